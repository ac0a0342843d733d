//! Load a generated app directory from disk.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use shipyard_core::files::FileRecord;

/// Directories that never belong in a deployment.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "dist", ".shipyard"];

/// Every UTF-8 file under `root`, with `/`-separated relative paths in a
/// stable (sorted) order. Binary files are skipped.
pub fn load_dir(root: &Path) -> Result<Vec<FileRecord>> {
    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<FileRecord>) -> Result<()> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            let name = entry.file_name();
            if SKIPPED_DIRS.iter().any(|s| name == *s) {
                continue;
            }
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            let Ok(contents) = std::fs::read_to_string(&path) else {
                debug!(path = %path.display(), "skipping non-UTF-8 file");
                continue;
            };
            let relative = path
                .strip_prefix(root)
                .with_context(|| format!("{} escapes {}", path.display(), root.display()))?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(FileRecord::new(relative, contents));
        }
    }
    Ok(())
}

/// Pick `paths` out of `files`. Unknown paths are an error.
pub fn pick(files: &[FileRecord], paths: &[String]) -> Result<Vec<FileRecord>> {
    paths
        .iter()
        .map(|wanted| {
            let wanted = wanted.trim_start_matches("./");
            files
                .iter()
                .find(|f| f.path == wanted)
                .cloned()
                .with_context(|| format!("{wanted} is not in the project directory"))
        })
        .collect()
}
