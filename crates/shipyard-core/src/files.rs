use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single file destined for a sandbox instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub contents: String,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// Insertion-ordered, path-keyed file collection. Re-inserting a path
/// replaces its contents in place.
#[derive(Clone, Debug, Default)]
pub struct FileSet {
    files: Vec<FileRecord>,
    index: HashMap<String, usize>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, file: FileRecord) {
        match self.index.get(&file.path) {
            Some(&idx) => self.files[idx] = file,
            None => {
                self.index.insert(file.path.clone(), self.files.len());
                self.files.push(file);
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.index.get(path).map(|&idx| &self.files[idx])
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.iter()
    }

    pub fn into_vec(self) -> Vec<FileRecord> {
        self.files
    }
}

impl FromIterator<FileRecord> for FileSet {
    fn from_iter<I: IntoIterator<Item = FileRecord>>(iter: I) -> Self {
        let mut set = FileSet::new();
        for file in iter {
            set.upsert(file);
        }
        set
    }
}

/// Source of the "all known files" set used for full redeploys.
pub trait FileSource: Send + Sync {
    /// Template files overlaid by generated files, in stable order.
    fn all_files(&self) -> Vec<FileRecord>;

    /// Paths produced by code generation (as opposed to the template).
    fn generated_paths(&self) -> HashSet<String>;
}

/// Project file registry: the template baseline plus everything generated
/// on top of it.
#[derive(Default)]
pub struct ProjectFiles {
    template: RwLock<FileSet>,
    generated: RwLock<FileSet>,
}

impl ProjectFiles {
    pub fn new(template: Vec<FileRecord>) -> Self {
        Self {
            template: RwLock::new(template.into_iter().collect()),
            generated: RwLock::new(FileSet::new()),
        }
    }

    /// Record generated files, replacing earlier versions of the same path.
    pub fn record_generated(&self, files: impl IntoIterator<Item = FileRecord>) {
        let mut generated = self.generated.write();
        for file in files {
            generated.upsert(file);
        }
    }

    pub fn generated_count(&self) -> usize {
        self.generated.read().len()
    }
}

impl FileSource for ProjectFiles {
    fn all_files(&self) -> Vec<FileRecord> {
        let mut merged = self.template.read().clone();
        for file in self.generated.read().iter() {
            merged.upsert(file.clone());
        }
        merged.into_vec()
    }

    fn generated_paths(&self) -> HashSet<String> {
        self.generated
            .read()
            .iter()
            .map(|f| f.path.clone())
            .collect()
    }
}

/// Order-sensitive SHA-256 over paths and contents, as 64 lowercase hex chars.
pub fn fingerprint(files: &[FileRecord]) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(file.contents.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_in_place() {
        let mut set = FileSet::new();
        set.upsert(FileRecord::new("a.ts", "1"));
        set.upsert(FileRecord::new("b.ts", "2"));
        set.upsert(FileRecord::new("a.ts", "3"));

        let files = set.into_vec();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0], FileRecord::new("a.ts", "3"));
        assert_eq!(files[1].path, "b.ts");
    }

    #[test]
    fn generated_files_override_template() {
        let project = ProjectFiles::new(vec![
            FileRecord::new("package.json", "{}"),
            FileRecord::new("src/App.tsx", "template"),
        ]);
        project.record_generated(vec![
            FileRecord::new("src/App.tsx", "generated"),
            FileRecord::new("src/new.tsx", "new"),
        ]);

        let all = project.all_files();
        let paths: Vec<_> = all.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["package.json", "src/App.tsx", "src/new.tsx"]);
        assert_eq!(all[1].contents, "generated");

        let generated = project.generated_paths();
        assert_eq!(generated.len(), 2);
        assert!(generated.contains("src/new.tsx"));
        assert!(!generated.contains("package.json"));
    }

    #[test]
    fn fingerprint_changes_with_contents() {
        let a = fingerprint(&[FileRecord::new("x", "1")]);
        let b = fingerprint(&[FileRecord::new("x", "2")]);
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(a, fingerprint(&[FileRecord::new("x", "1")]));
    }

    #[test]
    fn fingerprint_is_lowercase_hex_sha256() {
        assert_eq!(
            fingerprint(&[]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
