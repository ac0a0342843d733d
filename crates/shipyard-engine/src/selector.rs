use std::sync::Arc;

use tracing::warn;

use shipyard_core::files::{FileRecord, FileSet, FileSource};
use shipyard_core::policy::ReadOnlyPolicy;
use shipyard_telemetry::DeployMetrics;

/// Decides which files a deployment attempt writes.
pub struct FileSelector {
    policy: Arc<dyn ReadOnlyPolicy>,
    metrics: Arc<DeployMetrics>,
}

impl FileSelector {
    pub fn new(policy: Arc<dyn ReadOnlyPolicy>, metrics: Arc<DeployMetrics>) -> Self {
        Self { policy, metrics }
    }

    /// An empty request, or a freshly created instance, means every known
    /// file. Read-only paths are always dropped. Order follows the
    /// candidates; a repeated path keeps its first position and last contents.
    pub fn select(
        &self,
        requested: &[FileRecord],
        freshly_created: bool,
        source: &dyn FileSource,
    ) -> Vec<FileRecord> {
        let candidates = if requested.is_empty() || freshly_created {
            source.all_files()
        } else {
            requested.to_vec()
        };

        let generated = source.generated_paths();
        let mut dropped = 0u64;
        let selected: FileSet = candidates
            .into_iter()
            .filter(|file| {
                if !self.policy.is_read_only(&file.path) {
                    return true;
                }
                dropped += 1;
                warn!(
                    path = %file.path,
                    generated = generated.contains(&file.path),
                    "policy violation: skipping write to read-only path"
                );
                false
            })
            .collect();

        if dropped > 0 {
            self.metrics.policy_drops(dropped);
        }
        selected.into_vec()
    }
}
