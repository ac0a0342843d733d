use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use shipyard_core::deployment::{DeploymentRequest, InstanceRef};
use shipyard_core::files::{fingerprint, FileSource};
use shipyard_core::ids::InstanceId;
use shipyard_core::sandbox::SandboxClient;

use crate::error::DeployError;
use crate::reconciler::{EnsuredInstance, InstanceReconciler};
use crate::selector::FileSelector;

/// Result of one successful transaction.
pub struct ExecutionResult {
    pub instance: InstanceRef,
    pub freshly_created: bool,
    pub files_written: usize,
    pub client: Arc<dyn SandboxClient>,
}

/// One deployment transaction: ensure an instance, pick files, write them.
///
/// Transactions are serialized. An attempt abandoned by a timeout keeps the
/// transaction until its remote calls finish, and the next attempt waits.
pub struct DeployExecutor {
    reconciler: InstanceReconciler,
    selector: FileSelector,
    files: Arc<dyn FileSource>,
    transaction: AsyncMutex<()>,
}

impl DeployExecutor {
    pub fn new(reconciler: InstanceReconciler, selector: FileSelector, files: Arc<dyn FileSource>) -> Self {
        Self {
            reconciler,
            selector,
            files,
            transaction: AsyncMutex::new(()),
        }
    }

    #[instrument(skip_all, fields(redeploy = request.redeploy, requested = request.files.len()))]
    pub async fn execute(&self, request: &DeploymentRequest) -> Result<ExecutionResult, DeployError> {
        let _transaction = self.transaction.lock().await;

        let ensured = self.reconciler.ensure(request.redeploy).await?;
        match self.write(request, &ensured).await {
            Ok(files_written) => Ok(ExecutionResult {
                files_written,
                instance: ensured.instance,
                freshly_created: ensured.freshly_created,
                client: ensured.client,
            }),
            Err(e) => {
                // The instance may hold a partial file set; the next
                // transaction must provision and write everything again.
                self.reconciler.forget(&ensured.instance.instance_id);
                Err(e)
            }
        }
    }

    async fn write(&self, request: &DeploymentRequest, ensured: &EnsuredInstance) -> Result<usize, DeployError> {
        let instance_id = &ensured.instance.instance_id;
        let selected = self
            .selector
            .select(&request.files, ensured.freshly_created, self.files.as_ref());

        if selected.is_empty() {
            debug!(instance_id = %instance_id, "nothing to write");
        } else {
            let response = ensured
                .client
                .write_files(instance_id, &selected, request.commit_message.as_deref())
                .await?;

            let failed = response.failed_files();
            let digest = fingerprint(&selected);
            info!(
                instance_id = %instance_id,
                fingerprint = %&digest[..12],
                requested = selected.len(),
                succeeded = response.succeeded_count(),
                failed = failed.len(),
                "files written"
            );
            for f in &failed {
                warn!(file = %f.file, error = ?f.error, "file write failed");
            }

            if !failed.is_empty() {
                let message = failed
                    .iter()
                    .map(|f| match &f.error {
                        Some(e) => format!("{}: {e}", f.file),
                        None => f.file.clone(),
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(DeployError::WriteFailed {
                    failed: failed.len(),
                    message,
                });
            }
            if !response.success {
                return Err(DeployError::WriteRejected(
                    response.error.unwrap_or_else(|| "write reported failure".into()),
                ));
            }
        }

        if request.clear_logs {
            clear_logs(ensured.client.as_ref(), instance_id).await;
        }
        Ok(selected.len())
    }
}

/// Best effort: failures are logged and never fail the deployment.
async fn clear_logs(client: &dyn SandboxClient, instance_id: &InstanceId) {
    if let Err(e) = client.get_logs(instance_id, true).await {
        warn!(instance_id = %instance_id, error = %e, "failed to clear logs");
    }
    match client.clear_instance_errors(instance_id).await {
        Ok(resp) => debug!(instance_id = %instance_id, cleared = resp.cleared_count, "cleared runtime errors"),
        Err(e) => warn!(instance_id = %instance_id, error = %e, "failed to clear runtime errors"),
    }
}
