use parking_lot::Mutex;
use tracing::{info, warn};

use shipyard_core::ids::InstanceId;
use shipyard_core::sandbox::SandboxClient;

/// Commands to run once on the next successfully deployed instance.
#[derive(Default)]
pub struct SetupQueue {
    pending: Mutex<Vec<String>>,
}

impl SetupQueue {
    pub fn new(initial: Vec<String>) -> Self {
        Self {
            pending: Mutex::new(initial),
        }
    }

    pub fn push(&self, commands: impl IntoIterator<Item = String>) {
        self.pending.lock().extend(commands);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Drain the queue onto `instance_id`. Failures are logged, not retried.
    pub async fn run(&self, client: &dyn SandboxClient, instance_id: &InstanceId) {
        let commands = std::mem::take(&mut *self.pending.lock());
        if commands.is_empty() {
            return;
        }

        info!(instance_id = %instance_id, count = commands.len(), "running setup commands");
        match client.execute_commands(instance_id, &commands).await {
            Ok(resp) => {
                for result in resp.results.iter().filter(|r| !r.success) {
                    warn!(
                        instance_id = %instance_id,
                        command = %result.command,
                        exit_code = ?result.exit_code,
                        error = ?result.error,
                        "setup command failed"
                    );
                }
                if !resp.success {
                    warn!(instance_id = %instance_id, error = ?resp.error, "setup commands reported failure");
                }
            }
            Err(e) => warn!(instance_id = %instance_id, error = %e, "failed to run setup commands"),
        }
    }
}
