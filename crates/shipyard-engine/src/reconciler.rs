use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use shipyard_core::deployment::InstanceRef;
use shipyard_core::errors::SandboxError;
use shipyard_core::ids::{InstanceId, SessionId};
use shipyard_core::sandbox::{CreateInstanceRequest, EnvProvider, InstanceOptions, SandboxClient};

use crate::error::DeployError;
use crate::session::SessionIdentity;

/// What a new instance is provisioned from.
#[derive(Clone, Debug)]
pub struct TemplateSpec {
    pub name: String,
    pub project_name: String,
    pub init_command: Option<String>,
}

impl Default for TemplateSpec {
    fn default() -> Self {
        Self {
            name: "vite-react".into(),
            project_name: "preview".into(),
            init_command: None,
        }
    }
}

/// Provisions instances without extra environment.
pub struct NoEnv;

impl EnvProvider for NoEnv {
    fn env_vars(&self, _session_id: &SessionId) -> Result<HashMap<String, String>, SandboxError> {
        Ok(HashMap::new())
    }
}

/// A usable instance plus the session and client it was reached through.
pub struct EnsuredInstance {
    pub instance: InstanceRef,
    pub freshly_created: bool,
    pub session_id: SessionId,
    pub client: Arc<dyn SandboxClient>,
}

/// Makes sure a healthy instance exists for the current session.
pub struct InstanceReconciler {
    identity: Arc<SessionIdentity>,
    env: Arc<dyn EnvProvider>,
    template: TemplateSpec,
}

impl InstanceReconciler {
    pub fn new(identity: Arc<SessionIdentity>, env: Arc<dyn EnvProvider>, template: TemplateSpec) -> Self {
        Self {
            identity,
            env,
            template,
        }
    }

    /// Reuse the known instance if it reports healthy, otherwise provision
    /// a new one. Provisioning is attempted once; retrying is the caller's job.
    #[instrument(skip(self), fields(session_id = tracing::field::Empty))]
    pub async fn ensure(&self, force_redeploy: bool) -> Result<EnsuredInstance, DeployError> {
        let (session_id, client) = self.identity.client();
        tracing::Span::current().record("session_id", session_id.as_str());

        if !force_redeploy {
            if let Some(existing) = self.identity.instance() {
                match client.get_instance_status(&existing.instance_id).await {
                    Ok(status) if status.success && status.is_healthy => {
                        debug!(instance_id = %existing.instance_id, "reusing healthy instance");
                        return Ok(EnsuredInstance {
                            instance: existing,
                            freshly_created: false,
                            session_id,
                            client,
                        });
                    }
                    Ok(status) => {
                        info!(
                            instance_id = %existing.instance_id,
                            success = status.success,
                            healthy = status.is_healthy,
                            error = ?status.error,
                            "known instance unusable, provisioning a new one"
                        );
                    }
                    Err(e) => {
                        warn!(instance_id = %existing.instance_id, error = %e, "status check failed, provisioning a new one");
                    }
                }
            }
        }

        let instance = self.provision(&session_id, client.as_ref()).await?;
        if !self.identity.set_instance_if(&session_id, instance.clone()) {
            warn!(instance_id = %instance.instance_id, "session rotated during provisioning");
        }
        Ok(EnsuredInstance {
            instance,
            freshly_created: true,
            session_id,
            client,
        })
    }

    /// Drop `instance_id` as the known instance unless something newer
    /// replaced it.
    pub fn forget(&self, instance_id: &InstanceId) {
        if self.identity.clear_instance_if(instance_id) {
            debug!(instance_id = %instance_id, "forgot instance after failed transaction");
        }
    }

    async fn provision(&self, session_id: &SessionId, client: &dyn SandboxClient) -> Result<InstanceRef, DeployError> {
        let env_vars = self
            .env
            .env_vars(session_id)
            .map_err(|e| DeployError::Credential(e.to_string()))?;

        let request = CreateInstanceRequest {
            template: self.template.name.clone(),
            project_name: self.template.project_name.clone(),
            options: InstanceOptions {
                init_command: self.template.init_command.clone(),
                local_dev: true,
            },
            env_vars,
        };

        let response = client.create_instance(&request).await?;
        if !response.success {
            return Err(DeployError::ProvisioningFailed(
                response.error.unwrap_or_else(|| "unknown error".into()),
            ));
        }

        let run_id = response.run_id.filter(|s| !s.is_empty());
        let preview_url = response.preview_url.filter(|s| !s.is_empty());
        let (run_id, preview_url) = match (run_id, preview_url) {
            (Some(run_id), Some(preview_url)) => (run_id, preview_url),
            (run_id, preview_url) => {
                let mut missing = Vec::new();
                if run_id.is_none() {
                    missing.push("runId");
                }
                if preview_url.is_none() {
                    missing.push("previewUrl");
                }
                return Err(DeployError::ProvisioningIncomplete {
                    missing: missing.join(", "),
                });
            }
        };

        info!(instance_id = %run_id, preview_url = %preview_url, "instance provisioned");
        Ok(InstanceRef {
            instance_id: InstanceId::from_raw(run_id),
            preview_url: Some(preview_url),
            tunnel_url: response.tunnel_url,
        })
    }
}
