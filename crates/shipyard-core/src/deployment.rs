//! Deployment data model shared by the engine, the store and callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::files::FileRecord;
use crate::ids::{InstanceId, SessionId};

/// Opaque identity scoping one sandbox client and its instance state.
/// Replaced wholesale on rotation, never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            session_id: SessionId::new(),
            created_at: Utc::now(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// A provisioned sandbox instance and the addresses it serves on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    pub instance_id: InstanceId,
    pub preview_url: Option<String>,
    pub tunnel_url: Option<String>,
}

/// One call into the orchestrator. Immutable for the call's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeploymentRequest {
    /// Files to write. Empty means "everything known".
    pub files: Vec<FileRecord>,
    pub redeploy: bool,
    pub commit_message: Option<String>,
    pub clear_logs: bool,
}

impl DeploymentRequest {
    pub fn new(files: Vec<FileRecord>) -> Self {
        Self {
            files,
            ..Default::default()
        }
    }

    /// Full redeploy of all known files onto whatever instance is usable.
    pub fn all_files() -> Self {
        Self::default()
    }

    pub fn with_redeploy(mut self, redeploy: bool) -> Self {
        self.redeploy = redeploy;
        self
    }

    pub fn with_commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = Some(message.into());
        self
    }

    pub fn with_clear_logs(mut self, clear_logs: bool) -> Self {
        self.clear_logs = clear_logs;
        self
    }
}

/// What every coalesced caller receives on success.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOutcome {
    pub instance_id: InstanceId,
    pub preview_url: Option<String>,
    pub tunnel_url: Option<String>,
}

impl From<InstanceRef> for DeploymentOutcome {
    fn from(instance: InstanceRef) -> Self {
        Self {
            instance_id: instance.instance_id,
            preview_url: instance.preview_url,
            tunnel_url: instance.tunnel_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builders() {
        let req = DeploymentRequest::new(vec![FileRecord::new("a", "b")])
            .with_redeploy(true)
            .with_commit_message("fix")
            .with_clear_logs(true);
        assert!(req.redeploy);
        assert!(req.clear_logs);
        assert_eq!(req.commit_message.as_deref(), Some("fix"));
        assert_eq!(req.files.len(), 1);
        assert!(DeploymentRequest::all_files().files.is_empty());
    }

    #[test]
    fn outcome_from_instance_ref() {
        let outcome = DeploymentOutcome::from(InstanceRef {
            instance_id: InstanceId::from_raw("run-1"),
            preview_url: Some("https://p".into()),
            tunnel_url: None,
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["instanceId"], "run-1");
        assert_eq!(json["previewUrl"], "https://p");
    }

    #[test]
    fn sessions_are_distinct() {
        assert_ne!(Session::new().session_id, Session::new().session_id);
    }
}
