//! Contract with the remote sandbox control plane.
//!
//! Wire types use camelCase to match the control plane's JSON. The
//! `SandboxClient` trait is the only seam the orchestrator talks through;
//! `SandboxClientFactory` builds one client per session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::SandboxError;
use crate::files::FileRecord;
use crate::ids::{InstanceId, SessionId};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub success: bool,
    #[serde(default)]
    pub is_healthy: bool,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub tunnel_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_command: Option<String>,
    #[serde(default)]
    pub local_dev: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    pub template: String,
    pub project_name: String,
    #[serde(default)]
    pub options: InstanceOptions,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceResponse {
    pub success: bool,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub tunnel_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWriteResult {
    pub file: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFilesResponse {
    pub success: bool,
    #[serde(default)]
    pub results: Vec<FileWriteResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WriteFilesResponse {
    pub fn failed_files(&self) -> Vec<&FileWriteResult> {
        self.results.iter().filter(|r| !r.success).collect()
    }

    pub fn succeeded_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command: String,
    pub success: bool,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandsResponse {
    pub success: bool,
    #[serde(default)]
    pub results: Vec<CommandResult>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceLogs {
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearErrorsResponse {
    pub success: bool,
    #[serde(default)]
    pub cleared_count: u32,
    #[serde(default)]
    pub error: Option<String>,
}

/// Client for one session's view of the sandbox control plane.
#[async_trait]
pub trait SandboxClient: Send + Sync {
    async fn get_instance_status(&self, id: &InstanceId) -> Result<InstanceStatus, SandboxError>;

    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> Result<CreateInstanceResponse, SandboxError>;

    async fn write_files(
        &self,
        id: &InstanceId,
        files: &[FileRecord],
        commit_message: Option<&str>,
    ) -> Result<WriteFilesResponse, SandboxError>;

    async fn execute_commands(
        &self,
        id: &InstanceId,
        commands: &[String],
    ) -> Result<ExecuteCommandsResponse, SandboxError>;

    async fn get_logs(&self, id: &InstanceId, clear: bool) -> Result<InstanceLogs, SandboxError>;

    async fn clear_instance_errors(&self, id: &InstanceId) -> Result<ClearErrorsResponse, SandboxError>;
}

/// Environment variables injected into a freshly provisioned instance.
pub trait EnvProvider: Send + Sync {
    fn env_vars(&self, session_id: &SessionId) -> Result<HashMap<String, String>, SandboxError>;
}

/// Builds a client scoped to a session. Construction is local and
/// infallible; network traffic only happens in the client's methods.
pub trait SandboxClientFactory: Send + Sync {
    fn create(&self, session_id: &SessionId) -> Arc<dyn SandboxClient>;
}
