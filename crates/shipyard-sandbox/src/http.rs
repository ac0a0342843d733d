//! HTTP client for the sandbox control plane.
//!
//! Every request carries the owning session in `x-session-id`; the control
//! plane scopes instances to it. One `reqwest::Client` (and its connection
//! pool) is shared by all sessions built from the same factory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use shipyard_core::errors::SandboxError;
use shipyard_core::files::FileRecord;
use shipyard_core::ids::{InstanceId, SessionId};
use shipyard_core::sandbox::{
    ClearErrorsResponse, CreateInstanceRequest, CreateInstanceResponse, ExecuteCommandsResponse,
    InstanceLogs, InstanceStatus, SandboxClient, SandboxClientFactory, WriteFilesResponse,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_HEADER: &str = "x-session-id";

#[derive(Clone, Debug)]
pub struct HttpSandboxConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub request_timeout: Duration,
}

impl HttpSandboxConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            request_timeout: Duration::from_secs(45),
        }
    }
}

pub struct HttpSandboxClient {
    http: Client,
    config: Arc<HttpSandboxConfig>,
    session_id: SessionId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteFilesBody<'a> {
    files: &'a [FileRecord],
    #[serde(skip_serializing_if = "Option::is_none")]
    commit_message: Option<&'a str>,
}

#[derive(Serialize)]
struct CommandsBody<'a> {
    commands: &'a [String],
}

impl HttpSandboxClient {
    pub fn new(http: Client, config: Arc<HttpSandboxConfig>, session_id: SessionId) -> Self {
        Self {
            http,
            config,
            session_id,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut req = self
            .http
            .request(method, url)
            .timeout(self.config.request_timeout)
            .header(SESSION_HEADER, self.session_id.as_str())
            .header("accept", "application/json");
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key.expose_secret());
        }
        req
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, SandboxError> {
        let resp = req.send().await.map_err(|e| self.map_transport(e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.map_transport(e))?;

        if !status.is_success() {
            return Err(SandboxError::from_status(status.as_u16(), body));
        }

        let trimmed = body.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Err(SandboxError::Decode("empty response body".into()));
        }

        serde_json::from_str(trimmed).map_err(|e| SandboxError::Decode(e.to_string()))
    }

    fn map_transport(&self, e: reqwest::Error) -> SandboxError {
        if e.is_timeout() {
            SandboxError::Timeout(self.config.request_timeout)
        } else {
            SandboxError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl SandboxClient for HttpSandboxClient {
    #[instrument(skip(self), fields(session_id = %self.session_id, instance_id = %id))]
    async fn get_instance_status(&self, id: &InstanceId) -> Result<InstanceStatus, SandboxError> {
        let path = format!("/instances/{id}/status");
        self.send(self.request(Method::GET, &path)).await
    }

    #[instrument(skip(self, request), fields(session_id = %self.session_id, template = %request.template))]
    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> Result<CreateInstanceResponse, SandboxError> {
        debug!(env_vars = request.env_vars.len(), "creating instance");
        self.send(self.request(Method::POST, "/instances").json(request))
            .await
    }

    #[instrument(skip(self, files, commit_message), fields(session_id = %self.session_id, instance_id = %id, files = files.len()))]
    async fn write_files(
        &self,
        id: &InstanceId,
        files: &[FileRecord],
        commit_message: Option<&str>,
    ) -> Result<WriteFilesResponse, SandboxError> {
        let path = format!("/instances/{id}/files");
        let body = WriteFilesBody {
            files,
            commit_message,
        };
        self.send(self.request(Method::POST, &path).json(&body)).await
    }

    #[instrument(skip(self, commands), fields(session_id = %self.session_id, instance_id = %id))]
    async fn execute_commands(
        &self,
        id: &InstanceId,
        commands: &[String],
    ) -> Result<ExecuteCommandsResponse, SandboxError> {
        let path = format!("/instances/{id}/commands");
        self.send(self.request(Method::POST, &path).json(&CommandsBody { commands }))
            .await
    }

    #[instrument(skip(self), fields(session_id = %self.session_id, instance_id = %id))]
    async fn get_logs(&self, id: &InstanceId, clear: bool) -> Result<InstanceLogs, SandboxError> {
        let path = format!("/instances/{id}/logs");
        self.send(
            self.request(Method::GET, &path)
                .query(&[("clear", clear)]),
        )
        .await
    }

    #[instrument(skip(self), fields(session_id = %self.session_id, instance_id = %id))]
    async fn clear_instance_errors(&self, id: &InstanceId) -> Result<ClearErrorsResponse, SandboxError> {
        let path = format!("/instances/{id}/errors");
        self.send(self.request(Method::DELETE, &path)).await
    }
}

/// Builds one `HttpSandboxClient` per session over a shared connection pool.
pub struct HttpClientFactory {
    http: Client,
    config: Arc<HttpSandboxConfig>,
}

impl HttpClientFactory {
    /// Fails only if the TLS backend cannot be initialized.
    pub fn new(config: HttpSandboxConfig) -> Result<Self, SandboxError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SandboxError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }
}

impl SandboxClientFactory for HttpClientFactory {
    fn create(&self, session_id: &SessionId) -> Arc<dyn SandboxClient> {
        Arc::new(HttpSandboxClient::new(
            self.http.clone(),
            Arc::clone(&self.config),
            session_id.clone(),
        ))
    }
}
