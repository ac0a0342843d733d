//! Scripted sandbox for deterministic tests without a control plane.
//!
//! Each method pops its next reply from a per-method queue. An empty queue
//! falls back to a healthy default, so tests only script the calls they
//! care about.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use shipyard_core::errors::SandboxError;
use shipyard_core::files::FileRecord;
use shipyard_core::ids::{InstanceId, SessionId};
use shipyard_core::sandbox::{
    ClearErrorsResponse, CommandResult, CreateInstanceRequest, CreateInstanceResponse,
    ExecuteCommandsResponse, FileWriteResult, InstanceLogs, InstanceStatus, SandboxClient,
    SandboxClientFactory, WriteFilesResponse,
};

/// One pre-programmed reply.
pub enum MockReply<T> {
    Ok(T),
    Err(SandboxError),
    /// Wait, then resolve the inner reply.
    Delay(Duration, Box<MockReply<T>>),
}

impl<T> MockReply<T> {
    pub fn delayed(delay: Duration, inner: MockReply<T>) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    async fn resolve(self) -> Result<T, SandboxError> {
        let mut current = self;
        loop {
            match current {
                Self::Ok(v) => return Ok(v),
                Self::Err(e) => return Err(e),
                Self::Delay(d, inner) => {
                    tokio::time::sleep(d).await;
                    current = *inner;
                }
            }
        }
    }
}

/// A recorded call, tagged with the session of the client that made it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    GetStatus {
        session_id: SessionId,
        instance_id: InstanceId,
    },
    Create {
        session_id: SessionId,
        request: CreateInstanceRequest,
    },
    WriteFiles {
        session_id: SessionId,
        instance_id: InstanceId,
        paths: Vec<String>,
        commit_message: Option<String>,
    },
    ExecuteCommands {
        session_id: SessionId,
        instance_id: InstanceId,
        commands: Vec<String>,
    },
    GetLogs {
        session_id: SessionId,
        instance_id: InstanceId,
        clear: bool,
    },
    ClearErrors {
        session_id: SessionId,
        instance_id: InstanceId,
    },
}

impl MockCall {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::GetStatus { session_id, .. }
            | Self::Create { session_id, .. }
            | Self::WriteFiles { session_id, .. }
            | Self::ExecuteCommands { session_id, .. }
            | Self::GetLogs { session_id, .. }
            | Self::ClearErrors { session_id, .. } => session_id,
        }
    }
}

#[derive(Default)]
struct Script {
    status: Mutex<VecDeque<MockReply<InstanceStatus>>>,
    create: Mutex<VecDeque<MockReply<CreateInstanceResponse>>>,
    write: Mutex<VecDeque<MockReply<WriteFilesResponse>>>,
    commands: Mutex<VecDeque<MockReply<ExecuteCommandsResponse>>>,
    logs: Mutex<VecDeque<MockReply<InstanceLogs>>>,
    clear: Mutex<VecDeque<MockReply<ClearErrorsResponse>>>,
    calls: Mutex<Vec<MockCall>>,
    creates: AtomicUsize,
}

/// Shared script. Clones observe the same queues and call log.
#[derive(Clone, Default)]
pub struct MockSandbox {
    script: Arc<Script>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_status(&self, reply: MockReply<InstanceStatus>) -> &Self {
        self.script.status.lock().push_back(reply);
        self
    }

    pub fn push_create(&self, reply: MockReply<CreateInstanceResponse>) -> &Self {
        self.script.create.lock().push_back(reply);
        self
    }

    pub fn push_write(&self, reply: MockReply<WriteFilesResponse>) -> &Self {
        self.script.write.lock().push_back(reply);
        self
    }

    pub fn push_commands(&self, reply: MockReply<ExecuteCommandsResponse>) -> &Self {
        self.script.commands.lock().push_back(reply);
        self
    }

    pub fn push_logs(&self, reply: MockReply<InstanceLogs>) -> &Self {
        self.script.logs.lock().push_back(reply);
        self
    }

    pub fn push_clear(&self, reply: MockReply<ClearErrorsResponse>) -> &Self {
        self.script.clear.lock().push_back(reply);
        self
    }

    /// Client bound to `session_id` over this script.
    pub fn client(&self, session_id: SessionId) -> Arc<dyn SandboxClient> {
        Arc::new(ScopedMock {
            script: Arc::clone(&self.script),
            session_id,
        })
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.script.calls.lock().clone()
    }

    pub fn create_calls(&self) -> Vec<CreateInstanceRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Create { request, .. } => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Paths sent by each `write_files` call, in call order.
    pub fn write_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::WriteFiles { paths, .. } => Some(paths),
                _ => None,
            })
            .collect()
    }

    pub fn status_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MockCall::GetStatus { .. }))
            .count()
    }

    pub fn command_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::ExecuteCommands { commands, .. } => Some(commands),
                _ => None,
            })
            .collect()
    }

    pub fn create_count(&self) -> usize {
        self.script.creates.load(Ordering::SeqCst)
    }
}

struct ScopedMock {
    script: Arc<Script>,
    session_id: SessionId,
}

impl ScopedMock {
    fn record(&self, call: MockCall) {
        self.script.calls.lock().push(call);
    }
}

fn preview_for(id: &str) -> String {
    format!("https://{id}.preview.local")
}

#[async_trait]
impl SandboxClient for ScopedMock {
    async fn get_instance_status(&self, id: &InstanceId) -> Result<InstanceStatus, SandboxError> {
        self.record(MockCall::GetStatus {
            session_id: self.session_id.clone(),
            instance_id: id.clone(),
        });
        let reply = self.script.status.lock().pop_front();
        match reply {
            Some(r) => r.resolve().await,
            None => Ok(InstanceStatus {
                success: true,
                is_healthy: true,
                preview_url: Some(preview_for(id.as_str())),
                tunnel_url: None,
                error: None,
            }),
        }
    }

    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> Result<CreateInstanceResponse, SandboxError> {
        let n = self.script.creates.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(MockCall::Create {
            session_id: self.session_id.clone(),
            request: request.clone(),
        });
        let reply = self.script.create.lock().pop_front();
        match reply {
            Some(r) => r.resolve().await,
            None => {
                let run_id = format!("run-{n}");
                Ok(CreateInstanceResponse {
                    success: true,
                    preview_url: Some(preview_for(&run_id)),
                    run_id: Some(run_id),
                    tunnel_url: None,
                    error: None,
                })
            }
        }
    }

    async fn write_files(
        &self,
        id: &InstanceId,
        files: &[FileRecord],
        commit_message: Option<&str>,
    ) -> Result<WriteFilesResponse, SandboxError> {
        self.record(MockCall::WriteFiles {
            session_id: self.session_id.clone(),
            instance_id: id.clone(),
            paths: files.iter().map(|f| f.path.clone()).collect(),
            commit_message: commit_message.map(str::to_string),
        });
        let reply = self.script.write.lock().pop_front();
        match reply {
            Some(r) => r.resolve().await,
            None => Ok(WriteFilesResponse {
                success: true,
                results: files
                    .iter()
                    .map(|f| FileWriteResult {
                        file: f.path.clone(),
                        success: true,
                        error: None,
                    })
                    .collect(),
                error: None,
            }),
        }
    }

    async fn execute_commands(
        &self,
        id: &InstanceId,
        commands: &[String],
    ) -> Result<ExecuteCommandsResponse, SandboxError> {
        self.record(MockCall::ExecuteCommands {
            session_id: self.session_id.clone(),
            instance_id: id.clone(),
            commands: commands.to_vec(),
        });
        let reply = self.script.commands.lock().pop_front();
        match reply {
            Some(r) => r.resolve().await,
            None => Ok(ExecuteCommandsResponse {
                success: true,
                results: commands
                    .iter()
                    .map(|c| CommandResult {
                        command: c.clone(),
                        success: true,
                        output: None,
                        exit_code: Some(0),
                        error: None,
                    })
                    .collect(),
                error: None,
            }),
        }
    }

    async fn get_logs(&self, id: &InstanceId, clear: bool) -> Result<InstanceLogs, SandboxError> {
        self.record(MockCall::GetLogs {
            session_id: self.session_id.clone(),
            instance_id: id.clone(),
            clear,
        });
        let reply = self.script.logs.lock().pop_front();
        match reply {
            Some(r) => r.resolve().await,
            None => Ok(InstanceLogs {
                success: true,
                ..Default::default()
            }),
        }
    }

    async fn clear_instance_errors(&self, id: &InstanceId) -> Result<ClearErrorsResponse, SandboxError> {
        self.record(MockCall::ClearErrors {
            session_id: self.session_id.clone(),
            instance_id: id.clone(),
        });
        let reply = self.script.clear.lock().pop_front();
        match reply {
            Some(r) => r.resolve().await,
            None => Ok(ClearErrorsResponse {
                success: true,
                ..Default::default()
            }),
        }
    }
}

/// Factory over a shared script that records every session it was asked for.
#[derive(Clone, Default)]
pub struct MockFactory {
    sandbox: MockSandbox,
    sessions: Arc<Mutex<Vec<SessionId>>>,
}

impl MockFactory {
    pub fn new(sandbox: MockSandbox) -> Self {
        Self {
            sandbox,
            sessions: Arc::default(),
        }
    }

    pub fn sandbox(&self) -> &MockSandbox {
        &self.sandbox
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.lock().clone()
    }
}

impl SandboxClientFactory for MockFactory {
    fn create(&self, session_id: &SessionId) -> Arc<dyn SandboxClient> {
        self.sessions.lock().push(session_id.clone());
        self.sandbox.client(session_id.clone())
    }
}
