use std::time::Duration;

/// Errors talking to (or preparing requests for) the sandbox control plane.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("network error: {0}")]
    Network(String),
    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The control plane answered, but reported an error of its own.
    #[error("{0}")]
    Remote(String),
    #[error("credential error: {0}")]
    Credential(String),
}

impl SandboxError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Status { .. } => "status",
            Self::Decode(_) => "decode",
            Self::Timeout(_) => "timeout",
            Self::Remote(_) => "remote",
            Self::Credential(_) => "credential",
        }
    }

    /// Map a non-success HTTP status to an error.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            408 | 504 => Self::Timeout(Duration::ZERO),
            _ => Self::Status { status, body },
        }
    }
}
