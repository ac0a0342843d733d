use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use shipyard_core::errors::SandboxError;

/// Messages that mean the session's backing infrastructure is gone
/// (network loss, container/runtime disconnect, storage fault). Retrying on
/// the same session will not help.
static SESSION_FATAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)network connection lost|(container|runtime)( service)? (disconnected|is not running)|durable object (storage|reset)|storage (operation )?(failed|fault)|internal error in storage",
    )
    .unwrap()
});

/// Failure of a single deployment attempt.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("failed to provision instance: {0}")]
    ProvisioningFailed(String),

    #[error("provisioning incomplete: response missing {missing}")]
    ProvisioningIncomplete { missing: String },

    #[error("failed to write {failed} file(s): {message}")]
    WriteFailed { failed: usize, message: String },

    #[error("file write rejected: {0}")]
    WriteRejected(String),

    #[error("attempt timed out after {0:?}")]
    AttemptTimeout(Duration),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("{0}")]
    Internal(String),
}

impl DeployError {
    /// Whether the rendered message matches a known fatal-infrastructure signature.
    pub fn is_session_fatal(&self) -> bool {
        SESSION_FATAL.is_match(&self.to_string())
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Sandbox(e) => e.error_kind(),
            Self::ProvisioningFailed(_) => "provisioning_failed",
            Self::ProvisioningIncomplete { .. } => "provisioning_incomplete",
            Self::WriteFailed { .. } => "write_failed",
            Self::WriteRejected(_) => "write_rejected",
            Self::AttemptTimeout(_) => "attempt_timeout",
            Self::Credential(_) => "credential",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_signatures_are_case_insensitive() {
        let cases = [
            DeployError::Sandbox(SandboxError::Remote("Network connection lost.".into())),
            DeployError::ProvisioningFailed("Container service disconnected".into()),
            DeployError::WriteRejected("Durable Object storage failure".into()),
            DeployError::Sandbox(SandboxError::Status {
                status: 500,
                body: "internal error in storage layer".into(),
            }),
            DeployError::WriteFailed {
                failed: 2,
                message: "runtime disconnected".into(),
            },
        ];
        for err in cases {
            assert!(err.is_session_fatal(), "expected fatal: {err}");
        }
    }

    #[test]
    fn ordinary_failures_are_not_fatal() {
        let cases = [
            DeployError::AttemptTimeout(Duration::from_secs(60)),
            DeployError::ProvisioningIncomplete { missing: "previewUrl".into() },
            DeployError::Sandbox(SandboxError::Network("connection refused".into())),
            DeployError::WriteFailed {
                failed: 1,
                message: "src/App.tsx: disk full".into(),
            },
        ];
        for err in cases {
            assert!(!err.is_session_fatal(), "expected non-fatal: {err}");
        }
    }

    #[test]
    fn error_kind_delegates_for_sandbox_errors() {
        let err: DeployError = SandboxError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(err.error_kind(), "timeout");
        assert_eq!(
            DeployError::ProvisioningIncomplete { missing: "runId".into() }.error_kind(),
            "provisioning_incomplete"
        );
    }
}
