use serde::{Deserialize, Serialize};

use crate::ids::{DeploymentId, InstanceId, SessionId};

/// Deployment lifecycle events, broadcast to observers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeploymentEvent {
    #[serde(rename = "deployment_started")]
    Started {
        deployment_id: DeploymentId,
        session_id: SessionId,
        message: String,
        files: Vec<String>,
    },

    #[serde(rename = "deployment_attempt_failed")]
    AttemptFailed {
        deployment_id: DeploymentId,
        session_id: SessionId,
        attempt: u32,
        error: String,
        error_kind: String,
        retry_in_ms: u64,
        session_rotated: bool,
    },

    #[serde(rename = "deployment_completed")]
    Completed {
        deployment_id: DeploymentId,
        message: String,
        instance_id: InstanceId,
        preview_url: Option<String>,
        tunnel_url: Option<String>,
        attempts: u32,
        duration_ms: u64,
        freshly_created: bool,
    },

    /// The caller-visible ceiling expired. The retry loop may still converge.
    #[serde(rename = "deployment_timed_out")]
    TimedOut {
        deployment_id: DeploymentId,
        error: String,
        waited_ms: u64,
    },

    #[serde(rename = "session_rotated")]
    SessionRotated {
        previous: SessionId,
        current: SessionId,
        reason: String,
    },

    #[serde(rename = "self_heal_triggered")]
    SelfHealTriggered {
        instance_id: InstanceId,
    },

    /// A newer top-level deployment replaced this one's retry loop.
    #[serde(rename = "deployment_superseded")]
    Superseded {
        deployment_id: DeploymentId,
        superseded_by: DeploymentId,
    },
}

impl DeploymentEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "deployment_started",
            Self::AttemptFailed { .. } => "deployment_attempt_failed",
            Self::Completed { .. } => "deployment_completed",
            Self::TimedOut { .. } => "deployment_timed_out",
            Self::SessionRotated { .. } => "session_rotated",
            Self::SelfHealTriggered { .. } => "self_heal_triggered",
            Self::Superseded { .. } => "deployment_superseded",
        }
    }

    /// Error text for failure events, `None` otherwise.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::AttemptFailed { error, .. } | Self::TimedOut { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_serde_tag() {
        let evt = DeploymentEvent::Started {
            deployment_id: DeploymentId::new(),
            session_id: SessionId::new(),
            message: "Deploying".into(),
            files: vec!["src/App.tsx".into()],
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], evt.event_type());
    }

    #[test]
    fn error_accessor() {
        let evt = DeploymentEvent::TimedOut {
            deployment_id: DeploymentId::new(),
            error: "timed out".into(),
            waited_ms: 10,
        };
        assert_eq!(evt.error(), Some("timed out"));

        let evt = DeploymentEvent::SelfHealTriggered {
            instance_id: InstanceId::from_raw("run-1"),
        };
        assert_eq!(evt.error(), None);
    }

    #[test]
    fn completed_serializes_urls() {
        let evt = DeploymentEvent::Completed {
            deployment_id: DeploymentId::new(),
            message: "Deployed".into(),
            instance_id: InstanceId::from_raw("run-7"),
            preview_url: Some("https://preview".into()),
            tunnel_url: None,
            attempts: 2,
            duration_ms: 1500,
            freshly_created: true,
        };
        let json = serde_json::to_string(&evt).unwrap();
        assert!(json.contains("\"type\":\"deployment_completed\""));
        assert!(json.contains("\"instance_id\":\"run-7\""));
    }
}
