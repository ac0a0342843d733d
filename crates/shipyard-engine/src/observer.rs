//! Lifecycle notifications.
//!
//! Every event goes through [`notify`], which routes it to the matching
//! [`DeploymentObserver`] callback. Started, completed and error callbacks
//! cover the caller-facing lifecycle; the remaining events are notices.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use shipyard_core::deployment::InstanceRef;
use shipyard_core::events::DeploymentEvent;
use shipyard_store::{AttemptRow, DeploymentHistoryRepo};

pub trait DeploymentObserver: Send + Sync {
    fn on_started(&self, _event: &DeploymentEvent) {}
    fn on_completed(&self, _event: &DeploymentEvent) {}
    /// Attempt failures and master-timeout expiries.
    fn on_error(&self, _event: &DeploymentEvent) {}
    /// Rotations, self-heals, superseded loops.
    fn on_notice(&self, _event: &DeploymentEvent) {}
}

pub fn notify(observer: &dyn DeploymentObserver, event: &DeploymentEvent) {
    match event {
        DeploymentEvent::Started { .. } => observer.on_started(event),
        DeploymentEvent::Completed { .. } => observer.on_completed(event),
        DeploymentEvent::AttemptFailed { .. } | DeploymentEvent::TimedOut { .. } => observer.on_error(event),
        DeploymentEvent::SessionRotated { .. }
        | DeploymentEvent::SelfHealTriggered { .. }
        | DeploymentEvent::Superseded { .. } => observer.on_notice(event),
    }
}

/// Drops everything.
pub struct NoopObserver;

impl DeploymentObserver for NoopObserver {}

/// Republishes every event on a broadcast channel.
pub struct BroadcastObserver {
    tx: broadcast::Sender<DeploymentEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: &DeploymentEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!(event_type = event.event_type(), "no event receivers");
        }
    }
}

impl DeploymentObserver for BroadcastObserver {
    fn on_started(&self, event: &DeploymentEvent) {
        self.send(event);
    }
    fn on_completed(&self, event: &DeploymentEvent) {
        self.send(event);
    }
    fn on_error(&self, event: &DeploymentEvent) {
        self.send(event);
    }
    fn on_notice(&self, event: &DeploymentEvent) {
        self.send(event);
    }
}

/// Logs lifecycle events.
pub struct TracingObserver;

impl DeploymentObserver for TracingObserver {
    fn on_started(&self, event: &DeploymentEvent) {
        if let DeploymentEvent::Started { deployment_id, message, files, .. } = event {
            info!(deployment_id = %deployment_id, files = files.len(), "{message}");
        }
    }

    fn on_completed(&self, event: &DeploymentEvent) {
        if let DeploymentEvent::Completed {
            deployment_id,
            instance_id,
            preview_url,
            attempts,
            duration_ms,
            ..
        } = event
        {
            info!(
                deployment_id = %deployment_id,
                instance_id = %instance_id,
                preview_url = ?preview_url,
                attempts,
                duration_ms,
                "deployment completed"
            );
        }
    }

    fn on_error(&self, event: &DeploymentEvent) {
        match event {
            DeploymentEvent::AttemptFailed {
                deployment_id,
                session_id,
                attempt,
                error,
                retry_in_ms,
                session_rotated,
                ..
            } => warn!(
                deployment_id = %deployment_id,
                session_id = %session_id,
                attempt,
                delay_ms = retry_in_ms,
                session_rotated,
                error = %error,
                "deployment attempt failed"
            ),
            DeploymentEvent::TimedOut { deployment_id, waited_ms, .. } => warn!(
                deployment_id = %deployment_id,
                waited_ms,
                "deployment not ready within master timeout"
            ),
            _ => {}
        }
    }

    fn on_notice(&self, event: &DeploymentEvent) {
        debug!(event_type = event.event_type(), "deployment notice");
    }
}

/// Forwards to several observers in order.
#[derive(Default)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn DeploymentObserver>>,
}

impl FanoutObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn DeploymentObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl DeploymentObserver for FanoutObserver {
    fn on_started(&self, event: &DeploymentEvent) {
        self.observers.iter().for_each(|o| o.on_started(event));
    }
    fn on_completed(&self, event: &DeploymentEvent) {
        self.observers.iter().for_each(|o| o.on_completed(event));
    }
    fn on_error(&self, event: &DeploymentEvent) {
        self.observers.iter().for_each(|o| o.on_error(event));
    }
    fn on_notice(&self, event: &DeploymentEvent) {
        self.observers.iter().for_each(|o| o.on_notice(event));
    }
}

/// Writes the deployment history log. Store failures are logged only.
pub struct HistoryObserver {
    repo: DeploymentHistoryRepo,
    project: String,
}

impl HistoryObserver {
    pub fn new(repo: DeploymentHistoryRepo, project: impl Into<String>) -> Self {
        Self {
            repo,
            project: project.into(),
        }
    }
}

fn log_store_err<T>(result: Result<T, shipyard_store::StoreError>, what: &str) {
    if let Err(e) = result {
        warn!(error = %e, "failed to record {what}");
    }
}

impl DeploymentObserver for HistoryObserver {
    fn on_started(&self, event: &DeploymentEvent) {
        if let DeploymentEvent::Started { deployment_id, session_id, files, .. } = event {
            log_store_err(
                self.repo.start(deployment_id, &self.project, session_id, files.len()),
                "deployment start",
            );
        }
    }

    fn on_completed(&self, event: &DeploymentEvent) {
        if let DeploymentEvent::Completed {
            deployment_id,
            instance_id,
            preview_url,
            tunnel_url,
            attempts,
            ..
        } = event
        {
            let instance = InstanceRef {
                instance_id: instance_id.clone(),
                preview_url: preview_url.clone(),
                tunnel_url: tunnel_url.clone(),
            };
            log_store_err(self.repo.complete(deployment_id, *attempts, &instance), "deployment completion");
        }
    }

    fn on_error(&self, event: &DeploymentEvent) {
        match event {
            DeploymentEvent::AttemptFailed {
                deployment_id,
                session_id,
                attempt,
                error,
                error_kind,
                retry_in_ms,
                session_rotated,
            } => {
                let row = AttemptRow {
                    attempt: *attempt,
                    session_id: session_id.clone(),
                    error: error.clone(),
                    error_kind: error_kind.clone(),
                    retry_in_ms: *retry_in_ms,
                    session_rotated: *session_rotated,
                };
                log_store_err(self.repo.record_attempt(deployment_id, &row), "attempt");
            }
            DeploymentEvent::TimedOut { deployment_id, error, .. } => {
                log_store_err(self.repo.mark_timed_out(deployment_id, error), "timeout");
            }
            _ => {}
        }
    }

    fn on_notice(&self, event: &DeploymentEvent) {
        if let DeploymentEvent::Superseded { deployment_id, .. } = event {
            log_store_err(self.repo.mark_superseded(deployment_id), "superseded deployment");
        }
    }
}
