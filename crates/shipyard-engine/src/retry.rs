use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use shipyard_core::deployment::{DeploymentOutcome, DeploymentRequest};
use shipyard_core::events::DeploymentEvent;
use shipyard_core::ids::DeploymentId;
use shipyard_telemetry::DeployMetrics;

use crate::backoff::{detached_timeout, BackoffPolicy};
use crate::error::DeployError;
use crate::executor::{DeployExecutor, ExecutionResult};
use crate::health::HealthMonitor;
use crate::observer::{notify, DeploymentObserver};
use crate::session::SessionIdentity;
use crate::setup::SetupQueue;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    /// Every Nth consecutive failure rotates the session.
    pub rotation_threshold: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_millis(60_000),
            rotation_threshold: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    fn should_rotate(&self, failures: u32, err: &DeployError) -> bool {
        err.is_session_fatal() || (self.rotation_threshold > 0 && failures % self.rotation_threshold == 0)
    }
}

/// Runs deployment attempts until one succeeds or the loop is cancelled.
pub struct RetryCoordinator {
    executor: Arc<DeployExecutor>,
    identity: Arc<SessionIdentity>,
    health: Arc<HealthMonitor>,
    setup: Arc<SetupQueue>,
    observer: Arc<dyn DeploymentObserver>,
    metrics: Arc<DeployMetrics>,
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(
        executor: Arc<DeployExecutor>,
        identity: Arc<SessionIdentity>,
        health: Arc<HealthMonitor>,
        setup: Arc<SetupQueue>,
        observer: Arc<dyn DeploymentObserver>,
        metrics: Arc<DeployMetrics>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            executor,
            identity,
            health,
            setup,
            observer,
            metrics,
            policy,
        }
    }

    /// `None` only when cancelled; there is no attempt ceiling.
    #[instrument(skip_all, fields(deployment_id = %deployment_id))]
    pub async fn run(
        &self,
        deployment_id: DeploymentId,
        request: DeploymentRequest,
        cancel: CancellationToken,
    ) -> Option<DeploymentOutcome> {
        let started = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                debug!(attempt, "retry loop cancelled");
                return None;
            }

            self.metrics.attempt();
            let session_id = self.identity.session_id();
            let executor = Arc::clone(&self.executor);
            let req = request.clone();
            let result = detached_timeout(self.policy.attempt_timeout, async move {
                executor.execute(&req).await
            })
            .await;

            let err = match result {
                Ok(result) => return Some(self.succeed(&deployment_id, result, attempt, started).await),
                Err(err) => err,
            };

            self.metrics.attempt_failed();
            let rotated = self.policy.should_rotate(attempt, &err);
            if rotated {
                let (previous, current) = self.identity.rotate();
                self.metrics.session_rotated();
                notify(
                    self.observer.as_ref(),
                    &DeploymentEvent::SessionRotated {
                        previous,
                        current,
                        reason: if err.is_session_fatal() {
                            "fatal error signature".into()
                        } else {
                            format!("{} consecutive failures", attempt)
                        },
                    },
                );
            } else {
                self.identity.clear_instance();
            }

            let delay = self.policy.backoff.delay(attempt);
            notify(
                self.observer.as_ref(),
                &DeploymentEvent::AttemptFailed {
                    deployment_id: deployment_id.clone(),
                    session_id,
                    attempt,
                    error: err.to_string(),
                    error_kind: err.error_kind().to_string(),
                    retry_in_ms: delay.as_millis() as u64,
                    session_rotated: rotated,
                },
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(attempt, "retry loop cancelled during backoff");
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn succeed(
        &self,
        deployment_id: &DeploymentId,
        result: ExecutionResult,
        attempts: u32,
        started: Instant,
    ) -> DeploymentOutcome {
        let instance_id = result.instance.instance_id.clone();
        if result.freshly_created || !self.health.is_armed() {
            self.health.arm(instance_id.clone());
        }
        self.setup.run(result.client.as_ref(), &instance_id).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.deployment_completed(duration_ms);
        info!(instance_id = %instance_id, attempts, duration_ms, files = result.files_written, "deployment succeeded");

        notify(
            self.observer.as_ref(),
            &DeploymentEvent::Completed {
                deployment_id: deployment_id.clone(),
                message: "Deployment ready".into(),
                instance_id,
                preview_url: result.instance.preview_url.clone(),
                tunnel_url: result.instance.tunnel_url.clone(),
                attempts,
                duration_ms,
                freshly_created: result.freshly_created,
            },
        );
        result.instance.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::errors::SandboxError;

    #[test]
    fn rotation_on_fatal_or_every_third_failure() {
        let policy = RetryPolicy::default();
        let transient = DeployError::Sandbox(SandboxError::Network("refused".into()));
        let fatal = DeployError::Sandbox(SandboxError::Remote("Network connection lost.".into()));

        let rotations: Vec<u32> = (1..=9).filter(|n| policy.should_rotate(*n, &transient)).collect();
        assert_eq!(rotations, vec![3, 6, 9]);
        assert!(policy.should_rotate(1, &fatal));
    }

    #[test]
    fn zero_threshold_only_rotates_on_fatal() {
        let policy = RetryPolicy {
            rotation_threshold: 0,
            ..Default::default()
        };
        let transient = DeployError::AttemptTimeout(Duration::from_secs(60));
        assert!(!(1..=10).any(|n| policy.should_rotate(n, &transient)));
    }
}
