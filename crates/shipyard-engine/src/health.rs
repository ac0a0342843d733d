//! Periodic instance health checks with self-healing.
//!
//! The monitor is armed for one instance at a time. A failed status query
//! is not an unhealthy instance: it is logged and the next tick retries.
//! A successful query reporting unhealthy (for `unhealthy_threshold`
//! consecutive ticks) disarms the monitor and asks the owner to heal,
//! unless a debugging session is active.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shipyard_core::events::DeploymentEvent;
use shipyard_core::ids::InstanceId;
use shipyard_telemetry::DeployMetrics;

use crate::observer::{notify, DeploymentObserver};
use crate::session::SessionIdentity;

/// Owner of the monitor that knows how to redeploy.
pub trait SelfHeal: Send + Sync {
    fn is_debugging(&self) -> bool;
    fn heal(self: Arc<Self>) -> BoxFuture<'static, ()>;
}

struct Armed {
    generation: u64,
    instance_id: InstanceId,
    cancel: CancellationToken,
}

#[derive(Default)]
struct MonitorState {
    armed: Option<Armed>,
    generation: u64,
}

pub struct HealthMonitor {
    identity: Arc<SessionIdentity>,
    target: Weak<dyn SelfHeal>,
    observer: Arc<dyn DeploymentObserver>,
    metrics: Arc<DeployMetrics>,
    interval: Duration,
    unhealthy_threshold: u32,
    state: Arc<Mutex<MonitorState>>,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        identity: Arc<SessionIdentity>,
        target: Weak<dyn SelfHeal>,
        observer: Arc<dyn DeploymentObserver>,
        metrics: Arc<DeployMetrics>,
        interval: Duration,
        unhealthy_threshold: u32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            identity,
            target,
            observer,
            metrics,
            interval,
            unhealthy_threshold: unhealthy_threshold.max(1),
            state: Arc::default(),
            shutdown,
        }
    }

    /// Start watching `instance_id`, replacing any previous watch.
    pub fn arm(&self, instance_id: InstanceId) {
        let cancel = self.shutdown.child_token();
        let generation = {
            let mut state = self.state.lock();
            if let Some(prev) = state.armed.take() {
                prev.cancel.cancel();
            }
            state.generation += 1;
            state.armed = Some(Armed {
                generation: state.generation,
                instance_id: instance_id.clone(),
                cancel: cancel.clone(),
            });
            state.generation
        };
        info!(instance_id = %instance_id, interval_ms = self.interval.as_millis() as u64, "health monitor armed");

        let task = Tick {
            identity: Arc::clone(&self.identity),
            target: self.target.clone(),
            observer: Arc::clone(&self.observer),
            metrics: Arc::clone(&self.metrics),
            state: Arc::clone(&self.state),
            threshold: self.unhealthy_threshold,
            generation,
            instance_id,
        };
        tokio::spawn(task.run(self.interval, cancel));
    }

    pub fn disarm(&self) {
        if let Some(prev) = self.state.lock().armed.take() {
            prev.cancel.cancel();
            debug!(instance_id = %prev.instance_id, "health monitor disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed.is_some()
    }

    pub fn armed_instance(&self) -> Option<InstanceId> {
        self.state.lock().armed.as_ref().map(|a| a.instance_id.clone())
    }
}

struct Tick {
    identity: Arc<SessionIdentity>,
    target: Weak<dyn SelfHeal>,
    observer: Arc<dyn DeploymentObserver>,
    metrics: Arc<DeployMetrics>,
    state: Arc<Mutex<MonitorState>>,
    threshold: u32,
    generation: u64,
    instance_id: InstanceId,
}

impl Tick {
    async fn run(self, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut unhealthy = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let (_, client) = self.identity.client();
            let status = match client.get_instance_status(&self.instance_id).await {
                Ok(status) if status.success => status,
                Ok(status) => {
                    warn!(instance_id = %self.instance_id, error = ?status.error, "health check returned no status");
                    continue;
                }
                Err(e) => {
                    warn!(instance_id = %self.instance_id, error = %e, "health check failed");
                    continue;
                }
            };

            if status.is_healthy {
                unhealthy = 0;
                continue;
            }
            unhealthy += 1;
            if unhealthy < self.threshold {
                debug!(instance_id = %self.instance_id, unhealthy, threshold = self.threshold, "instance unhealthy");
                continue;
            }

            let Some(target) = self.target.upgrade() else {
                return;
            };
            if target.is_debugging() {
                info!(instance_id = %self.instance_id, "instance unhealthy, self-heal suppressed while debugging");
                continue;
            }

            if !self.disarm_self() {
                return;
            }
            warn!(instance_id = %self.instance_id, "instance unhealthy, redeploying");
            self.metrics.self_heal();
            notify(
                self.observer.as_ref(),
                &DeploymentEvent::SelfHealTriggered {
                    instance_id: self.instance_id.clone(),
                },
            );
            tokio::spawn(target.heal());
            return;
        }
    }

    /// Clear the armed slot if it still belongs to this tick loop.
    fn disarm_self(&self) -> bool {
        let mut state = self.state.lock();
        match &state.armed {
            Some(armed) if armed.generation == self.generation => {
                state.armed = None;
                true
            }
            _ => false,
        }
    }
}
