//! Top-level deployment entry point.
//!
//! `deploy()` coalesces concurrent callers onto one shared retry loop. The
//! loop itself runs on a spawned task, so a caller giving up at the master
//! timeout stops waiting without stopping the work; the loop only ends on
//! success, when a newer top-level deployment supersedes it, or on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shipyard_core::deployment::{DeploymentOutcome, DeploymentRequest, InstanceRef};
use shipyard_core::events::DeploymentEvent;
use shipyard_core::files::FileSource;
use shipyard_core::ids::{DeploymentId, InstanceId, SessionId};
use shipyard_core::policy::{PathPrefixPolicy, ReadOnlyPolicy};
use shipyard_core::sandbox::{EnvProvider, SandboxClientFactory};
use shipyard_store::{Database, DeploymentHistoryRepo, DeploymentStateRepo};
use shipyard_telemetry::DeployMetrics;

use crate::backoff::BackoffPolicy;
use crate::executor::DeployExecutor;
use crate::health::{HealthMonitor, SelfHeal};
use crate::observer::{notify, DeploymentObserver, FanoutObserver, HistoryObserver, TracingObserver};
use crate::reconciler::{InstanceReconciler, NoEnv, TemplateSpec};
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::selector::FileSelector;
use crate::session::SessionIdentity;
use crate::setup::SetupQueue;

/// Timing constants. The defaults are the production values.
#[derive(Clone, Copy, Debug)]
pub struct OrchestratorConfig {
    pub attempt_timeout: Duration,
    /// Ceiling on how long one caller waits, measured from when it called.
    pub master_timeout: Duration,
    pub health_interval: Duration,
    pub rotation_threshold: u32,
    pub backoff: BackoffPolicy,
    /// Consecutive unhealthy ticks before self-heal.
    pub unhealthy_threshold: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_millis(60_000),
            master_timeout: Duration::from_millis(300_000),
            health_interval: Duration::from_millis(30_000),
            rotation_threshold: 3,
            backoff: BackoffPolicy::default(),
            unhealthy_threshold: 1,
        }
    }
}

impl OrchestratorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: self.attempt_timeout,
            rotation_threshold: self.rotation_threshold,
            backoff: self.backoff,
        }
    }
}

/// Collaborators for [`DeploymentOrchestrator::new`].
pub struct OrchestratorDeps {
    pub factory: Arc<dyn SandboxClientFactory>,
    pub files: Arc<dyn FileSource>,
    pub env: Arc<dyn EnvProvider>,
    pub policy: Arc<dyn ReadOnlyPolicy>,
    pub template: TemplateSpec,
    pub observer: Arc<dyn DeploymentObserver>,
    pub metrics: Arc<DeployMetrics>,
    /// State store and the project key rows are filed under.
    pub store: Option<(Database, String)>,
    pub setup_commands: Vec<String>,
}

impl OrchestratorDeps {
    pub fn new(factory: Arc<dyn SandboxClientFactory>, files: Arc<dyn FileSource>) -> Self {
        Self {
            factory,
            files,
            env: Arc::new(NoEnv),
            policy: Arc::new(PathPrefixPolicy::default()),
            template: TemplateSpec::default(),
            observer: Arc::new(TracingObserver),
            metrics: Arc::new(DeployMetrics::new()),
            store: None,
            setup_commands: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Arc<dyn EnvProvider>) -> Self {
        self.env = env;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn ReadOnlyPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_template(mut self, template: TemplateSpec) -> Self {
        self.template = template;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DeploymentObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<DeployMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_store(mut self, db: Database, project: impl Into<String>) -> Self {
        self.store = Some((db, project.into()));
        self
    }

    pub fn with_setup_commands(mut self, commands: Vec<String>) -> Self {
        self.setup_commands = commands;
        self
    }
}

type SharedOutcome = Shared<BoxFuture<'static, Option<DeploymentOutcome>>>;

struct InFlight {
    deployment_id: DeploymentId,
    outcome: SharedOutcome,
}

/// The retry loop currently allowed to run.
struct ActiveLoop {
    deployment_id: DeploymentId,
    cancel: CancellationToken,
}

struct Inner {
    config: OrchestratorConfig,
    identity: Arc<SessionIdentity>,
    retry: Arc<RetryCoordinator>,
    health: Arc<HealthMonitor>,
    setup: Arc<SetupQueue>,
    observer: Arc<dyn DeploymentObserver>,
    metrics: Arc<DeployMetrics>,
    in_flight: Mutex<Option<InFlight>>,
    active_loop: Mutex<Option<ActiveLoop>>,
    debugging: AtomicBool,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct DeploymentOrchestrator {
    inner: Arc<Inner>,
}

impl DeploymentOrchestrator {
    pub fn new(deps: OrchestratorDeps, config: OrchestratorConfig) -> Self {
        let OrchestratorDeps {
            factory,
            files,
            env,
            policy,
            template,
            observer,
            metrics,
            store,
            setup_commands,
        } = deps;

        let (identity, observer) = match store {
            Some((db, project)) => {
                let identity =
                    SessionIdentity::restore(factory, DeploymentStateRepo::new(db.clone()), project.clone());
                let history: Arc<dyn DeploymentObserver> =
                    Arc::new(HistoryObserver::new(DeploymentHistoryRepo::new(db), project));
                let fanout: Arc<dyn DeploymentObserver> = Arc::new(FanoutObserver::new().with(history).with(observer));
                (identity, fanout)
            }
            None => (SessionIdentity::new(factory), observer),
        };
        let identity = Arc::new(identity);

        let executor = Arc::new(DeployExecutor::new(
            InstanceReconciler::new(Arc::clone(&identity), env, template),
            FileSelector::new(policy, Arc::clone(&metrics)),
            files,
        ));
        let setup = Arc::new(SetupQueue::new(setup_commands));
        let shutdown = CancellationToken::new();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let target: Weak<dyn SelfHeal> = weak.clone();
            let health = Arc::new(HealthMonitor::new(
                Arc::clone(&identity),
                target,
                Arc::clone(&observer),
                Arc::clone(&metrics),
                config.health_interval,
                config.unhealthy_threshold,
                shutdown.clone(),
            ));
            let retry = Arc::new(RetryCoordinator::new(
                executor,
                Arc::clone(&identity),
                Arc::clone(&health),
                Arc::clone(&setup),
                Arc::clone(&observer),
                Arc::clone(&metrics),
                config.retry_policy(),
            ));
            Inner {
                config,
                identity,
                retry,
                health,
                setup,
                observer,
                metrics,
                in_flight: Mutex::new(None),
                active_loop: Mutex::new(None),
                debugging: AtomicBool::new(false),
                shutdown,
            }
        });

        Self { inner }
    }

    /// Deploy and wait, at most the master timeout, for a ready instance.
    ///
    /// Concurrent callers share one underlying deployment and resolve to the
    /// same outcome. `None` means this caller's wait expired (or the
    /// orchestrator is shut down); the deployment itself may still finish.
    pub async fn deploy(&self, request: DeploymentRequest) -> Option<DeploymentOutcome> {
        self.inner.deploy(request).await
    }

    /// Commands to run after the next successful deployment.
    pub fn queue_setup_commands(&self, commands: impl IntoIterator<Item = String>) {
        self.inner.setup.push(commands);
    }

    /// While set, unhealthy instances are left alone for inspection.
    pub fn set_debugging(&self, debugging: bool) {
        self.inner.debugging.store(debugging, Ordering::SeqCst);
        debug!(debugging, "debugging session flag changed");
    }

    pub fn is_debugging(&self) -> bool {
        self.inner.is_debugging()
    }

    /// Whether a caller is currently waiting on a deployment.
    pub fn is_deploying(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.identity.session_id()
    }

    pub fn instance(&self) -> Option<InstanceRef> {
        self.inner.identity.instance()
    }

    /// Instance the health monitor is watching, if armed.
    pub fn monitored_instance(&self) -> Option<InstanceId> {
        self.inner.health.armed_instance()
    }

    pub fn metrics(&self) -> Arc<DeployMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Stop the health monitor and any background retry loop. Later
    /// `deploy()` calls return `None` immediately.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Inner {
    fn is_debugging(&self) -> bool {
        self.debugging.load(Ordering::SeqCst)
    }

    async fn deploy(self: &Arc<Self>, request: DeploymentRequest) -> Option<DeploymentOutcome> {
        if self.shutdown.is_cancelled() {
            debug!("deploy requested after shutdown");
            return None;
        }

        let joined = Instant::now();
        let (deployment_id, outcome, started) = self.join_or_start(request);
        let _guard = started.then(|| InFlightGuard {
            inner: self,
            deployment_id: deployment_id.clone(),
        });

        match tokio::time::timeout(self.config.master_timeout, outcome).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let waited_ms = joined.elapsed().as_millis() as u64;
                self.metrics.deployment_timed_out();
                notify(
                    self.observer.as_ref(),
                    &DeploymentEvent::TimedOut {
                        deployment_id,
                        error: format!(
                            "deployment not ready after {}s",
                            self.config.master_timeout.as_secs()
                        ),
                        waited_ms,
                    },
                );
                None
            }
        }
    }

    /// Join the in-flight deployment or install a new one. The new handle is
    /// installed before the slot lock is released.
    fn join_or_start(self: &Arc<Self>, request: DeploymentRequest) -> (DeploymentId, SharedOutcome, bool) {
        let mut slot = self.in_flight.lock();
        if let Some(current) = slot.as_ref() {
            self.metrics.caller_coalesced();
            debug!(deployment_id = %current.deployment_id, "joining in-flight deployment");
            return (current.deployment_id.clone(), current.outcome.clone(), false);
        }

        let deployment_id = DeploymentId::new();
        let cancel = self.shutdown.child_token();
        let previous = self.active_loop.lock().replace(ActiveLoop {
            deployment_id: deployment_id.clone(),
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
            info!(
                deployment_id = %previous.deployment_id,
                superseded_by = %deployment_id,
                "background deployment superseded"
            );
            notify(
                self.observer.as_ref(),
                &DeploymentEvent::Superseded {
                    deployment_id: previous.deployment_id,
                    superseded_by: deployment_id.clone(),
                },
            );
        }

        // Observers see the start before the loop can report anything.
        self.metrics.deployment_started();
        notify(
            self.observer.as_ref(),
            &DeploymentEvent::Started {
                deployment_id: deployment_id.clone(),
                session_id: self.identity.session_id(),
                message: if request.files.is_empty() {
                    "Deploying all files".into()
                } else {
                    format!("Deploying {} file(s)", request.files.len())
                },
                files: request.files.iter().map(|f| f.path.clone()).collect(),
            },
        );

        let retry = Arc::clone(&self.retry);
        let owner = Arc::downgrade(self);
        let id = deployment_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = retry.run(id.clone(), request, cancel).await;
            if let Some(owner) = owner.upgrade() {
                owner.loop_finished(&id);
            }
            outcome
        });
        let outcome = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "deployment task ended abnormally");
                    None
                }
            }
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            deployment_id: deployment_id.clone(),
            outcome: outcome.clone(),
        });
        (deployment_id, outcome, true)
    }

    fn loop_finished(&self, deployment_id: &DeploymentId) {
        let mut active = self.active_loop.lock();
        if active.as_ref().is_some_and(|a| &a.deployment_id == deployment_id) {
            *active = None;
        }
    }

    fn clear_in_flight(&self, deployment_id: &DeploymentId) {
        let mut slot = self.in_flight.lock();
        if slot.as_ref().is_some_and(|f| &f.deployment_id == deployment_id) {
            *slot = None;
        }
    }

    fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.health.disarm();
        self.active_loop.lock().take();
        info!("deployment orchestrator shut down");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl SelfHeal for Inner {
    fn is_debugging(&self) -> bool {
        Inner::is_debugging(self)
    }

    fn heal(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            if self.deploy(DeploymentRequest::all_files()).await.is_none() {
                warn!("self-heal deployment did not complete");
            }
        }
        .boxed()
    }
}

/// Clears the in-flight marker when the starting caller stops waiting,
/// whichever way it exits.
struct InFlightGuard<'a> {
    inner: &'a Inner,
    deployment_id: DeploymentId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.clear_in_flight(&self.deployment_id);
    }
}
