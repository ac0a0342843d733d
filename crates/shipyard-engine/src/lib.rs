pub mod backoff;
pub mod error;
pub mod executor;
pub mod health;
pub mod observer;
pub mod orchestrator;
pub mod reconciler;
pub mod retry;
pub mod selector;
pub mod session;
pub mod setup;

pub use backoff::BackoffPolicy;
pub use error::DeployError;
pub use observer::{
    BroadcastObserver, DeploymentObserver, FanoutObserver, HistoryObserver, NoopObserver, TracingObserver,
};
pub use orchestrator::{DeploymentOrchestrator, OrchestratorConfig, OrchestratorDeps};
pub use reconciler::{NoEnv, TemplateSpec};
pub use retry::RetryPolicy;
