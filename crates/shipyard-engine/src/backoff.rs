//! Backoff and timeout helpers shared by the retry loop and the orchestrator.

use std::future::Future;
use std::time::Duration;

use crate::error::DeployError;

/// Exponential backoff with an exponent cap and an absolute ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Largest exponent applied, i.e. growth stops at attempt `exponent_cap + 1`.
    pub exponent_cap: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(30_000),
            exponent_cap: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay after failed attempt `attempt` (1-based):
    /// `min(base * 2^min(attempt - 1, exponent_cap), cap)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(self.exponent_cap).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }
}

/// Run `fut` on its own task and wait at most `limit` for it.
///
/// On expiry the task is left running; only the wait stops.
pub async fn detached_timeout<F, T>(limit: Duration, fut: F) -> Result<T, DeployError>
where
    F: Future<Output = Result<T, DeployError>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(fut);
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(DeployError::Internal(format!("attempt task failed: {join_err}"))),
        Err(_) => Err(DeployError::AttemptTimeout(limit)),
    }
}
