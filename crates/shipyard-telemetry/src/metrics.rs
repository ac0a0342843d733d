use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Monotonically increasing counter.
#[derive(Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Stores all observations for percentile computation.
#[derive(Default)]
struct Histogram {
    observations: Mutex<Vec<f64>>,
}

impl Histogram {
    fn observe(&self, value: f64) {
        self.observations.lock().push(value);
    }

    fn summary(&self) -> HistogramSummary {
        let mut obs = self.observations.lock().clone();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = obs.len();
        let sum: f64 = obs.iter().sum();
        let at = |q: f64| obs[((count as f64 * q) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum,
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Point-in-time view of the deployment counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub deployments_started: u64,
    pub deployments_completed: u64,
    pub deployments_timed_out: u64,
    pub coalesced_callers: u64,
    pub attempts: u64,
    pub attempt_failures: u64,
    pub session_rotations: u64,
    pub self_heals: u64,
    pub policy_drops: u64,
    pub deploy_duration_ms: HistogramSummary,
}

/// In-process deployment metrics. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct DeployMetrics {
    deployments_started: Counter,
    deployments_completed: Counter,
    deployments_timed_out: Counter,
    coalesced_callers: Counter,
    attempts: Counter,
    attempt_failures: Counter,
    session_rotations: Counter,
    self_heals: Counter,
    policy_drops: Counter,
    deploy_duration_ms: Histogram,
}

impl DeployMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deployment_started(&self) {
        self.deployments_started.increment();
    }

    pub fn deployment_completed(&self, duration_ms: u64) {
        self.deployments_completed.increment();
        self.deploy_duration_ms.observe(duration_ms as f64);
    }

    pub fn deployment_timed_out(&self) {
        self.deployments_timed_out.increment();
    }

    pub fn caller_coalesced(&self) {
        self.coalesced_callers.increment();
    }

    pub fn attempt(&self) {
        self.attempts.increment();
    }

    pub fn attempt_failed(&self) {
        self.attempt_failures.increment();
    }

    pub fn session_rotated(&self) {
        self.session_rotations.increment();
    }

    pub fn self_heal(&self) {
        self.self_heals.increment();
    }

    pub fn policy_drops(&self, n: u64) {
        self.policy_drops.add(n);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            deployments_started: self.deployments_started.get(),
            deployments_completed: self.deployments_completed.get(),
            deployments_timed_out: self.deployments_timed_out.get(),
            coalesced_callers: self.coalesced_callers.get(),
            attempts: self.attempts.get(),
            attempt_failures: self.attempt_failures.get(),
            session_rotations: self.session_rotations.get(),
            self_heals: self.self_heals.get(),
            policy_drops: self.policy_drops.get(),
            deploy_duration_ms: self.deploy_duration_ms.summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = DeployMetrics::new();
        m.deployment_started();
        m.attempt();
        m.attempt();
        m.attempt_failed();
        m.session_rotated();
        m.policy_drops(3);

        let snap = m.snapshot();
        assert_eq!(snap.deployments_started, 1);
        assert_eq!(snap.attempts, 2);
        assert_eq!(snap.attempt_failures, 1);
        assert_eq!(snap.session_rotations, 1);
        assert_eq!(snap.policy_drops, 3);
        assert_eq!(snap.deployments_completed, 0);
    }

    #[test]
    fn empty_histogram_summary_is_zero() {
        let m = DeployMetrics::new();
        assert_eq!(m.snapshot().deploy_duration_ms, HistogramSummary::default());
    }

    #[test]
    fn duration_percentiles() {
        let m = DeployMetrics::new();
        for ms in 1..=100 {
            m.deployment_completed(ms);
        }
        let summary = m.snapshot().deploy_duration_ms;
        assert_eq!(summary.count, 100);
        assert_eq!(summary.sum, 5050.0);
        assert_eq!(summary.p50, 51.0);
        assert_eq!(summary.p95, 96.0);
        assert_eq!(summary.p99, 100.0);
    }

    #[test]
    fn snapshot_serializes() {
        let m = DeployMetrics::new();
        m.self_heal();
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["self_heals"], 1);
    }
}
