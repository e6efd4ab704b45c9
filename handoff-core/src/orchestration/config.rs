use std::time::Duration;

use handoff_model::FlagType;
use serde::{Deserialize, Serialize};

/// Shortest cadence any timer loop runs at. `tokio::time::interval` rejects
/// a zero period.
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// Global knobs that tune the coordination runtime.
///
/// All fields carry defaults so deployments can override a single value
/// without supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HandoffConfig {
    /// Per-subscriber delivery queue sizing.
    pub bus: BusConfig,
    /// Flag TTLs, priorities and retention of resolved flags.
    pub flags: FlagConfig,
    /// Session cache idle TTL.
    pub sessions: SessionConfig,
    /// Expiry sweep cadence.
    pub sweeper: SweeperConfig,
    /// Worker pool sizes, poll cadence and retry policy.
    pub workers: WorkerPoolConfig,
    /// Workflow-level deadlines.
    pub coordinator: CoordinatorConfig,
}

impl HandoffConfig {
    /// Rejects values the runtime cannot operate with and returns warnings for
    /// legal but suspicious combinations.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        if self.bus.subscriber_capacity == 0 {
            return Err("bus.subscriber_capacity must be greater than zero".into());
        }
        if self.sweeper.interval_ms == 0 {
            return Err("sweeper.interval_ms must be greater than zero".into());
        }
        if self.workers.poll_interval_ms == 0 {
            return Err("workers.poll_interval_ms must be greater than zero".into());
        }
        if self.workers.prediction_parallelism == 0 || self.workers.report_parallelism == 0 {
            return Err("worker parallelism must be at least one per flag type".into());
        }
        if self.workers.retry.max_attempts == 0 {
            return Err("workers.retry.max_attempts must be at least 1".into());
        }
        if self.coordinator.workflow_timeout_secs == 0 {
            return Err("coordinator.workflow_timeout_secs must be greater than zero".into());
        }
        if self.coordinator.recheck_interval_ms == 0 {
            return Err("coordinator.recheck_interval_ms must be greater than zero".into());
        }

        let mut warnings = Vec::new();
        let shortest_ttl_ms = self
            .flags
            .predict_ttl_secs
            .min(self.flags.report_ttl_secs)
            .saturating_mul(1_000);
        if self.sweeper.interval_ms > shortest_ttl_ms {
            warnings.push(format!(
                "sweeper.interval_ms ({}) exceeds the shortest flag TTL ({}ms); expired flags will linger",
                self.sweeper.interval_ms, shortest_ttl_ms
            ));
        }
        let chain_ttl_secs = self
            .flags
            .predict_ttl_secs
            .saturating_add(self.flags.report_ttl_secs);
        if self.coordinator.workflow_timeout_secs > chain_ttl_secs {
            warnings.push(format!(
                "coordinator.workflow_timeout_secs ({}) exceeds the combined flag TTLs ({}s)",
                self.coordinator.workflow_timeout_secs, chain_ttl_secs
            ));
        }
        if self.workers.retry.backoff_base_ms > self.workers.retry.backoff_max_ms {
            warnings.push(
                "workers.retry.backoff_base_ms is larger than backoff_max_ms; every retry waits the maximum"
                    .to_string(),
            );
        }
        Ok(warnings)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Capacity of each subscriber's delivery queue. Events beyond this are
    /// dropped with a warning instead of blocking the publisher.
    pub subscriber_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagConfig {
    /// TTL (seconds) for `PREDICT` flags.
    pub predict_ttl_secs: u64,
    /// TTL (seconds) for `GENERATE_REPORT` flags.
    pub report_ttl_secs: u64,
    /// Priority assigned when a request does not carry one.
    pub default_priority: i32,
    /// How long resolved flags stay queryable before the sweeper drops them.
    pub retain_resolved_secs: u64,
}

impl FlagConfig {
    pub fn ttl_for(&self, flag_type: FlagType) -> Duration {
        match flag_type {
            FlagType::Predict => Duration::from_secs(self.predict_ttl_secs),
            FlagType::GenerateReport => Duration::from_secs(self.report_ttl_secs),
        }
    }

    pub fn retain_resolved(&self) -> Duration {
        Duration::from_secs(self.retain_resolved_secs)
    }
}

impl Default for FlagConfig {
    fn default() -> Self {
        Self {
            predict_ttl_secs: 300,
            report_ttl_secs: 600,
            default_priority: 0,
            retain_resolved_secs: 900,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time (seconds) after which a session's slots are evicted.
    pub ttl_secs: u64,
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_secs: 30 * 60 }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Cadence (ms) of the expiry sweep.
    pub interval_ms: u64,
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of prediction worker instances.
    pub prediction_parallelism: usize,
    /// Number of report worker instances.
    pub report_parallelism: usize,
    /// Cadence (ms) of the recovery re-scan over pending flags.
    pub poll_interval_ms: u64,
    /// Bounded retry around collaborator calls. One attempt disables retries.
    pub retry: RetryConfig,
}

impl WorkerPoolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn parallelism_for(&self, flag_type: FlagType) -> usize {
        match flag_type {
            FlagType::Predict => self.prediction_parallelism,
            FlagType::GenerateReport => self.report_parallelism,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            prediction_parallelism: 2,
            report_parallelism: 1,
            poll_interval_ms: 2_000,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Overall deadline (seconds) for one submitted workflow.
    pub workflow_timeout_secs: u64,
    /// Cadence (ms) at which an awaited flag is re-read from the store in case
    /// its completion event was dropped.
    pub recheck_interval_ms: u64,
    /// How long a finished workflow's status stays queryable before the
    /// sweeper drops it.
    pub retain_finished_secs: u64,
}

impl CoordinatorConfig {
    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }

    pub fn retain_finished(&self) -> Duration {
        Duration::from_secs(self.retain_finished_secs)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workflow_timeout_secs: 15 * 60,
            recheck_interval_ms: 1_000,
            retain_finished_secs: 900,
        }
    }
}
