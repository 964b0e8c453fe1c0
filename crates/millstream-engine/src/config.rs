//! Engine configuration.
//!
//! All knobs recognized by the core. Deployments typically deserialize this
//! from a JSON/environment layer; defaults match a single-node setup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum age (seconds) of a RUNNING task before the integrity monitor
    /// considers it for recovery. Negative disables the monitor entirely.
    pub execution_integrity_check_delay: i64,

    /// Maximum number of task executions examined per integrity pass.
    pub execution_integrity_check_batch_size: usize,

    /// Size limit (KB) for long execution fields (input, output, params,
    /// published). Negative means unlimited.
    pub execution_field_size_limit_kb: i64,

    /// Action heartbeat tracking.
    pub action_heartbeat: HeartbeatConfig,

    /// Delayed-job scheduler tuning.
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_integrity_check_delay: 120,
            execution_integrity_check_batch_size: 20,
            execution_field_size_limit_kb: 1024,
            action_heartbeat: HeartbeatConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the integrity check delay (negative disables the monitor).
    pub fn with_integrity_check_delay(mut self, seconds: i64) -> Self {
        self.execution_integrity_check_delay = seconds;
        self
    }

    pub fn with_integrity_check_batch_size(mut self, size: usize) -> Self {
        self.execution_integrity_check_batch_size = size.max(1);
        self
    }

    /// Set the long-field size limit in KB (negative = unlimited).
    pub fn with_field_size_limit_kb(mut self, limit: i64) -> Self {
        self.execution_field_size_limit_kb = limit;
        self
    }

    pub fn with_heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.action_heartbeat = config;
        self
    }

    pub fn with_scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Whether the integrity monitor is enabled at all.
    pub fn integrity_check_enabled(&self) -> bool {
        self.execution_integrity_check_delay >= 0
    }
}

/// Action heartbeat configuration.
///
/// An action that has not heartbeated for `max_missed_heartbeats * interval`
/// is declared lost and failed by the sweep job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Grace period (seconds) granted to a freshly created action before its
    /// first heartbeat is expected.
    pub first_heartbeat_timeout: u64,

    /// Number of missed heartbeats after which an action is declared lost.
    pub max_missed_heartbeats: u32,

    /// Expected heartbeat interval in seconds. Zero disables the sweep.
    pub interval: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            first_heartbeat_timeout: 3600,
            max_missed_heartbeats: 15,
            interval: 20,
        }
    }
}

impl HeartbeatConfig {
    pub fn enabled(&self) -> bool {
        self.interval > 0
    }

    /// How long an action may stay silent before it is considered lost.
    pub fn max_silence(&self) -> Duration {
        Duration::from_secs(self.interval * u64::from(self.max_missed_heartbeats))
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between polling passes.
    #[serde(with = "duration_millis")]
    pub fixed_delay: Duration,

    /// How long a captured job may stay unfinished before another worker is
    /// allowed to re-capture it (crash recovery).
    #[serde(with = "duration_millis")]
    pub capture_timeout: Duration,

    /// Maximum number of due jobs claimed per polling pass.
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fixed_delay: Duration::from_secs(1),
            capture_timeout: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn with_fixed_delay(mut self, delay: Duration) -> Self {
        self.fixed_delay = delay;
        self
    }

    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
