//! Job queue configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default worker cap: one per CPU.
fn default_max_workers() -> usize {
    num_cpus::get()
}

/// Default idle timeout before a worker exits: 4 seconds.
fn default_idle_timeout_ms() -> u64 {
    4_000
}

/// Default pause after an unproductive promotion pass: 2 seconds.
fn default_retry_pause_ms() -> u64 {
    2_000
}

/// Default longest single sleep of a scheduler-wait thread: 30 seconds.
fn default_sched_slice_ms() -> u64 {
    30_000
}

/// Configuration for a [`JobQueue`](crate::core::JobQueue).
///
/// The three timing knobs default to the values the director daemon has
/// always used; tests compress them to run the same machinery in
/// milliseconds.
///
/// # Example
///
/// ```rust
/// use director_jobq::config::QueueConfig;
///
/// let config = QueueConfig::new()
///     .with_max_workers(10)
///     .with_idle_timeout(std::time::Duration::from_secs(4));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Upper bound on concurrently live worker threads.
    ///
    /// Workers are spawned on demand and exit after the idle timeout; the
    /// pool refills on new submissions.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How long an idle worker waits on the work condition before exiting.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// How long a worker pauses, queue mutex released, when queued work
    /// exists that the arbiter cannot yet satisfy. Guards against busy-wait
    /// while counters are held elsewhere.
    #[serde(default = "default_retry_pause_ms")]
    pub retry_pause_ms: u64,

    /// Longest single sleep of a scheduler-wait thread. Bounds how late a
    /// cancellation of a future-scheduled job is observed.
    #[serde(default = "default_sched_slice_ms")]
    pub sched_wait_slice_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            idle_timeout_ms: default_idle_timeout_ms(),
            retry_pause_ms: default_retry_pause_ms(),
            sched_wait_slice_ms: default_sched_slice_ms(),
        }
    }
}

impl QueueConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread cap.
    #[must_use]
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the blocked-on-resources retry pause.
    #[must_use]
    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause_ms = pause.as_millis() as u64;
        self
    }

    /// Set the scheduler-wait slice.
    #[must_use]
    pub fn with_sched_wait_slice(mut self, slice: Duration) -> Self {
        self.sched_wait_slice_ms = slice.as_millis() as u64;
        self
    }

    /// Idle timeout as a [`Duration`].
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Retry pause as a [`Duration`].
    #[must_use]
    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    /// Scheduler-wait slice as a [`Duration`].
    #[must_use]
    pub fn sched_wait_slice(&self) -> Duration {
        Duration::from_millis(self.sched_wait_slice_ms)
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers must be greater than 0".into());
        }
        if self.idle_timeout_ms == 0 {
            return Err("idle_timeout_ms must be greater than 0".into());
        }
        if self.retry_pause_ms == 0 {
            return Err("retry_pause_ms must be greater than 0".into());
        }
        if self.sched_wait_slice_ms == 0 {
            return Err("sched_wait_slice_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse a configuration from a JSON string and validate it.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = QueueConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(4));
        assert_eq!(cfg.retry_pause(), Duration::from_secs(2));
        assert_eq!(cfg.sched_wait_slice(), Duration::from_secs(30));
    }

    #[test]
    fn zero_workers_rejected() {
        let cfg = QueueConfig::new().with_max_workers(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_json_applies_defaults() {
        let cfg = QueueConfig::from_json_str(r#"{"max_workers": 3}"#).unwrap();
        assert_eq!(cfg.max_workers, 3);
        assert_eq!(cfg.idle_timeout_ms, 4_000);
    }

    #[test]
    fn from_json_rejects_invalid() {
        assert!(QueueConfig::from_json_str(r#"{"max_workers": 0}"#).is_err());
        assert!(QueueConfig::from_json_str("not json").is_err());
    }
}
