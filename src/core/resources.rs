//! Resource definitions consumed by the queue.
//!
//! These mirror the director's configuration objects: clients, job
//! definitions, storages, pools and message routes. Each concurrency-bearing
//! resource carries its live counters next to its configured cap; the
//! counters are mutated only under the [`ResourceArbiter`] lock and may be
//! read lock-free for status reporting.
//!
//! [`ResourceArbiter`]: super::arbiter::ResourceArbiter

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::record::{JobLevel, JobType};

/// Live counter cell. Writes happen only under the arbiter mutex; reads are
/// lock-free snapshots for observers.
#[derive(Debug, Default)]
pub(crate) struct ConcurrencyCell(AtomicI64);

impl ConcurrencyCell {
    pub(crate) fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    /// Add `delta` and return the new value. Caller holds the arbiter lock.
    pub(crate) fn add(&self, delta: i64) -> i64 {
        self.0.fetch_add(delta, Ordering::AcqRel) + delta
    }
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_priority() -> i32 {
    10
}

/// A backup client definition.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientResource {
    /// Resource name.
    pub name: String,
    /// Maximum jobs that may run against this client concurrently.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: u32,
    #[serde(skip)]
    pub(crate) concurrency: ConcurrencyCell,
}

impl ClientResource {
    /// Create a client resource with the given concurrency cap.
    pub fn new(name: impl Into<String>, max_concurrent_jobs: u32) -> Self {
        Self {
            name: name.into(),
            max_concurrent_jobs,
            concurrency: ConcurrencyCell::default(),
        }
    }

    /// Jobs currently counted against this client.
    pub fn num_concurrent(&self) -> i64 {
        self.concurrency.get()
    }
}

/// A storage daemon definition, usable for reading, writing or both.
#[derive(Debug, Serialize, Deserialize)]
pub struct StorageResource {
    /// Resource name.
    pub name: String,
    /// Maximum jobs that may use this storage concurrently.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: u32,
    #[serde(skip)]
    pub(crate) concurrency: ConcurrencyCell,
    #[serde(skip)]
    pub(crate) read_concurrency: ConcurrencyCell,
}

impl StorageResource {
    /// Create a storage resource with the given concurrency cap.
    pub fn new(name: impl Into<String>, max_concurrent_jobs: u32) -> Self {
        Self {
            name: name.into(),
            max_concurrent_jobs,
            concurrency: ConcurrencyCell::default(),
            read_concurrency: ConcurrencyCell::default(),
        }
    }

    /// Jobs currently counted against this storage.
    pub fn num_concurrent(&self) -> i64 {
        self.concurrency.get()
    }

    /// Read jobs currently counted against this storage.
    pub fn num_concurrent_read(&self) -> i64 {
        self.read_concurrency.get()
    }
}

/// A job definition: the per-job-name configuration the queue consults for
/// concurrency, priority mixing and reschedule policy.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResource {
    /// Resource name.
    pub name: String,
    /// Job type this definition produces.
    pub job_type: JobType,
    /// Default level for runs of this job.
    #[serde(default)]
    pub level: JobLevel,
    /// Default priority for runs of this job. Lower is more urgent.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Maximum runs of this definition that may execute concurrently.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: u32,
    /// Permit runs of this job to execute alongside running jobs of a
    /// different priority.
    #[serde(default)]
    pub allow_mixed_priority: bool,
    /// Reschedule runs that terminate in error.
    #[serde(default)]
    pub reschedule_on_error: bool,
    /// Reschedule runs that stopped incomplete.
    #[serde(default)]
    pub reschedule_incomplete_jobs: bool,
    /// Maximum reschedule attempts; zero means unlimited.
    #[serde(default)]
    pub reschedule_times: u32,
    /// Delay before a rescheduled run becomes eligible again.
    #[serde(default, with = "duration_secs")]
    pub reschedule_interval: Duration,
    #[serde(skip)]
    pub(crate) concurrency: ConcurrencyCell,
}

impl JobResource {
    /// Create a job definition with defaults: priority 10, one concurrent
    /// run, no mixing, no rescheduling.
    pub fn new(name: impl Into<String>, job_type: JobType) -> Self {
        Self {
            name: name.into(),
            job_type,
            level: JobLevel::default(),
            priority: default_priority(),
            max_concurrent_jobs: default_max_concurrent(),
            allow_mixed_priority: false,
            reschedule_on_error: false,
            reschedule_incomplete_jobs: false,
            reschedule_times: 0,
            reschedule_interval: Duration::ZERO,
            concurrency: ConcurrencyCell::default(),
        }
    }

    /// Set the default priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the concurrency cap.
    #[must_use]
    pub fn with_max_concurrent_jobs(mut self, max: u32) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Permit mixed-priority execution.
    #[must_use]
    pub fn with_allow_mixed_priority(mut self, allow: bool) -> Self {
        self.allow_mixed_priority = allow;
        self
    }

    /// Configure rescheduling of failed runs.
    #[must_use]
    pub fn with_reschedule_on_error(mut self, times: u32, interval: Duration) -> Self {
        self.reschedule_on_error = true;
        self.reschedule_times = times;
        self.reschedule_interval = interval;
        self
    }

    /// Configure rescheduling of incomplete runs.
    #[must_use]
    pub fn with_reschedule_incomplete(mut self, times: u32, interval: Duration) -> Self {
        self.reschedule_incomplete_jobs = true;
        self.reschedule_times = times;
        self.reschedule_interval = interval;
        self
    }

    /// Runs of this definition currently counted as executing.
    pub fn num_concurrent(&self) -> i64 {
        self.concurrency.get()
    }
}

/// A media pool definition. The queue only carries pool bindings between
/// reschedule runs; pool selection itself happens in the surrounding daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolResource {
    /// Resource name.
    pub name: String,
}

impl PoolResource {
    /// Create a pool resource.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A message-routing definition carried per record so the director shell can
/// key informational and error output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResource {
    /// Resource name.
    pub name: String,
}

impl MessagesResource {
    /// Create a messages resource.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
