//! # Director Job Queue
//!
//! The scheduling and admission-control core of a backup director daemon.
//!
//! Jobs enter as [`JobRecord`]s and move through three queues: *waiting*
//! (priority-sorted), *ready* (promoted, counters held) and *running*. A
//! bounded pool of on-demand worker threads drives the dispatch loop,
//! a [`ResourceArbiter`] enforces the per-client, per-job-definition and
//! per-storage concurrency caps, and failed or incomplete backups are
//! rescheduled according to their job definition.
//!
//! ## Modules
//!
//! - [`core`] - records, queues, arbitration and reschedule policy
//! - [`config`] - queue configuration
//! - [`util`] - telemetry bootstrap
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use director_jobq::config::QueueConfig;
//! use director_jobq::{JobQueue, JobRecord, JobResource, JobStatus, JobType};
//!
//! // The engine runs the job and leaves a terminal status on the record.
//! let queue = JobQueue::new(QueueConfig::new(), |record: &Arc<JobRecord>| {
//!     record.set_status(JobStatus::TerminatedOk);
//! })
//! .unwrap();
//!
//! let nightly = Arc::new(JobResource::new("nightly", JobType::Backup));
//! let record = JobRecord::from_job(&nightly).build();
//! queue.submit(&record).unwrap();
//!
//! assert_eq!(
//!     record.wait_terminated(std::time::Duration::from_secs(10)),
//!     Some(JobStatus::TerminatedOk)
//! );
//! queue.shutdown().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod util;

// Re-export main types for convenience
pub use crate::core::{
    AllowDuplicates, AppResult, ClientResource, DuplicateJobPolicy, JobEngine, JobId, JobLauncher,
    JobLevel, JobQueue, JobQueueBuilder, JobRecord, JobResource, JobStatus, JobSummary, JobType,
    MessagesResource, PoolBindings, PoolResource, QueueError, QueueSnapshot, RecordBuilder,
    ResourceArbiter, StorageResource,
};
