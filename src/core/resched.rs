//! Reschedule policy: decides whether a completed job re-enters the queue,
//! and under which identity.
//!
//! A failed or incomplete backup whose definition requests retries is either
//! requeued on the same record (nothing was written, the job id can be
//! reused) or cloned into a fresh record (output exists, so the old id must
//! stay attached to what was written).

use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use super::error::QueueError;
use super::queue::{QueueCore, QueueState};
use super::record::{JobLevel, JobRecord, JobStatus, JobType};

/// Consulted before a reschedule is allowed to proceed; the surrounding
/// daemon uses this to enforce its duplicate-job rules.
pub trait DuplicateJobPolicy: Send + Sync + 'static {
    /// Return false to veto the reschedule; the record then terminates.
    fn allow(&self, record: &JobRecord) -> bool;
}

/// Default policy: every reschedule is allowed.
#[derive(Debug, Default)]
pub struct AllowDuplicates;

impl DuplicateJobPolicy for AllowDuplicates {
    fn allow(&self, _record: &JobRecord) -> bool {
        true
    }
}

/// Entry point a spawned reschedule record is handed to. The surrounding
/// daemon's run-job machinery implements this; without one the record is
/// submitted straight back to the originating queue.
pub trait JobLauncher: Send + Sync + 'static {
    /// Take ownership of a freshly built record and start it.
    fn launch(&self, record: Arc<JobRecord>) -> Result<(), QueueError>;
}

/// What the worker should do with the record after the rescheduler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RescheduleOutcome {
    /// The record was requeued under its own id; skip termination cleanup.
    Requeued,
    /// Proceed with normal termination of this record.
    Terminate,
}

pub(crate) struct Rescheduler {
    policy: Arc<dyn DuplicateJobPolicy>,
    launcher: Option<Arc<dyn JobLauncher>>,
}

impl Rescheduler {
    pub(crate) fn new() -> Self {
        Self {
            policy: Arc::new(AllowDuplicates),
            launcher: None,
        }
    }

    pub(crate) fn set_policy(&mut self, policy: Arc<dyn DuplicateJobPolicy>) {
        self.policy = policy;
    }

    pub(crate) fn set_launcher(&mut self, launcher: Arc<dyn JobLauncher>) {
        self.launcher = launcher.into();
    }

    /// Called by a worker after the engine returned and counters were
    /// released, queue mutex held. May release the mutex around nested
    /// submission.
    pub(crate) fn on_job_end(
        &self,
        core: &Arc<QueueCore>,
        state: &mut MutexGuard<'_, QueueState>,
        record: &Arc<JobRecord>,
    ) -> RescheduleOutcome {
        if !self.eligible(record) {
            return RescheduleOutcome::Terminate;
        }

        let job = Arc::clone(record.job());
        let (attempt, next_start) = record.begin_reschedule(job.reschedule_interval);
        info!(
            job = record.name(),
            id = %record.id(),
            attempt,
            interval_secs = job.reschedule_interval.as_secs(),
            "rescheduled job to re-run"
        );

        if !self.policy.allow(record) {
            // The record terminates with the status the engine left on it.
            debug!(id = %record.id(), "duplicate job policy vetoed reschedule");
            return RescheduleOutcome::Terminate;
        }

        if record.bytes_written() == 0 {
            // Nothing was written, the job id can be reused: clear the run
            // fields and requeue the same record; the worker then looks for
            // more work instead of terminating it.
            record.reset_for_rerun();
            record.set_status(JobStatus::WaitStartTime);
            MutexGuard::unlocked(state, || {
                if let Err(err) = core.submit(record) {
                    warn!(id = %record.id(), error = %err, "requeue after reschedule failed");
                    record.set_status(JobStatus::ErrorTerminated);
                }
            });
            return RescheduleOutcome::Requeued;
        }

        // Output exists; the old id stays with what was written and the old
        // record keeps its terminal status. The retry becomes a fresh record
        // handed to the launcher.
        let new_record = self.clone_for_rerun(record, next_start);
        debug!(
            old_id = %record.id(),
            new_id = %new_record.id(),
            "spawning new record for reschedule with output"
        );
        MutexGuard::unlocked(state, || {
            let launched = match &self.launcher {
                Some(launcher) => launcher.launch(Arc::clone(&new_record)),
                None => core.submit(&new_record),
            };
            if let Err(err) = launched {
                warn!(id = %new_record.id(), error = %err, "launch of reschedule record failed");
                new_record.set_status(JobStatus::ErrorTerminated);
            }
        });
        RescheduleOutcome::Terminate
    }

    /// Reschedule eligibility: attempts must remain, and the run must be
    /// either an incomplete non-base backup with incomplete-rescheduling on,
    /// or a non-ok, non-canceled backup with error-rescheduling on.
    fn eligible(&self, record: &JobRecord) -> bool {
        let job = record.job();
        let more_attempts =
            job.reschedule_times == 0 || record.reschedule_count() < job.reschedule_times;
        if !more_attempts {
            return false;
        }

        let status = record.status();
        let incomplete = job.reschedule_incomplete_jobs
            && status == JobStatus::Incomplete
            && record.job_type() == JobType::Backup
            && record.level() != JobLevel::Base;
        let errored = job.reschedule_on_error
            && status != JobStatus::TerminatedOk
            && status != JobStatus::Canceled
            && record.job_type() == JobType::Backup;
        incomplete || errored
    }

    /// Build the replacement record: defaults from the job definition, plus
    /// the carried subset — level, pools and overrides, storage bindings,
    /// client binding, messages, spool flag, reschedule bookkeeping, status.
    fn clone_for_rerun(
        &self,
        record: &Arc<JobRecord>,
        next_start: std::time::SystemTime,
    ) -> Arc<JobRecord> {
        let mut builder = JobRecord::from_job(record.job())
            .level(record.level())
            .reschedule_count(record.reschedule_count())
            .sched_time(next_start)
            .initial_sched_time(record.initial_sched_time())
            .pools(record.pools().clone())
            .spool_data(record.spool_data())
            .status(JobStatus::WaitStartTime);
        if let Some(client) = record.client() {
            builder = builder.client(Arc::clone(client));
        }
        if let Some(store) = record.read_storage() {
            builder = builder.read_storage(Arc::clone(store));
        }
        if let Some(store) = record.write_storage() {
            builder = builder.write_storage(Arc::clone(store));
        }
        if let Some(messages) = record.messages() {
            builder = builder.messages(Arc::clone(messages));
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::resources::JobResource;
    use super::*;

    fn resched_job(times: u32) -> Arc<JobResource> {
        Arc::new(
            JobResource::new("nightly", JobType::Backup)
                .with_reschedule_on_error(times, Duration::from_secs(10)),
        )
    }

    fn rescheduler() -> Rescheduler {
        Rescheduler::new()
    }

    #[test]
    fn failed_backup_is_eligible() {
        let record = JobRecord::from_job(&resched_job(2)).build();
        record.set_status(JobStatus::ErrorTerminated);
        assert!(rescheduler().eligible(&record));
    }

    #[test]
    fn ok_backup_is_not_eligible() {
        let record = JobRecord::from_job(&resched_job(2)).build();
        record.set_status(JobStatus::TerminatedOk);
        assert!(!rescheduler().eligible(&record));
    }

    #[test]
    fn canceled_backup_is_not_eligible() {
        let record = JobRecord::from_job(&resched_job(2)).build();
        record.cancel();
        assert!(!rescheduler().eligible(&record));
    }

    #[test]
    fn non_backup_is_not_eligible() {
        let job = Arc::new(
            JobResource::new("restore", JobType::Restore)
                .with_reschedule_on_error(2, Duration::from_secs(10)),
        );
        let record = JobRecord::from_job(&job).build();
        record.set_status(JobStatus::ErrorTerminated);
        assert!(!rescheduler().eligible(&record));
    }

    #[test]
    fn attempts_are_bounded() {
        let record = JobRecord::from_job(&resched_job(1)).build();
        record.set_status(JobStatus::ErrorTerminated);
        assert!(rescheduler().eligible(&record));
        record.begin_reschedule(Duration::from_secs(10));
        assert!(!rescheduler().eligible(&record));
    }

    #[test]
    fn zero_times_means_unlimited() {
        let record = JobRecord::from_job(&resched_job(0)).build();
        record.set_status(JobStatus::ErrorTerminated);
        for _ in 0..5 {
            assert!(rescheduler().eligible(&record));
            record.begin_reschedule(Duration::from_secs(10));
            // A fresh failure after each attempt.
            record.reset_for_rerun();
            record.set_status(JobStatus::ErrorTerminated);
        }
    }

    #[test]
    fn incomplete_base_backup_is_not_eligible() {
        let job = Arc::new(
            JobResource::new("nightly", JobType::Backup)
                .with_reschedule_incomplete(2, Duration::from_secs(10)),
        );
        let record = JobRecord::from_job(&job).level(JobLevel::Base).build();
        record.set_status(JobStatus::Incomplete);
        assert!(!rescheduler().eligible(&record));
    }

    #[test]
    fn incomplete_full_backup_is_eligible() {
        let job = Arc::new(
            JobResource::new("nightly", JobType::Backup)
                .with_reschedule_incomplete(2, Duration::from_secs(10)),
        );
        let record = JobRecord::from_job(&job).build();
        record.set_status(JobStatus::Incomplete);
        assert!(rescheduler().eligible(&record));
    }

    #[test]
    fn clone_carries_defined_subset() {
        use super::super::record::PoolBindings;
        use super::super::resources::{
            ClientResource, MessagesResource, PoolResource, StorageResource,
        };

        let job = resched_job(2);
        let pools = PoolBindings {
            pool: Some(Arc::new(PoolResource::new("tape-pool"))),
            run_pool_override: true,
            ..PoolBindings::default()
        };
        let record = JobRecord::from_job(&job)
            .level(JobLevel::Incremental)
            .client(Arc::new(ClientResource::new("client-a", 2)))
            .write_storage(Arc::new(StorageResource::new("tape", 2)))
            .messages(Arc::new(MessagesResource::new("standard")))
            .pools(pools)
            .spool_data(true)
            .build();
        record.begin_reschedule(Duration::from_secs(10));

        let clone = rescheduler().clone_for_rerun(&record, record.sched_time());
        assert_ne!(clone.id(), record.id());
        assert_eq!(clone.level(), JobLevel::Incremental);
        assert_eq!(clone.reschedule_count(), 1);
        assert_eq!(clone.sched_time(), record.sched_time());
        assert_eq!(clone.initial_sched_time(), record.initial_sched_time());
        assert!(clone.spool_data());
        assert_eq!(clone.status(), JobStatus::WaitStartTime);
        assert_eq!(clone.client().unwrap().name, "client-a");
        assert_eq!(clone.write_storage().unwrap().name, "tape");
        assert_eq!(clone.messages().unwrap().name, "standard");
        assert_eq!(clone.pools().pool.as_ref().unwrap().name, "tape-pool");
        assert!(clone.pools().run_pool_override);
    }
}
