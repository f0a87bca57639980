//! Counting-semaphore arbitration for the four shared concurrency families:
//! per-client, per-job-definition, per-read-storage and per-write-storage.
//!
//! The arbiter owns a single mutex, separate from the queue mutex, so that a
//! worker can return counters for a terminating job while the dispatch loop
//! is scanning the waiting queue. The lock is held only for one
//! increment/decrement or a short rollback sequence; never across I/O or a
//! condition wait. Lock order is always queue mutex → arbiter mutex.

use parking_lot::Mutex;
use tracing::{debug, error};

use super::error::QueueError;
use super::record::{JobRecord, JobStatus};

/// Result of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcquireOutcome {
    /// All required counters incremented; the record holds its locks.
    Acquired,
    /// A counter was at its cap; everything rolled back. Carries the wait
    /// status to put on the record.
    Blocked(JobStatus),
}

/// Arbitrates the four concurrency counter families.
///
/// One arbiter serves the whole process; multiple queues may share it since
/// the counters live on the resource objects themselves.
#[derive(Debug, Default)]
pub struct ResourceArbiter {
    lock: Mutex<()>,
}

impl ResourceArbiter {
    /// Create an arbiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to acquire every counter the record needs, in fixed order:
    /// read storage, write storage, client, job definition. On the first
    /// failure all prior increments are rolled back and the blocking wait
    /// status is returned.
    pub(crate) fn acquire(&self, record: &JobRecord) -> AcquireOutcome {
        // Migration, copy and consolidation never touch the client; their
        // control variants (no job id to move) never touch storage either.
        let skip_client = record.job_type().skips_client_concurrency();
        let skip_storage = skip_client && record.migrate_job_id() == 0;
        record.set_concurrency_exclusions(skip_client, skip_storage);
        if skip_client {
            debug!(job = record.name(), id = %record.id(),
                "excluded from client concurrency");
        }
        if skip_storage {
            debug!(job = record.name(), id = %record.id(),
                "control job excluded from storage concurrency");
        }

        let _guard = self.lock.lock();

        if !self.inc_read_store(record) {
            return AcquireOutcome::Blocked(JobStatus::WaitStoreRes);
        }
        if !self.inc_write_store(record) {
            self.dec_read_store(record);
            return AcquireOutcome::Blocked(JobStatus::WaitStoreRes);
        }
        if !self.inc_client(record) {
            self.dec_write_store(record);
            self.dec_read_store(record);
            return AcquireOutcome::Blocked(JobStatus::WaitClientRes);
        }
        if !self.inc_job(record) {
            self.dec_write_store(record);
            self.dec_read_store(record);
            self.dec_client(record);
            return AcquireOutcome::Blocked(JobStatus::WaitJobRes);
        }

        record.mark_resource_locks_acquired();
        AcquireOutcome::Acquired
    }

    /// Return every counter a successful [`acquire`](Self::acquire)
    /// incremented. Must be called exactly once per acquisition; the caller
    /// gates on the record's acquired flag.
    pub(crate) fn release(&self, record: &JobRecord) {
        let _guard = self.lock.lock();
        self.dec_read_store(record);
        self.dec_write_store(record);
        self.dec_client(record);
        self.dec_job(record);
    }

    fn inc_read_store(&self, record: &JobRecord) -> bool {
        let Some(store) = record.read_storage() else {
            return true;
        };
        if record.ignores_storage_concurrency() {
            return true;
        }
        if store.concurrency.get() < i64::from(store.max_concurrent_jobs) {
            store.read_concurrency.add(1);
            let now = store.concurrency.add(1);
            debug!(store = %store.name, concurrent = now, "inc read storage");
            true
        } else {
            debug!(store = %store.name, concurrent = store.concurrency.get(),
                "read storage at concurrency cap");
            false
        }
    }

    fn dec_read_store(&self, record: &JobRecord) {
        let Some(store) = record.read_storage() else {
            return;
        };
        if record.ignores_storage_concurrency() {
            return;
        }
        let reads = store.read_concurrency.add(-1);
        let now = store.concurrency.add(-1);
        debug!(store = %store.name, concurrent = now, "dec read storage");
        if reads < 0 {
            self.report_underflow(record, &store.name, reads);
        }
        if now < 0 {
            self.report_underflow(record, &store.name, now);
        }
    }

    fn inc_write_store(&self, record: &JobRecord) -> bool {
        let Some(store) = record.write_storage() else {
            return true;
        };
        if record.ignores_storage_concurrency() {
            return true;
        }
        if store.concurrency.get() < i64::from(store.max_concurrent_jobs) {
            let now = store.concurrency.add(1);
            debug!(store = %store.name, concurrent = now, "inc write storage");
            true
        } else {
            debug!(store = %store.name, concurrent = store.concurrency.get(),
                "write storage at concurrency cap");
            false
        }
    }

    fn dec_write_store(&self, record: &JobRecord) {
        let Some(store) = record.write_storage() else {
            return;
        };
        if record.ignores_storage_concurrency() {
            return;
        }
        let now = store.concurrency.add(-1);
        debug!(store = %store.name, concurrent = now, "dec write storage");
        if now < 0 {
            self.report_underflow(record, &store.name, now);
        }
    }

    fn inc_client(&self, record: &JobRecord) -> bool {
        let Some(client) = record.client() else {
            return true;
        };
        if record.ignores_client_concurrency() {
            return true;
        }
        if client.concurrency.get() < i64::from(client.max_concurrent_jobs) {
            let now = client.concurrency.add(1);
            debug!(client = %client.name, concurrent = now, "inc client");
            true
        } else {
            false
        }
    }

    fn dec_client(&self, record: &JobRecord) {
        if record.ignores_client_concurrency() {
            return;
        }
        let Some(client) = record.client() else {
            return;
        };
        let now = client.concurrency.add(-1);
        debug!(client = %client.name, concurrent = now, "dec client");
        if now < 0 {
            self.report_underflow(record, &client.name, now);
        }
    }

    fn inc_job(&self, record: &JobRecord) -> bool {
        let job = record.job();
        if job.concurrency.get() < i64::from(job.max_concurrent_jobs) {
            let now = job.concurrency.add(1);
            debug!(job = %job.name, concurrent = now, "inc job definition");
            true
        } else {
            false
        }
    }

    fn dec_job(&self, record: &JobRecord) {
        let job = record.job();
        let now = job.concurrency.add(-1);
        debug!(job = %job.name, concurrent = now, "dec job definition");
        if now < 0 {
            self.report_underflow(record, &job.name, now);
        }
    }

    /// A negative counter is a programming error. The value is reported and
    /// left in place for diagnosis rather than clamped; the record is marked
    /// errored.
    fn report_underflow(&self, record: &JobRecord, resource: &str, value: i64) {
        let err = QueueError::CounterUnderflow {
            resource: resource.to_string(),
            value,
        };
        error!(
            job = record.name(),
            id = %record.id(),
            error = %err,
            "fatal counter invariant violation"
        );
        record.set_status(JobStatus::ErrorTerminated);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::record::JobType;
    use super::super::resources::{ClientResource, JobResource, StorageResource};
    use super::*;

    fn arbiter() -> ResourceArbiter {
        ResourceArbiter::new()
    }

    #[test]
    fn acquire_and_release_roundtrip() {
        let job = Arc::new(JobResource::new("nightly", JobType::Backup).with_max_concurrent_jobs(2));
        let client = Arc::new(ClientResource::new("client-a", 2));
        let store = Arc::new(StorageResource::new("tape", 2));
        let record = JobRecord::from_job(&job)
            .client(Arc::clone(&client))
            .write_storage(Arc::clone(&store))
            .build();

        let arb = arbiter();
        assert_eq!(arb.acquire(&record), AcquireOutcome::Acquired);
        assert_eq!(client.num_concurrent(), 1);
        assert_eq!(store.num_concurrent(), 1);
        assert_eq!(job.num_concurrent(), 1);
        assert!(record.take_resource_locks());

        arb.release(&record);
        assert_eq!(client.num_concurrent(), 0);
        assert_eq!(store.num_concurrent(), 0);
        assert_eq!(job.num_concurrent(), 0);
    }

    #[test]
    fn read_storage_tracks_read_counter() {
        let job = Arc::new(JobResource::new("restore", JobType::Restore));
        let store = Arc::new(StorageResource::new("tape", 1));
        let record = JobRecord::from_job(&job)
            .read_storage(Arc::clone(&store))
            .build();

        let arb = arbiter();
        assert_eq!(arb.acquire(&record), AcquireOutcome::Acquired);
        assert_eq!(store.num_concurrent(), 1);
        assert_eq!(store.num_concurrent_read(), 1);
        arb.release(&record);
        assert_eq!(store.num_concurrent(), 0);
        assert_eq!(store.num_concurrent_read(), 0);
    }

    #[test]
    fn client_cap_blocks_and_rolls_back_storage() {
        let job = Arc::new(JobResource::new("nightly", JobType::Backup).with_max_concurrent_jobs(8));
        let client = Arc::new(ClientResource::new("client-a", 1));
        let store = Arc::new(StorageResource::new("tape", 8));
        let arb = arbiter();

        let first = JobRecord::from_job(&job)
            .client(Arc::clone(&client))
            .write_storage(Arc::clone(&store))
            .build();
        assert_eq!(arb.acquire(&first), AcquireOutcome::Acquired);

        let second = JobRecord::from_job(&job)
            .client(Arc::clone(&client))
            .write_storage(Arc::clone(&store))
            .build();
        assert_eq!(
            arb.acquire(&second),
            AcquireOutcome::Blocked(JobStatus::WaitClientRes)
        );
        // The storage increment taken before the client failure is undone.
        assert_eq!(store.num_concurrent(), 1);
        assert_eq!(job.num_concurrent(), 1);
        assert!(!second.holds_resource_locks());
    }

    #[test]
    fn job_cap_blocks() {
        let job = Arc::new(JobResource::new("nightly", JobType::Backup).with_max_concurrent_jobs(1));
        let arb = arbiter();
        let first = JobRecord::from_job(&job).build();
        assert_eq!(arb.acquire(&first), AcquireOutcome::Acquired);
        let second = JobRecord::from_job(&job).build();
        assert_eq!(
            arb.acquire(&second),
            AcquireOutcome::Blocked(JobStatus::WaitJobRes)
        );
        assert_eq!(job.num_concurrent(), 1);
    }

    #[test]
    fn storage_cap_blocks_write_after_read() {
        let job = Arc::new(JobResource::new("migrate", JobType::Migrate).with_max_concurrent_jobs(8));
        let store = Arc::new(StorageResource::new("tape", 1));
        let arb = arbiter();
        // Data-moving migration: storage concurrency applies.
        let record = JobRecord::from_job(&job)
            .read_storage(Arc::clone(&store))
            .write_storage(Arc::clone(&store))
            .migrate_job_id(77)
            .build();
        assert_eq!(
            arb.acquire(&record),
            AcquireOutcome::Blocked(JobStatus::WaitStoreRes)
        );
        // Read increment rolled back after the write-side failure.
        assert_eq!(store.num_concurrent(), 0);
        assert_eq!(store.num_concurrent_read(), 0);
    }

    #[test]
    fn control_job_skips_client_and_storage() {
        let job = Arc::new(JobResource::new("copy-ctl", JobType::Copy));
        let client = Arc::new(ClientResource::new("client-a", 1));
        let store = Arc::new(StorageResource::new("tape", 1));
        // Saturate both caps with an unrelated backup.
        let backup = Arc::new(JobResource::new("nightly", JobType::Backup));
        let blocker = JobRecord::from_job(&backup)
            .client(Arc::clone(&client))
            .write_storage(Arc::clone(&store))
            .build();
        let arb = arbiter();
        assert_eq!(arb.acquire(&blocker), AcquireOutcome::Acquired);

        // The copy control job (migrate_job_id == 0) ignores both families.
        let control = JobRecord::from_job(&job)
            .client(Arc::clone(&client))
            .read_storage(Arc::clone(&store))
            .write_storage(Arc::clone(&store))
            .build();
        assert_eq!(arb.acquire(&control), AcquireOutcome::Acquired);
        assert_eq!(client.num_concurrent(), 1);
        assert_eq!(store.num_concurrent(), 1);

        // Release touches only what acquisition counted.
        arb.release(&control);
        assert_eq!(client.num_concurrent(), 1);
        assert_eq!(store.num_concurrent(), 1);
    }

    #[test]
    fn underflow_is_reported_not_clamped() {
        let job = Arc::new(JobResource::new("nightly", JobType::Backup));
        let record = JobRecord::from_job(&job).build();
        let arb = arbiter();
        // Release without acquire drives the job counter negative; the value
        // stays negative for diagnosis and the record is marked errored.
        arb.release(&record);
        assert_eq!(job.num_concurrent(), -1);
        assert_eq!(record.status(), JobStatus::ErrorTerminated);
    }
}
