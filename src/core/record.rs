//! The per-job state container shared between queues, workers and joiners.
//!
//! A [`JobRecord`] is created once per run, handed around as `Arc<JobRecord>`
//! (every queue slot, scheduler-wait thread and worker frame owns a clone)
//! and destroyed when the last reference drops. Identity and resource
//! bindings are immutable; run state lives behind a mutex paired with a
//! termination condition variable for joiners.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::resources::{
    ClientResource, JobResource, MessagesResource, PoolResource, StorageResource,
};

static NEXT_JOB_ID: AtomicU32 = AtomicU32::new(1);

/// Numeric identifier of a job run. Unique per process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u32);

impl JobId {
    /// Allocate the next unused job id.
    pub fn allocate() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Back up client data to storage.
    Backup,
    /// Restore data from storage to a client.
    Restore,
    /// Verify stored data against the catalog or the client.
    Verify,
    /// Administrative run, no data movement.
    Admin,
    /// Move jobs between storages, removing the source.
    Migrate,
    /// Copy jobs between storages, keeping the source.
    Copy,
    /// Consolidate incremental backups.
    Consolidate,
}

impl JobType {
    /// Types that never touch the client and are excluded from client
    /// concurrency accounting.
    pub(crate) fn skips_client_concurrency(self) -> bool {
        matches!(self, Self::Migrate | Self::Copy | Self::Consolidate)
    }
}

/// Backup level of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobLevel {
    /// Everything.
    #[default]
    Full,
    /// Changes since the last backup of any level.
    Incremental,
    /// Changes since the last full backup.
    Differential,
    /// Base for subsequent incrementals; never rescheduled as incomplete.
    Base,
    /// Synthetic full built from prior runs.
    VirtualFull,
}

/// Lifecycle status of a job run.
///
/// Non-terminal statuses churn freely while a record moves between queues;
/// terminal statuses are absorbing except toward a strictly more severe one
/// (`Canceled` wins over everything).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Record exists but has not been queued.
    Created,
    /// Held by a scheduler-wait thread until the start time arrives.
    WaitStartTime,
    /// Blocked on the client concurrency counter.
    WaitClientRes,
    /// Blocked on a storage concurrency counter.
    WaitStoreRes,
    /// Blocked on the job-definition concurrency counter.
    WaitJobRes,
    /// Blocked behind the running set's priority.
    WaitPriority,
    /// Promoted; a worker will pick it up.
    Ready,
    /// Engine is executing the job.
    Running,
    /// Ran to completion without errors.
    TerminatedOk,
    /// Stopped before transferring all data; may be rescheduled.
    Incomplete,
    /// Terminated with errors.
    ErrorTerminated,
    /// Canceled by an operator or policy.
    Canceled,
}

impl JobStatus {
    /// True once the run can no longer progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::TerminatedOk | Self::Incomplete | Self::ErrorTerminated | Self::Canceled
        )
    }

    /// Severity rank used by [`JobRecord::set_status`]. Higher wins among
    /// terminal statuses.
    fn severity(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::WaitStartTime
            | Self::WaitClientRes
            | Self::WaitStoreRes
            | Self::WaitJobRes
            | Self::WaitPriority
            | Self::Ready
            | Self::Running => 1,
            Self::TerminatedOk => 2,
            Self::Incomplete => 3,
            Self::ErrorTerminated => 4,
            Self::Canceled => 5,
        }
    }
}

/// The six media-pool slots a run carries, with their per-run override
/// markers. The queue only transports these between reschedule runs; pool
/// selection happens in the surrounding daemon.
#[derive(Debug, Clone, Default)]
pub struct PoolBindings {
    /// Pool for the current level.
    pub pool: Option<Arc<PoolResource>>,
    /// Pool was overridden on the run line.
    pub run_pool_override: bool,
    /// Pool used for full runs.
    pub full_pool: Option<Arc<PoolResource>>,
    /// Full pool was overridden on the run line.
    pub run_full_pool_override: bool,
    /// Pool used for incremental runs.
    pub incremental_pool: Option<Arc<PoolResource>>,
    /// Incremental pool was overridden on the run line.
    pub run_incremental_pool_override: bool,
    /// Pool used for differential runs.
    pub differential_pool: Option<Arc<PoolResource>>,
    /// Differential pool was overridden on the run line.
    pub run_differential_pool_override: bool,
    /// Pool a migration or copy writes into.
    pub next_pool: Option<Arc<PoolResource>>,
    /// Next pool was overridden on the run line.
    pub run_next_pool_override: bool,
    /// Pool used for virtual full runs.
    pub virtual_full_pool: Option<Arc<PoolResource>>,
    /// Virtual full pool was overridden on the run line.
    pub run_virtual_full_pool_override: bool,
}

/// Mutable per-run state, guarded by the record mutex.
#[derive(Debug)]
struct RunState {
    status: JobStatus,
    sched_time: SystemTime,
    initial_sched_time: SystemTime,
    reschedule_count: u32,
    bytes_written: u64,
    job_errors: u32,
    sd_status: u32,
    acquired_resource_locks: bool,
    ignore_client_concurrency: bool,
    ignore_storage_concurrency: bool,
}

/// Shared per-job record.
///
/// Resource pointers are non-owning in spirit: the `Arc`s keep the
/// definitions alive, but resources never reference records back, and
/// definitions are only loaded or unloaded while the queue is quiescent.
#[derive(Debug)]
pub struct JobRecord {
    id: JobId,
    name: String,
    job_type: JobType,
    level: JobLevel,
    priority: i32,
    migrate_job_id: u32,
    spool_data: bool,
    job: Arc<JobResource>,
    client: Option<Arc<ClientResource>>,
    read_storage: Option<Arc<StorageResource>>,
    write_storage: Option<Arc<StorageResource>>,
    messages: Option<Arc<MessagesResource>>,
    pools: PoolBindings,
    killable: AtomicBool,
    state: Mutex<RunState>,
    term: Condvar,
}

impl JobRecord {
    /// Start building a record for a run of `job`, with type, level and
    /// priority defaulted from the definition and a freshly allocated id.
    pub fn from_job(job: &Arc<JobResource>) -> RecordBuilder {
        RecordBuilder {
            id: None,
            name: job.name.clone(),
            job_type: job.job_type,
            level: job.level,
            priority: job.priority,
            migrate_job_id: 0,
            spool_data: false,
            job: Arc::clone(job),
            client: None,
            read_storage: None,
            write_storage: None,
            messages: None,
            pools: PoolBindings::default(),
            sched_time: SystemTime::now(),
            initial_sched_time: None,
            reschedule_count: 0,
            status: JobStatus::Created,
        }
    }

    /// Job id of this run.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Display name of this run.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of work this run performs.
    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// Backup level of this run.
    pub fn level(&self) -> JobLevel {
        self.level
    }

    /// Priority of this run. Lower is more urgent.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Id of the job being migrated or copied; zero marks a control job
    /// that moves no data itself.
    pub fn migrate_job_id(&self) -> u32 {
        self.migrate_job_id
    }

    /// Whether the storage daemon should spool data for this run.
    pub fn spool_data(&self) -> bool {
        self.spool_data
    }

    /// The job definition this run belongs to.
    pub fn job(&self) -> &Arc<JobResource> {
        &self.job
    }

    /// Client this run touches, if any.
    pub fn client(&self) -> Option<&Arc<ClientResource>> {
        self.client.as_ref()
    }

    /// Storage this run reads from, if any.
    pub fn read_storage(&self) -> Option<&Arc<StorageResource>> {
        self.read_storage.as_ref()
    }

    /// Storage this run writes to, if any.
    pub fn write_storage(&self) -> Option<&Arc<StorageResource>> {
        self.write_storage.as_ref()
    }

    /// Message route bound to this run, if any.
    pub fn messages(&self) -> Option<&Arc<MessagesResource>> {
        self.messages.as_ref()
    }

    /// Pool bindings carried by this run.
    pub fn pools(&self) -> &PoolBindings {
        &self.pools
    }

    /// Current status.
    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    /// Apply a status change under the severity rule: non-terminal churn is
    /// free, terminal states are absorbing except toward a more severe
    /// terminal state. Signals joiners when a terminal state is reached.
    pub fn set_status(&self, new: JobStatus) {
        let mut state = self.state.lock();
        let current = state.status;
        if current.is_terminal() && new.severity() <= current.severity() {
            return;
        }
        state.status = new;
        if new.is_terminal() {
            self.term.notify_all();
        }
    }

    /// Mark the run canceled and wake joiners. Cancellation is cooperative:
    /// the queue and the engine observe the status, nothing is interrupted
    /// forcibly.
    pub fn cancel(&self) {
        self.set_status(JobStatus::Canceled);
    }

    /// True once the run has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.status() == JobStatus::Canceled
    }

    /// Block until the run reaches a terminal status, or until `timeout`
    /// elapses. Returns the terminal status on success.
    pub fn wait_terminated(&self, timeout: Duration) -> Option<JobStatus> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.status.is_terminal() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            if self.term.wait_for(&mut state, deadline - now).timed_out()
                && !state.status.is_terminal()
            {
                return None;
            }
        }
        Some(state.status)
    }

    /// Scheduled start time of this run.
    pub fn sched_time(&self) -> SystemTime {
        self.state.lock().sched_time
    }

    /// Scheduled start time of the first attempt of this run.
    pub fn initial_sched_time(&self) -> SystemTime {
        self.state.lock().initial_sched_time
    }

    /// How often this record has been rescheduled.
    pub fn reschedule_count(&self) -> u32 {
        self.state.lock().reschedule_count
    }

    /// Bytes the engine reported written for the current attempt.
    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    /// Record bytes written by the engine for the current attempt.
    pub fn set_bytes_written(&self, bytes: u64) {
        self.state.lock().bytes_written = bytes;
    }

    /// Subsidiary status last reported by the storage daemon for this run.
    pub fn storage_daemon_status(&self) -> u32 {
        self.state.lock().sd_status
    }

    /// Record the subsidiary status reported by the storage daemon.
    pub fn set_storage_daemon_status(&self, status: u32) {
        self.state.lock().sd_status = status;
    }

    /// Error count of the current attempt.
    pub fn job_errors(&self) -> u32 {
        self.state.lock().job_errors
    }

    /// Increment the error count of the current attempt.
    pub fn add_job_error(&self) {
        self.state.lock().job_errors += 1;
    }

    /// True while a worker is executing the engine for this record.
    pub fn is_killable(&self) -> bool {
        self.killable.load(Ordering::Acquire)
    }

    pub(crate) fn set_killable(&self, killable: bool) {
        self.killable.store(killable, Ordering::Release);
    }

    pub(crate) fn set_sched_time(&self, when: SystemTime) {
        self.state.lock().sched_time = when;
    }

    /// Reschedule bookkeeping: bump the attempt counter and move the start
    /// time forward. Returns the new (count, start time) pair.
    pub(crate) fn begin_reschedule(&self, interval: Duration) -> (u32, SystemTime) {
        let mut state = self.state.lock();
        state.reschedule_count += 1;
        state.sched_time = SystemTime::now() + interval;
        (state.reschedule_count, state.sched_time)
    }

    /// Reset per-run fields for the next attempt. Bypasses the severity rule
    /// deliberately: a rescheduled record starts its next attempt clean.
    pub(crate) fn reset_for_rerun(&self) {
        let mut state = self.state.lock();
        state.status = JobStatus::Created;
        state.sd_status = 0;
        state.job_errors = 0;
        state.bytes_written = 0;
    }

    pub(crate) fn clear_sd_status(&self) {
        self.state.lock().sd_status = 0;
    }

    pub(crate) fn mark_resource_locks_acquired(&self) {
        self.state.lock().acquired_resource_locks = true;
    }

    /// Clears the acquired flag and reports whether it was set. Release must
    /// happen exactly once per acquisition.
    pub(crate) fn take_resource_locks(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.acquired_resource_locks, false)
    }

    #[cfg(test)]
    pub(crate) fn holds_resource_locks(&self) -> bool {
        self.state.lock().acquired_resource_locks
    }

    pub(crate) fn set_concurrency_exclusions(&self, client: bool, storage: bool) {
        let mut state = self.state.lock();
        state.ignore_client_concurrency = client;
        state.ignore_storage_concurrency = storage;
    }

    pub(crate) fn ignores_client_concurrency(&self) -> bool {
        self.state.lock().ignore_client_concurrency
    }

    pub(crate) fn ignores_storage_concurrency(&self) -> bool {
        self.state.lock().ignore_storage_concurrency
    }
}

/// Builder for [`JobRecord`], seeded by [`JobRecord::from_job`].
#[derive(Debug)]
pub struct RecordBuilder {
    id: Option<JobId>,
    name: String,
    job_type: JobType,
    level: JobLevel,
    priority: i32,
    migrate_job_id: u32,
    spool_data: bool,
    job: Arc<JobResource>,
    client: Option<Arc<ClientResource>>,
    read_storage: Option<Arc<StorageResource>>,
    write_storage: Option<Arc<StorageResource>>,
    messages: Option<Arc<MessagesResource>>,
    pools: PoolBindings,
    sched_time: SystemTime,
    initial_sched_time: Option<SystemTime>,
    reschedule_count: u32,
    status: JobStatus,
}

impl RecordBuilder {
    /// Override the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override the priority for this run.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the level for this run.
    #[must_use]
    pub fn level(mut self, level: JobLevel) -> Self {
        self.level = level;
        self
    }

    /// Bind the client this run touches.
    #[must_use]
    pub fn client(mut self, client: Arc<ClientResource>) -> Self {
        self.client = Some(client);
        self
    }

    /// Bind the storage this run reads from.
    #[must_use]
    pub fn read_storage(mut self, storage: Arc<StorageResource>) -> Self {
        self.read_storage = Some(storage);
        self
    }

    /// Bind the storage this run writes to.
    #[must_use]
    pub fn write_storage(mut self, storage: Arc<StorageResource>) -> Self {
        self.write_storage = Some(storage);
        self
    }

    /// Bind the message route for this run.
    #[must_use]
    pub fn messages(mut self, messages: Arc<MessagesResource>) -> Self {
        self.messages = Some(messages);
        self
    }

    /// Carry pool bindings into this run.
    #[must_use]
    pub fn pools(mut self, pools: PoolBindings) -> Self {
        self.pools = pools;
        self
    }

    /// Set the scheduled start time. Defaults to now.
    #[must_use]
    pub fn sched_time(mut self, when: SystemTime) -> Self {
        self.sched_time = when;
        self
    }

    /// Preserve the first attempt's scheduled time across reschedules.
    #[must_use]
    pub fn initial_sched_time(mut self, when: SystemTime) -> Self {
        self.initial_sched_time = Some(when);
        self
    }

    /// Carry a reschedule count from a prior record.
    #[must_use]
    pub fn reschedule_count(mut self, count: u32) -> Self {
        self.reschedule_count = count;
        self
    }

    /// Id of the job a migration or copy operates on. Zero (the default)
    /// marks a control job.
    #[must_use]
    pub fn migrate_job_id(mut self, id: u32) -> Self {
        self.migrate_job_id = id;
        self
    }

    /// Carry the spool flag into this run.
    #[must_use]
    pub fn spool_data(mut self, spool: bool) -> Self {
        self.spool_data = spool;
        self
    }

    /// Carry a starting status from a prior record.
    #[must_use]
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    /// Finish the record. Allocates a fresh id unless one was carried over.
    pub fn build(self) -> Arc<JobRecord> {
        let id = self.id.unwrap_or_else(JobId::allocate);
        Arc::new(JobRecord {
            id,
            name: self.name,
            job_type: self.job_type,
            level: self.level,
            priority: self.priority,
            migrate_job_id: self.migrate_job_id,
            spool_data: self.spool_data,
            job: self.job,
            client: self.client,
            read_storage: self.read_storage,
            write_storage: self.write_storage,
            messages: self.messages,
            pools: self.pools,
            killable: AtomicBool::new(false),
            state: Mutex::new(RunState {
                status: self.status,
                sched_time: self.sched_time,
                initial_sched_time: self.initial_sched_time.unwrap_or(self.sched_time),
                reschedule_count: self.reschedule_count,
                bytes_written: 0,
                job_errors: 0,
                sd_status: 0,
                acquired_resource_locks: false,
                ignore_client_concurrency: false,
                ignore_storage_concurrency: false,
            }),
            term: Condvar::new(),
        })
    }
}
