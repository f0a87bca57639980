//! The job queue: three ordered queues, a bounded self-refilling worker
//! pool, and the dispatch loop that ties admission control to execution.
//!
//! Jobs are submitted as [`JobRecord`]s. A record whose start time lies in
//! the future is held by a short-lived scheduler-wait thread; otherwise it
//! joins the priority-sorted waiting queue. Workers move eligible records to
//! the ready queue once the [`ResourceArbiter`] grants all counters, run the
//! engine with the queue mutex released, return the counters, and consult the
//! rescheduler. Workers exit after an idle timeout; the pool refills on
//! demand, never exceeding the configured cap.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use super::arbiter::{AcquireOutcome, ResourceArbiter};
use super::error::QueueError;
use super::record::{JobId, JobRecord, JobStatus, JobType};
use super::resched::{DuplicateJobPolicy, JobLauncher, Rescheduler, RescheduleOutcome};
use crate::config::QueueConfig;

static WORKER_SEQ: AtomicUsize = AtomicUsize::new(0);

/// The per-job execution routine supplied by the surrounding daemon.
///
/// Invoked once per dispatched record with the queue mutex released. The
/// engine runs the job to completion and must leave a terminal status on the
/// record before returning; a canceled record is still dispatched and is
/// expected to observe its status and return quickly. The engine must not
/// touch the queue directly.
pub trait JobEngine: Send + Sync + 'static {
    /// Run the job to a terminal status.
    fn run(&self, record: &Arc<JobRecord>);
}

impl<F> JobEngine for F
where
    F: Fn(&Arc<JobRecord>) + Send + Sync + 'static,
{
    fn run(&self, record: &Arc<JobRecord>) {
        self(record)
    }
}

/// Point-in-time description of one record, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    /// Job id.
    pub id: JobId,
    /// Display name.
    pub name: String,
    /// Kind of work.
    pub job_type: JobType,
    /// Priority, lower is more urgent.
    pub priority: i32,
    /// Status at snapshot time.
    pub status: JobStatus,
}

impl JobSummary {
    fn of(record: &Arc<JobRecord>) -> Self {
        Self {
            id: record.id(),
            name: record.name().to_string(),
            job_type: record.job_type(),
            priority: record.priority(),
            status: record.status(),
        }
    }
}

/// Point-in-time view of the three queues, for the director shell.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    /// Jobs waiting for resources or priority clearance.
    pub waiting: Vec<JobSummary>,
    /// Jobs promoted and awaiting a worker.
    pub ready: Vec<JobSummary>,
    /// Jobs currently executing.
    pub running: Vec<JobSummary>,
    /// Live worker threads.
    pub num_workers: usize,
}

/// Queue state guarded by the queue mutex.
pub(crate) struct QueueState {
    /// Priority-sorted ascending; stable for equal priorities.
    waiting: Vec<Arc<JobRecord>>,
    /// FIFO; canceled jobs are pushed at the front so they drain first.
    ready: VecDeque<Arc<JobRecord>>,
    /// Insertion order; treated as a set.
    running: Vec<Arc<JobRecord>>,
    num_workers: usize,
    quit: bool,
    valid: bool,
}

pub(crate) struct QueueCore {
    state: Mutex<QueueState>,
    work: Condvar,
    engine: Arc<dyn JobEngine>,
    arbiter: Arc<ResourceArbiter>,
    rescheduler: Rescheduler,
    config: QueueConfig,
}

/// Builder for [`JobQueue`].
pub struct JobQueueBuilder {
    config: QueueConfig,
    engine: Arc<dyn JobEngine>,
    arbiter: Option<Arc<ResourceArbiter>>,
    policy: Option<Arc<dyn DuplicateJobPolicy>>,
    launcher: Option<Arc<dyn JobLauncher>>,
}

impl JobQueueBuilder {
    /// Share a process-wide arbiter with other queues. A private arbiter is
    /// created otherwise.
    #[must_use]
    pub fn arbiter(mut self, arbiter: Arc<ResourceArbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    /// Install a duplicate-job policy consulted on reschedule.
    #[must_use]
    pub fn duplicate_policy(mut self, policy: Arc<dyn DuplicateJobPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Install the entry point that starts spawned reschedule records.
    /// Without one they are submitted back to this queue.
    #[must_use]
    pub fn launcher(mut self, launcher: Arc<dyn JobLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Validate the configuration and construct the queue with zero workers
    /// and empty queues.
    pub fn build(self) -> Result<JobQueue, QueueError> {
        self.config
            .validate()
            .map_err(QueueError::InvalidConfig)?;
        let mut rescheduler = Rescheduler::new();
        if let Some(policy) = self.policy {
            rescheduler.set_policy(policy);
        }
        if let Some(launcher) = self.launcher {
            rescheduler.set_launcher(launcher);
        }
        Ok(JobQueue {
            core: Arc::new(QueueCore {
                state: Mutex::new(QueueState {
                    waiting: Vec::new(),
                    ready: VecDeque::new(),
                    running: Vec::new(),
                    num_workers: 0,
                    quit: false,
                    valid: true,
                }),
                work: Condvar::new(),
                engine: self.engine,
                arbiter: self.arbiter.unwrap_or_default(),
                rescheduler,
                config: self.config,
            }),
        })
    }
}

/// The director's job queue.
///
/// Cloning is cheap and shares the same queue.
#[derive(Clone)]
pub struct JobQueue {
    core: Arc<QueueCore>,
}

impl JobQueue {
    /// Start building a queue around an engine.
    pub fn builder(config: QueueConfig, engine: impl JobEngine) -> JobQueueBuilder {
        JobQueueBuilder {
            config,
            engine: Arc::new(engine),
            arbiter: None,
            policy: None,
            launcher: None,
        }
    }

    /// Construct a queue with default arbiter, policy and launcher.
    pub fn new(config: QueueConfig, engine: impl JobEngine) -> Result<Self, QueueError> {
        Self::builder(config, engine).build()
    }

    /// The arbiter this queue acquires counters from.
    pub fn arbiter(&self) -> &Arc<ResourceArbiter> {
        &self.core.arbiter
    }

    /// Add a record to the queue.
    ///
    /// A record scheduled in the future is held by a scheduler-wait thread
    /// until its start time; a canceled record goes to the front of the
    /// ready queue so it drains quickly; anything else joins the waiting
    /// queue in priority order. A worker is spawned if the pool is below its
    /// cap.
    pub fn submit(&self, record: &Arc<JobRecord>) -> Result<(), QueueError> {
        self.core.submit(record)
    }

    /// Cancel a record sitting in the waiting queue: it moves to the front
    /// of the ready queue, where a worker will dispatch it without acquiring
    /// counters and the engine will observe its status.
    ///
    /// The caller marks the record canceled first (see
    /// [`JobRecord::cancel`]); a record already running is the engine's
    /// responsibility and `NotFound` is returned for it.
    pub fn cancel(&self, record: &Arc<JobRecord>) -> Result<(), QueueError> {
        let core = &self.core;
        let mut state = core.state.lock();
        if !state.valid {
            return Err(QueueError::Invalid);
        }
        let Some(pos) = state
            .waiting
            .iter()
            .position(|r| Arc::ptr_eq(r, record))
        else {
            debug!(id = %record.id(), "cancel target not in waiting queue");
            return Err(QueueError::NotFound(record.id().0));
        };
        let removed = state.waiting.remove(pos);
        state.ready.push_front(removed);
        debug!(id = %record.id(), "canceled job moved to ready front");
        core.ensure_worker(&mut state)?;
        core.work.notify_one();
        Ok(())
    }

    /// Snapshot the queues for status reporting.
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.core.state.lock();
        QueueSnapshot {
            waiting: state.waiting.iter().map(JobSummary::of).collect(),
            ready: state.ready.iter().map(JobSummary::of).collect(),
            running: state.running.iter().map(JobSummary::of).collect(),
            num_workers: state.num_workers,
        }
    }

    /// Shut the queue down: wake all workers, wait until the pool drains,
    /// then drop every queued record. Further operations fail with
    /// [`QueueError::Invalid`].
    pub fn shutdown(&self) -> Result<(), QueueError> {
        let core = &self.core;
        let mut state = core.state.lock();
        if !state.valid {
            return Err(QueueError::Invalid);
        }
        state.valid = false;
        if state.num_workers > 0 {
            state.quit = true;
            core.work.notify_all();
            while state.num_workers > 0 {
                core.work.wait(&mut state);
            }
        }
        state.waiting.clear();
        state.ready.clear();
        state.running.clear();
        info!("job queue shut down");
        Ok(())
    }
}

impl QueueCore {
    pub(crate) fn submit(self: &Arc<Self>, record: &Arc<JobRecord>) -> Result<(), QueueError> {
        if !self.state.lock().valid {
            return Err(QueueError::Invalid);
        }

        let delay = record
            .sched_time()
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        if !record.is_canceled() && delay > Duration::ZERO {
            return self.spawn_sched_wait(record);
        }

        let mut state = self.state.lock();
        if !state.valid {
            return Err(QueueError::Invalid);
        }
        if record.is_canceled() {
            state.ready.push_front(Arc::clone(record));
            debug!(id = %record.id(), "prepended canceled job to ready queue");
        } else {
            // Insert before the first strictly less urgent entry; equal
            // priorities keep submission order.
            let pos = state
                .waiting
                .iter()
                .position(|w| w.priority() > record.priority())
                .unwrap_or(state.waiting.len());
            state.waiting.insert(pos, Arc::clone(record));
            debug!(
                id = %record.id(),
                priority = record.priority(),
                slot = pos,
                "added job to waiting queue"
            );
        }
        self.ensure_worker(&mut state)?;
        self.work.notify_one();
        Ok(())
    }

    /// Spawn a worker iff the pool is below its cap, so that at least one
    /// worker observes any new work.
    fn ensure_worker(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, QueueState>,
    ) -> Result<(), QueueError> {
        if state.num_workers >= self.config.max_workers {
            return Ok(());
        }
        let core = Arc::clone(self);
        let seq = WORKER_SEQ.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("jobq-worker-{seq}"))
            .spawn(move || worker_loop(&core))?;
        state.num_workers += 1;
        debug!(num_workers = state.num_workers, "spawned worker thread");
        Ok(())
    }

    /// Hold a future-scheduled record on a detached thread until its start
    /// time arrives, sleeping at most a slice at a time so cancellation is
    /// observed promptly. A record canceled during the wait is released
    /// without ever entering the queues.
    fn spawn_sched_wait(self: &Arc<Self>, record: &Arc<JobRecord>) -> Result<(), QueueError> {
        let core = Arc::clone(self);
        let record = Arc::clone(record);
        thread::Builder::new()
            .name(format!("jobq-sched-{}", record.id()))
            .spawn(move || {
                record.set_status(JobStatus::WaitStartTime);
                let slice = core.config.sched_wait_slice();
                let mut remaining = record
                    .sched_time()
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO);
                if remaining > Duration::ZERO {
                    info!(
                        job = record.name(),
                        id = %record.id(),
                        wait_secs = remaining.as_secs(),
                        "job waiting for scheduled start time"
                    );
                }
                while remaining > Duration::ZERO {
                    thread::sleep(remaining.min(slice));
                    if record.is_canceled() {
                        debug!(id = %record.id(), "job canceled during scheduled wait");
                        return;
                    }
                    remaining = record
                        .sched_time()
                        .duration_since(SystemTime::now())
                        .unwrap_or(Duration::ZERO);
                }
                if record.is_canceled() {
                    return;
                }
                if let Err(err) = core.submit(&record) {
                    warn!(id = %record.id(), error = %err, "submit after scheduled wait failed");
                }
            })?;
        Ok(())
    }
}

/// The dispatch loop each worker runs. Holds the queue mutex except across
/// the engine call, the anti-livelock pause and record destruction.
fn worker_loop(core: &Arc<QueueCore>) {
    debug!("worker started");
    let mut state = core.state.lock();
    let mut timedout = false;
    let mut work = true;

    loop {
        if !work && !state.quit {
            timedout = core
                .work
                .wait_for(&mut state, core.config.idle_timeout())
                .timed_out();
        }

        // Run everything in the ready queue.
        while !state.ready.is_empty() && !state.quit {
            let record = state.ready.pop_front().expect("ready checked non-empty");
            if !state.ready.is_empty() {
                // Hand the remainder to a sibling so it is not stuck behind
                // this engine call.
                if let Err(err) = core.ensure_worker(&mut state) {
                    warn!(error = %err, "could not spawn sibling worker");
                }
            }
            state.running.push(Arc::clone(&record));
            record.set_killable(true);
            record.set_status(JobStatus::Running);
            debug!(id = %record.id(), "dispatching job to engine");

            MutexGuard::unlocked(&mut state, || {
                let span = info_span!("job", id = %record.id(), name = record.name());
                let _enter = span.enter();
                core.engine.run(&record);
            });

            record.set_killable(false);
            state.running.retain(|r| !Arc::ptr_eq(r, &record));
            debug!(id = %record.id(), status = ?record.status(), "engine returned");

            if record.take_resource_locks() {
                core.arbiter.release(&record);
            }

            match core.rescheduler.on_job_end(core, &mut state, &record) {
                RescheduleOutcome::Requeued => continue,
                RescheduleOutcome::Terminate => {
                    record.clear_sd_status();
                    debug!(id = %record.id(), status = ?record.status(), "job terminated");
                    // Destruction of the last reference happens outside the
                    // queue mutex.
                    MutexGuard::unlocked(&mut state, move || drop(record));
                }
            }
        }

        // Promote whatever the arbiter will now admit.
        if !state.waiting.is_empty() && !state.quit {
            promote_waiting(core, &mut state);
        }

        if state.ready.is_empty() && state.quit {
            state.num_workers -= 1;
            if state.num_workers == 0 {
                // Wake the shutdown routine.
                core.work.notify_all();
            }
            break;
        }

        if state.ready.is_empty() && timedout {
            debug!("idle timeout, worker exiting");
            state.num_workers -= 1;
            break;
        }

        work = !state.ready.is_empty() || !state.waiting.is_empty();
        if work {
            // Queued work the arbiter cannot yet satisfy: release the mutex
            // and pause so a terminating job elsewhere can return counters.
            MutexGuard::unlocked(&mut state, || {
                thread::sleep(core.config.retry_pause());
            });
            work = !state.ready.is_empty() || !state.waiting.is_empty();
        }
    }

    drop(state);
    debug!("worker exited");
}

/// One promotion pass over the waiting queue, queue mutex held.
///
/// The reference priority comes from the head of the running queue when one
/// exists, else from the head of the waiting queue. Mixing requires every
/// running job's definition to allow it. The first record that fails the
/// priority test ends the scan; records blocked only on counters keep their
/// wait status and the scan continues behind them.
fn promote_waiting(core: &Arc<QueueCore>, state: &mut MutexGuard<'_, QueueState>) {
    let (priority, running_allow_mix) = match state.running.first() {
        Some(head) => {
            let mix = state
                .running
                .iter()
                .all(|r| r.job().allow_mixed_priority);
            debug!(
                running_id = %head.id(),
                priority = head.priority(),
                allow_mix = mix,
                "promotion pass against running set"
            );
            (head.priority(), mix)
        }
        None => {
            let head = state.waiting.first().expect("waiting checked non-empty");
            debug!(priority = head.priority(), "promotion pass, nothing running");
            (head.priority(), false)
        }
    };

    let mut idx = 0;
    while idx < state.waiting.len() {
        let record = Arc::clone(&state.waiting[idx]);

        let priority_ok = record.priority() == priority
            || (record.priority() < priority
                && record.job().allow_mixed_priority
                && running_allow_mix);
        if !priority_ok {
            // Priority barrier: this job waits for the running set to drain
            // rather than being scheduled behind it.
            record.set_status(JobStatus::WaitPriority);
            debug!(id = %record.id(), priority = record.priority(), "priority barrier");
            break;
        }

        match core.arbiter.acquire(&record) {
            AcquireOutcome::Acquired => {
                state.waiting.remove(idx);
                record.set_status(JobStatus::Ready);
                debug!(id = %record.id(), "promoted job to ready queue");
                state.ready.push_back(record);
            }
            AcquireOutcome::Blocked(wait_status) => {
                if record.is_canceled() {
                    // No counters for a canceled job; it still proceeds so a
                    // worker terminates it quickly.
                    state.waiting.remove(idx);
                    state.ready.push_back(record);
                } else {
                    record.set_status(wait_status);
                    idx += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::record::JobRecord;
    use super::super::resources::JobResource;
    use super::*;

    fn fast_config() -> QueueConfig {
        QueueConfig::new()
            .with_max_workers(4)
            .with_idle_timeout(Duration::from_millis(200))
            .with_retry_pause(Duration::from_millis(20))
            .with_sched_wait_slice(Duration::from_millis(20))
    }

    #[test]
    fn builder_rejects_invalid_config() {
        let result = JobQueue::new(QueueConfig::new().with_max_workers(0), |_: &Arc<JobRecord>| {});
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn operations_fail_after_shutdown() {
        let queue = JobQueue::new(fast_config(), |record: &Arc<JobRecord>| {
            record.set_status(JobStatus::TerminatedOk);
        })
        .unwrap();
        queue.shutdown().unwrap();

        let job = Arc::new(JobResource::new("nightly", JobType::Backup));
        let record = JobRecord::from_job(&job).build();
        assert!(matches!(queue.submit(&record), Err(QueueError::Invalid)));
        assert!(matches!(queue.cancel(&record), Err(QueueError::Invalid)));
        assert!(matches!(queue.shutdown(), Err(QueueError::Invalid)));
    }

    #[test]
    fn cancel_requires_waiting_membership() {
        let queue = JobQueue::new(fast_config(), |record: &Arc<JobRecord>| {
            record.set_status(JobStatus::TerminatedOk);
        })
        .unwrap();
        let job = Arc::new(JobResource::new("nightly", JobType::Backup));
        let record = JobRecord::from_job(&job).build();
        assert!(matches!(
            queue.cancel(&record),
            Err(QueueError::NotFound(_))
        ));
        queue.shutdown().unwrap();
    }

    #[test]
    fn waiting_queue_is_priority_sorted_stable() {
        let queue = JobQueue::new(fast_config(), |record: &Arc<JobRecord>| {
            record.set_status(JobStatus::TerminatedOk);
        })
        .unwrap();

        // Definition caps of zero keep every record parked in waiting, so
        // the insertion order is observable.
        let def_a = Arc::new(JobResource::new("a", JobType::Backup).with_max_concurrent_jobs(0));
        let def_b = Arc::new(JobResource::new("b", JobType::Backup).with_max_concurrent_jobs(0));

        let hi = JobRecord::from_job(&def_a).priority(5).build();
        let lo = JobRecord::from_job(&def_a).priority(20).build();
        let mid1 = JobRecord::from_job(&def_a).priority(10).build();
        let mid2 = JobRecord::from_job(&def_b).priority(10).build();

        queue.submit(&lo).unwrap();
        queue.submit(&mid1).unwrap();
        queue.submit(&hi).unwrap();
        queue.submit(&mid2).unwrap();

        let snapshot = queue.snapshot();
        let order: Vec<i32> = snapshot.waiting.iter().map(|j| j.priority).collect();
        // Sorted ascending, equal priorities in submission order.
        assert_eq!(order, vec![5, 10, 10, 20]);
        let names: Vec<&str> = snapshot
            .waiting
            .iter()
            .map(|j| j.name.as_str())
            .collect();
        assert_eq!(names[1], "a");
        assert_eq!(names[2], "b");

        queue.shutdown().unwrap();
    }
}
