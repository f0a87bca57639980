//! Core scheduling components: records, queues, arbitration, rescheduling.

pub mod arbiter;
pub mod error;
pub mod queue;
pub mod record;
pub mod resched;
pub mod resources;

pub use arbiter::ResourceArbiter;
pub use error::{AppResult, QueueError};
pub use queue::{JobEngine, JobQueue, JobQueueBuilder, JobSummary, QueueSnapshot};
pub use record::{JobId, JobLevel, JobRecord, JobStatus, JobType, PoolBindings, RecordBuilder};
pub use resched::{AllowDuplicates, DuplicateJobPolicy, JobLauncher};
pub use resources::{
    ClientResource, JobResource, MessagesResource, PoolResource, StorageResource,
};
