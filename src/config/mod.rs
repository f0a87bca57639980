//! Configuration models for the job queue.

pub mod queue;

pub use queue::QueueConfig;
