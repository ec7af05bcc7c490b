//! Job lifecycle and placement.
//!
//! - [`Scheduler`]: the state machine that owns every [`JobRecord`]
//! - [`JobTable`]: record storage with FIFO ordering of queued jobs
//! - [`WorkerPool`]: worker advertisements and reserved capacity
//! - [`matcher`]: pure eligibility and ranking of workers for a request

pub mod engine;
pub mod job;
pub mod matcher;
pub mod pool;
pub mod queue;

pub use engine::{Dispatch, ReportDisposition, Scheduler, Submission};
pub use job::{FailureReason, JobRecord, JobState, JobStatus, Transition, WorkerOutcome};
pub use pool::{WorkerAdvertisement, WorkerInfo, WorkerPool, WorkerSnapshot};
pub use queue::JobTable;
