//! Worker side of an attempt.
//!
//! - [`Dispatcher`]: per-job task that stages the input, waits for the
//!   scheduler's go-ahead, runs the container and pushes outputs
//! - [`WorkerRunner`] / [`DockerRunner`]: launches the container with the
//!   grant as hard limits
//! - [`heartbeat`]: periodic worker advertisements
//!
//! # Attempt Flow
//!
//! 1. The scheduler emits a [`Dispatch`](crate::scheduler::Dispatch)
//! 2. The dispatcher fetches the input bundle into a scratch directory
//! 3. It sends [`WorkerEvent::Staged`] and waits; a cancelled job is never launched
//! 4. The runner executes the container and classifies its exit
//! 5. It sends [`WorkerEvent::Finishing`]; a superseded attempt pushes nothing
//! 6. Declared outputs are pushed and [`WorkerEvent::Finished`] is sent
//!
//! The scheduler loop aborts the task of any attempt that is no longer current.
//! Dropping the runner future removes the container.

pub mod dispatch;
pub mod heartbeat;
pub mod runner;

pub use dispatch::{Dispatcher, WorkerEvent};
pub use heartbeat::HeartbeatSender;
pub use runner::{DockerRunner, ExecutionResult, Launch, WorkerRunner};
