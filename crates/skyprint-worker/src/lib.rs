//! skyprint-worker: run similarity calculations off the caller's thread.
//!
//! A [`TaskCoordinator`] submits a [`TaskRequest`] to any [`TaskBroker`],
//! polls until it completes, and hands back the first result.
//! [`LocalWorkerPool`] is the in-process broker.

pub mod coordinator;
pub mod error;
pub mod pool;
pub mod protocol;

pub use coordinator::{TaskCoordinator, run_similarity_local};
pub use error::WorkerError;
pub use pool::{LocalWorkerPool, ProgressReporter};
pub use protocol::{TaskBroker, TaskHandle, TaskRequest, TaskState};
