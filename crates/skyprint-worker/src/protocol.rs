//! Submit/poll protocol between a coordinator and a worker backend.
//!
//! Requests and results cross the boundary as JSON, the way they would
//! through a remote queue, so a [`TaskBroker`] can be backed by threads
//! in this process or by something on the other end of a socket.

use std::fmt;

use serde::{Deserialize, Serialize};
use skyprint_pipeline::{FingerprintRecord, PipelineError, SimilarityKind, SimilarityResult};
use uuid::Uuid;

use crate::error::WorkerError;

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskRequest {
    /// Fit `similarity_calculator` to `fingerprints`.
    Similarity {
        fingerprints: Vec<FingerprintRecord>,
        similarity_calculator: SimilarityKind,
    },
}

impl TaskRequest {
    /// Execute the request in this process.
    ///
    /// Returns the worker's result list (one element for similarity).
    ///
    /// # Errors
    ///
    /// Propagates similarity errors.
    pub fn run(&self, progress: &mut dyn FnMut(f64)) -> Result<Vec<SimilarityResult>, PipelineError> {
        match self {
            Self::Similarity {
                fingerprints,
                similarity_calculator,
            } => Ok(vec![similarity_calculator.calculate(fingerprints, progress)?]),
        }
    }
}

/// Opaque identifier for a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(Uuid);

impl TaskHandle {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a poll observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    /// Queued or running. `progress` is `None` until the worker reports.
    Pending { progress: Option<f64> },
    /// Finished; the worker's result list.
    Done { results: Vec<SimilarityResult> },
    /// The worker raised; the message is its error text.
    Failed { message: String },
}

/// A backend that accepts tasks and reports on them.
pub trait TaskBroker: Send + Sync {
    /// Enqueue a request.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Submit`] when the backend refuses the task,
    /// or a serialization error encoding it.
    fn submit(&self, request: &TaskRequest) -> Result<TaskHandle, WorkerError>;

    /// Current state of a task. Terminal states may be reported only once.
    fn poll(&self, handle: &TaskHandle) -> TaskState;

    /// Drop a task whose outcome is no longer wanted. Later polls report
    /// it as unknown.
    fn forget(&self, _handle: &TaskHandle) {}
}

impl<B: TaskBroker + ?Sized> TaskBroker for &B {
    fn submit(&self, request: &TaskRequest) -> Result<TaskHandle, WorkerError> {
        (**self).submit(request)
    }

    fn poll(&self, handle: &TaskHandle) -> TaskState {
        (**self).poll(handle)
    }

    fn forget(&self, handle: &TaskHandle) {
        (**self).forget(handle);
    }
}
