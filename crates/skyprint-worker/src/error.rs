use skyprint_pipeline::PipelineError;

use crate::protocol::TaskHandle;

/// Errors raised while submitting or waiting on similarity tasks.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The broker refused the request.
    #[error("failed to submit task: {0}")]
    Submit(String),

    /// A worker reported failure. Not retried.
    #[error("task {task} failed: {message}")]
    TaskFailed { task: TaskHandle, message: String },

    /// A task finished with an empty result list.
    #[error("task {0} returned no results")]
    EmptyResult(TaskHandle),

    /// The caller raised the stop flag before all tasks finished.
    #[error("stopped waiting with {pending} task(s) still pending")]
    Stopped { pending: usize },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A pool worker thread could not be started.
    #[error("failed to start worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
