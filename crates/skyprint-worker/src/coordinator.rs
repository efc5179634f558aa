//! Submit similarity work to a broker and block until it finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use skyprint_pipeline::{FingerprintRecord, SimilarityKind, SimilarityResult};

use crate::error::WorkerError;
use crate::protocol::{TaskBroker, TaskHandle, TaskRequest, TaskState};

/// Drives tasks on a [`TaskBroker`] by polling at a fixed interval.
#[derive(Debug, Clone)]
pub struct TaskCoordinator<B> {
    broker: B,
    poll_interval: Duration,
}

impl<B: TaskBroker> TaskCoordinator<B> {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

    #[must_use]
    pub const fn new(broker: B) -> Self {
        Self {
            broker,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub const fn broker(&self) -> &B {
        &self.broker
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run one similarity calculation remotely and return its result.
    ///
    /// # Errors
    ///
    /// Fails on submission errors, a failed task, or an empty result list.
    pub fn run_similarity(
        &self,
        fingerprints: &[FingerprintRecord],
        similarity: SimilarityKind,
    ) -> Result<SimilarityResult, WorkerError> {
        self.run_similarity_with(fingerprints, similarity, &AtomicBool::new(false), &mut |_: f64| {})
    }

    /// [`run_similarity`](Self::run_similarity) with a stop flag and a
    /// progress observer called once per poll.
    ///
    /// # Errors
    ///
    /// As `run_similarity`, plus [`WorkerError::Stopped`] when `stop` is
    /// raised before the task finishes.
    pub fn run_similarity_with(
        &self,
        fingerprints: &[FingerprintRecord],
        similarity: SimilarityKind,
        stop: &AtomicBool,
        observer: &mut dyn FnMut(f64),
    ) -> Result<SimilarityResult, WorkerError> {
        let request = TaskRequest::Similarity {
            fingerprints: fingerprints.to_vec(),
            similarity_calculator: similarity,
        };
        let handle = self.broker.submit(&request)?;
        tracing::info!(%handle, %similarity, fingerprints = fingerprints.len(), "similarity submitted");

        self.wait_all(&[handle], stop, observer)?
            .into_iter()
            .next()
            .ok_or(WorkerError::EmptyResult(handle))
    }

    /// Wait for every handle, returning their result lists concatenated in
    /// handle order.
    ///
    /// `observer` receives the mean completion fraction across handles;
    /// a task that has not reported yet counts as `0.0`.
    ///
    /// # Errors
    ///
    /// Returns the first task failure seen, or [`WorkerError::Stopped`].
    /// Either way the tasks still pending are forgotten by the broker.
    pub fn wait_all(
        &self,
        handles: &[TaskHandle],
        stop: &AtomicBool,
        observer: &mut dyn FnMut(f64),
    ) -> Result<Vec<SimilarityResult>, WorkerError> {
        let mut finished: Vec<Option<Vec<SimilarityResult>>> = vec![None; handles.len()];
        loop {
            let mut progress_sum = 0.0;
            for (handle, slot) in handles.iter().zip(finished.iter_mut()) {
                if slot.is_some() {
                    progress_sum += 1.0;
                    continue;
                }
                match self.broker.poll(handle) {
                    TaskState::Pending { progress } => progress_sum += progress.unwrap_or(0.0),
                    TaskState::Done { results } => {
                        tracing::debug!(%handle, results = results.len(), "task finished");
                        progress_sum += 1.0;
                        *slot = Some(results);
                    }
                    TaskState::Failed { message } => {
                        self.forget_pending(handles, &finished);
                        return Err(WorkerError::TaskFailed {
                            task: *handle,
                            message,
                        });
                    }
                }
            }

            #[allow(clippy::cast_precision_loss)]
            let fraction = if handles.is_empty() {
                1.0
            } else {
                progress_sum / handles.len() as f64
            };
            observer(fraction);

            let pending = finished.iter().filter(|s| s.is_none()).count();
            if pending == 0 {
                break;
            }
            tracing::debug!(progress = fraction, pending, "waiting on tasks");
            if stop.load(Ordering::Relaxed) {
                self.forget_pending(handles, &finished);
                return Err(WorkerError::Stopped { pending });
            }
            thread::sleep(self.poll_interval);
        }

        Ok(finished.into_iter().flatten().flatten().collect())
    }

    fn forget_pending(&self, handles: &[TaskHandle], finished: &[Option<Vec<SimilarityResult>>]) {
        for (handle, _) in handles.iter().zip(finished).filter(|(_, s)| s.is_none()) {
            self.broker.forget(handle);
        }
    }
}

/// Run a similarity calculation in the calling thread.
///
/// # Errors
///
/// Propagates similarity errors.
pub fn run_similarity_local(
    fingerprints: &[FingerprintRecord],
    similarity: SimilarityKind,
) -> Result<SimilarityResult, WorkerError> {
    let result = similarity.calculate(fingerprints, &mut |fraction: f64| {
        tracing::trace!(progress = fraction, "similarity progress");
    })?;
    tracing::info!(%similarity, fingerprints = fingerprints.len(), "similarity calculated locally");
    Ok(result)
}
