//! In-process [`TaskBroker`] backed by a fixed set of worker threads.
//!
//! Requests travel as JSON over an unbounded crossbeam queue; each task's
//! state lives in a shared `DashMap` slot that workers update as they go.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use skyprint_pipeline::SimilarityResult;

use crate::error::WorkerError;
use crate::protocol::{TaskBroker, TaskHandle, TaskRequest, TaskState};

/// Where a task is in its lifecycle.
#[derive(Debug, Clone)]
enum Slot {
    Queued,
    Running { progress: Option<f64> },
    Succeeded { results_json: String },
    Failed { message: String },
}

struct Job {
    handle: TaskHandle,
    payload: String,
}

type Slots = Arc<DashMap<TaskHandle, Slot>>;

/// Lets a running task publish its completion fraction.
#[derive(Clone)]
pub struct ProgressReporter {
    handle: TaskHandle,
    slots: Slots,
}

impl ProgressReporter {
    /// Record `fraction` (clamped to `[0, 1]`) for the task.
    pub fn report(&self, fraction: f64) {
        let progress = Some(fraction.clamp(0.0, 1.0));
        if let Some(mut slot) = self.slots.get_mut(&self.handle) {
            *slot = Slot::Running { progress };
        }
    }

    #[must_use]
    pub const fn handle(&self) -> TaskHandle {
        self.handle
    }
}

/// Fixed-size pool of threads executing [`TaskRequest`]s.
pub struct LocalWorkerPool {
    sender: Option<Sender<Job>>,
    slots: Slots,
    workers: Vec<JoinHandle<()>>,
}

impl LocalWorkerPool {
    /// Start `workers` threads (at least one).
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Spawn`] if a thread cannot be started.
    pub fn new(workers: usize) -> Result<Self, WorkerError> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let slots: Slots = Arc::new(DashMap::new());

        let mut pool = Self {
            sender: Some(sender),
            slots: Arc::clone(&slots),
            workers: Vec::new(),
        };
        for index in 0..workers.max(1) {
            let receiver = receiver.clone();
            let slots = Arc::clone(&slots);
            let worker = thread::Builder::new()
                .name(format!("skyprint-worker-{index}"))
                .spawn(move || worker_loop(&receiver, &slots))?;
            pool.workers.push(worker);
        }
        tracing::debug!(workers = pool.workers.len(), "worker pool started");
        Ok(pool)
    }

    /// One thread per available core.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Spawn`] if a thread cannot be started.
    pub fn with_available_parallelism() -> Result<Self, WorkerError> {
        Self::new(thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get))
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Number of tasks whose terminal state has not been polled yet.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.slots.len()
    }
}

impl TaskBroker for LocalWorkerPool {
    fn submit(&self, request: &TaskRequest) -> Result<TaskHandle, WorkerError> {
        let payload = serde_json::to_string(request)?;
        let handle = TaskHandle::new();
        let Some(sender) = &self.sender else {
            return Err(WorkerError::Submit("worker pool is shut down".to_string()));
        };
        self.slots.insert(handle, Slot::Queued);
        if sender.send(Job { handle, payload }).is_err() {
            self.slots.remove(&handle);
            return Err(WorkerError::Submit("worker queue is closed".to_string()));
        }
        tracing::debug!(%handle, "task queued");
        Ok(handle)
    }

    fn poll(&self, handle: &TaskHandle) -> TaskState {
        let Some(slot) = self.slots.get(handle).map(|e| e.value().clone()) else {
            return TaskState::Failed {
                message: format!("unknown task {handle}"),
            };
        };
        match slot {
            Slot::Queued => TaskState::Pending { progress: None },
            Slot::Running { progress } => TaskState::Pending { progress },
            Slot::Succeeded { results_json } => {
                self.slots.remove(handle);
                match serde_json::from_str::<Vec<SimilarityResult>>(&results_json) {
                    Ok(results) => TaskState::Done { results },
                    Err(e) => TaskState::Failed {
                        message: format!("malformed task result: {e}"),
                    },
                }
            }
            Slot::Failed { message } => {
                self.slots.remove(handle);
                TaskState::Failed { message }
            }
        }
    }

    fn forget(&self, handle: &TaskHandle) {
        if self.slots.remove(handle).is_some() {
            tracing::debug!(%handle, "task forgotten");
        }
    }
}

impl Drop for LocalWorkerPool {
    fn drop(&mut self) {
        // Closing the queue ends every worker's `recv` loop.
        self.sender = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("worker thread exited abnormally");
            }
        }
    }
}

fn worker_loop(receiver: &Receiver<Job>, slots: &Slots) {
    while let Ok(job) = receiver.recv() {
        // A missing slot means the task was forgotten while queued.
        match slots.get_mut(&job.handle) {
            Some(mut slot) => *slot = Slot::Running { progress: None },
            None => continue,
        }
        let reporter = ProgressReporter {
            handle: job.handle,
            slots: Arc::clone(slots),
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| execute(&job.payload, &reporter)))
            .unwrap_or_else(|_| Err("worker panicked".to_string()));
        let slot = match outcome {
            Ok(results_json) => Slot::Succeeded { results_json },
            Err(message) => {
                tracing::warn!(handle = %job.handle, %message, "task failed");
                Slot::Failed { message }
            }
        };
        if let Some(mut entry) = slots.get_mut(&job.handle) {
            *entry = slot;
        }
    }
}

fn execute(payload: &str, reporter: &ProgressReporter) -> Result<String, String> {
    let request: TaskRequest = serde_json::from_str(payload).map_err(|e| e.to_string())?;
    let results = request
        .run(&mut |fraction: f64| reporter.report(fraction))
        .map_err(|e| e.to_string())?;
    serde_json::to_string(&results).map_err(|e| e.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use skyprint_pipeline::{Bounds, FingerprintRecord, Prediction, SimilarityKind};
    use uuid::Uuid;

    use super::*;

    fn fingerprints(n: usize) -> Vec<FingerprintRecord> {
        (0..n)
            .map(|i| FingerprintRecord {
                image: Uuid::new_v4(),
                bounds: Bounds::new(0, 10, i * 10, i * 10 + 10),
                predictions: vec![
                    Prediction::new(format!("c{i}"), "class", 0.6),
                    Prediction::new("shared", "class", 0.3),
                ],
            })
            .collect()
    }

    fn wait(pool: &LocalWorkerPool, handle: &TaskHandle) -> TaskState {
        loop {
            match pool.poll(handle) {
                TaskState::Pending { .. } => thread::sleep(Duration::from_millis(2)),
                terminal => return terminal,
            }
        }
    }

    #[test]
    fn runs_task_and_consumes_terminal_state() {
        let pool = LocalWorkerPool::new(2).unwrap();
        let handle = pool
            .submit(&TaskRequest::Similarity {
                fingerprints: fingerprints(3),
                similarity_calculator: SimilarityKind::Distance,
            })
            .unwrap();

        let TaskState::Done { results } = wait(&pool, &handle) else {
            unreachable!("distance task should succeed");
        };
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].len(), 3);
        assert_eq!(pool.outstanding(), 0);
        assert!(matches!(pool.poll(&handle), TaskState::Failed { .. }));
    }

    #[test]
    fn unknown_handle_is_failed() {
        let pool = LocalWorkerPool::new(1).unwrap();
        let state = pool.poll(&TaskHandle::new());
        assert!(matches!(state, TaskState::Failed { message } if message.contains("unknown")));
    }

    #[test]
    fn zero_workers_still_starts_one() {
        let pool = LocalWorkerPool::new(0).unwrap();
        assert_eq!(pool.workers(), 1);
    }

    #[test]
    fn reporter_clamps_progress() {
        let slots: Slots = Arc::new(DashMap::new());
        let handle = TaskHandle::new();
        slots.insert(handle, Slot::Running { progress: None });
        let reporter = ProgressReporter {
            handle,
            slots: Arc::clone(&slots),
        };
        reporter.report(1.7);
        let progress = match slots.get(&handle).map(|e| e.value().clone()) {
            Some(Slot::Running { progress }) => progress,
            _ => None,
        };
        assert_eq!(progress, Some(1.0));
    }

    #[test]
    fn forgotten_tasks_release_their_slots() {
        let pool = LocalWorkerPool::new(1).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                pool.submit(&TaskRequest::Similarity {
                    fingerprints: fingerprints(40),
                    similarity_calculator: SimilarityKind::Distance,
                })
                .unwrap()
            })
            .collect();
        for handle in &handles {
            pool.forget(handle);
        }
        assert_eq!(pool.outstanding(), 0);

        // One worker runs in order, so once this finishes the forgotten
        // tasks have been skipped or completed without reclaiming a slot.
        let last = pool
            .submit(&TaskRequest::Similarity {
                fingerprints: fingerprints(1),
                similarity_calculator: SimilarityKind::Distance,
            })
            .unwrap();
        assert!(matches!(wait(&pool, &last), TaskState::Done { .. }));
        assert_eq!(pool.outstanding(), 0);
        assert!(matches!(pool.poll(&handles[0]), TaskState::Failed { .. }));
    }

    #[test]
    fn many_tasks_complete() {
        let pool = LocalWorkerPool::new(3).unwrap();
        let handles: Vec<_> = (1..=6)
            .map(|n| {
                pool.submit(&TaskRequest::Similarity {
                    fingerprints: fingerprints(n),
                    similarity_calculator: SimilarityKind::Jaccard { top_k: 2 },
                })
                .unwrap()
            })
            .collect();
        for (i, handle) in handles.iter().enumerate() {
            let TaskState::Done { results } = wait(&pool, handle) else {
                unreachable!("jaccard task should succeed");
            };
            assert_eq!(results[0].len(), i + 1);
        }
    }
}
