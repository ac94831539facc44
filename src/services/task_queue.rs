//! Bounded worker pool for [`ProcessingTask`]s.
//!
//! Per task: `Submitted -> Running -> {Completed | RetryPending -> Submitted | Failed}`.
//! Every task that enters the queue produces exactly one terminal event
//! (COMPLETED or FAILED) on the [`ProgressBroadcaster`], and the PROCESSING
//! values it publishes never decrease, even across retries.

use crate::config::UploadConfig;
use crate::error::{QueueError, TaskError};
use crate::models::ProgressEvent;
use crate::services::progress::ProgressBroadcaster;
use crate::services::tasks::ProcessingTask;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Submitted,
    Running,
    RetryPending,
}

struct ActiveTask {
    filename: String,
    state: TaskState,
    /// Highest PROCESSING value published so far
    progress: Option<f64>,
    message: String,
    retry_count: u32,
    cancel: CancellationToken,
}

/// Point-in-time view of an active task.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub identifier: String,
    pub filename: String,
    pub state: TaskState,
    pub progress: f64,
    pub message: String,
    pub retry_count: u32,
}

/// Terminal record kept for status lookups after a task left the active index.
#[derive(Debug, Clone)]
pub struct FinishedTask {
    pub event: ProgressEvent,
    pub retry_count: u32,
    pub finished_at: Instant,
}

struct Inner {
    config: UploadConfig,
    broadcaster: ProgressBroadcaster,
    active: DashMap<String, ActiveTask>,
    outcomes: DashMap<String, FinishedTask>,
    workers: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<ProcessingTask>,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

/// What a finished attempt asks of its worker.
enum AttemptOutcome {
    Done,
    Retry(ProcessingTask, Duration),
}

impl TaskQueue {
    /// Creates the queue and spawns its dispatcher. The dispatcher stops when
    /// `shutdown` changes; attempts already running are left to finish.
    pub fn start(
        config: UploadConfig,
        broadcaster: ProgressBroadcaster,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(Inner {
                workers: Arc::new(Semaphore::new(config.worker_count.max(1))),
                config,
                broadcaster,
                active: DashMap::new(),
                outcomes: DashMap::new(),
                tx,
            }),
        };
        let handle = tokio::spawn(queue.clone().dispatch(rx, shutdown));
        (queue, handle)
    }

    /// Registers the task in the active index and enqueues it. Never waits.
    pub fn submit_task(&self, task: ProcessingTask) -> Result<(), QueueError> {
        let identifier = task.identifier().to_string();
        match self.inner.active.entry(identifier.clone()) {
            Entry::Occupied(_) => return Err(QueueError::DuplicateTask(identifier)),
            Entry::Vacant(slot) => {
                slot.insert(ActiveTask {
                    filename: task.display_name().to_string(),
                    state: TaskState::Submitted,
                    progress: None,
                    message: "queued".to_string(),
                    retry_count: task.retry_count(),
                    cancel: CancellationToken::new(),
                });
            }
        }
        self.inner.outcomes.remove(&identifier);

        tracing::info!(
            "Submitting {} task for '{}' (max retries {})",
            task.processor_name(),
            identifier,
            task.max_retries()
        );
        if self.inner.tx.send(task).is_err() {
            self.inner.active.remove(&identifier);
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Cancels a task. A queued or retry-pending task is finalized at once; a
    /// running one stops at its next progress boundary. Returns false for
    /// unknown or already finished identifiers.
    pub fn cancel(&self, identifier: &str) -> bool {
        if let Some((_, task)) = self
            .inner
            .active
            .remove_if(identifier, |_, t| t.state != TaskState::Running)
        {
            tracing::info!("Cancelled queued task for '{}'", identifier);
            let event = ProgressEvent::failed(identifier, &task.filename, "cancelled");
            self.store_outcome(identifier, &event, task.retry_count);
            self.inner.broadcaster.publish(event);
            return true;
        }

        match self.inner.active.get(identifier) {
            Some(task) => {
                tracing::info!("Cancelling running task for '{}'", identifier);
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, identifier: &str) -> Option<TaskSnapshot> {
        self.inner.active.get(identifier).map(|t| TaskSnapshot {
            identifier: identifier.to_string(),
            filename: t.filename.clone(),
            state: t.state,
            progress: t.progress.unwrap_or(0.0),
            message: t.message.clone(),
            retry_count: t.retry_count,
        })
    }

    pub fn outcome(&self, identifier: &str) -> Option<FinishedTask> {
        self.inner.outcomes.get(identifier).map(|o| o.clone())
    }

    /// True while a task for the identifier is active or its outcome is retained.
    pub fn is_known(&self, identifier: &str) -> bool {
        self.inner.outcomes.contains_key(identifier) || self.inner.active.contains_key(identifier)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Drops outcome records older than `max_age`. Returns how many were removed.
    pub fn prune_outcomes(&self, max_age: Duration) -> usize {
        let before = self.inner.outcomes.len();
        self.inner
            .outcomes
            .retain(|_, o| o.finished_at.elapsed() < max_age);
        before.saturating_sub(self.inner.outcomes.len())
    }

    async fn dispatch(
        self,
        mut rx: mpsc::UnboundedReceiver<ProcessingTask>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(
            "🚀 Task dispatcher started with {} workers",
            self.inner.config.worker_count.max(1)
        );

        loop {
            let task = tokio::select! {
                _ = shutdown.changed() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = self.inner.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let queue = self.clone();
            tokio::spawn(async move {
                let outcome = queue.run(task).await;
                drop(permit);
                if let AttemptOutcome::Retry(task, delay) = outcome {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    queue.requeue(task);
                }
            });
        }

        tracing::info!("🛑 Task dispatcher shutting down");
    }

    /// Runs one attempt of `task`, publishing its progress.
    async fn run(&self, mut task: ProcessingTask) -> AttemptOutcome {
        let identifier = task.identifier().to_string();
        let filename = task.display_name().to_string();

        // Gone from the index means it was cancelled while queued.
        let Some((cancel, mut high_water)) = self.mark_running(&identifier) else {
            tracing::debug!("Skipping '{}': no longer active", identifier);
            return AttemptOutcome::Done;
        };

        let attempt = task.retry_count() + 1;
        tracing::info!(
            "Running {} for '{}' (attempt {}/{})",
            task.processor_name(),
            identifier,
            attempt,
            task.max_retries().max(1)
        );

        let mut progress = task.execute();
        let result = loop {
            if cancel.is_cancelled() {
                break Err(TaskError::Cancelled);
            }
            match progress.next().await {
                None => break Ok(()),
                Some(Err(e)) => break Err(e),
                Some(Ok(value)) => {
                    if cancel.is_cancelled() {
                        break Err(TaskError::Cancelled);
                    }
                    let value = value.clamp(0.0, 100.0);
                    // 100 is reported by the COMPLETED event; values at or
                    // below the mark come from a re-run and are not news.
                    if value >= 100.0 || high_water.is_some_and(|h| value <= h) {
                        continue;
                    }
                    high_water = Some(value);
                    self.publish_progress(
                        &identifier,
                        &filename,
                        value,
                        format!("{}: {:.0}%", task.processor_name(), value),
                    );
                }
            }
        };
        drop(progress);

        match result {
            Ok(()) => {
                tracing::info!("✅ Task for '{}' completed on attempt {}", identifier, attempt);
                self.finish(
                    &identifier,
                    ProgressEvent::completed(&identifier, &filename),
                    task.retry_count(),
                );
                AttemptOutcome::Done
            }
            Err(TaskError::Cancelled) => {
                tracing::info!("Task for '{}' cancelled", identifier);
                self.finish(
                    &identifier,
                    ProgressEvent::failed(&identifier, &filename, "cancelled"),
                    task.retry_count(),
                );
                AttemptOutcome::Done
            }
            Err(e) => {
                if !(task.should_retry() && task.increment_retry_count()) {
                    tracing::error!(
                        "❌ Task for '{}' failed after {} attempt(s): {}",
                        identifier,
                        attempt,
                        e
                    );
                    self.finish(
                        &identifier,
                        ProgressEvent::failed(&identifier, &filename, e.to_string()),
                        task.retry_count(),
                    );
                    return AttemptOutcome::Done;
                }

                let delay = self.inner.config.retry_delay(task.retry_count());
                tracing::warn!(
                    "Attempt {} for '{}' failed: {}; retrying in {:?}",
                    attempt,
                    identifier,
                    e,
                    delay
                );
                if let Some(mut entry) = self.inner.active.get_mut(&identifier) {
                    entry.state = TaskState::RetryPending;
                    entry.retry_count = task.retry_count();
                }
                self.publish_progress(
                    &identifier,
                    &filename,
                    high_water.unwrap_or(0.0),
                    format!("attempt {} failed: {}; retrying", attempt, e),
                );
                AttemptOutcome::Retry(task, delay)
            }
        }
    }

    fn mark_running(&self, identifier: &str) -> Option<(CancellationToken, Option<f64>)> {
        let mut entry = self.inner.active.get_mut(identifier)?;
        entry.state = TaskState::Running;
        Some((entry.cancel.clone(), entry.progress))
    }

    fn requeue(&self, task: ProcessingTask) {
        let identifier = task.identifier().to_string();
        {
            let Some(mut entry) = self.inner.active.get_mut(&identifier) else {
                // Cancelled during the backoff; already finalized.
                return;
            };
            entry.state = TaskState::Submitted;
        }

        if let Err(mpsc::error::SendError(task)) = self.inner.tx.send(task) {
            tracing::error!("Cannot requeue '{}': queue is shut down", identifier);
            self.finish(
                &identifier,
                ProgressEvent::failed(&identifier, task.display_name(), QueueError::Closed.to_string()),
                task.retry_count(),
            );
        }
    }

    fn publish_progress(&self, identifier: &str, filename: &str, value: f64, message: String) {
        if let Some(mut entry) = self.inner.active.get_mut(identifier) {
            entry.progress = Some(entry.progress.map_or(value, |p| p.max(value)));
            entry.message = message.clone();
        }
        self.inner
            .broadcaster
            .publish(ProgressEvent::processing(identifier, filename, value, message));
    }

    /// Records the terminal event, leaves the active index and publishes.
    /// The outcome is stored first so the identifier never looks unknown.
    fn finish(&self, identifier: &str, event: ProgressEvent, retry_count: u32) {
        self.store_outcome(identifier, &event, retry_count);
        self.inner.active.remove(identifier);
        self.inner.broadcaster.publish(event);
    }

    fn store_outcome(&self, identifier: &str, event: &ProgressEvent, retry_count: u32) {
        self.inner.outcomes.insert(
            identifier.to_string(),
            FinishedTask {
                event: event.clone(),
                retry_count,
                finished_at: Instant::now(),
            },
        );
    }
}
