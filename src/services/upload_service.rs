use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::models::{ChunkDescriptor, ChunkUploadResponse, UploadStatus, UploadStatusResponse};
use crate::services::chunk_merger::ChunkMerger;
use crate::services::chunk_store::ChunkStore;
use crate::services::chunk_tracker::{ChunkTracker, UploadPhase};
use crate::services::task_queue::TaskQueue;
use crate::services::tasks::{ProcessingTask, TaskProcessor};
use crate::utils::validation::{storage_key, validate_chunk};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Chunked upload pipeline: store, record, merge once, hand off to the queue.
#[derive(Clone)]
pub struct UploadService {
    config: UploadConfig,
    store: ChunkStore,
    tracker: ChunkTracker,
    merger: ChunkMerger,
    queue: TaskQueue,
    processor: Arc<dyn TaskProcessor>,
}

impl UploadService {
    pub fn new(config: UploadConfig, queue: TaskQueue, processor: Arc<dyn TaskProcessor>) -> Self {
        let store = ChunkStore::new(config.clone());
        let merger = ChunkMerger::new(store.clone(), config.upload_dir.clone());
        Self {
            config,
            store,
            tracker: ChunkTracker::new(),
            merger,
            queue,
            processor,
        }
    }

    /// Stores one chunk. When it completes the set, the caller that completed
    /// it merges the chunks and submits the processing task before returning.
    pub async fn save_chunk(
        &self,
        descriptor: ChunkDescriptor,
        payload: &[u8],
    ) -> Result<ChunkUploadResponse, UploadError> {
        // Policy failures never touch the tracker.
        validate_chunk(&descriptor, payload.len(), &self.config)?;

        let identifier = descriptor.identifier.clone();
        let mut slot = self.tracker.begin(&descriptor).await?;

        // Checked under the slot: a task is submitted before its entry is removed.
        if self.queue.is_known(&identifier) {
            self.tracker.release_if_empty(slot);
            return Err(UploadError::AlreadyFinalized(identifier));
        }

        if let Err(e) = self.store.write_chunk(&descriptor, payload).await {
            tracing::error!(
                "Failed to store chunk {} of '{}': {}",
                descriptor.chunk_number,
                identifier,
                e
            );
            self.tracker.release_if_empty(slot);
            return Err(e);
        }

        let complete = slot.record_and_check(descriptor.chunk_number);
        let received_chunks = slot.received_chunks();
        let recorded = slot.descriptor().clone();
        drop(slot);

        if complete {
            tracing::info!(
                "All {} chunks of '{}' received",
                recorded.total_chunks,
                identifier
            );
            // Spawned so a dropped request cannot strand the entry in `Merging`.
            let service = self.clone();
            let descriptor = recorded.clone();
            tokio::spawn(async move { service.finalize(&descriptor).await })
                .await
                .map_err(|e| UploadError::MergeFailed {
                    identifier: identifier.clone(),
                    reason: format!("finalize task aborted: {}", e),
                })??;
        }

        Ok(ChunkUploadResponse {
            identifier,
            complete,
            received_chunks,
            total_chunks: recorded.total_chunks,
        })
    }

    /// Merges a complete chunk set and submits its processing task.
    /// Runs at most once per upload: only the completing caller gets here.
    async fn finalize(&self, descriptor: &ChunkDescriptor) -> Result<PathBuf, UploadError> {
        let identifier = descriptor.identifier.as_str();

        let artifact = match self.merger.merge(descriptor).await {
            Ok(path) => path,
            Err(e) => {
                if let Err(cleanup) = self.store.remove_upload(identifier).await {
                    tracing::warn!("Cleanup after failed merge of '{}': {}", identifier, cleanup);
                }
                self.tracker.remove(identifier).await;
                return Err(e);
            }
        };

        let task = ProcessingTask::new(
            identifier,
            &descriptor.filename,
            artifact.clone(),
            self.config.max_retries,
            self.processor.clone(),
        );
        let submitted = self.queue.submit_task(task);
        self.tracker.remove(identifier).await;

        if let Err(e) = submitted {
            tracing::error!(
                "Merged '{}' but could not submit its task: {}",
                identifier,
                e
            );
            return Err(e.into());
        }
        Ok(artifact)
    }

    /// Aggregate status: chunk reception, then the active task, then the
    /// retained outcome.
    pub async fn status(&self, identifier: &str) -> Option<UploadStatusResponse> {
        if let Some(snapshot) = self.tracker.snapshot(identifier).await {
            let total = snapshot.descriptor.total_chunks;
            let (status, progress, message) = match snapshot.phase {
                UploadPhase::Merging => (UploadStatus::Processing, 0.0, "merging chunks".to_string()),
                _ => (
                    UploadStatus::Uploading,
                    snapshot.received_chunks as f64 * 100.0 / total.max(1) as f64,
                    format!("received {} of {} chunks", snapshot.received_chunks, total),
                ),
            };
            return Some(UploadStatusResponse {
                identifier: identifier.to_string(),
                filename: snapshot.descriptor.filename,
                status,
                progress,
                message,
                received_chunks: Some(snapshot.received_chunks),
                total_chunks: Some(total),
                retry_count: None,
            });
        }

        if let Some(task) = self.queue.snapshot(identifier) {
            return Some(UploadStatusResponse {
                identifier: task.identifier,
                filename: task.filename,
                status: UploadStatus::Processing,
                progress: task.progress,
                message: task.message,
                received_chunks: None,
                total_chunks: None,
                retry_count: Some(task.retry_count),
            });
        }

        self.queue.outcome(identifier).map(|done| UploadStatusResponse {
            identifier: identifier.to_string(),
            filename: done.event.filename,
            status: done.event.status,
            progress: done.event.progress,
            message: done.event.message,
            received_chunks: None,
            total_chunks: None,
            retry_count: Some(done.retry_count),
        })
    }

    /// Cancels the identifier's task, or aborts its chunk upload and deletes
    /// the staged chunks. Returns false if there is nothing to stop.
    pub async fn cancel(&self, identifier: &str) -> bool {
        if self.queue.cancel(identifier) {
            return true;
        }
        if self.tracker.abort(identifier).await {
            tracing::info!("Aborted upload '{}'", identifier);
            if let Err(e) = self.store.remove_upload(identifier).await {
                tracing::warn!("Failed to remove chunks of '{}': {}", identifier, e);
            }
            return true;
        }
        false
    }

    /// Aborts uploads idle for `max_age` and deletes staging dirs of the same
    /// age that no tracked upload owns. Returns the number of uploads removed.
    pub async fn sweep_stale_uploads(&self, max_age: Duration) -> Result<usize, UploadError> {
        let mut removed = 0;
        for identifier in self.tracker.stale(max_age).await {
            if self.tracker.abort_if_idle(&identifier, max_age).await {
                tracing::info!("Expiring idle upload '{}'", identifier);
                self.store.remove_upload(&identifier).await?;
                removed += 1;
            }
        }

        let keep: HashSet<String> = self
            .tracker
            .identifiers()
            .iter()
            .map(|id| storage_key(id))
            .collect();
        removed += self.store.sweep_stale(max_age, &keep).await?;
        Ok(removed)
    }

    pub fn pending_uploads(&self) -> usize {
        self.tracker.len()
    }

    pub fn tracker(&self) -> &ChunkTracker {
        &self.tracker
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn merger(&self) -> &ChunkMerger {
        &self.merger
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{QueueError, TaskError};
    use crate::services::progress::ProgressBroadcaster;
    use crate::services::tasks::{ProgressStream, TaskInput};
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio::sync::{Notify, watch};

    /// Waits for `gate`, then succeeds.
    struct Held {
        gate: Arc<Notify>,
        runs: Arc<AtomicU32>,
    }

    impl TaskProcessor for Held {
        fn name(&self) -> &'static str {
            "held"
        }

        fn execute(&self, _input: TaskInput) -> ProgressStream {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.clone();
            async_stream::stream! {
                yield Ok::<f64, TaskError>(0.0);
                gate.notified().await;
                yield Ok(100.0);
            }
            .boxed()
        }
    }

    struct Harness {
        _tmp: TempDir,
        _shutdown: watch::Sender<bool>,
        service: UploadService,
        broadcaster: ProgressBroadcaster,
        gate: Arc<Notify>,
        runs: Arc<AtomicU32>,
    }

    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap();
        let mut config = UploadConfig::development();
        config.temp_dir = tmp.path().join("tmp");
        config.upload_dir = tmp.path().join("uploads");

        let broadcaster = ProgressBroadcaster::new(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue, _) = TaskQueue::start(config.clone(), broadcaster.clone(), shutdown_rx);
        let gate = Arc::new(Notify::new());
        let runs = Arc::new(AtomicU32::new(0));
        let processor = Arc::new(Held {
            gate: gate.clone(),
            runs: runs.clone(),
        });

        Harness {
            _tmp: tmp,
            _shutdown: shutdown_tx,
            service: UploadService::new(config, queue, processor),
            broadcaster,
            gate,
            runs,
        }
    }

    fn chunk(identifier: &str, n: u32, total_chunks: u32, total_size: u64) -> ChunkDescriptor {
        ChunkDescriptor {
            identifier: identifier.to_string(),
            chunk_number: n,
            total_chunks,
            chunk_size: 10,
            total_size,
            filename: "book.txt".to_string(),
        }
    }

    #[tokio::test]
    async fn test_status_follows_the_upload() {
        let h = harness();
        let mut events = h.broadcaster.subscribe("id1");

        let first = h.service.save_chunk(chunk("id1", 1, 2, 15), b"0123456789").await.unwrap();
        assert!(!first.complete);
        assert_eq!(first.received_chunks, 1);

        let status = h.service.status("id1").await.unwrap();
        assert_eq!(status.status, UploadStatus::Uploading);
        assert_eq!(status.progress, 50.0);
        assert_eq!(status.received_chunks, Some(1));
        assert_eq!(h.service.pending_uploads(), 1);

        let last = h.service.save_chunk(chunk("id1", 2, 2, 15), b"abcde").await.unwrap();
        assert!(last.complete);
        assert_eq!(h.service.pending_uploads(), 0);

        // The task is held after reporting 0
        let started = events.next().await.unwrap();
        assert_eq!(started.progress, 0.0);
        let status = h.service.status("id1").await.unwrap();
        assert_eq!(status.status, UploadStatus::Processing);
        assert_eq!(status.retry_count, Some(0));

        h.gate.notify_one();
        let done = events.next().await.unwrap();
        assert_eq!(done.status, UploadStatus::Completed);
        let status = h.service.status("id1").await.unwrap();
        assert_eq!(status.status, UploadStatus::Completed);
        assert_eq!(status.progress, 100.0);

        assert!(h.service.status("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_chunks_after_finalization_are_rejected() {
        let h = harness();
        h.service.save_chunk(chunk("id1", 1, 1, 5), b"hello").await.unwrap();

        let err = h
            .service
            .save_chunk(chunk("id1", 1, 1, 5), b"hello")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::AlreadyFinalized(_)));
        assert_eq!(h.service.pending_uploads(), 0);
        h.gate.notify_one();
    }

    #[tokio::test]
    async fn test_mismatched_descriptor_is_not_stored() {
        let h = harness();
        h.service.save_chunk(chunk("id1", 1, 3, 25), b"0123456789").await.unwrap();

        let err = h
            .service
            .save_chunk(chunk("id1", 2, 3, 30), b"0123456789")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::DescriptorMismatch(_)));
        assert_eq!(h.service.store().stored_chunks("id1").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_failed_merge_cleans_up_and_submits_nothing() {
        let h = harness();
        // Declared 30 bytes, only 15 arrive
        h.service.save_chunk(chunk("id1", 1, 2, 30), b"0123456789").await.unwrap();
        let err = h
            .service
            .save_chunk(chunk("id1", 2, 2, 30), b"abcde")
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::MergeFailed { .. }));
        assert!(!h.service.store().upload_dir("id1").exists());
        assert!(h.service.tracker().is_empty());
        assert!(!h.service.queue().is_known("id1"));
        assert_eq!(h.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_a_partial_upload() {
        let h = harness();
        h.service.save_chunk(chunk("id1", 1, 3, 25), b"0123456789").await.unwrap();

        assert!(h.service.cancel("id1").await);
        assert!(!h.service.store().upload_dir("id1").exists());
        assert!(h.service.status("id1").await.is_none());
        assert!(!h.service.cancel("id1").await);
    }

    #[tokio::test]
    async fn test_cancel_stops_the_task() {
        let h = harness();
        let mut events = h.broadcaster.subscribe("id1");
        h.service.save_chunk(chunk("id1", 1, 1, 5), b"hello").await.unwrap();
        assert_eq!(events.next().await.unwrap().progress, 0.0);

        assert!(h.service.cancel("id1").await);
        h.gate.notify_one();

        let terminal = events.next().await.unwrap();
        assert_eq!(terminal.status, UploadStatus::Failed);
        assert_eq!(terminal.message, "cancelled");
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_uploads() {
        let h = harness();
        h.service.save_chunk(chunk("idle", 1, 2, 15), b"0123456789").await.unwrap();

        assert_eq!(h.service.sweep_stale_uploads(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(h.service.pending_uploads(), 1);

        assert_eq!(h.service.sweep_stale_uploads(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(h.service.pending_uploads(), 0);
        assert!(!h.service.store().upload_dir("idle").exists());
    }

    #[tokio::test]
    async fn test_dropped_request_does_not_strand_the_upload() {
        let h = harness();
        let payload = vec![b'a'; 256 * 1024];
        let total = 3 * payload.len() as u64;

        // Abandon the completing request after a growing number of polls, so
        // some drops land before the slot is taken and some during the merge.
        for polls in 0..16u32 {
            let id = format!("id{}", polls);
            for n in 1..=2 {
                h.service.save_chunk(chunk(&id, n, 3, total), &payload).await.unwrap();
            }

            let mut request = Box::pin(h.service.save_chunk(chunk(&id, 3, 3, total), &payload));
            for _ in 0..polls {
                if futures::poll!(request.as_mut()).is_ready() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            drop(request);

            // Either the merge carried on without the request, or the client
            // can simply send the last chunk again.
            for _ in 0..400 {
                if h.service.queue().is_known(&id) {
                    break;
                }
                if let Some(snapshot) = h.service.tracker().snapshot(&id).await {
                    if snapshot.phase == UploadPhase::Receiving {
                        let retry = h
                            .service
                            .save_chunk(chunk(&id, 3, 3, total), &payload)
                            .await
                            .unwrap();
                        assert!(retry.complete);
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            assert!(h.service.queue().is_known(&id), "'{}' never reached the queue", id);
            assert!(h.service.tracker().snapshot(&id).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_sweep_spares_an_upload_that_just_received_a_chunk() {
        let h = harness();
        h.service.save_chunk(chunk("busy", 1, 3, 25), b"0123456789").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let idle = Duration::from_millis(50);
        assert_eq!(h.service.tracker().stale(idle).await, vec!["busy".to_string()]);

        // A chunk lands between listing and aborting
        h.service.save_chunk(chunk("busy", 2, 3, 25), b"0123456789").await.unwrap();
        assert!(!h.service.tracker().abort_if_idle("busy", idle).await);

        assert_eq!(h.service.sweep_stale_uploads(idle).await.unwrap(), 0);
        assert_eq!(h.service.store().stored_chunks("busy").await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_submit_failure_surfaces_to_the_caller() {
        let tmp = TempDir::new().unwrap();
        let mut config = UploadConfig::development();
        config.temp_dir = tmp.path().join("tmp");
        config.upload_dir = tmp.path().join("uploads");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue, handle) = TaskQueue::start(config.clone(), ProgressBroadcaster::new(8), shutdown_rx);
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let processor = Arc::new(Held {
            gate: Arc::new(Notify::new()),
            runs: Arc::new(AtomicU32::new(0)),
        });
        let service = UploadService::new(config, queue, processor);
        let err = service.save_chunk(chunk("id1", 1, 1, 5), b"hello").await.unwrap_err();
        assert!(matches!(err, UploadError::Submit(QueueError::Closed)));
        assert!(service.tracker().is_empty());
    }
}
