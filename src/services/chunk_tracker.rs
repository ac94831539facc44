use crate::error::UploadError;
use crate::models::ChunkDescriptor;
use crate::utils::keyed_mutex::KeyedMutex;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    /// Accepting chunks
    Receiving,
    /// Every chunk arrived; exactly one caller is merging
    Merging,
    /// Entry was dropped from the index; holders must start over
    Discarded,
}

/// Bookkeeping for one upload identifier.
#[derive(Debug)]
pub struct UploadEntry {
    pub descriptor: ChunkDescriptor,
    pub received: BTreeSet<u32>,
    pub phase: UploadPhase,
    pub updated_at: Instant,
}

impl UploadEntry {
    fn new(descriptor: ChunkDescriptor) -> Self {
        Self {
            descriptor,
            received: BTreeSet::new(),
            phase: UploadPhase::Receiving,
            updated_at: Instant::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.descriptor.total_chunks
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSnapshot {
    pub descriptor: ChunkDescriptor,
    pub received_chunks: u32,
    pub phase: UploadPhase,
}

/// Exclusive access to one identifier's entry. Everything done through a
/// slot is serialized with every other operation on the same identifier.
pub struct UploadSlot {
    identifier: String,
    guard: OwnedMutexGuard<UploadEntry>,
}

impl UploadSlot {
    /// Records `chunk_number` as present and reports whether this call completed
    /// the set. Only one caller ever gets `true`: the entry moves to `Merging`
    /// in the same critical section.
    pub fn record_and_check(&mut self, chunk_number: u32) -> bool {
        let entry = &mut *self.guard;
        entry.received.insert(chunk_number);
        entry.updated_at = Instant::now();

        if entry.phase == UploadPhase::Receiving && entry.is_complete() {
            entry.phase = UploadPhase::Merging;
            return true;
        }
        false
    }

    pub fn received_chunks(&self) -> u32 {
        self.guard.received.len() as u32
    }

    pub fn descriptor(&self) -> &ChunkDescriptor {
        &self.guard.descriptor
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// In-memory index of uploads that are still receiving chunks or merging.
#[derive(Clone, Default)]
pub struct ChunkTracker {
    entries: KeyedMutex<UploadEntry>,
}

impl ChunkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the slot for the descriptor's identifier, creating the entry on the
    /// first chunk. Fails when the upload is already merging or the descriptor
    /// disagrees with the one recorded first.
    pub async fn begin(&self, descriptor: &ChunkDescriptor) -> Result<UploadSlot, UploadError> {
        loop {
            let guard = self
                .entries
                .lock_or_insert_with(&descriptor.identifier, || {
                    UploadEntry::new(descriptor.clone())
                })
                .await;

            match guard.phase {
                UploadPhase::Discarded => continue,
                UploadPhase::Merging => {
                    return Err(UploadError::AlreadyFinalized(descriptor.identifier.clone()));
                }
                UploadPhase::Receiving => {}
            }

            if !guard.descriptor.agrees_with(descriptor) {
                tracing::warn!(
                    "Rejecting chunk {} of '{}': descriptor differs from the first chunk",
                    descriptor.chunk_number,
                    descriptor.identifier
                );
                return Err(UploadError::DescriptorMismatch(descriptor.identifier.clone()));
            }

            return Ok(UploadSlot {
                identifier: descriptor.identifier.clone(),
                guard,
            });
        }
    }

    /// Drops a slot's entry if no chunk was ever recorded in it.
    pub fn release_if_empty(&self, mut slot: UploadSlot) {
        if slot.guard.received.is_empty() && slot.guard.phase == UploadPhase::Receiving {
            slot.guard.phase = UploadPhase::Discarded;
            self.entries.remove(&slot.identifier);
        }
    }

    /// True when every declared chunk has been recorded.
    ///
    /// Only meaningful while the upload is tracked: once the completing chunk
    /// has been merged and its task submitted the entry is dropped, and this
    /// reports `false`. Use [`ChunkUploadResponse::complete`] or the upload
    /// status for finalized uploads.
    ///
    /// [`ChunkUploadResponse::complete`]: crate::models::ChunkUploadResponse::complete
    pub async fn is_complete(&self, identifier: &str) -> bool {
        match self.entries.lock(identifier).await {
            Some(entry) => entry.is_complete(),
            None => false,
        }
    }

    pub async fn snapshot(&self, identifier: &str) -> Option<TrackerSnapshot> {
        let entry = self.entries.lock(identifier).await?;
        if entry.phase == UploadPhase::Discarded {
            return None;
        }
        Some(TrackerSnapshot {
            descriptor: entry.descriptor.clone(),
            received_chunks: entry.received.len() as u32,
            phase: entry.phase,
        })
    }

    /// Removes the entry after its merge finished or failed.
    pub async fn remove(&self, identifier: &str) {
        if let Some(mut entry) = self.entries.lock(identifier).await {
            entry.phase = UploadPhase::Discarded;
        }
        self.entries.remove(identifier);
    }

    /// Aborts an upload that is still receiving chunks.
    /// Returns false when the identifier is unknown or already merging.
    pub async fn abort(&self, identifier: &str) -> bool {
        self.abort_if_idle(identifier, Duration::ZERO).await
    }

    /// Like [`abort`](Self::abort), but only when the upload has still been
    /// idle for `max_age` once its lock is held.
    pub async fn abort_if_idle(&self, identifier: &str, max_age: Duration) -> bool {
        let Some(mut entry) = self.entries.lock(identifier).await else {
            return false;
        };
        if entry.phase != UploadPhase::Receiving || entry.updated_at.elapsed() < max_age {
            return false;
        }
        entry.phase = UploadPhase::Discarded;
        drop(entry);
        self.entries.remove(identifier);
        true
    }

    /// Identifiers still receiving chunks with no activity for `max_age`.
    pub async fn stale(&self, max_age: Duration) -> Vec<String> {
        let mut stale = Vec::new();
        for identifier in self.entries.keys() {
            if let Some(entry) = self.entries.lock(&identifier).await {
                if entry.phase == UploadPhase::Receiving && entry.updated_at.elapsed() >= max_age {
                    stale.push(identifier);
                }
            }
        }
        stale
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
