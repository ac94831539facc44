use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::models::ChunkDescriptor;
use crate::utils::validation::{storage_key, validate_chunk};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;

/// Temporary on-disk storage of chunk payloads.
///
/// Layout: `<temp_dir>/<storage_key(identifier)>/<chunk_number>`. Each chunk is
/// written to a `.part` file first and renamed into place, so a chunk file is
/// either absent or complete.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    config: UploadConfig,
}

impl ChunkStore {
    pub fn new(config: UploadConfig) -> Self {
        Self { config }
    }

    /// Validates the descriptor against upload policy and stores the payload.
    pub async fn save_chunk(
        &self,
        descriptor: &ChunkDescriptor,
        payload: &[u8],
    ) -> Result<String, UploadError> {
        validate_chunk(descriptor, payload.len(), &self.config)?;
        self.write_chunk(descriptor, payload).await?;
        Ok(descriptor.identifier.clone())
    }

    /// Stores the payload without policy checks; callers validate first.
    pub(crate) async fn write_chunk(
        &self,
        descriptor: &ChunkDescriptor,
        payload: &[u8],
    ) -> Result<PathBuf, UploadError> {
        let dir = self.upload_dir(&descriptor.identifier);
        tokio::fs::create_dir_all(&dir).await?;

        let target = dir.join(descriptor.chunk_number.to_string());
        let partial = dir.join(format!("{}.part", descriptor.chunk_number));

        let mut file = tokio::fs::File::create(&partial).await?;
        file.write_all(payload).await?;
        file.flush().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&partial, &target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }

        tracing::debug!(
            "Stored chunk {}/{} of '{}' ({} bytes)",
            descriptor.chunk_number,
            descriptor.total_chunks,
            descriptor.identifier,
            payload.len()
        );
        Ok(target)
    }

    /// Staging directory of one upload.
    pub fn upload_dir(&self, identifier: &str) -> PathBuf {
        self.config.temp_dir.join(storage_key(identifier))
    }

    pub fn chunk_path(&self, identifier: &str, chunk_number: u32) -> PathBuf {
        self.upload_dir(identifier).join(chunk_number.to_string())
    }

    /// Chunk numbers physically present for an upload, ascending.
    pub async fn stored_chunks(&self, identifier: &str) -> Result<Vec<u32>, UploadError> {
        let dir = self.upload_dir(identifier);
        let mut numbers = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(numbers),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Removes the staging directory of an upload. Missing dirs are not an error.
    pub async fn remove_upload(&self, identifier: &str) -> Result<(), UploadError> {
        remove_dir_if_exists(&self.upload_dir(identifier)).await
    }

    /// Deletes staging dirs last modified before `max_age` ago, except those
    /// whose key is in `keep`. Returns the number of dirs removed.
    pub async fn sweep_stale(
        &self,
        max_age: Duration,
        keep: &HashSet<String>,
    ) -> Result<usize, UploadError> {
        let mut entries = match tokio::fs::read_dir(&self.config.temp_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if keep.contains(&name) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= max_age {
                match remove_dir_if_exists(&entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!("Failed to remove stale staging dir {}: {}", name, e),
                }
            }
        }
        Ok(removed)
    }
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), UploadError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> ChunkStore {
        let mut config = UploadConfig::development();
        config.temp_dir = tmp.path().join("tmp");
        config.upload_dir = tmp.path().join("uploads");
        ChunkStore::new(config)
    }

    fn descriptor(identifier: &str, filename: &str, chunk_number: u32) -> ChunkDescriptor {
        ChunkDescriptor {
            identifier: identifier.to_string(),
            chunk_number,
            total_chunks: 3,
            chunk_size: 10,
            total_size: 25,
            filename: filename.to_string(),
        }
    }

    #[tokio::test]
    async fn test_save_chunk_writes_addressed_file() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let id = store
            .save_chunk(&descriptor("id1", "book.txt", 2), b"0123456789")
            .await
            .unwrap();
        assert_eq!(id, "id1");

        let written = tokio::fs::read(store.chunk_path("id1", 2)).await.unwrap();
        assert_eq!(written, b"0123456789");
        assert_eq!(store.stored_chunks("id1").await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_save_chunk_rejects_policy_violations_without_writing() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let err = store
            .save_chunk(&descriptor("id1", "virus.exe", 1), b"MZ")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidFileType { .. }));

        let mut huge = descriptor("id1", "book.pdf", 1);
        huge.total_size = 51 * 1024 * 1024;
        let err = store.save_chunk(&huge, b"%PDF").await.unwrap_err();
        assert!(matches!(err, UploadError::FileTooLarge { .. }));

        assert!(!store.upload_dir("id1").exists());
    }

    #[tokio::test]
    async fn test_rewriting_a_chunk_replaces_it() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let d = descriptor("id1", "book.txt", 1);

        store.save_chunk(&d, b"first").await.unwrap();
        store.save_chunk(&d, b"second").await.unwrap();

        let written = tokio::fs::read(store.chunk_path("id1", 1)).await.unwrap();
        assert_eq!(written, b"second");
        assert_eq!(store.stored_chunks("id1").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_remove_and_sweep() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.save_chunk(&descriptor("a", "a.txt", 1), b"x").await.unwrap();
        store.save_chunk(&descriptor("b", "b.txt", 1), b"y").await.unwrap();

        store.remove_upload("a").await.unwrap();
        assert!(!store.upload_dir("a").exists());
        // Removing twice is fine
        store.remove_upload("a").await.unwrap();

        let mut keep = HashSet::new();
        keep.insert(storage_key("b"));
        assert_eq!(store.sweep_stale(Duration::ZERO, &keep).await.unwrap(), 0);
        assert!(store.upload_dir("b").exists());

        assert_eq!(
            store.sweep_stale(Duration::ZERO, &HashSet::new()).await.unwrap(),
            1
        );
        assert!(!store.upload_dir("b").exists());
    }
}
