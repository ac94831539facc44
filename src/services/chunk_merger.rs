use crate::error::UploadError;
use crate::models::ChunkDescriptor;
use crate::services::chunk_store::ChunkStore;
use crate::utils::validation::{sanitize_filename, storage_key};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

/// Reassembles a complete chunk set into the final artifact.
#[derive(Debug, Clone)]
pub struct ChunkMerger {
    store: ChunkStore,
    upload_dir: PathBuf,
}

impl ChunkMerger {
    pub fn new(store: ChunkStore, upload_dir: PathBuf) -> Self {
        Self { store, upload_dir }
    }

    /// Where the merged artifact for an upload lands.
    pub fn final_path(&self, descriptor: &ChunkDescriptor) -> Result<PathBuf, UploadError> {
        let filename = sanitize_filename(&descriptor.filename)?;
        Ok(self.upload_dir.join(format!(
            "{}_{}",
            &storage_key(&descriptor.identifier)[..12],
            filename
        )))
    }

    /// Concatenates chunks `1..=total_chunks` into a private staging file, checks
    /// the result against `total_size`, renames it into place and removes the
    /// chunk staging dir. On failure the staging file is removed and no
    /// artifact is exposed; chunk files are left to the caller.
    pub async fn merge(&self, descriptor: &ChunkDescriptor) -> Result<PathBuf, UploadError> {
        let identifier = descriptor.identifier.as_str();
        let final_path = self.final_path(descriptor)?;
        let staging = self
            .upload_dir
            .join(format!(".{}.{}.partial", storage_key(identifier), Uuid::new_v4()));

        tracing::info!(
            "Merging {} chunks of '{}' into {}",
            descriptor.total_chunks,
            identifier,
            final_path.display()
        );

        if let Err(e) = self.write_staging(descriptor, &staging).await {
            let _ = tokio::fs::remove_file(&staging).await;
            tracing::error!("Merge of '{}' failed: {}", identifier, e);
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&staging, &final_path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(merge_failed(identifier, format!("rename failed: {}", e)));
        }

        if let Err(e) = self.store.remove_upload(identifier).await {
            // The artifact is complete; leftovers are swept by maintenance.
            tracing::warn!("Failed to remove chunk dir of '{}': {}", identifier, e);
        }

        tracing::info!(
            "Merged '{}' ({} bytes) to {}",
            identifier,
            descriptor.total_size,
            final_path.display()
        );
        Ok(final_path)
    }

    async fn write_staging(
        &self,
        descriptor: &ChunkDescriptor,
        staging: &Path,
    ) -> Result<(), UploadError> {
        let identifier = descriptor.identifier.as_str();
        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(|e| merge_failed(identifier, e.to_string()))?;

        let file = tokio::fs::File::create(staging)
            .await
            .map_err(|e| merge_failed(identifier, e.to_string()))?;
        let mut writer = BufWriter::new(file);
        let mut written: u64 = 0;

        // Chunk numbers, not arrival order, define the byte order.
        for n in 1..=descriptor.total_chunks {
            let path = self.store.chunk_path(identifier, n);
            let mut chunk = tokio::fs::File::open(&path)
                .await
                .map_err(|e| merge_failed(identifier, format!("chunk {}: {}", n, e)))?;
            written += tokio::io::copy(&mut chunk, &mut writer)
                .await
                .map_err(|e| merge_failed(identifier, format!("chunk {}: {}", n, e)))?;
        }

        writer
            .flush()
            .await
            .map_err(|e| merge_failed(identifier, e.to_string()))?;
        writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| merge_failed(identifier, e.to_string()))?;

        if written != descriptor.total_size {
            return Err(merge_failed(
                identifier,
                format!(
                    "merged {} bytes but {} were declared",
                    written, descriptor.total_size
                ),
            ));
        }
        Ok(())
    }
}

fn merge_failed(identifier: &str, reason: String) -> UploadError {
    UploadError::MergeFailed {
        identifier: identifier.to_string(),
        reason,
    }
}
