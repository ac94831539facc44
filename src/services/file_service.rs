use crate::services::metadata::{BookFormat, MetadataService};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// File primitives available to processing tasks.
#[async_trait]
pub trait FileService: Send + Sync {
    /// Stores `data` under `name` (relative to the service root) and returns the full path.
    async fn save_file(&self, name: &str, data: Bytes) -> Result<PathBuf>;

    /// Extracts readable text from a book artifact.
    async fn parse_book_content(&self, path: &Path) -> Result<String>;

    async fn delete_file(&self, path: &Path) -> Result<()>;
}

/// `FileService` backed by a local directory.
pub struct LocalFileService {
    root: PathBuf,
}

impl LocalFileService {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(anyhow!("path escapes storage root: {}", path.display()));
        }
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.root.join(path))
        }
    }
}

#[async_trait]
impl FileService for LocalFileService {
    async fn save_file(&self, name: &str, data: Bytes) -> Result<PathBuf> {
        let target = self.resolve(Path::new(name))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &data)
            .await
            .with_context(|| format!("writing {}", target.display()))?;
        Ok(target)
    }

    async fn parse_book_content(&self, path: &Path) -> Result<String> {
        let path = self.resolve(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_string();
        let format = BookFormat::from_extension(&extension)
            .ok_or_else(|| anyhow!("cannot parse .{} files", extension))?;
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;

        tokio::task::spawn_blocking(move || -> Result<String> {
            match format {
                BookFormat::Txt => Ok(String::from_utf8_lossy(&bytes).into_owned()),
                BookFormat::Epub => MetadataService::epub_text(&bytes).map_err(|e| anyhow!(e)),
                BookFormat::Pdf => {
                    let doc = lopdf::Document::load_mem(&bytes)?;
                    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
                    Ok(doc.extract_text(&pages)?)
                }
            }
        })
        .await?
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        let path = self.resolve(path)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting {}", path.display())),
        }
    }
}
