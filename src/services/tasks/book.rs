use super::{ProgressStream, TaskInput, TaskProcessor};
use crate::error::TaskError;
use crate::services::file_service::FileService;
use crate::services::metadata::{BookFormat, MetadataService};
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One phase of book pre-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookStage {
    /// Content sniffing: the bytes must really be the format the extension claims
    FormatValidation,
    /// Title/author/counts written to a `.meta.json` sidecar
    MetadataExtraction,
    /// First characters of the readable text saved under `previews/`
    PreviewGeneration,
    /// Plain text is gzipped in place when that saves space
    StorageOptimization,
}

impl BookStage {
    pub const ALL: [BookStage; 4] = [
        BookStage::FormatValidation,
        BookStage::MetadataExtraction,
        BookStage::PreviewGeneration,
        BookStage::StorageOptimization,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BookStage::FormatValidation => "format-validation",
            BookStage::MetadataExtraction => "metadata-extraction",
            BookStage::PreviewGeneration => "preview-generation",
            BookStage::StorageOptimization => "storage-optimization",
        }
    }
}

/// Runs a fixed list of [`BookStage`]s over a merged artifact.
///
/// Progress is split evenly: `0` before the first stage, one step after each
/// stage, and `100` at the end. The full pipeline therefore reports
/// 0, 20, 40, 60, 80, 100.
#[derive(Clone)]
pub struct BookProcessor {
    stages: Vec<BookStage>,
    files: Arc<dyn FileService>,
    preview_chars: usize,
}

impl BookProcessor {
    pub fn new(stages: Vec<BookStage>, files: Arc<dyn FileService>, preview_chars: usize) -> Self {
        Self {
            stages,
            files,
            preview_chars,
        }
    }

    /// Every stage, in pipeline order.
    pub fn full(files: Arc<dyn FileService>, preview_chars: usize) -> Self {
        Self::new(BookStage::ALL.to_vec(), files, preview_chars)
    }

    pub fn single(stage: BookStage, files: Arc<dyn FileService>, preview_chars: usize) -> Self {
        Self::new(vec![stage], files, preview_chars)
    }

    pub fn stages(&self) -> &[BookStage] {
        &self.stages
    }
}

impl TaskProcessor for BookProcessor {
    fn name(&self) -> &'static str {
        match self.stages.as_slice() {
            [only] => only.name(),
            _ => "book-preprocessing",
        }
    }

    fn execute(&self, input: TaskInput) -> ProgressStream {
        let stages = self.stages.clone();
        let mut ctx = StageContext {
            input,
            files: self.files.clone(),
            preview_chars: self.preview_chars,
            bytes: None,
            format: None,
        };

        async_stream::stream! {
            let steps = stages.len() as f64 + 1.0;
            yield Ok(0.0);

            for (i, stage) in stages.iter().enumerate() {
                tracing::debug!("'{}': running {}", ctx.input.identifier, stage.name());
                if let Err(e) = ctx.run(*stage).await {
                    tracing::warn!(
                        "'{}': {} failed: {}",
                        ctx.input.identifier,
                        stage.name(),
                        e
                    );
                    yield Err(e);
                    return;
                }
                yield Ok((i as f64 + 1.0) * 100.0 / steps);
            }

            yield Ok(100.0);
        }
        .boxed()
    }
}

/// State shared by the stages of one run.
struct StageContext {
    input: TaskInput,
    files: Arc<dyn FileService>,
    preview_chars: usize,
    bytes: Option<Vec<u8>>,
    format: Option<BookFormat>,
}

impl StageContext {
    async fn run(&mut self, stage: BookStage) -> Result<(), TaskError> {
        match stage {
            BookStage::FormatValidation => self.validate_format().await.map(|_| ()),
            BookStage::MetadataExtraction => self.extract_metadata().await,
            BookStage::PreviewGeneration => self.generate_preview().await,
            BookStage::StorageOptimization => self.optimize_storage().await,
        }
    }

    async fn load(&mut self) -> Result<(), TaskError> {
        if self.bytes.is_none() {
            self.bytes = Some(tokio::fs::read(&self.input.artifact).await?);
        }
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or_default()
    }

    async fn validate_format(&mut self) -> Result<BookFormat, TaskError> {
        self.load().await?;
        let format = MetadataService::detect_format(self.bytes(), &self.input.filename)
            .map_err(TaskError::failed)?;
        self.format = Some(format);
        Ok(format)
    }

    /// The artifact as the file service addresses it. Merged artifacts land
    /// directly in the file service root, so this is the bare file name.
    fn stored_name(&self) -> PathBuf {
        self.input
            .artifact
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.input.artifact.clone())
    }

    async fn format(&mut self) -> Result<BookFormat, TaskError> {
        match self.format {
            Some(format) => Ok(format),
            None => self.validate_format().await,
        }
    }

    async fn extract_metadata(&mut self) -> Result<(), TaskError> {
        let format = self.format().await?;
        let bytes = self.bytes().to_vec();
        let metadata = tokio::task::spawn_blocking(move || MetadataService::analyze(&bytes, format))
            .await
            .map_err(|e| TaskError::failed(format!("metadata worker panicked: {}", e)))?;

        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| TaskError::failed(e.to_string()))?;
        let sidecar = sidecar_path(&self.stored_name(), "meta.json");
        self.files
            .save_file(&sidecar.to_string_lossy(), Bytes::from(json))
            .await?;

        tracing::info!(
            "'{}': metadata extracted (title: {:?})",
            self.input.identifier,
            metadata.title
        );
        Ok(())
    }

    async fn generate_preview(&mut self) -> Result<(), TaskError> {
        let text = self.files.parse_book_content(&self.stored_name()).await?;
        let preview: String = text.chars().take(self.preview_chars).collect();

        let stem = self
            .input
            .artifact
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.input.identifier.clone());
        self.files
            .save_file(&format!("previews/{}.txt", stem), Bytes::from(preview))
            .await?;
        Ok(())
    }

    async fn optimize_storage(&mut self) -> Result<(), TaskError> {
        // pdf and epub are compressed containers already
        if self.format().await? != BookFormat::Txt {
            return Ok(());
        }

        let original = self.bytes().to_vec();
        let original_len = original.len();
        let compressed = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&original)?;
            encoder.finish()
        })
        .await
        .map_err(|e| TaskError::failed(format!("compression worker panicked: {}", e)))??;

        if compressed.len() >= original_len {
            tracing::debug!("'{}': gzip would not shrink the artifact", self.input.identifier);
            return Ok(());
        }

        let stored = self.stored_name();
        let gz = sidecar_path(&stored, "gz");
        let compressed_len = compressed.len();
        self.files
            .save_file(&gz.to_string_lossy(), Bytes::from(compressed))
            .await?;
        self.files.delete_file(&stored).await?;

        tracing::info!(
            "'{}': stored compressed ({} -> {} bytes)",
            self.input.identifier,
            original_len,
            compressed_len
        );
        Ok(())
    }
}

/// `<artifact>.<suffix>`, next to the artifact.
fn sidecar_path(artifact: &Path, suffix: &str) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
