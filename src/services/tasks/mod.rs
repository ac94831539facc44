//! Retryable units of post-upload work.
//!
//! A [`ProcessingTask`] is a plain value: the identifier it belongs to, the
//! artifact it works on and its retry counter. What the work actually does is
//! delegated to a [`TaskProcessor`]; each call to [`ProcessingTask::execute`]
//! starts a fresh run from zero.

use crate::error::TaskError;
use futures::stream::BoxStream;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod book;

pub use book::{BookProcessor, BookStage};

/// Lazy, single-use sequence of progress values in `[0, 100]`.
/// Normal end of stream is success; an `Err` item is a failed attempt.
pub type ProgressStream = BoxStream<'static, Result<f64, TaskError>>;

/// What a processor gets to work on.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub identifier: String,
    pub filename: String,
    pub artifact: PathBuf,
}

pub trait TaskProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(&self, input: TaskInput) -> ProgressStream;
}

#[derive(Clone)]
pub struct ProcessingTask {
    identifier: String,
    display_name: String,
    artifact: PathBuf,
    retry_count: u32,
    max_retries: u32,
    processor: Arc<dyn TaskProcessor>,
}

impl ProcessingTask {
    pub fn new(
        identifier: impl Into<String>,
        display_name: impl Into<String>,
        artifact: impl Into<PathBuf>,
        max_retries: u32,
        processor: Arc<dyn TaskProcessor>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            display_name: display_name.into(),
            artifact: artifact.into(),
            retry_count: 0,
            max_retries,
            processor,
        }
    }

    pub fn execute(&self) -> ProgressStream {
        self.processor.execute(TaskInput {
            identifier: self.identifier.clone(),
            filename: self.display_name.clone(),
            artifact: self.artifact.clone(),
        })
    }

    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Counts one more failure and reports whether another attempt is allowed.
    pub fn increment_retry_count(&mut self) -> bool {
        self.retry_count += 1;
        self.should_retry()
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn processor_name(&self) -> &'static str {
        self.processor.name()
    }
}

impl fmt::Debug for ProcessingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingTask")
            .field("identifier", &self.identifier)
            .field("display_name", &self.display_name)
            .field("artifact", &self.artifact)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("processor", &self.processor.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct Steps;

    impl TaskProcessor for Steps {
        fn name(&self) -> &'static str {
            "steps"
        }

        fn execute(&self, _input: TaskInput) -> ProgressStream {
            futures::stream::iter(vec![Ok(0.0), Ok(50.0), Ok(100.0)]).boxed()
        }
    }

    #[test]
    fn test_retry_counter() {
        let mut task = ProcessingTask::new("id1", "book.txt", "/tmp/book.txt", 3, Arc::new(Steps));
        assert!(task.should_retry());
        assert!(task.increment_retry_count());
        assert!(task.increment_retry_count());
        assert!(!task.increment_retry_count());
        assert_eq!(task.retry_count(), 3);
        assert!(!task.should_retry());
    }

    #[test]
    fn test_zero_retries() {
        let task = ProcessingTask::new("id1", "book.txt", "/tmp/book.txt", 0, Arc::new(Steps));
        assert!(!task.should_retry());
    }

    #[tokio::test]
    async fn test_each_execute_is_a_fresh_run() {
        let task = ProcessingTask::new("id1", "book.txt", "/tmp/book.txt", 1, Arc::new(Steps));
        let first: Vec<_> = task.execute().map(|r| r.unwrap()).collect().await;
        let second: Vec<_> = task.execute().map(|r| r.unwrap()).collect().await;
        assert_eq!(first, vec![0.0, 50.0, 100.0]);
        assert_eq!(first, second);
    }
}
