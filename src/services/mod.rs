pub mod chunk_merger;
pub mod chunk_store;
pub mod chunk_tracker;
pub mod file_service;
pub mod maintenance;
pub mod metadata;
pub mod progress;
pub mod task_queue;
pub mod tasks;
pub mod upload_service;
