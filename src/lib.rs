pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::UploadConfig;
use crate::services::file_service::LocalFileService;
use crate::services::progress::ProgressBroadcaster;
use crate::services::task_queue::TaskQueue;
use crate::services::tasks::BookProcessor;
use crate::services::upload_service::UploadService;
use axum::{
    Router,
    middleware::from_fn,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::upload::upload_chunk,
        api::handlers::upload::upload_status,
        api::handlers::upload::upload_progress,
        api::handlers::upload::cancel_upload,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::upload::ChunkUploadForm,
            api::handlers::health::HealthResponse,
            models::ChunkDescriptor,
            models::ChunkUploadResponse,
            models::UploadStatusResponse,
            models::UploadStatus,
            models::ProgressEvent,
            services::metadata::BookMetadata,
        )
    ),
    tags(
        (name = "upload", description = "Chunked book upload and processing progress"),
        (name = "system", description = "Service health")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub config: UploadConfig,
    pub uploads: UploadService,
    pub broadcaster: ProgressBroadcaster,
    /// Lets long-lived responses end when the server shuts down
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// Wires the upload pipeline for `config` and starts the task dispatcher,
    /// which runs until `shutdown` changes.
    pub fn build(config: UploadConfig, shutdown: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let broadcaster = ProgressBroadcaster::new(config.progress_buffer);
        let (queue, dispatcher) =
            TaskQueue::start(config.clone(), broadcaster.clone(), shutdown.clone());

        let files = Arc::new(LocalFileService::new(config.upload_dir.clone()));
        let processor = Arc::new(BookProcessor::full(files, config.preview_chars));
        let uploads = UploadService::new(config.clone(), queue, processor);

        (
            Self {
                config,
                uploads,
                broadcaster,
                shutdown,
            },
            dispatcher,
        )
    }
}

pub fn create_app(state: AppState) -> Router {
    // Room for the multipart framing around the largest allowed chunk
    let body_limit = usize::try_from(state.config.max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_add(1024 * 1024);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/api/books/upload/chunk",
            post(api::handlers::upload::upload_chunk),
        )
        .route(
            "/api/books/upload/status/:identifier",
            get(api::handlers::upload::upload_status),
        )
        .route(
            "/api/books/upload/progress/:identifier",
            get(api::handlers::upload::upload_progress),
        )
        .route(
            "/api/books/upload/:identifier",
            delete(api::handlers::upload::cancel_upload),
        )
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers(Any),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
