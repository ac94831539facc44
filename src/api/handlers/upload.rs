use crate::AppState;
use crate::api::error::AppError;
use crate::models::{ChunkDescriptor, ChunkUploadResponse, ProgressEvent, UploadStatusResponse};
use crate::utils::validation::generate_identifier;
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use utoipa::ToSchema;

/// Multipart body of a chunk upload (documentation only).
#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
pub struct ChunkUploadForm {
    /// Raw chunk bytes
    #[schema(value_type = String, format = Binary)]
    file: Vec<u8>,
    /// JSON-encoded `ChunkDescriptor`
    chunk_info: String,
}

#[utoipa::path(
    post,
    path = "/api/books/upload/chunk",
    request_body(content = ChunkUploadForm, description = "Chunk payload and descriptor", content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Chunk stored", body = ChunkUploadResponse),
        (status = 400, description = "Invalid file type or malformed chunk"),
        (status = 409, description = "Descriptor mismatch or upload already finalized"),
        (status = 413, description = "Declared size exceeds the limit")
    ),
    tag = "upload"
)]
pub async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>, AppError> {
    let mut payload: Option<Bytes> = None;
    let mut descriptor: Option<ChunkDescriptor> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                payload = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AppError::BadRequest(format!("Failed to read chunk: {}", e)))?,
                );
            }
            "chunkInfo" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read chunkInfo: {}", e)))?;
                descriptor = Some(
                    serde_json::from_str(&text)
                        .map_err(|e| AppError::BadRequest(format!("Invalid chunkInfo: {}", e)))?,
                );
            }
            other => tracing::debug!("Ignoring multipart field '{}'", other),
        }
    }

    let payload = payload.ok_or_else(|| AppError::BadRequest("Missing 'file' part".to_string()))?;
    let mut descriptor = descriptor
        .ok_or_else(|| AppError::BadRequest("Missing 'chunkInfo' part".to_string()))?;

    if descriptor.identifier.trim().is_empty() {
        descriptor.identifier = generate_identifier(&descriptor.filename);
        tracing::debug!("Assigned identifier '{}'", descriptor.identifier);
    }

    let response = state.uploads.save_chunk(descriptor, &payload).await?;
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/api/books/upload/status/{identifier}",
    params(
        ("identifier" = String, Path, description = "Upload identifier")
    ),
    responses(
        (status = 200, description = "Current upload status", body = UploadStatusResponse),
        (status = 404, description = "Unknown identifier")
    ),
    tag = "upload"
)]
pub async fn upload_status(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<Json<UploadStatusResponse>, AppError> {
    state
        .uploads
        .status(&identifier)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No upload '{}'", identifier)))
}

#[utoipa::path(
    get,
    path = "/api/books/upload/progress/{identifier}",
    params(
        ("identifier" = String, Path, description = "Upload identifier")
    ),
    responses(
        (status = 200, description = "Server-sent `progress` events until COMPLETED or FAILED", content_type = "text/event-stream", body = ProgressEvent)
    ),
    tag = "upload"
)]
pub async fn upload_progress(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before looking for an outcome so a terminal event published
    // in between is not missed.
    let mut live = state.broadcaster.subscribe(&identifier);
    let finished = state.uploads.queue().outcome(&identifier).map(|o| o.event);
    let mut shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        if let Some(event) = finished {
            if let Some(sse) = to_sse(&event) {
                yield Ok(sse);
            }
            return;
        }

        loop {
            let event = tokio::select! {
                event = live.next() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            let terminal = event.is_terminal();
            if let Some(sse) = to_sse(&event) {
                yield Ok(sse);
            }
            if terminal {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse(event: &ProgressEvent) -> Option<Event> {
    match Event::default().event("progress").json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            tracing::warn!("Failed to encode progress event: {}", e);
            None
        }
    }
}

#[utoipa::path(
    delete,
    path = "/api/books/upload/{identifier}",
    params(
        ("identifier" = String, Path, description = "Upload identifier")
    ),
    responses(
        (status = 204, description = "Upload aborted or task cancelled"),
        (status = 404, description = "Nothing to cancel")
    ),
    tag = "upload"
)]
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.uploads.cancel(&identifier).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!(
            "Nothing to cancel for '{}'",
            identifier
        )))
    }
}
