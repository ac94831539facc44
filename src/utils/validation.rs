use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::models::ChunkDescriptor;
use sha2::{Digest, Sha256};
use std::path::Path;
use validator::Validate;

/// Validates the declared total size against the configured limit
pub fn validate_file_size(size: u64, max_size: u64) -> Result<(), UploadError> {
    if size > max_size {
        return Err(UploadError::FileTooLarge {
            size,
            max: max_size,
        });
    }
    Ok(())
}

/// Validates the filename extension against the allowlist (case-insensitive)
pub fn validate_extension(filename: &str, allowed: &[String]) -> Result<String, UploadError> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    if !extension.is_empty() && allowed.iter().any(|a| a == &extension) {
        return Ok(extension);
    }

    Err(UploadError::InvalidFileType {
        extension,
        allowed: allowed.join(", "),
    })
}

/// Strips path components and replaces reserved characters.
/// Returns an error if nothing usable remains.
pub fn sanitize_filename(filename: &str) -> Result<String, UploadError> {
    // Both separators, regardless of platform
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim();

    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        tracing::warn!("Path components stripped from uploaded filename: {}", filename);
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|' | ';') {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Limit length safely for UTF-8
    let sanitized = if sanitized.len() > 255 {
        let mut end = 255;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    };

    if sanitized.is_empty() || sanitized.starts_with('.') {
        return Err(UploadError::InvalidChunk(format!(
            "unusable filename '{}'",
            filename
        )));
    }

    Ok(sanitized)
}

/// Runs every chunk-save policy check before anything touches disk.
pub fn validate_chunk(
    descriptor: &ChunkDescriptor,
    payload_len: usize,
    config: &UploadConfig,
) -> Result<(), UploadError> {
    validate_extension(&descriptor.filename, &config.allowed_extensions)?;
    validate_file_size(descriptor.total_size, config.max_file_size)?;

    descriptor
        .validate()
        .map_err(|e| UploadError::InvalidChunk(e.to_string()))?;

    if descriptor.chunk_number > descriptor.total_chunks {
        return Err(UploadError::InvalidChunk(format!(
            "chunk {} is beyond the declared total of {}",
            descriptor.chunk_number, descriptor.total_chunks
        )));
    }

    if payload_len as u64 > descriptor.total_size {
        return Err(UploadError::InvalidChunk(format!(
            "chunk payload of {} bytes exceeds the declared total size",
            payload_len
        )));
    }

    Ok(())
}

/// Filesystem-safe key for an upload identifier.
pub fn storage_key(identifier: &str) -> String {
    let digest = Sha256::digest(identifier.as_bytes());
    hex::encode(&digest[..16])
}

/// Server-side identifier for uploads that did not bring one.
pub fn generate_identifier(filename: &str) -> String {
    let base = sanitize_filename(filename).unwrap_or_else(|_| "upload".to_string());
    format!("{}_{}", base, chrono::Utc::now().timestamp_millis())
}
