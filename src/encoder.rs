use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use std::io::ErrorKind;
use std::path::Path;

use crate::error::ServiceError;

/// Identify an image by its magic bytes.
pub fn guess_image_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 8 && bytes[0..8] == [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A] {
        return Some("image/png");
    }
    if bytes.len() >= 3 && bytes[0..3] == [0xFF, 0xD8, 0xFF] {
        return Some("image/jpeg");
    }
    if bytes.len() >= 6 && (&bytes[0..6] == b"GIF87a" || &bytes[0..6] == b"GIF89a") {
        return Some("image/gif");
    }
    // RIFF....WEBP
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    None
}

pub fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

pub fn encode_data_uri_bytes(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", B64.encode(bytes))
}

/// Read an image from disk and inline it as a `data:` URI. Re-reads on every call.
pub async fn encode_data_uri(path: &Path) -> Result<String, ServiceError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => {
            ServiceError::NotFound(format!("image file not found: {}", path.display()))
        }
        _ => ServiceError::Io(e),
    })?;
    let mime = guess_image_mime(&bytes)
        .or_else(|| mime_from_extension(path))
        .unwrap_or("image/jpeg");
    Ok(encode_data_uri_bytes(&bytes, mime))
}

/// Accepts either a full `data:` URI or bare base64.
pub fn decode_data_uri(s: &str) -> Result<Vec<u8>, ServiceError> {
    let data = match s.find(',') {
        Some(idx) if s.starts_with("data:") => &s[(idx + 1)..],
        _ => s,
    };
    B64.decode(data.trim())
        .map_err(|e| ServiceError::Validation(format!("base64 decode: {e}")))
}
