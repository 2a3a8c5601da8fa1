//! The three-step flow a user walks through: pick a photo, wait for the analysis
//! and the generated preview, look at the result.
//!
//! [`WizardState`] owns the flow; a [`WizardBackend`] performs each stage either
//! against a running server ([`HttpBackend`]) or in-process ([`Pipeline`]).

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoder::{guess_image_mime, mime_from_extension};
use crate::error::ServiceError;
use crate::generation::GeneratedImage;
use crate::palette::AnalysisResult;
use crate::pipeline::Pipeline;
use crate::server::{GenerateResponse, UploadResponse};
use crate::upload::{normalize_mime, UploadedFile};

/// Longest edge after client-side downscaling.
pub const MAX_EDGE: u32 = 2048;
pub const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WizardStep {
    #[default]
    Upload,
    Analyzing,
    Generating,
    Result,
}

impl WizardStep {
    fn next(self) -> Option<WizardStep> {
        match self {
            WizardStep::Upload => Some(WizardStep::Analyzing),
            WizardStep::Analyzing => Some(WizardStep::Generating),
            WizardStep::Generating => Some(WizardStep::Result),
            WizardStep::Result => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedImage {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl SelectedImage {
    pub async fn from_path(path: &Path) -> Result<Self, ServiceError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ServiceError::NotFound(format!("image file not found: {}", path.display()))
            }
            _ => ServiceError::Io(e),
        })?;
        let mime_type = guess_image_mime(&bytes)
            .or_else(|| mime_from_extension(path))
            .unwrap_or("application/octet-stream")
            .to_string();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self { name, mime_type, bytes })
    }
}

#[derive(Debug, Error)]
pub enum WizardError {
    #[error("cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: WizardStep, to: WizardStep },
    #[error("no image selected")]
    NothingSelected,
    #[error(transparent)]
    Stage(#[from] ServiceError),
}

/// Downscale so the longest edge is at most [`MAX_EDGE`] and re-encode.
///
/// JPEG is always re-encoded at [`JPEG_QUALITY`]. PNG is re-encoded losslessly; GIF
/// passes through untouched unless it needs shrinking, in which case it becomes a
/// PNG. Anything that fails to decode or encode is returned as is.
pub fn compress_image(image: &SelectedImage) -> SelectedImage {
    let decoded = match image::load_from_memory(&image.bytes) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(error = %e, name = %image.name, "cannot decode image, sending original");
            return image.clone();
        }
    };
    let needs_resize = decoded.width().max(decoded.height()) > MAX_EDGE;
    let resized = if needs_resize {
        decoded.resize(MAX_EDGE, MAX_EDGE, FilterType::Triangle)
    } else {
        decoded
    };

    let mut buf = Vec::new();
    let (mime, written) = match normalize_mime(&image.mime_type) {
        Some("image/jpeg") => {
            let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
            ("image/jpeg", rgb.write_with_encoder(encoder))
        }
        Some("image/gif") if !needs_resize => return image.clone(),
        _ => (
            "image/png",
            resized.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png),
        ),
    };
    if let Err(e) = written {
        warn!(error = %e, name = %image.name, "re-encoding failed, sending original");
        return image.clone();
    }

    let name = if mime == image.mime_type || normalize_mime(&image.mime_type) == Some(mime) {
        image.name.clone()
    } else {
        let stem = Path::new(&image.name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        format!("{stem}.png")
    };
    debug!(before = image.bytes.len(), after = buf.len(), "image compressed");
    SelectedImage {
        name,
        mime_type: mime.to_string(),
        bytes: buf,
    }
}

/// One transport for the three stages.
#[async_trait]
pub trait WizardBackend: Send + Sync {
    async fn upload(&self, image: &SelectedImage) -> Result<UploadedFile, ServiceError>;
    async fn analyze(&self, file_path: &str) -> Result<AnalysisResult, ServiceError>;
    async fn generate(
        &self,
        description: &str,
        original_image_path: Option<&str>,
    ) -> Result<GeneratedImage, ServiceError>;
}

#[async_trait]
impl WizardBackend for Pipeline {
    async fn upload(&self, image: &SelectedImage) -> Result<UploadedFile, ServiceError> {
        Pipeline::upload(self, &image.name, Some(image.mime_type.as_str()), &image.bytes).await
    }

    async fn analyze(&self, file_path: &str) -> Result<AnalysisResult, ServiceError> {
        Pipeline::analyze(self, file_path).await
    }

    async fn generate(
        &self,
        description: &str,
        original_image_path: Option<&str>,
    ) -> Result<GeneratedImage, ServiceError> {
        Pipeline::generate(self, description, original_image_path).await
    }
}

/// Talks to a running server's `/api/*` routes.
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ServiceError> {
        let status = resp.status();
        if status.is_success() {
            return resp.json::<T>().await.map_err(|e| {
                ServiceError::MalformedResponse(format!("unexpected server response: {e}"))
            });
        }
        let message = resp
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| "unknown error".to_string());
        Err(ServiceError::Remote {
            status: status.as_u16(),
            message,
        })
    }

    fn unavailable(source: reqwest::Error) -> ServiceError {
        ServiceError::Unavailable {
            provider: "outfit-palette server",
            source,
        }
    }
}

#[async_trait]
impl WizardBackend for HttpBackend {
    async fn upload(&self, image: &SelectedImage) -> Result<UploadedFile, ServiceError> {
        let part = reqwest::multipart::Part::bytes(image.bytes.clone())
            .file_name(image.name.clone())
            .mime_str(&image.mime_type)
            .map_err(|e| ServiceError::Validation(format!("invalid MIME type: {e}")))?;
        let form = reqwest::multipart::Form::new().part("image", part);
        let resp = self
            .http
            .post(self.url("/api/upload"))
            .multipart(form)
            .send()
            .await
            .map_err(Self::unavailable)?;
        let body: UploadResponse = Self::read(resp).await?;
        Ok(body.file)
    }

    async fn analyze(&self, file_path: &str) -> Result<AnalysisResult, ServiceError> {
        let resp = self
            .http
            .post(self.url("/api/analyze"))
            .json(&serde_json::json!({ "filePath": file_path }))
            .send()
            .await
            .map_err(Self::unavailable)?;
        Self::read(resp).await
    }

    async fn generate(
        &self,
        description: &str,
        original_image_path: Option<&str>,
    ) -> Result<GeneratedImage, ServiceError> {
        let resp = self
            .http
            .post(self.url("/api/generate-image"))
            .json(&serde_json::json!({
                "suggested_outfit_description": description,
                "original_image_path": original_image_path,
            }))
            .send()
            .await
            .map_err(Self::unavailable)?;
        let body: GenerateResponse = Self::read(resp).await?;
        Ok(GeneratedImage {
            image_url: body.image_url,
            description: body.description,
        })
    }
}

/// Everything the wizard knows. Only user actions and finished stages change it.
#[derive(Debug, Clone)]
pub struct WizardState {
    step: WizardStep,
    pub selected_file: Option<SelectedImage>,
    pub compressed_file: Option<SelectedImage>,
    pub uploaded: Option<UploadedFile>,
    pub analysis: Option<AnalysisResult>,
    pub generated: Option<GeneratedImage>,
    pub last_error: Option<String>,
    history: Vec<WizardStep>,
}

impl Default for WizardState {
    fn default() -> Self {
        Self {
            step: WizardStep::Upload,
            selected_file: None,
            compressed_file: None,
            uploaded: None,
            analysis: None,
            generated: None,
            last_error: None,
            history: vec![WizardStep::Upload],
        }
    }
}

impl WizardState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self) -> WizardStep {
        self.step
    }

    /// Every step entered since the last reset, in order.
    pub fn history(&self) -> &[WizardStep] {
        &self.history
    }

    /// Pick a photo. Applies the same type and size checks as the server, then
    /// compresses it for upload.
    pub fn select(&mut self, image: SelectedImage, max_bytes: u64) -> Result<(), WizardError> {
        if self.step != WizardStep::Upload {
            return Err(WizardError::InvalidTransition {
                from: self.step,
                to: WizardStep::Upload,
            });
        }
        if normalize_mime(&image.mime_type).is_none() {
            return Err(ServiceError::Validation(
                "only JPEG, PNG and GIF images are supported".to_string(),
            )
            .into());
        }
        if image.bytes.len() as u64 > max_bytes {
            return Err(ServiceError::Validation(format!(
                "image must not exceed {max_bytes} bytes"
            ))
            .into());
        }
        let compressed = compress_image(&image);
        info!(
            original_kb = image.bytes.len() / 1024,
            compressed_kb = compressed.bytes.len() / 1024,
            "image selected"
        );
        self.selected_file = Some(image);
        self.compressed_file = Some(compressed);
        self.last_error = None;
        Ok(())
    }

    /// Move exactly one step forward.
    pub fn advance(&mut self, to: WizardStep) -> Result<(), WizardError> {
        if self.step.next() != Some(to) {
            return Err(WizardError::InvalidTransition { from: self.step, to });
        }
        debug!(from = ?self.step, to = ?to, "wizard step");
        self.step = to;
        self.history.push(to);
        Ok(())
    }

    /// Abort the run: back to upload, keep the selection, drop every result.
    pub fn fail(&mut self, message: String) {
        warn!(error = %message, from = ?self.step, "wizard run aborted");
        self.uploaded = None;
        self.analysis = None;
        self.generated = None;
        self.last_error = Some(message);
        if self.step != WizardStep::Upload {
            self.step = WizardStep::Upload;
            self.history.push(WizardStep::Upload);
        }
    }

    /// Start over from any step.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Drive upload → analyze → generate. On failure the state is back at
    /// [`WizardStep::Upload`] and the error is returned. Only starts from
    /// [`WizardStep::Upload`]; anywhere else it refuses and changes nothing.
    pub async fn run<B: WizardBackend + ?Sized>(&mut self, backend: &B) -> Result<(), WizardError> {
        if self.step != WizardStep::Upload {
            return Err(WizardError::InvalidTransition {
                from: self.step,
                to: WizardStep::Analyzing,
            });
        }
        let compressed = self
            .compressed_file
            .clone()
            .ok_or(WizardError::NothingSelected)?;
        match self.drive(backend, &compressed).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn drive<B: WizardBackend + ?Sized>(
        &mut self,
        backend: &B,
        image: &SelectedImage,
    ) -> Result<(), WizardError> {
        self.advance(WizardStep::Analyzing)?;
        let uploaded = backend.upload(image).await?;
        self.uploaded = Some(uploaded.clone());

        let analysis = backend.analyze(&uploaded.path).await?.normalized();
        self.analysis = Some(analysis.clone());

        self.advance(WizardStep::Generating)?;
        let generated = backend
            .generate(&analysis.suggested_outfit_description, Some(&uploaded.path))
            .await?;
        self.generated = Some(generated);

        self.advance(WizardStep::Result)?;
        Ok(())
    }
}
