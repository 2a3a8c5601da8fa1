use axum::{
    extract::{multipart::MultipartError, rejection::JsonRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::error::ServiceError;
use crate::generation::GeneratedImage;
use crate::palette::AnalysisResult;
use crate::pipeline::Pipeline;
use crate::upload::UploadedFile;
use crate::utils::now_iso;

/// Room for multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

#[derive(Debug, Serialize)]
struct Banner {
    message: &'static str,
    version: &'static str,
    time: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub file: UploadedFile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub suggested_outfit_description: Option<String>,
    #[serde(default)]
    pub original_image_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub image_url: String,
    pub message: String,
    pub description: String,
}

impl From<GeneratedImage> for GenerateResponse {
    fn from(img: GeneratedImage) -> Self {
        Self {
            image_url: img.image_url,
            message: "image generated".to_string(),
            description: img.description,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

fn bad_multipart(e: MultipartError) -> ServiceError {
    ServiceError::Validation(format!("invalid upload: {}", e.body_text()))
}

fn bad_json(e: JsonRejection) -> ServiceError {
    ServiceError::Validation(format!("invalid JSON body: {}", e.body_text()))
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let body_limit = usize::try_from(pipeline.settings().max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);
    Router::new()
        .route("/", get(index))
        .route("/api/upload", post(upload))
        .route("/api/analyze", post(analyze))
        .route("/api/generate-image", post(generate_image))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { pipeline })
}

async fn index() -> Json<Banner> {
    Json(Banner {
        message: "Outfit colour harmony API",
        version: env!("CARGO_PKG_VERSION"),
        time: now_iso(),
    })
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServiceError> {
    let store = state.pipeline.store().clone();
    while let Some(mut field) = multipart.next_field().await.map_err(bad_multipart)? {
        if field.name() != Some("image") {
            continue;
        }
        let original_name = field.file_name().unwrap_or("upload").to_string();
        let mime = field.content_type().map(str::to_string);
        store.check_mime(mime.as_deref())?;

        // Buffer up to the limit so an oversized file is refused before any write.
        let mut bytes = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
            bytes.extend_from_slice(&chunk);
            store.check_size(bytes.len() as u64)?;
        }

        let file = state
            .pipeline
            .upload(&original_name, mime.as_deref(), &bytes)
            .await?;
        return Ok(Json(UploadResponse { success: true, file }));
    }
    Err(ServiceError::Validation("no file uploaded in field \"image\"".to_string()))
}

async fn analyze(
    State(state): State<AppState>,
    body: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<AnalysisResult>, ServiceError> {
    let Json(req) = body.map_err(bad_json)?;
    let file_path = req.file_path.unwrap_or_default();
    let result = state.pipeline.analyze(&file_path).await?;
    Ok(Json(result))
}

async fn generate_image(
    State(state): State<AppState>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ServiceError> {
    let Json(req) = body.map_err(bad_json)?;
    let description = req.suggested_outfit_description.unwrap_or_default();
    let generated = state
        .pipeline
        .generate(&description, req.original_image_path.as_deref())
        .await?;
    Ok(Json(generated.into()))
}
