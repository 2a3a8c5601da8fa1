use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

use outfit_palette_lib::encoder::{decode_data_uri, encode_data_uri};
use outfit_palette_lib::wizard::{HttpBackend, SelectedImage, WizardState, WizardStep};
use outfit_palette_lib::{server, Pipeline, Settings};

const BOUNDARY: &str = "outfit-test-boundary";
const GENERATED_URL: &str = "https://cdn.example.com/generated/look.png";

#[derive(Clone)]
struct Provider {
    chat_status: u16,
    chat_content: Option<String>,
    chat_calls: Arc<AtomicUsize>,
    image_calls: Arc<AtomicUsize>,
    last_image_request: Arc<Mutex<Option<Value>>>,
}

impl Provider {
    fn replying(content: &str) -> Self {
        Self {
            chat_status: 200,
            chat_content: Some(content.to_string()),
            chat_calls: Arc::new(AtomicUsize::new(0)),
            image_calls: Arc::new(AtomicUsize::new(0)),
            last_image_request: Arc::new(Mutex::new(None)),
        }
    }

    fn failing(status: u16) -> Self {
        Self {
            chat_status: status,
            ..Self::replying("")
        }
    }

    fn outbound_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst) + self.image_calls.load(Ordering::SeqCst)
    }
}

async fn mock_chat(State(p): State<Provider>, Json(_body): Json<Value>) -> (StatusCode, Json<Value>) {
    p.chat_calls.fetch_add(1, Ordering::SeqCst);
    let status = StatusCode::from_u16(p.chat_status).unwrap();
    if !status.is_success() {
        return (status, Json(json!({ "error": { "message": "provider exploded" } })));
    }
    (
        status,
        Json(json!({
            "choices": [{ "message": { "role": "assistant", "content": p.chat_content } }]
        })),
    )
}

async fn mock_images(State(p): State<Provider>, Json(body): Json<Value>) -> Json<Value> {
    p.image_calls.fetch_add(1, Ordering::SeqCst);
    *p.last_image_request.lock().unwrap() = Some(body);
    Json(json!({ "data": [{ "url": GENERATED_URL }] }))
}

async fn spawn_provider(provider: Provider) -> String {
    let app = Router::new()
        .route("/chat/completions", post(mock_chat))
        .route("/images/generations", post(mock_images))
        .with_state(provider);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct Harness {
    app: Router,
    pipeline: Arc<Pipeline>,
    provider: Provider,
    upload_dir: PathBuf,
    _temp: TempDir,
}

async fn harness_with(provider: Provider, tweak: impl FnOnce(&mut Settings)) -> Harness {
    let base = spawn_provider(provider.clone()).await;
    let temp = tempfile::tempdir().unwrap();
    let upload_dir = temp.path().join("uploads");
    let mut settings = Settings {
        vision_api_key: Some("test-vision-key-0123456789".to_string()),
        vision_endpoint: format!("{base}/chat/completions"),
        generation_api_key: Some("test-image-key-0123456789".to_string()),
        generation_endpoint: format!("{base}/images/generations"),
        upload_dir: upload_dir.clone(),
        request_timeout_secs: 10,
        ..Settings::default()
    };
    tweak(&mut settings);
    let pipeline = Arc::new(Pipeline::new(settings).unwrap());
    Harness {
        app: server::router(pipeline.clone()),
        pipeline,
        provider,
        upload_dir,
        _temp: temp,
    }
}

async fn harness(provider: Provider) -> Harness {
    harness_with(provider, |_| {}).await
}

fn jpeg_100() -> Vec<u8> {
    let img = RgbImage::from_pixel(100, 100, Rgb([180, 40, 40]));
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
        .unwrap();
    buf
}

fn multipart_request(field: &str, filename: &str, content_type: &str, bytes: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

fn json_request(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn upload(h: &Harness, bytes: &[u8]) -> String {
    let (status, body) = send(&h.app, multipart_request("image", "look.jpg", "image/jpeg", bytes)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["file"]["path"].as_str().unwrap().to_string()
}

fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn upload_round_trips_supported_types() {
    let h = harness(Provider::replying("")).await;
    for (mime, name) in [("image/jpeg", "a.jpg"), ("image/png", "b.png"), ("image/gif", "c.gif")] {
        let bytes: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let (status, body) = send(&h.app, multipart_request("image", name, mime, &bytes)).await;
        assert_eq!(status, StatusCode::OK, "{mime}: {body}");
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["file"]["originalName"], json!(name));
        assert_eq!(body["file"]["size"], json!(4096));
        let filename = body["file"]["filename"].as_str().unwrap();
        assert!(filename.starts_with("image-"));

        let path = body["file"]["path"].as_str().unwrap();
        let uri = encode_data_uri(Path::new(path)).await.unwrap();
        assert_eq!(decode_data_uri(&uri).unwrap(), bytes);
    }
    assert_eq!(files_in(&h.upload_dir), 3);
    assert_eq!(h.pipeline.store().len(), 3);
}

#[tokio::test]
async fn upload_rejects_oversized_and_unsupported() {
    let h = harness_with(Provider::replying(""), |s| s.max_upload_bytes = 1024).await;

    let (status, body) = send(&h.app, multipart_request("image", "big.jpg", "image/jpeg", &[7u8; 2048])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("too large"));

    let (status, body) = send(&h.app, multipart_request("image", "notes.txt", "text/plain", b"hello")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("text/plain"));

    assert_eq!(files_in(&h.upload_dir), 0);
}

#[tokio::test]
async fn upload_without_image_field_is_rejected() {
    let h = harness(Provider::replying("")).await;
    let (status, body) = send(&h.app, multipart_request("photo", "a.jpg", "image/jpeg", b"abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn analyze_missing_file_is_404_without_provider_call() {
    let h = harness(Provider::replying("{}")).await;
    let (status, body) = send(
        &h.app,
        json_request("/api/analyze", json!({ "filePath": "/tmp/does-not-exist-4711.jpg" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
    assert_eq!(h.provider.outbound_calls(), 0);
}

#[tokio::test]
async fn analyze_requires_file_path() {
    let h = harness(Provider::replying("{}")).await;
    let (status, _) = send(&h.app, json_request("/api/analyze", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.provider.outbound_calls(), 0);
}

#[tokio::test]
async fn analyze_normalizes_named_colors() {
    let reply = r#"Here is my assessment:
{"dominant_colors":["红色","蓝色"],"is_harmonious":true,"comment":"Classic pairing","suggestion_logic":"keep_original","suggested_outfit_description":"A model wearing a red sweater and blue jeans on a white background"}
Let me know if you need more."#;
    let h = harness(Provider::replying(reply)).await;
    let path = upload(&h, &jpeg_100()).await;

    let (status, body) = send(&h.app, json_request("/api/analyze", json!({ "filePath": path }))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["dominant_colors"], json!(["#FF0000", "#0000FF"]));
    assert_eq!(body["is_harmonious"], json!(true));
    assert_eq!(body["suggestion_logic"], json!("keep_original"));
    assert!(body.get("fallback").is_none());
    assert_eq!(h.provider.chat_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn analyze_empty_reply_uses_fallback() {
    let h = harness(Provider::replying("")).await;
    let path = upload(&h, &jpeg_100()).await;

    let (status, first) = send(&h.app, json_request("/api/analyze", json!({ "filePath": path }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["dominant_colors"], json!(["#0000FF", "#FFFFFF"]));
    assert_eq!(first["is_harmonious"], json!(true));
    assert_eq!(first["fallback"], json!(true));

    let (_, second) = send(&h.app, json_request("/api/analyze", json!({ "filePath": path }))).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn analyze_upstream_error_reports_status() {
    let h = harness(Provider::failing(503)).await;
    let path = upload(&h, &jpeg_100()).await;
    let (status, body) = send(&h.app, json_request("/api/analyze", json!({ "filePath": path }))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("503"));
}

#[tokio::test]
async fn missing_credential_fails_without_provider_call() {
    let h = harness_with(Provider::replying("{}"), |s| s.vision_api_key = None).await;
    let path = upload(&h, &jpeg_100()).await;
    let (status, body) = send(&h.app, json_request("/api/analyze", json!({ "filePath": path }))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("API key not configured"));
    assert_eq!(h.provider.outbound_calls(), 0);
}

#[tokio::test]
async fn generate_empty_description_is_400_without_provider_call() {
    let h = harness(Provider::replying("")).await;
    let (status, _) = send(
        &h.app,
        json_request("/api/generate-image", json!({ "suggested_outfit_description": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.provider.outbound_calls(), 0);
}

#[tokio::test]
async fn generate_missing_source_is_404() {
    let h = harness(Provider::replying("")).await;
    let (status, _) = send(
        &h.app,
        json_request(
            "/api/generate-image",
            json!({
                "suggested_outfit_description": "A model in navy and cream",
                "original_image_path": "image-0-0.jpg"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(h.provider.outbound_calls(), 0);
}

#[tokio::test]
async fn generate_sends_image_to_image_request() {
    let h = harness(Provider::replying("")).await;
    let path = upload(&h, &jpeg_100()).await;
    let (status, body) = send(
        &h.app,
        json_request(
            "/api/generate-image",
            json!({
                "suggested_outfit_description": "A model in navy and cream",
                "original_image_path": path
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["image_url"], json!(GENERATED_URL));
    assert_eq!(body["description"], json!("A model in navy and cream"));

    let sent = h.provider.last_image_request.lock().unwrap().clone().unwrap();
    assert_eq!(sent["response_format"], json!("url"));
    assert_eq!(sent["size"], json!("1024x1024"));
    assert_eq!(sent["prompt"], json!("A model in navy and cream"));
    assert!(sent["image"].as_str().unwrap().starts_with("data:image/jpeg;base64,"));
}

#[tokio::test]
async fn wizard_in_process_end_to_end() {
    let reply = r##"{"dominant_colors":["#8B0000","green"],"is_harmonious":false,"comment":"Complementary clash","suggestion_logic":"suggest_new","suggested_outfit_description":"A model wearing a dark red shirt and beige trousers"}"##;
    let h = harness(Provider::replying(reply)).await;

    let mut state = WizardState::new();
    state
        .select(
            SelectedImage {
                name: "look.jpg".to_string(),
                mime_type: "image/jpeg".to_string(),
                bytes: jpeg_100(),
            },
            h.pipeline.settings().max_upload_bytes,
        )
        .unwrap();
    state.run(h.pipeline.as_ref()).await.unwrap();

    assert_eq!(
        state.history(),
        &[WizardStep::Upload, WizardStep::Analyzing, WizardStep::Generating, WizardStep::Result]
    );
    let analysis = state.analysis.as_ref().unwrap();
    assert_eq!(analysis.dominant_colors, vec!["#8B0000", "#008000"]);
    assert!(!analysis.is_harmonious);
    assert_eq!(state.generated.as_ref().unwrap().image_url, GENERATED_URL);
}

#[tokio::test]
async fn wizard_over_http_end_to_end() {
    let reply = r#"{"dominant_colors":["白色","灰色"],"is_harmonious":true,"comment":"Neutral","suggested_outfit_description":"A model in a white shirt and grey trousers"}"#;
    let h = harness(Provider::replying(reply)).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = h.app.clone();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let backend = HttpBackend::new(reqwest::Client::new(), &format!("http://{addr}/"));

    let mut state = WizardState::new();
    state
        .select(
            SelectedImage {
                name: "look.jpg".to_string(),
                mime_type: "image/jpeg".to_string(),
                bytes: jpeg_100(),
            },
            5 * 1024 * 1024,
        )
        .unwrap();
    state.run(&backend).await.unwrap();

    assert_eq!(state.step(), WizardStep::Result);
    assert_eq!(state.history().len(), 4);
    let analysis = state.analysis.as_ref().unwrap();
    assert_eq!(analysis.dominant_colors, vec!["#FFFFFF", "#808080"]);
    let generated = state.generated.as_ref().unwrap();
    assert!(!generated.image_url.is_empty());
    assert_eq!(h.provider.chat_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.provider.image_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wizard_over_http_surfaces_server_errors() {
    let h = harness(Provider::failing(500)).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = h.app.clone();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let backend = HttpBackend::new(reqwest::Client::new(), &format!("http://{addr}"));

    let mut state = WizardState::new();
    state
        .select(
            SelectedImage {
                name: "look.jpg".to_string(),
                mime_type: "image/jpeg".to_string(),
                bytes: jpeg_100(),
            },
            5 * 1024 * 1024,
        )
        .unwrap();
    let err = state.run(&backend).await.unwrap_err();

    assert!(err.to_string().contains("HTTP 500"), "{err}");
    assert_eq!(state.step(), WizardStep::Upload);
    assert!(state.analysis.is_none());
    assert!(state.last_error.is_some());
}
