use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use uuid::Uuid;

use crate::{
    archive::{live_archive, storyboard_archive},
    capture::BufferedCapture,
    config::{Config, MAX_UPLOAD_BYTES, MIN_STORYBOARD_BYTES},
    error::{check_size, AppError},
    gemini::{encode_payload, GeminiClient, GenerationService},
    live::{LiveConfig, LivePipeline, LiveView},
    models::{AudioFile, CaptureErrorRequest, CreateRequest, CredentialRequest, EncodedPayload, PromptRequest, SelectRequest},
    session::{ImageSession, SessionView},
    storyboard::{StoryboardPipeline, StoryboardView},
    style::Style,
};

struct SessionEntry {
    session: Arc<Mutex<ImageSession>>,
    view: watch::Receiver<SessionView>,
}

struct StoryboardEntry {
    pipeline: Arc<Mutex<StoryboardPipeline>>,
    view: watch::Receiver<StoryboardView>,
}

#[derive(Clone)]
struct LiveEntry {
    pipeline: LivePipeline,
    device: Arc<BufferedCapture>,
}

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    service: Arc<RwLock<Option<Arc<dyn GenerationService>>>>,
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
    storyboards: Arc<RwLock<HashMap<Uuid, StoryboardEntry>>>,
    live: Arc<RwLock<HashMap<Uuid, LiveEntry>>>,
}

impl AppState {
    pub fn new(config: Config, service: Option<Arc<dyn GenerationService>>) -> Self {
        Self {
            config: Arc::new(config),
            service: Arc::new(RwLock::new(service)),
            sessions: Arc::default(),
            storyboards: Arc::default(),
            live: Arc::default(),
        }
    }

    /// The credential-bound service; every pipeline needs one.
    fn service(&self) -> Result<Arc<dyn GenerationService>, AppError> {
        self.service.read().clone().ok_or(AppError::CredentialMissing)
    }

    async fn lock_session(&self, id: Uuid) -> Result<OwnedMutexGuard<ImageSession>, AppError> {
        let session = self
            .sessions
            .read()
            .get(&id)
            .map(|e| e.session.clone())
            .ok_or_else(|| AppError::NotFound(format!("session {}", id)))?;
        session.try_lock_owned().map_err(|_| AppError::SessionBusy)
    }

    fn session_view(&self, id: Uuid) -> Result<SessionView, AppError> {
        self.sessions
            .read()
            .get(&id)
            .map(|e| e.view.borrow().clone())
            .ok_or_else(|| AppError::NotFound(format!("session {}", id)))
    }

    fn live_entry(&self, id: Uuid) -> Result<LiveEntry, AppError> {
        self.live.read().get(&id).cloned().ok_or_else(|| AppError::NotFound(format!("live run {}", id)))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/credential", put(put_credential))
        .route("/api/styles", get(get_styles))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/sessions/:id/prompt", put(put_prompt))
        .route("/api/sessions/:id/audio", post(post_session_audio))
        .route("/api/sessions/:id/create", post(post_session_create))
        .route("/api/sessions/:id/edit", post(post_session_edit))
        .route("/api/sessions/:id/select", post(post_session_select))
        .route("/api/sessions/:id/acknowledge", post(post_session_acknowledge))
        .route("/api/storyboards", post(post_storyboard))
        .route("/api/storyboards/:id", get(get_storyboard).delete(delete_storyboard))
        .route("/api/storyboards/:id/archive", get(get_storyboard_archive))
        .route("/api/storyboards/:id/reset", post(post_storyboard_reset))
        .route("/api/live", post(create_live))
        .route("/api/live/:id", get(get_live).delete(delete_live))
        .route("/api/live/:id/start", post(post_live_start))
        .route("/api/live/:id/audio", post(post_live_audio))
        .route("/api/live/:id/stop", post(post_live_stop))
        .route("/api/live/:id/capture-error", post(post_live_capture_error))
        .route("/api/live/:id/reset", post(post_live_reset))
        .route("/api/live/:id/archive", get(get_live_archive))
        // Oversized uploads must reach the size check so the message names the bound.
        .layer(DefaultBodyLimit::max(2 * MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        )
        .with_state(state)
}

// --- Form helpers ---

struct Upload {
    name: String,
    content_type: String,
    bytes: Bytes,
}

impl From<Upload> for AudioFile {
    fn from(u: Upload) -> Self {
        AudioFile { name: u.name, mime_type: u.content_type, bytes: u.bytes }
    }
}

#[derive(Default)]
struct Form {
    files: HashMap<String, Upload>,
    fields: HashMap<String, String>,
}

impl Form {
    fn flag(&self, name: &str) -> bool {
        self.fields.get(name).is_some_and(|v| matches!(v.trim(), "true" | "1" | "yes"))
    }

    fn text(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or_default()
    }

    fn take_file(&mut self, name: &str) -> Result<Upload, AppError> {
        self.files.remove(name).ok_or_else(|| AppError::Validation(format!("missing '{}' file", name)))
    }
}

async fn read_form(mut multipart: Multipart) -> Result<Form, AppError> {
    let mut form = Form::default();
    while let Some(field) = multipart.next_field().await.map_err(|e| AppError::Validation(e.to_string()))? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let content_type = field.content_type().unwrap_or("application/octet-stream").to_string();
                let bytes = field.bytes().await.map_err(|e| AppError::PayloadRead(e.to_string()))?;
                form.files.insert(name, Upload { name: file_name, content_type, bytes });
            }
            None => {
                let text = field.text().await.map_err(|e| AppError::PayloadRead(e.to_string()))?;
                form.fields.insert(name, text);
            }
        }
    }
    Ok(form)
}

fn parse_style(tag: &str) -> Result<Style, AppError> {
    if tag.trim().is_empty() {
        return Ok(Style::Unspecified);
    }
    serde_json::from_value(Value::String(tag.to_string()))
        .map_err(|_| AppError::Validation(format!("unknown style '{}'", tag)))
}

fn zip_response(filename: String, bytes: Vec<u8>) -> Result<Response, AppError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/zip".parse().map_err(|_| AppError::Archive("bad header".into()))?);
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", filename)
            .parse()
            .map_err(|_| AppError::Archive("bad header".into()))?,
    );
    Ok((StatusCode::OK, headers, bytes).into_response())
}

// --- Credential & styles ---

pub async fn put_credential(State(state): State<AppState>, Json(body): Json<CredentialRequest>) -> Result<StatusCode, AppError> {
    let key = body.api_key.trim();
    if key.is_empty() {
        return Err(AppError::Validation("API key must not be empty".into()));
    }
    let client: Arc<dyn GenerationService> = Arc::new(GeminiClient::new(key.to_string(), &state.config));
    *state.service.write() = Some(client);
    tracing::info!("🔑 API key set ({}...)", key.chars().take(4).collect::<String>());
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_styles() -> Json<Value> {
    Json(json!({
        "creation": Style::creation_picker(),
        "restyle": Style::restyle_picker(),
    }))
}

// --- Single-image sessions ---

pub async fn create_session(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let session = ImageSession::new(state.service()?);
    let id = Uuid::new_v4();
    let entry = SessionEntry { view: session.subscribe(), session: Arc::new(Mutex::new(session)) };
    state.sessions.write().insert(id, entry);
    tracing::info!("🆕 Image session {}", id);
    Ok(Json(json!({ "id": id })))
}

pub async fn get_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<SessionView>, AppError> {
    state.session_view(id).map(Json)
}

/// Drops the session and its history. Refused while a step is running.
pub async fn delete_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, AppError> {
    let _guard = state.lock_session(id).await?;
    state.sessions.write().remove(&id);
    tracing::info!("🗑️ Image session {} deleted", id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn put_prompt(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<PromptRequest>,
) -> Result<Json<SessionView>, AppError> {
    state.lock_session(id).await?.set_prompt(&body.text);
    state.session_view(id).map(Json)
}

pub async fn post_session_audio(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let mut form = read_form(multipart).await?;
    let file: AudioFile = form.take_file("file")?.into();
    let confirm = form.flag("confirm_discard");
    let mut session = state.lock_session(id).await?;
    let outcome = match form.text("source") {
        "recording" => session.recording_completed(file, || confirm)?,
        "upload" | "" => session.file_uploaded(file, || confirm)?,
        other => return Err(AppError::Validation(format!("unknown audio source '{}'", other))),
    };
    drop(session);
    Ok(Json(json!({ "outcome": outcome, "view": state.session_view(id)? })))
}

pub async fn post_session_create(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<CreateRequest>,
) -> Result<Json<Value>, AppError> {
    let mut session = state.lock_session(id).await?;
    let prompt = body.prompt.clone().unwrap_or_else(|| session.prompt().to_string());
    let outcome = if prompt.trim().is_empty() && session.has_audio() {
        let confirm = body.confirm_discard;
        session.create_from_audio(body.context.as_deref(), body.style, body.intent, || confirm).await?
    } else {
        session.create_from_text(&prompt, body.style).await?
    };
    drop(session);
    Ok(Json(json!({ "outcome": outcome, "view": state.session_view(id)? })))
}

pub async fn post_session_edit(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let mut form = read_form(multipart).await?;
    let style = parse_style(form.text("style"))?;
    let edit_text = form.text("edit_text").to_string();
    let remix = match form.files.remove("remix") {
        Some(upload) => {
            check_size(upload.bytes.len(), None, MAX_UPLOAD_BYTES)?;
            let format = image::guess_format(&upload.bytes)
                .map_err(|_| AppError::Validation(format!("'{}' is not a recognized image", upload.name)))?;
            Some(EncodedPayload { data: encode_payload(&upload.bytes[..])?, mime_type: format.to_mime_type().to_string() })
        }
        None => None,
    };

    let outcome = state.lock_session(id).await?.edit_active(&edit_text, style, remix).await?;
    Ok(Json(json!({ "outcome": outcome, "view": state.session_view(id)? })))
}

pub async fn post_session_select(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<SelectRequest>,
) -> Result<Json<SessionView>, AppError> {
    state.lock_session(id).await?.select(body.index)?;
    state.session_view(id).map(Json)
}

pub async fn post_session_acknowledge(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<SessionView>, AppError> {
    state.lock_session(id).await?.acknowledge_error();
    state.session_view(id).map(Json)
}

// --- Storyboards ---

pub async fn post_storyboard(State(state): State<AppState>, multipart: Multipart) -> Result<(StatusCode, Json<Value>), AppError> {
    let service = state.service()?;
    let mut form = read_form(multipart).await?;
    let file: AudioFile = form.take_file("file")?.into();
    check_size(file.bytes.len(), Some(MIN_STORYBOARD_BYTES), MAX_UPLOAD_BYTES)?;
    let reported = form.text("duration_secs").trim().parse::<f64>().ok();

    let pipeline = StoryboardPipeline::new(service);
    let id = Uuid::new_v4();
    let view = pipeline.subscribe();
    let pipeline = Arc::new(Mutex::new(pipeline));
    let mut guard = pipeline.clone().lock_owned().await;
    state.storyboards.write().insert(id, StoryboardEntry { pipeline, view });

    tracing::info!("🚀 Storyboard {} for '{}' ({} bytes)", id, file.name, file.bytes.len());
    tokio::spawn(async move {
        if let Err(e) = guard.process_file(file, reported).await {
            tracing::error!("❌ Storyboard {} failed: {}", id, e);
        }
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))))
}

pub async fn get_storyboard(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<StoryboardView>, AppError> {
    state
        .storyboards
        .read()
        .get(&id)
        .map(|e| Json(e.view.borrow().clone()))
        .ok_or_else(|| AppError::NotFound(format!("storyboard {}", id)))
}

pub async fn delete_storyboard(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, AppError> {
    let pipeline = state
        .storyboards
        .read()
        .get(&id)
        .map(|e| e.pipeline.clone())
        .ok_or_else(|| AppError::NotFound(format!("storyboard {}", id)))?;
    let _guard = pipeline.try_lock_owned().map_err(|_| AppError::SessionBusy)?;
    state.storyboards.write().remove(&id);
    tracing::info!("🗑️ Storyboard {} deleted", id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn post_storyboard_reset(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<StoryboardView>, AppError> {
    let (pipeline, view) = state
        .storyboards
        .read()
        .get(&id)
        .map(|e| (e.pipeline.clone(), e.view.clone()))
        .ok_or_else(|| AppError::NotFound(format!("storyboard {}", id)))?;
    pipeline.try_lock_owned().map_err(|_| AppError::SessionBusy)?.reset();
    let view = view.borrow().clone();
    Ok(Json(view))
}

pub async fn get_storyboard_archive(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Response, AppError> {
    let pipeline = state
        .storyboards
        .read()
        .get(&id)
        .map(|e| e.pipeline.clone())
        .ok_or_else(|| AppError::NotFound(format!("storyboard {}", id)))?;
    let pipeline = pipeline.try_lock_owned().map_err(|_| AppError::SessionBusy)?;
    let result = pipeline.result().ok_or_else(|| AppError::Validation("storyboard is not finished".into()))?;
    zip_response(format!("storyboard_{}.zip", id), storyboard_archive(result)?)
}

// --- Live capture ---

pub async fn create_live(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let device = Arc::new(BufferedCapture::new(state.config.live_capture_mime.clone()));
    let pipeline = LivePipeline::new(state.service()?, device.clone(), state.config.live_min_chunk_bytes);
    let id = Uuid::new_v4();
    state.live.write().insert(id, LiveEntry { pipeline, device });
    tracing::info!("🆕 Live run {}", id);
    Ok(Json(json!({ "id": id })))
}

pub async fn get_live(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<LiveView>, AppError> {
    let entry = state.live_entry(id)?;
    let view = entry.pipeline.subscribe().borrow().clone();
    Ok(Json(view))
}

pub async fn delete_live(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.live_entry(id)?.pipeline.discard()?;
    state.live.write().remove(&id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn post_live_start(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(config): Json<LiveConfig>,
) -> Result<Json<LiveView>, AppError> {
    let entry = state.live_entry(id)?;
    entry.pipeline.start(config)?;
    let view = entry.pipeline.subscribe().borrow().clone();
    Ok(Json(view))
}

pub async fn post_live_audio(Path(id): Path<Uuid>, State(state): State<AppState>, body: Bytes) -> Result<StatusCode, AppError> {
    state.live_entry(id)?.device.push(&body)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn post_live_stop(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<LiveView>, AppError> {
    let entry = state.live_entry(id)?;
    entry.pipeline.stop().await?;
    let view = entry.pipeline.subscribe().borrow().clone();
    Ok(Json(view))
}

pub async fn post_live_capture_error(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<CaptureErrorRequest>,
) -> Result<Json<LiveView>, AppError> {
    let entry = state.live_entry(id)?;
    entry.pipeline.capture_failed(&body.message)?;
    let view = entry.pipeline.subscribe().borrow().clone();
    Ok(Json(view))
}

pub async fn post_live_reset(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<LiveView>, AppError> {
    let entry = state.live_entry(id)?;
    entry.pipeline.reset()?;
    let view = entry.pipeline.subscribe().borrow().clone();
    Ok(Json(view))
}

pub async fn get_live_archive(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Response, AppError> {
    let (images, summary) = state
        .live_entry(id)?
        .pipeline
        .finished_run()
        .ok_or_else(|| AppError::Validation("live run is not finished".into()))?;
    zip_response(format!("flow_of_life_{}.zip", id), live_archive(&images, &summary)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeService};
    use axum::{body::Body, http::Request};
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    const BOUNDARY: &str = "sound-canvas-test";

    fn app(fake: Option<Arc<FakeService>>) -> Router {
        let service = fake.map(|f| f as Arc<dyn GenerationService>);
        router(AppState::new(Config::default(), service))
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    fn json_req(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_req(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    /// Parts are `(name, Some((filename, content_type)), data)`.
    fn multipart_req(uri: &str, parts: &[(&str, Option<(&str, &str)>, &[u8])]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, file, data) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match file {
                Some((filename, content_type)) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        name, filename, content_type
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes()),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn pipelines_require_a_credential() {
        let app = app(None);
        let (status, body) = send(&app, empty_req("POST", "/api/sessions")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "API key required");

        let (status, _) = send(&app, empty_req("POST", "/api/live")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, json_req("PUT", "/api/credential", json!({ "api_key": " " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, json_req("PUT", "/api/credential", json!({ "api_key": "abc123" }))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, empty_req("POST", "/api/sessions")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn styles_endpoint_lists_pickers() {
        let (status, body) = send(&app(None), empty_req("GET", "/api/styles")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["creation"][0], "unspecified");
        assert_eq!(body["restyle"][0], "photorealistic");
        assert!(!body["creation"].as_array().unwrap().iter().any(|s| s == "raphaelite-digital-art"));
    }

    #[tokio::test]
    async fn create_edit_and_select_over_http() {
        let fake = Arc::new(FakeService::new());
        let app = app(Some(fake.clone()));
        let (_, body) = send(&app, empty_req("POST", "/api/sessions")).await;
        let id = body["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            json_req("POST", &format!("/api/sessions/{}/create", id), json!({ "prompt": "a koi pond", "style": "Anime" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "applied");
        assert_eq!(body["view"]["history"]["entries"].as_array().unwrap().len(), 1);

        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        let req = multipart_req(
            &format!("/api/sessions/{}/edit", id),
            &[
                ("edit_text", None, b"add lanterns"),
                ("style", None, b"ink sketch"),
                ("remix", Some(("ref.png", "application/octet-stream")), &png),
            ],
        );
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let entries = body["view"]["history"]["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[1]["prompt"].as_str().unwrap().ends_with("[Filter: ink sketch]\n[Edit: add lanterns]"));
        assert_eq!(
            fake.calls().last(),
            Some(&Call::Edit { edit_text: "add lanterns".into(), style: Style::InkSketch, remix: true })
        );

        let (status, body) = send(&app, json_req("POST", &format!("/api/sessions/{}/select", id), json!({ "index": 0 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["history"]["active"], 0);
        assert_eq!(body["history"]["entries"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn non_image_remix_is_rejected() {
        let fake = Arc::new(FakeService::new());
        let app = app(Some(fake.clone()));
        let (_, body) = send(&app, empty_req("POST", "/api/sessions")).await;
        let id = body["id"].as_str().unwrap().to_string();
        send(&app, json_req("POST", &format!("/api/sessions/{}/create", id), json!({ "prompt": "a koi pond" }))).await;

        let req = multipart_req(
            &format!("/api/sessions/{}/edit", id),
            &[("edit_text", None, b"more"), ("remix", Some(("notes.txt", "text/plain")), b"hello there")],
        );
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("notes.txt"));
        assert_eq!(fake.count(|c| matches!(c, Call::Edit { .. })), 0);
    }

    #[tokio::test]
    async fn audio_upload_asks_before_discarding_prompt() {
        let app = app(Some(Arc::new(FakeService::new())));
        let (_, body) = send(&app, empty_req("POST", "/api/sessions")).await;
        let id = body["id"].as_str().unwrap().to_string();
        send(&app, json_req("PUT", &format!("/api/sessions/{}/prompt", id), json!({ "text": "keep me" }))).await;

        let audio = [1u8; 32];
        let req = multipart_req(
            &format!("/api/sessions/{}/audio", id),
            &[("source", None, b"recording"), ("file", Some(("rec.webm", "audio/webm")), &audio)],
        );
        let (_, body) = send(&app, req).await;
        assert_eq!(body["outcome"], "declined");
        assert_eq!(body["view"]["prompt"], "keep me");

        let req = multipart_req(
            &format!("/api/sessions/{}/audio", id),
            &[
                ("source", None, b"recording"),
                ("confirm_discard", None, b"true"),
                ("file", Some(("rec.webm", "audio/webm")), &audio),
            ],
        );
        let (_, body) = send(&app, req).await;
        assert_eq!(body["outcome"], "applied");
        assert_eq!(body["view"]["prompt"], "");
        assert_eq!(body["view"]["armed_audio"]["kind"], "recording");
    }

    #[tokio::test]
    async fn short_storyboard_upload_is_rejected_up_front() {
        let fake = Arc::new(FakeService::new());
        let app = app(Some(fake.clone()));
        let req = multipart_req("/api/storyboards", &[("file", Some(("clip.mp3", "audio/mpeg")), &[0u8; 1024])]);
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains(&MIN_STORYBOARD_BYTES.to_string()));
        assert_eq!(fake.network_calls(), 0);
    }

    #[tokio::test]
    async fn deleted_resources_are_gone() {
        let fake = Arc::new(FakeService::new());
        let app = app(Some(fake.clone()));

        let (_, body) = send(&app, empty_req("POST", "/api/sessions")).await;
        let session = format!("/api/sessions/{}", body["id"].as_str().unwrap());
        let (status, _) = send(&app, empty_req("DELETE", &session)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, empty_req("GET", &session)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, empty_req("DELETE", &session)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = send(&app, empty_req("POST", "/api/live")).await;
        let live = format!("/api/live/{}", body["id"].as_str().unwrap());
        let config = json!({
            "context": { "location": "Old town", "activity": "walking", "age": "52" },
            "target": { "mode": "count", "image_count": 3 },
            "interval_secs": 30
        });
        let (status, _) = send(&app, json_req("POST", &format!("{}/start", live), config)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, empty_req("DELETE", &live)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, empty_req("GET", &live)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let audio = vec![3u8; MIN_STORYBOARD_BYTES + 10];
        let req = multipart_req(
            "/api/storyboards",
            &[("duration_secs", None, b"95"), ("file", Some(("talk.mp3", "audio/mpeg")), &audio)],
        );
        let (_, body) = send(&app, req).await;
        let storyboard = format!("/api/storyboards/{}", body["id"].as_str().unwrap());
        let mut status = StatusCode::CONFLICT;
        for _ in 0..100 {
            (status, _) = send(&app, empty_req("DELETE", &storyboard)).await;
            if status != StatusCode::CONFLICT {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, empty_req("GET", &storyboard)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn storyboard_runs_in_background_and_downloads() {
        let fake = Arc::new(FakeService::new());
        let app = app(Some(fake.clone()));
        let audio = vec![3u8; MIN_STORYBOARD_BYTES + 10];
        let req = multipart_req(
            "/api/storyboards",
            &[("duration_secs", None, b"95"), ("file", Some(("talk.mp3", "audio/mpeg")), &audio)],
        );
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = body["id"].as_str().unwrap().to_string();

        let mut view = Value::Null;
        for _ in 0..100 {
            let (_, body) = send(&app, empty_req("GET", &format!("/api/storyboards/{}", id))).await;
            view = body;
            if view["state"]["state"] == "finished" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(view["state"]["state"], "finished");
        assert_eq!(view["scenes"].as_array().unwrap().len(), 3);
        assert_eq!(view["summary"], "# The story\n\nIt went well.");

        let response = app
            .clone()
            .oneshot(empty_req("GET", &format!("/api/storyboards/{}/archive", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
    }

    #[tokio::test]
    async fn live_run_lifecycle_over_http() {
        let app = app(Some(Arc::new(FakeService::new())));
        let (_, body) = send(&app, empty_req("POST", "/api/live")).await;
        let id = body["id"].as_str().unwrap().to_string();

        let (status, _) = send(&app, empty_req("POST", &format!("/api/live/{}/audio", id))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let config = json!({
            "context": { "location": "Old town", "activity": "walking", "age": "52" },
            "target": { "mode": "count", "image_count": 3 },
            "interval_secs": 30
        });
        let (status, body) = send(&app, json_req("POST", &format!("/api/live/{}/start", id), config)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["state"], "recording");
        assert_eq!(body["target"], 3);

        let (status, _) = send(&app, empty_req("GET", &format!("/api/live/{}/archive", id))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, empty_req("POST", &format!("/api/live/{}/stop", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["state"], "config");

        let config = json!({
            "context": { "location": "Old town", "activity": "walking", "age": "52" },
            "target": { "mode": "duration", "minutes": 2 },
            "interval_secs": 60
        });
        let (_, body) = send(&app, json_req("POST", &format!("/api/live/{}/start", id), config)).await;
        assert_eq!(body["target"], 2);
        let (status, body) = send(
            &app,
            json_req("POST", &format!("/api/live/{}/capture-error", id), json!({ "message": "microphone permission denied" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["state"], "error");
        assert!(body["state"]["message"].as_str().unwrap().contains("permission denied"));

        let (status, _) = send(
            &app,
            json_req("POST", &format!("/api/live/{}/capture-error", id), json!({ "message": "again" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, empty_req("POST", &format!("/api/live/{}/reset", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["state"], "config");

        let (status, _) = send(&app, empty_req("GET", "/api/live/00000000-0000-0000-0000-000000000000")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
