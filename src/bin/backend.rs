#![forbid(unsafe_code)]

//! Axum backend for the Skyward relay.
//!
//! Startup decodes the bootstrap credential blob and resolves the operating
//! credential before the listener binds. A failed bootstrap aborts the
//! process: the relay never serves requests with a missing or default
//! credential. Once up, the backend answers the player poll, takes operator
//! pushes, ingests webhook notifications and proxies two YouTube Data API
//! read endpoints so the browser never holds the key.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use mime_guess::{MimeGuess, mime::Mime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skyward_tools::config::{RuntimeOverrides, resolve_runtime_paths};
use skyward_tools::secrets::{HttpSecretTransport, SecretResolver, SecretTransport, SharedSlot};
use skyward_tools::security::{ensure_not_root, verify_operator_key};
use skyward_tools::store::{CachedVideo, RelayReader, RelayStore, TalentRecord};
use skyward_tools::youtube::YoutubeClient;
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use xml::reader::{EventReader, XmlEvent};

// Relay database file relative to the data root.
const RELAY_DB_FILE: &str = "relay.db";

const DEFAULT_SEARCH_RESULTS: u32 = 10;
const MAX_SEARCH_RESULTS: u32 = 25;

#[derive(Debug, Clone)]
struct BackendArgs {
    data_root: PathBuf,
    www_root: PathBuf,
    skyward_port: u16,
    listen_host: IpAddr,
    operator_key: Option<String>,
    secret_endpoint: String,
    bootstrap_blob: PathBuf,
    credential_file: PathBuf,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut data_root_override: Option<PathBuf> = None;
        let mut www_root_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut blob_override: Option<PathBuf> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--data-root=") {
                data_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--www-root=") {
                www_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--blob=") {
                blob_override = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--data-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--data-root requires a value"))?;
                    data_root_override = Some(PathBuf::from(value));
                }
                "--www-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--www-root requires a value"))?;
                    www_root_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                "--blob" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--blob requires a value"))?;
                    blob_override = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let runtime_paths = resolve_runtime_paths(RuntimeOverrides {
            data_root: data_root_override.clone(),
            www_root: www_root_override.clone(),
            bootstrap_blob: blob_override.clone(),
            ..RuntimeOverrides::default()
        })?;
        let runtime_host = parse_host_arg(&runtime_paths.skyward_host)?;
        let data_root = data_root_override.unwrap_or(runtime_paths.data_root);
        let www_root = www_root_override.unwrap_or(runtime_paths.www_root);
        let skyward_port = port_override.unwrap_or(runtime_paths.skyward_port);
        let listen_host = host_override.unwrap_or(runtime_host);

        Ok(Self {
            data_root,
            www_root,
            skyward_port,
            listen_host,
            operator_key: runtime_paths.operator_key,
            secret_endpoint: runtime_paths.secret_endpoint,
            bootstrap_blob: runtime_paths.bootstrap_blob,
            credential_file: runtime_paths.credential_file,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/SKYWARD_HOST")
}

/// Shared state injected into every Axum handler.
///
/// * `reader`/`store` wrap the relay SQLite database.
/// * `resolver` owns the operating credential and the shared API key.
/// * `now_playing` mirrors the persisted playback row for cheap reads.
#[derive(Clone)]
struct AppState {
    reader: Arc<RelayReader>,
    store: Arc<RelayStore>,
    resolver: Arc<SecretResolver>,
    youtube: Arc<YoutubeClient>,
    now_playing: SharedSlot<String>,
    operator_key: Arc<String>,
    www_root: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    // Operator pushes are useless without a key to check against, and a baked
    // default would reopen the hole the whitelist exists to close.
    let operator_key = args
        .operator_key
        .clone()
        .ok_or_else(|| anyhow!("OPERATOR_KEY not set; refusing to start without it"))?;

    let relay_db = args.data_root.join(RELAY_DB_FILE);
    let store = RelayStore::open(&relay_db)
        .await
        .context("initializing relay store")?;
    let reader = RelayReader::new(&relay_db)
        .await
        .context("initializing relay reader")?;

    let transport: Arc<dyn SecretTransport> =
        Arc::new(HttpSecretTransport::new(&args.secret_endpoint));
    let resolver = Arc::new(SecretResolver::new(reader.clone(), transport));

    // The whole credential chain runs before the listener binds; any failure
    // here aborts startup.
    resolver
        .bootstrap(&args.bootstrap_blob, &args.credential_file)
        .await
        .context("bootstrapping credentials")?;
    if let Some(credential) = resolver.credential() {
        println!("Operating credential: {}", credential);
    }

    let youtube = Arc::new(YoutubeClient::new(resolver.api_key()));

    let now_playing = SharedSlot::empty();
    if let Some(current) = reader
        .now_playing()
        .await
        .context("loading now-playing row")?
    {
        now_playing.install(current);
    }

    let state = AppState {
        reader: Arc::new(reader),
        store: Arc::new(store),
        resolver,
        youtube,
        now_playing,
        operator_key: Arc::new(operator_key),
        www_root: Arc::new(args.www_root),
    };

    // Each route is extremely small; helpers supplement anything shared
    // between the player, operator and webhook paths.
    let app = Router::new()
        .route("/api/status", get(get_status))
        .route("/api/player/next", get(get_next_video))
        .route("/api/player/current", post(set_current_video))
        .route("/api/talents", get(list_talents).post(add_talent))
        .route("/api/talents/{id}", delete(remove_talent))
        .route("/api/search", get(proxy_search))
        .route("/api/videos/{id}", get(proxy_video_details))
        .route("/api/webhook", get(verify_webhook).post(receive_webhook))
        .route("/api/admin/refresh-key", post(refresh_api_key))
        .fallback(static_fallback)
        .with_state(state);

    let addr = SocketAddr::new(args.listen_host, args.skyward_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("Relay server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running relay server")?;

    Ok(())
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: &'static str,
    bootstrapped: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct NextVideoResponse {
    video_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetVideoRequest {
    video_id: Option<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SetVideoResponse {
    status: &'static str,
    video_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddTalentRequest {
    channel_id: Option<String>,
    display_name: Option<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WebhookResponse {
    status: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    q: Option<String>,
    max_results: Option<u32>,
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        bootstrapped: state.resolver.is_bootstrapped(),
    })
}

/// Endpoint the embedded player polls. Prefers the operator-pushed video,
/// then the newest cached approved video; an empty cache is a 404 rather
/// than a baked-in default id.
async fn get_next_video(State(state): State<AppState>) -> ApiResult<Json<NextVideoResponse>> {
    if let Some(current) = state.now_playing.get() {
        return Ok(Json(NextVideoResponse {
            video_id: current.as_str().to_owned(),
        }));
    }

    let latest = state
        .reader
        .latest_video()
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::not_found("no approved video available"))?;

    Ok(Json(NextVideoResponse {
        video_id: latest.video_id,
    }))
}

/// Operator push of the now-playing video. Only ids already present in the
/// approved cache are accepted.
async fn set_current_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SetVideoRequest>,
) -> ApiResult<Json<SetVideoResponse>> {
    require_operator(&state, &headers)?;

    let video_id = payload
        .video_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("'videoId' is required"))?;

    let known = state
        .reader
        .get_video(video_id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if known.is_none() {
        return Err(ApiError::bad_request("video not in the approved cache"));
    }

    state
        .store
        .set_now_playing(video_id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    state.now_playing.install(video_id.to_owned());

    Ok(Json(SetVideoResponse {
        status: "success",
        video_id: video_id.to_owned(),
    }))
}

async fn list_talents(State(state): State<AppState>) -> ApiResult<Json<Vec<TalentRecord>>> {
    let talents = state
        .reader
        .list_talents()
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(talents))
}

async fn add_talent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AddTalentRequest>,
) -> ApiResult<Json<TalentRecord>> {
    require_operator(&state, &headers)?;

    let channel_id = payload
        .channel_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("'channelId' is required"))?;

    let record = TalentRecord {
        channel_id: channel_id.to_owned(),
        display_name: payload.display_name.unwrap_or_default().trim().to_owned(),
        added_at: None,
    };
    state
        .store
        .upsert_talent(&record)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;

    let stored = state
        .reader
        .get_talent(channel_id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::internal("talent vanished after insert"))?;
    Ok(Json(stored))
}

async fn remove_talent(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<WebhookResponse>> {
    require_operator(&state, &headers)?;

    let removed = state
        .store
        .remove_talent(&id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if !removed {
        return Err(ApiError::not_found("talent not found"));
    }
    Ok(Json(WebhookResponse { status: "removed" }))
}

/// Server-side proxy for the YouTube search endpoint; the response body is
/// passed through verbatim.
async fn proxy_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Value>> {
    let query = params
        .q
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("'q' is required"))?
        .to_owned();
    let max_results = params
        .max_results
        .unwrap_or(DEFAULT_SEARCH_RESULTS)
        .clamp(1, MAX_SEARCH_RESULTS);

    let youtube = state.youtube.clone();
    let body = tokio::task::spawn_blocking(move || youtube.search(&query, max_results))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(body))
}

/// Server-side proxy for the YouTube video-details endpoint.
async fn proxy_video_details(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    let id = id.trim().to_owned();
    if id.is_empty() {
        return Err(ApiError::bad_request("video id is required"));
    }

    let youtube = state.youtube.clone();
    let body = tokio::task::spawn_blocking(move || youtube.video_details(&id))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(body))
}

/// WebSub subscription verification: the hub expects its challenge echoed
/// back verbatim.
async fn verify_webhook(Query(params): Query<HashMap<String, String>>) -> Response {
    match params.get("hub.challenge") {
        Some(challenge) => (StatusCode::OK, challenge.clone()).into_response(),
        None => ApiError::bad_request("missing hub.challenge").into_response(),
    }
}

/// WebSub notification: an Atom entry describing a new or live video. Only
/// videos from approved talents enter the cache; others are acknowledged and
/// dropped so the hub does not retry them forever.
async fn receive_webhook(
    State(state): State<AppState>,
    body: String,
) -> ApiResult<Json<WebhookResponse>> {
    let notification =
        parse_feed_notification(&body).map_err(|err| ApiError::bad_request(err.to_string()))?;

    let talent = state
        .reader
        .get_talent(&notification.channel_id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if talent.is_none() {
        return Ok(Json(WebhookResponse { status: "ignored" }));
    }

    let record = CachedVideo {
        video_id: notification.video_id,
        channel_id: notification.channel_id,
        title: notification.title.unwrap_or_default(),
        published_at: notification.published_at,
        live: false,
        approved_at: None,
    };
    state
        .store
        .upsert_video(&record)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;

    Ok(Json(WebhookResponse { status: "accepted" }))
}

/// Operator-triggered refresh of the YouTube API key. The shared slot is
/// replaced wholesale, so in-flight requests keep the key they started with.
async fn refresh_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<WebhookResponse>> {
    require_operator(&state, &headers)?;

    state
        .resolver
        .refresh_api_key()
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(WebhookResponse { status: "refreshed" }))
}

fn require_operator(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let provided = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !verify_operator_key(provided, &state.operator_key) {
        return Err(ApiError::forbidden("invalid API key"));
    }
    Ok(())
}

/// Fields pulled out of a WebSub Atom notification.
#[derive(Debug, PartialEq)]
struct FeedNotification {
    video_id: String,
    channel_id: String,
    title: Option<String>,
    published_at: Option<String>,
}

/// Extracts `yt:videoId`, `yt:channelId`, the entry title and the published
/// timestamp from the Atom payload. Both ids are required.
fn parse_feed_notification(body: &str) -> Result<FeedNotification> {
    let mut video_id = None;
    let mut channel_id = None;
    let mut title = None;
    let mut published_at = None;

    let mut in_entry = false;
    let mut current_element: Option<String> = None;

    for event in EventReader::new(body.as_bytes()) {
        match event.map_err(|err| anyhow!("invalid feed notification: {err}"))? {
            XmlEvent::StartElement { name, .. } => {
                if name.local_name == "entry" {
                    in_entry = true;
                }
                current_element = Some(name.local_name);
            }
            XmlEvent::EndElement { name } => {
                if name.local_name == "entry" {
                    in_entry = false;
                }
                current_element = None;
            }
            XmlEvent::Characters(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match current_element.as_deref() {
                    Some("videoId") if video_id.is_none() => {
                        video_id = Some(trimmed.to_owned());
                    }
                    Some("channelId") if channel_id.is_none() => {
                        channel_id = Some(trimmed.to_owned());
                    }
                    Some("title") if in_entry && title.is_none() => {
                        title = Some(trimmed.to_owned());
                    }
                    Some("published") if published_at.is_none() => {
                        published_at = Some(trimmed.to_owned());
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    let video_id = video_id.ok_or_else(|| anyhow!("notification is missing yt:videoId"))?;
    let channel_id = channel_id.ok_or_else(|| anyhow!("notification is missing yt:channelId"))?;
    Ok(FeedNotification {
        video_id,
        channel_id,
        title,
        published_at,
    })
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => {
            let index = root.join("index.html");
            stream_file(index, None).await
        }
        Ok(_) => stream_file(target, None).await,
        Err(_) => {
            if should_fallback_to_index(request_path) {
                let index = root.join("index.html");
                stream_file(index, None).await
            } else {
                Err(ApiError::not_found("file not found"))
            }
        }
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return true;
    }
    let candidate = Path::new(trimmed);
    let has_extension = candidate.extension().is_some();
    !has_extension
}

async fn stream_file(path: PathBuf, mime: Option<Mime>) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;

    let guessed = mime.or_else(|| MimeGuess::from_path(&path).first());
    let stream = ReaderStream::new(file);
    let mut response = Body::from_stream(stream).into_response();
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}
