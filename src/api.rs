use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, Request, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value, json};
use tokio::sync::{Mutex, broadcast};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{generate_api_key, persist_api_key};
use crate::engines::EngineKind;
use crate::gateway::{GATEWAY_ERROR_CODE, RpcRequest, RpcResponse};
use crate::models::{
    BatchRequest, CreateDownloadRequest, DownloadStatus, ListMeta, MagnetDownloadRequest,
    IndexConfigUpdate, PriorityRequest, UpdateDownloadRequest,
};
use crate::providers::Headers;
use crate::service::ServiceError;
use crate::state::AppState;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);
const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_SEARCH_PAGE: i64 = 500;
const INVALID_REQUEST: i64 = -32600;

pub fn router(state: Arc<AppState>) -> Router {
    let auth = middleware::from_fn_with_state(state.clone(), require_api_key);

    let api = Router::new()
        .route("/downloads", get(list_downloads).post(create_download))
        .route("/downloads/batch", post(batch_downloads))
        .route(
            "/downloads/{id}",
            get(get_download)
                .patch(update_download)
                .delete(delete_download),
        )
        .route("/downloads/{id}/pause", post(pause_download))
        .route("/downloads/{id}/resume", post(resume_download))
        .route("/downloads/{id}/retry", post(retry_download))
        .route("/downloads/{id}/priority", patch(update_priority))
        .route("/magnets/check", post(check_magnet))
        .route("/magnets/check-torrent", post(check_torrent))
        .route("/magnets/download", post(download_magnet))
        .route("/providers", get(list_providers))
        .route("/providers/resolve", post(resolve_url))
        .route(
            "/providers/{name}",
            get(get_provider)
                .put(configure_provider)
                .delete(delete_provider),
        )
        .route("/providers/{name}/status", get(provider_status))
        .route("/providers/{name}/hosts", get(provider_hosts))
        .route("/remotes", get(list_remotes).post(create_remote))
        .route("/remotes/{name}", delete(delete_remote))
        .route("/remotes/{name}/test", post(test_remote))
        .route("/files/list", get(list_files))
        .route("/files/mkdir", post(make_dir))
        .route("/files/delete", post(delete_path))
        .route("/files/operate", post(operate_files))
        .route("/search", get(search_files))
        .route("/search/config", get(index_configs))
        .route("/search/config/{remote}", post(update_index_config))
        .route("/search/index/{remote}", post(start_index))
        .route("/settings", get(get_settings).patch(update_settings))
        .route("/settings/reset", post(reset_settings))
        .route("/stats", get(get_stats))
        .route("/system/version", get(system_version))
        .route("/system/restart/{engine}", post(restart_engine))
        .route("/system/api-key/regenerate", post(regenerate_api_key))
        .route("/events", get(stream_events))
        .route_layer(auth.clone());

    Router::new()
        .route("/health", get(health))
        .route("/jsonrpc", post(jsonrpc).route_layer(auth.clone()))
        .route("/ws", get(ws_upgrade).route_layer(auth))
        .nest("/api/v1", api)
        .layer(cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
        ])
}

fn data<T: Serialize>(value: T) -> Json<Value> {
    Json(json!({ "data": value }))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "build": state.build }))
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let query_key = Query::<TokenQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(q)| q.token);
    verify_api_key(req.headers(), query_key.as_deref(), &state).await?;
    Ok(next.run(req).await)
}

async fn verify_api_key(
    headers: &HeaderMap,
    query_key: Option<&str>,
    state: &AppState,
) -> Result<(), ApiError> {
    let expected = state.api_key.read().await.clone();
    if expected.is_empty() {
        return Ok(());
    }

    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or(query_key)
        .unwrap_or_default();

    if provided.is_empty() {
        return Err(ApiError::unauthorized("API key required"));
    }
    if provided == expected {
        Ok(())
    } else {
        Err(ApiError::unauthorized("invalid API key"))
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

fn parse_statuses(raw: Option<&str>) -> Result<Vec<DownloadStatus>, ApiError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<DownloadStatus>()
                .map_err(|_| ApiError::bad_request(format!("unknown status {s}")))
        })
        .collect()
}

async fn list_downloads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let statuses = parse_statuses(query.status.as_deref())?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0).max(0);

    let (tasks, total) = state.service.list(&statuses, limit, offset).await?;
    Ok(Json(json!({
        "data": tasks,
        "meta": ListMeta { total, limit, offset },
    })))
}

async fn create_download(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateDownloadRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let task = state.service.create(payload).await?;
    Ok((StatusCode::CREATED, data(task)))
}

async fn batch_downloads(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BatchRequest>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.batch(payload).await?))
}

async fn get_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.get(&id).await?))
}

async fn update_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateDownloadRequest>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.update(&id, payload).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteQuery {
    #[serde(default)]
    delete_files: bool,
}

async fn delete_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode, ApiError> {
    state.service.delete(&id, query.delete_files).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.pause(&id).await?))
}

async fn resume_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.resume(&id).await?))
}

async fn retry_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.retry(&id).await?))
}

async fn update_priority(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<PriorityRequest>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(
        state.service.update_priority(&id, payload.priority).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct MagnetCheckRequest {
    magnet: String,
}

#[derive(Debug, Deserialize)]
struct TorrentCheckRequest {
    torrent: String,
}

async fn check_magnet(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MagnetCheckRequest>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.check_magnet(payload.magnet.trim()).await?))
}

async fn check_torrent(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TorrentCheckRequest>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.check_torrent(&payload.torrent).await?))
}

async fn download_magnet(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MagnetDownloadRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let tasks = state.service.download_magnet(payload).await?;
    Ok((StatusCode::CREATED, data(tasks)))
}

async fn list_providers(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.providers().await?))
}

async fn get_provider(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.provider(&name).await?))
}

#[derive(Debug, Deserialize)]
struct ProviderUpdate {
    enabled: Option<bool>,
    priority: Option<i32>,
    #[serde(default)]
    config: BTreeMap<String, String>,
}

async fn configure_provider(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(payload): Json<ProviderUpdate>,
) -> Result<Json<Value>, ApiError> {
    let summary = state
        .service
        .configure_provider(&name, payload.enabled, payload.priority, payload.config)
        .await?;
    Ok(data(summary))
}

async fn delete_provider(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_provider(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn provider_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.provider_status(&name).await?))
}

async fn provider_hosts(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.provider_hosts(&name).await?))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    url: String,
    #[serde(default)]
    headers: Headers,
}

async fn resolve_url(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ResolveRequest>,
) -> Result<Json<Value>, ApiError> {
    let (result, provider) = state
        .service
        .resolve_url(&payload.url, &payload.headers)
        .await?;
    let mut body = serde_json::to_value(result).unwrap_or_else(|_| json!({}));
    if let Some(obj) = body.as_object_mut() {
        obj.insert("provider".to_string(), Value::String(provider));
    }
    Ok(data(body))
}

async fn list_remotes(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.remotes().await?))
}

#[derive(Debug, Deserialize)]
struct RemoteCreateRequest {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    parameters: JsonMap<String, Value>,
}

async fn create_remote(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RemoteCreateRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state
        .service
        .create_remote(&payload.name, &payload.kind, &payload.parameters)
        .await?;
    Ok((
        StatusCode::CREATED,
        data(json!({ "name": payload.name, "type": payload.kind })),
    ))
}

async fn delete_remote(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_remote(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn test_remote(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.service.test_remote(&name).await?;
    Ok(data(json!({ "name": name, "ok": true })))
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
struct PathRequest {
    path: String,
}

#[derive(Debug, Deserialize)]
struct FileOperationRequest {
    op: String,
    src: String,
    dst: String,
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    let path = if query.path.is_empty() { "/" } else { &query.path };
    Ok(data(state.service.list_files(path).await?))
}

async fn make_dir(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PathRequest>,
) -> Result<Json<Value>, ApiError> {
    state.service.make_dir(&payload.path).await?;
    Ok(data(json!({ "path": payload.path })))
}

async fn delete_path(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PathRequest>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_path(&payload.path).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn operate_files(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<FileOperationRequest>,
) -> Result<Json<Value>, ApiError> {
    let job_id = state
        .service
        .file_operation(&payload.op, &payload.src, &payload.dst)
        .await?;
    Ok(data(json!({ "op": payload.op, "jobId": job_id })))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn search_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_SEARCH_PAGE);
    let offset = query.offset.unwrap_or(0).max(0);
    let (files, total) = state.search.search(&query.q, limit, offset).await?;
    Ok(Json(json!({
        "data": files,
        "meta": ListMeta { total, limit, offset },
    })))
}

async fn index_configs(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    Ok(data(state.search.configs().await?))
}

async fn update_index_config(
    State(state): State<Arc<AppState>>,
    Path(remote): Path<String>,
    Json(payload): Json<IndexConfigUpdate>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(state.search.update_config(&remote, payload).await?))
}

async fn start_index(
    State(state): State<Arc<AppState>>,
    Path(remote): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let _ = state.search.start_index(&remote)?;
    Ok((
        StatusCode::ACCEPTED,
        data(json!({ "remote": remote, "status": "indexing" })),
    ))
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.settings().await?))
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.update_settings(payload).await?))
}

async fn reset_settings(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.reset_settings().await?))
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    Ok(data(state.service.stats().await?))
}

async fn system_version(State(state): State<Arc<AppState>>) -> Json<Value> {
    data(state.service.version().await)
}

async fn restart_engine(
    State(state): State<Arc<AppState>>,
    Path(engine): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let kind = engine
        .parse::<EngineKind>()
        .map_err(|_| ApiError::bad_request(format!("unknown engine {engine}")))?;
    if !state.engines.enabled() {
        return Err(ServiceError::InvalidOperation(
            "engines are not managed by gravity".to_string(),
        )
        .into());
    }
    state.engines.restart(kind).await?;
    if kind == EngineKind::Aria2 {
        let settings = state.service.settings().await?;
        state.service.apply_settings(&settings).await;
    }
    info!("{} restarted on request", kind.as_str());
    Ok(data(json!({ "engine": kind.as_str(), "restarted": true })))
}

async fn regenerate_api_key(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let new_key = generate_api_key();
    persist_api_key(&state.config_path, &new_key)?;
    {
        let mut key = state.api_key.write().await;
        *key = new_key.clone();
    }
    info!("API key regenerated");
    Ok(data(json!({ "apiKey": new_key })))
}

async fn jsonrpc(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Json<Value> {
    match body {
        Value::Array(items) => {
            let responses = futures::future::join_all(
                items.into_iter().map(|item| handle_rpc(&state, item)),
            )
            .await;
            Json(Value::Array(responses))
        }
        item => Json(handle_rpc(&state, item).await),
    }
}

async fn handle_rpc(state: &AppState, item: Value) -> Value {
    let id = item.get("id").cloned().unwrap_or(Value::Null);
    let response = match serde_json::from_value::<RpcRequest>(item) {
        Ok(req) => state.gateway.handle(req).await,
        Err(err) => {
            debug!("rejected JSON-RPC request: {err}");
            RpcResponse {
                jsonrpc: "2.0",
                result: None,
                error: Some(json!({ "code": INVALID_REQUEST, "message": "Invalid Request" })),
                id,
            }
        }
    };
    serde_json::to_value(response).unwrap_or_else(|_| {
        json!({
            "jsonrpc": "2.0",
            "error": { "code": GATEWAY_ERROR_CODE, "message": "response encoding failed" },
            "id": Value::Null,
        })
    })
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.events.subscribe();
    let stream = stream! {
        yield Ok(Event::default().data(json!({ "type": "connected" }).to_string()));
        loop {
            match subscription.rx.recv().await {
                Ok(event) => {
                    yield Ok(Event::default().data(event.as_json_value().to_string()));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event stream lagged by {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));
    let mut subscription = state.events.subscribe();

    let hello = json!({ "type": "connected" }).to_string();
    if sender
        .lock()
        .await
        .send(Message::Text(hello.into()))
        .await
        .is_err()
    {
        return;
    }

    let send_sender = sender.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let text = match subscription.rx.recv().await {
                Ok(event) => event.as_json_value().to_string(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("websocket client lagged by {skipped} events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if send_sender
                .lock()
                .await
                .send(Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let recv_sender = sender.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let is_ping = serde_json::from_str::<Value>(&text)
                        .ok()
                        .is_some_and(|v| v.get("type").and_then(Value::as_str) == Some("ping"));
                    if is_ping {
                        let pong = json!({ "type": "pong" }).to_string();
                        if recv_sender
                            .lock()
                            .await
                            .send(Message::Text(pong.into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Ok(Message::Ping(payload)) => {
                    if recv_sender
                        .lock()
                        .await
                        .send(Message::Pong(payload))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Validation(_) | ServiceError::InvalidOperation(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::InvalidTransition(_) => StatusCode::CONFLICT,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("request failed: {err}");
        }
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::Internal(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": { "code": self.code, "message": self.message },
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::AppConfig;
    use crate::events::EventType;
    use crate::providers::ProviderRegistry;
    use crate::rclone::RcloneClient;
    use crate::rpc::Aria2Client;
    use crate::testutil::{FakeAria2, FakeRclone, temp_db};

    struct TestApp {
        base: String,
        state: Arc<AppState>,
        aria2: FakeAria2,
        rclone: FakeRclone,
        _dir: tempfile::TempDir,
    }

    async fn spawn_app(api_key: &str) -> TestApp {
        let (dir, db) = temp_db().await;
        let aria2 = FakeAria2::start().await;
        let rclone = FakeRclone::start().await;
        let config = Arc::new(AppConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            api_key: api_key.to_string(),
            config_path: dir.path().join("gravity.toml"),
            ..AppConfig::default()
        });
        let state = Arc::new(AppState::assemble(
            config,
            db,
            Arc::new(Aria2Client::new(aria2.url.clone(), "")),
            RcloneClient::new(rclone.url.clone()),
            Arc::new(ProviderRegistry::new()),
            crate::events::EventBus::new(64),
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        TestApp {
            base: format!("http://{addr}"),
            state,
            aria2,
            rclone,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn api_key_guards_the_rest_surface() {
        let app = spawn_app("k3y").await;
        let http = reqwest::Client::new();

        let res = http
            .get(format!("{}/api/v1/stats", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");

        let res = http
            .get(format!("{}/api/v1/stats", app.base))
            .header("X-API-Key", "wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = http
            .get(format!("{}/api/v1/stats", app.base))
            .header("X-API-Key", "k3y")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = http
            .get(format!("{}/api/v1/settings?token=k3y", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = http
            .get(format!("{}/health", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn downloads_round_trip_through_rest() {
        let app = spawn_app("").await;
        let http = reqwest::Client::new();

        let res = http
            .post(format!("{}/api/v1/downloads", app.base))
            .json(&json!({ "url": "https://example.com/file.bin" }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let body: Value = res.json().await.unwrap();
        let id = body["data"]["id"].as_str().expect("id").to_string();
        assert_eq!(app.aria2.calls_to("aria2.addUri").len(), 1);

        let body: Value = http
            .get(format!("{}/api/v1/downloads?status=waiting,paused", app.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["meta"]["total"], 1);
        assert_eq!(body["meta"]["limit"], 50);
        assert_eq!(body["data"][0]["id"], json!(id));

        let res = http
            .post(format!("{}/api/v1/downloads/{id}/retry", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let res = http
            .get(format!("{}/api/v1/downloads?status=bogus", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = http
            .delete(format!("{}/api/v1/downloads/{id}", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = http
            .get(format!("{}/api/v1/downloads/{id}", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn jsonrpc_requires_the_api_key() {
        let app = spawn_app("k3y").await;
        let http = reqwest::Client::new();
        let call = json!({
            "jsonrpc": "2.0",
            "id": "x",
            "method": "aria2.changeGlobalOption",
            "params": [{ "on-download-complete": "/bin/sh" }]
        });

        let res = http
            .post(format!("{}/jsonrpc", app.base))
            .json(&call)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert!(app.aria2.calls_to("aria2.changeGlobalOption").is_empty());

        let res = http
            .post(format!("{}/jsonrpc?token=k3y", app.base))
            .json(&call)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(app.aria2.calls_to("aria2.changeGlobalOption").len(), 1);
    }

    #[tokio::test]
    async fn jsonrpc_accepts_single_and_batch_requests() {
        let app = spawn_app("k3y").await;
        app.aria2
            .reply("aria2.getVersion", json!({ "version": "1.37.0", "enabledFeatures": [] }));
        let http = reqwest::Client::new();

        let single: Value = http
            .post(format!("{}/jsonrpc", app.base))
            .header("X-API-Key", "k3y")
            .json(&json!({ "jsonrpc": "2.0", "id": "a", "method": "aria2.getVersion" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(single["id"], "a");
        assert_eq!(single["result"]["version"], "1.37.0");

        let batch: Value = http
            .post(format!("{}/jsonrpc", app.base))
            .header("X-API-Key", "k3y")
            .json(&json!([
                { "jsonrpc": "2.0", "id": 1, "method": "aria2.getVersion" },
                { "jsonrpc": "2.0", "id": 2 }
            ]))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(batch[0]["id"], 1);
        assert_eq!(batch[1]["id"], 2);
        assert_eq!(batch[1]["error"]["code"], INVALID_REQUEST);
    }

    #[tokio::test]
    async fn event_stream_opens_with_connected_frame() {
        let app = spawn_app("").await;
        let mut res = reqwest::Client::new()
            .get(format!("{}/api/v1/events", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let first = res.chunk().await.unwrap().expect("first frame");
        let text = String::from_utf8_lossy(&first);
        assert!(text.contains(r#"data: {"type":"connected"}"#), "{text}");
        assert!(app.state.events.has_subscribers());

        app.state
            .events
            .lifecycle(EventType::DownloadPaused, "abc", json!({ "id": "abc" }));
        let next = res.chunk().await.unwrap().expect("event frame");
        let text = String::from_utf8_lossy(&next);
        assert!(text.contains("download.paused"), "{text}");
    }

    #[tokio::test]
    async fn websocket_answers_pings() {
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let app = spawn_app("").await;
        let url = format!("{}/ws", app.base.replacen("http", "ws", 1));
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.expect("connect");

        let hello = socket.next().await.expect("hello").expect("frame");
        assert_eq!(hello.into_text().unwrap().as_str(), r#"{"type":"connected"}"#);

        socket
            .send(WsMessage::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        let pong = socket.next().await.expect("pong").expect("frame");
        assert_eq!(pong.into_text().unwrap().as_str(), r#"{"type":"pong"}"#);
    }

    #[tokio::test]
    async fn regenerated_key_replaces_the_old_one() {
        let app = spawn_app("old").await;
        let http = reqwest::Client::new();

        let body: Value = http
            .post(format!("{}/api/v1/system/api-key/regenerate", app.base))
            .header("X-API-Key", "old")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let new_key = body["data"]["apiKey"].as_str().expect("key").to_string();
        assert_eq!(new_key.len(), 64);

        let res = http
            .get(format!("{}/api/v1/stats", app.base))
            .header("X-API-Key", "old")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let saved = std::fs::read_to_string(&app.state.config_path).unwrap();
        assert!(saved.contains(&new_key));
    }

    #[tokio::test]
    async fn engine_restart_needs_managed_engines() {
        let app = spawn_app("").await;
        let http = reqwest::Client::new();
        let res = http
            .post(format!("{}/api/v1/system/restart/aria2", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["error"]["code"], "INVALID_OPERATION");

        let res = http
            .post(format!("{}/api/v1/system/restart/transmission", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn search_routes_index_and_query_a_remote() {
        let app = spawn_app("").await;
        app.rclone.reply("config/listremotes", json!({ "remotes": ["media"] }));
        app.rclone.reply(
            "operations/list:media:",
            json!({ "list": [
                { "Path": "Shows", "Name": "Shows", "IsDir": true },
                { "Path": "readme.txt", "Name": "readme.txt", "Size": 12 },
            ]}),
        );
        app.rclone.reply(
            "operations/list:media:Shows",
            json!({ "list": [
                { "Path": "Shows/Pilot Episode.mkv", "Name": "Pilot Episode.mkv", "Size": 700 },
            ]}),
        );
        let http = reqwest::Client::new();

        let res = http
            .post(format!("{}/api/v1/search/config/media", app.base))
            .json(&json!({ "autoIndexIntervalMin": 0, "includedExtensions": "mkv" }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["data"]["includedExtensions"], "mkv");

        let res = http
            .post(format!("{}/api/v1/search/index/media", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        for _ in 0..50 {
            if !app.state.search.is_indexing("media") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let body: Value = http
            .get(format!("{}/api/v1/search?q=pilot%20mkv&limit=10", app.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["meta"]["total"], 1);
        assert_eq!(body["meta"]["limit"], 10);
        assert_eq!(body["data"][0]["path"], "/media/Shows/Pilot Episode.mkv");

        let body: Value = http
            .get(format!("{}/api/v1/search?q=readme", app.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["meta"]["total"], 0);

        let body: Value = http
            .get(format!("{}/api/v1/search/config", app.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["data"][0]["remote"], "media");
        assert_eq!(body["data"][0]["status"], "idle");

        let res = http
            .get(format!("{}/api/v1/search", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
