//! aria2 JSON-RPC client with WebSocket and HTTP transports.
//!
//! `ws://`/`wss://` endpoints share one lazily opened socket. Responses are
//! matched to callers by request id; frames without an id are aria2
//! notifications and are fanned out on a broadcast channel. Any other URL is
//! spoken to with plain HTTP POSTs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, RpcError>>>>>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("RPC Error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("HTTP Error: {0}")]
    Http(u16),
    #[error("WebSocket request timeout")]
    Timeout,
    #[error("WebSocket connection failed")]
    ConnectFailed,
    #[error("WebSocket connection closed or configuration changed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            Self::Rpc { code, .. } => *code,
            _ => -32000,
        }
    }

    /// aria2's answer for an unknown gid, as opposed to a transport failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Rpc { code: 1, message } if message.contains("not found"))
    }

    /// Message without the `RPC Error <code>:` prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Start,
    Pause,
    Stop,
    Complete,
    Error,
    BtComplete,
}

impl NotificationKind {
    pub fn from_method(method: &str) -> Option<Self> {
        Some(match method {
            "aria2.onDownloadStart" => Self::Start,
            "aria2.onDownloadPause" => Self::Pause,
            "aria2.onDownloadStop" => Self::Stop,
            "aria2.onDownloadComplete" => Self::Complete,
            "aria2.onDownloadError" => Self::Error,
            "aria2.onBtDownloadComplete" => Self::BtComplete,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aria2Notification {
    pub kind: NotificationKind,
    pub gid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Aria2Uri {
    pub uri: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Aria2File {
    pub index: String,
    pub path: String,
    pub length: String,
    pub completed_length: String,
    pub selected: String,
    pub uris: Vec<Aria2Uri>,
}

/// `tellStatus` result. aria2 encodes every number as a string.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Aria2Task {
    pub gid: String,
    pub status: String,
    pub total_length: String,
    pub completed_length: String,
    pub upload_length: String,
    pub download_speed: String,
    pub upload_speed: String,
    pub info_hash: String,
    pub num_seeders: String,
    pub connections: String,
    pub error_code: String,
    pub error_message: String,
    pub followed_by: Vec<String>,
    pub following: String,
    pub belongs_to: String,
    pub dir: String,
    pub files: Vec<Aria2File>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bittorrent: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rclone: Option<Value>,
}

impl Aria2Task {
    pub fn total(&self) -> i64 {
        parse_num(&self.total_length)
    }

    pub fn completed(&self) -> i64 {
        parse_num(&self.completed_length)
    }

    pub fn speed(&self) -> i64 {
        parse_num(&self.download_speed)
    }

    pub fn upload_speed(&self) -> i64 {
        parse_num(&self.upload_speed)
    }

    pub fn seeders(&self) -> i64 {
        parse_num(&self.num_seeders)
    }

    pub fn peers(&self) -> i64 {
        parse_num(&self.connections)
    }

    pub fn first_path(&self) -> String {
        self.files
            .first()
            .map(|f| f.path.clone())
            .unwrap_or_default()
    }

    /// Torrent name when present, else the first file's basename.
    pub fn display_name(&self) -> String {
        if let Some(name) = self
            .bittorrent
            .as_ref()
            .and_then(|bt| bt.pointer("/info/name"))
            .and_then(Value::as_str)
        {
            return name.to_string();
        }
        let path = self.first_path();
        if !path.is_empty() {
            return path.rsplit('/').next().unwrap_or(&path).to_string();
        }
        self.files
            .first()
            .and_then(|f| f.uris.first())
            .map(|u| u.uri.rsplit('/').next().unwrap_or(&u.uri).to_string())
            .unwrap_or_default()
    }

    /// `[code] message`, or whichever half is present.
    pub fn error_text(&self) -> String {
        match (self.error_code.is_empty(), self.error_message.is_empty()) {
            (false, false) => format!("[{}] {}", self.error_code, self.error_message),
            (true, false) => self.error_message.clone(),
            (false, true) => format!("[{}]", self.error_code),
            (true, true) => "Unknown error".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Aria2GlobalStat {
    pub download_speed: String,
    pub upload_speed: String,
    pub num_active: String,
    pub num_waiting: String,
    pub num_stopped: String,
    pub num_stopped_total: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_upload_speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_uploading: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_downloaded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_uploaded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tasks: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_tasks: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_tasks: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Aria2Version {
    pub version: String,
    pub enabled_features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RcloneStats {
    pub bytes: f64,
    pub speed: f64,
    pub transfers: f64,
    pub errors: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RcloneVersion {
    pub version: String,
    pub os: String,
    pub arch: String,
}

pub fn parse_num(raw: &str) -> i64 {
    raw.trim().parse::<i64>().unwrap_or(0)
}

pub fn is_ws_url(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    lower.starts_with("ws://") || lower.starts_with("wss://")
}

/// Seven random base-36 characters.
pub fn request_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..7)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

fn has_token(params: &[Value]) -> bool {
    params
        .first()
        .and_then(Value::as_str)
        .is_some_and(|p| p.starts_with("token:"))
}

/// Prepends `token:<secret>` the way aria2 expects it.
///
/// `rclone.*` calls are never touched. `system.multicall` gets the token on each
/// inner call instead of on the outer params. Params that already carry a
/// token are left alone.
pub fn inject_token(secret: &str, method: &str, mut params: Vec<Value>) -> Vec<Value> {
    if secret.is_empty() || method.starts_with("rclone.") {
        return params;
    }

    if method == "system.multicall" {
        if let Some(Value::Array(calls)) = params.get_mut(0) {
            for call in calls.iter_mut() {
                let Some(obj) = call.as_object_mut() else {
                    continue;
                };
                let inner_method = obj
                    .get("methodName")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let inner = match obj.remove("params") {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                obj.insert(
                    "params".to_string(),
                    Value::Array(inject_token(secret, &inner_method, inner)),
                );
            }
        }
        return params;
    }

    if !has_token(&params) {
        params.insert(0, Value::String(format!("token:{secret}")));
    }
    params
}

/// Splits a JSON-RPC response object into its result or error.
fn extract_result(value: &Value) -> Result<Value, RpcError> {
    if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        return Err(RpcError::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(value.get("result").cloned().unwrap_or(Value::Null))
}

fn response_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    url: String,
    secret: String,
}

struct Connection {
    url: String,
    sink: Arc<Mutex<WsSink>>,
    alive: watch::Receiver<bool>,
    reader: JoinHandle<()>,
}

#[derive(Clone)]
struct ConnectionHandle {
    sink: Arc<Mutex<WsSink>>,
    alive: watch::Receiver<bool>,
}

pub struct Aria2Client {
    endpoint: RwLock<Endpoint>,
    http: reqwest::Client,
    connection: Mutex<Option<Connection>>,
    pending: Pending,
    notifications: broadcast::Sender<Aria2Notification>,
    request_timeout: Duration,
}

impl Aria2Client {
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_timeout(url, secret, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        url: impl Into<String>,
        secret: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        let (notifications, _rx) = broadcast::channel(256);
        Self {
            endpoint: RwLock::new(Endpoint {
                url: url.into(),
                secret: secret.into(),
            }),
            http: reqwest::Client::new(),
            connection: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            notifications,
            request_timeout,
        }
    }

    fn endpoint(&self) -> Endpoint {
        match self.endpoint.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn url(&self) -> String {
        self.endpoint().url
    }

    pub fn secret(&self) -> String {
        self.endpoint().secret
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Aria2Notification> {
        self.notifications.subscribe()
    }

    /// Swaps endpoint or secret. A URL change drops the socket and fails every
    /// in-flight request.
    pub async fn update_config(&self, url: impl Into<String>, secret: impl Into<String>) {
        let url = url.into();
        let changed = {
            let mut guard = match self.endpoint.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let changed = guard.url != url;
            guard.url = url;
            guard.secret = secret.into();
            changed
        };

        if changed {
            self.close().await;
        }
    }

    pub async fn close(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.reader.abort();
            let _ = conn.sink.lock().await.close().await;
        }
        fail_pending(&self.pending, RpcError::Closed).await;
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let endpoint = self.endpoint();
        let params = inject_token(&endpoint.secret, method, params);
        let id = request_id();
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        if is_ws_url(&endpoint.url) {
            self.call_ws(&endpoint.url, id, body).await
        } else {
            self.call_http(&endpoint.url, body).await
        }
    }

    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|err| RpcError::InvalidResponse(err.to_string()))
    }

    async fn call_http(&self, url: &str, body: Value) -> Result<Value, RpcError> {
        let response = self
            .http
            .post(url)
            .json(&body)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|err| RpcError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Http(status.as_u16()));
        }

        let value = response
            .json::<Value>()
            .await
            .map_err(|err| RpcError::InvalidResponse(err.to_string()))?;
        extract_result(&value)
    }

    async fn call_ws(&self, url: &str, id: String, body: Value) -> Result<Value, RpcError> {
        let handle = self.connect(url).await?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let sent = handle
            .sink
            .lock()
            .await
            .send(Message::Text(body.to_string().into()))
            .await;
        if let Err(err) = sent {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::Transport(err.to_string()));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Returns the live socket, opening it first if needed. The connection lock
    /// is held across the handshake so concurrent callers share one attempt.
    async fn connect(&self, url: &str) -> Result<ConnectionHandle, RpcError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.url == url && *conn.alive.borrow() {
                return Ok(ConnectionHandle {
                    sink: conn.sink.clone(),
                    alive: conn.alive.clone(),
                });
            }
        }
        if let Some(stale) = guard.take() {
            stale.reader.abort();
        }

        let (stream, _) = match tokio::time::timeout(self.request_timeout, connect_async(url)).await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(err)) => {
                warn!("aria2 websocket connect to {url} failed: {err}");
                return Err(RpcError::ConnectFailed);
            }
            Err(_) => {
                warn!("aria2 websocket handshake with {url} timed out");
                return Err(RpcError::ConnectFailed);
            }
        };
        debug!("aria2 websocket connected to {url}");

        let (sink, stream) = stream.split();
        let sink = Arc::new(Mutex::new(sink));
        let (alive_tx, alive_rx) = watch::channel(true);
        let reader = tokio::spawn(read_loop(
            stream,
            self.pending.clone(),
            self.notifications.clone(),
            alive_tx,
        ));

        *guard = Some(Connection {
            url: url.to_string(),
            sink: sink.clone(),
            alive: alive_rx.clone(),
            reader,
        });

        Ok(ConnectionHandle {
            sink,
            alive: alive_rx,
        })
    }

    /// Keeps the notification socket up until `shutdown` flips, retrying every
    /// five seconds. HTTP endpoints cannot push, so the loop exits and the
    /// poller carries the load.
    pub async fn run_notification_listener(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let url = self.url();
            if !is_ws_url(&url) {
                info!("aria2 endpoint {url} is not a websocket; notifications disabled");
                return;
            }

            match self.connect(&url).await {
                Ok(mut handle) => {
                    info!("listening for aria2 notifications on {url}");
                    tokio::select! {
                        _ = handle.alive.wait_for(|alive| !*alive) => {
                            warn!("aria2 websocket closed; reconnecting in {}s", RECONNECT_DELAY.as_secs());
                        }
                        _ = shutdown.changed() => return,
                    }
                }
                Err(err) => warn!("aria2 notification listener: {err}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    pub async fn get_version(&self) -> Result<Aria2Version, RpcError> {
        self.call_as("aria2.getVersion", vec![]).await
    }

    pub async fn get_global_stat(&self) -> Result<Aria2GlobalStat, RpcError> {
        self.call_as("aria2.getGlobalStat", vec![]).await
    }

    pub async fn tell_active(&self, keys: &[&str]) -> Result<Vec<Aria2Task>, RpcError> {
        self.call_as("aria2.tellActive", keys_param(keys)).await
    }

    pub async fn tell_waiting(
        &self,
        offset: i64,
        num: i64,
        keys: &[&str],
    ) -> Result<Vec<Aria2Task>, RpcError> {
        let mut params = vec![json!(offset), json!(num)];
        params.extend(keys_param(keys));
        self.call_as("aria2.tellWaiting", params).await
    }

    pub async fn tell_stopped(
        &self,
        offset: i64,
        num: i64,
        keys: &[&str],
    ) -> Result<Vec<Aria2Task>, RpcError> {
        let mut params = vec![json!(offset), json!(num)];
        params.extend(keys_param(keys));
        self.call_as("aria2.tellStopped", params).await
    }

    pub async fn tell_status(&self, gid: &str, keys: &[&str]) -> Result<Aria2Task, RpcError> {
        let mut params = vec![json!(gid)];
        params.extend(keys_param(keys));
        self.call_as("aria2.tellStatus", params).await
    }

    pub async fn get_files(&self, gid: &str) -> Result<Vec<Aria2File>, RpcError> {
        self.call_as("aria2.getFiles", vec![json!(gid)]).await
    }

    pub async fn get_peers(&self, gid: &str) -> Result<Value, RpcError> {
        self.call("aria2.getPeers", vec![json!(gid)]).await
    }

    pub async fn get_servers(&self, gid: &str) -> Result<Value, RpcError> {
        self.call("aria2.getServers", vec![json!(gid)]).await
    }

    pub async fn get_uris(&self, gid: &str) -> Result<Vec<Aria2Uri>, RpcError> {
        self.call_as("aria2.getUris", vec![json!(gid)]).await
    }

    pub async fn change_position(&self, gid: &str, pos: i64, how: &str) -> Result<i64, RpcError> {
        self.call_as("aria2.changePosition", vec![json!(gid), json!(pos), json!(how)])
            .await
    }

    pub async fn add_uri(
        &self,
        uris: &[String],
        options: &JsonMap<String, Value>,
    ) -> Result<String, RpcError> {
        self.call_as("aria2.addUri", vec![json!(uris), Value::Object(options.clone())])
            .await
    }

    pub async fn add_torrent(
        &self,
        torrent_base64: &str,
        uris: &[String],
        options: &JsonMap<String, Value>,
    ) -> Result<String, RpcError> {
        self.call_as(
            "aria2.addTorrent",
            vec![
                json!(torrent_base64),
                json!(uris),
                Value::Object(options.clone()),
            ],
        )
        .await
    }

    pub async fn add_metalink(
        &self,
        metalink_base64: &str,
        options: &JsonMap<String, Value>,
    ) -> Result<Value, RpcError> {
        self.call(
            "aria2.addMetalink",
            vec![json!(metalink_base64), Value::Object(options.clone())],
        )
        .await
    }

    pub async fn remove(&self, gid: &str) -> Result<String, RpcError> {
        self.call_as("aria2.remove", vec![json!(gid)]).await
    }

    pub async fn force_remove(&self, gid: &str) -> Result<String, RpcError> {
        self.call_as("aria2.forceRemove", vec![json!(gid)]).await
    }

    pub async fn pause(&self, gid: &str) -> Result<String, RpcError> {
        self.call_as("aria2.pause", vec![json!(gid)]).await
    }

    pub async fn pause_all(&self) -> Result<String, RpcError> {
        self.call_as("aria2.pauseAll", vec![]).await
    }

    pub async fn force_pause(&self, gid: &str) -> Result<String, RpcError> {
        self.call_as("aria2.forcePause", vec![json!(gid)]).await
    }

    pub async fn force_pause_all(&self) -> Result<String, RpcError> {
        self.call_as("aria2.forcePauseAll", vec![]).await
    }

    pub async fn unpause(&self, gid: &str) -> Result<String, RpcError> {
        self.call_as("aria2.unpause", vec![json!(gid)]).await
    }

    pub async fn unpause_all(&self) -> Result<String, RpcError> {
        self.call_as("aria2.unpauseAll", vec![]).await
    }

    pub async fn get_option(&self, gid: &str) -> Result<JsonMap<String, Value>, RpcError> {
        self.call_as("aria2.getOption", vec![json!(gid)]).await
    }

    pub async fn change_option(
        &self,
        gid: &str,
        options: &JsonMap<String, Value>,
    ) -> Result<String, RpcError> {
        self.call_as(
            "aria2.changeOption",
            vec![json!(gid), Value::Object(options.clone())],
        )
        .await
    }

    pub async fn get_global_option(&self) -> Result<JsonMap<String, Value>, RpcError> {
        self.call_as("aria2.getGlobalOption", vec![]).await
    }

    pub async fn change_global_option(
        &self,
        options: &JsonMap<String, Value>,
    ) -> Result<String, RpcError> {
        self.call_as(
            "aria2.changeGlobalOption",
            vec![Value::Object(options.clone())],
        )
        .await
    }

    pub async fn remove_download_result(&self, gid: &str) -> Result<String, RpcError> {
        self.call_as("aria2.removeDownloadResult", vec![json!(gid)])
            .await
    }

    pub async fn purge_download_result(&self) -> Result<String, RpcError> {
        self.call_as("aria2.purgeDownloadResult", vec![]).await
    }

    pub async fn save_session(&self) -> Result<String, RpcError> {
        self.call_as("aria2.saveSession", vec![]).await
    }

    /// Gateway extension: re-queue a failed or lost task under its old gid.
    pub async fn retry_task(&self, gid: &str) -> Result<String, RpcError> {
        self.call_as("aria2.retryTask", vec![json!(gid)]).await
    }

    pub async fn multicall(&self, calls: Vec<(String, Vec<Value>)>) -> Result<Vec<Value>, RpcError> {
        let calls = calls
            .into_iter()
            .map(|(method, params)| json!({"methodName": method, "params": params}))
            .collect::<Vec<_>>();
        self.call_as("system.multicall", vec![Value::Array(calls)])
            .await
    }

    pub async fn rclone_list_remotes(&self) -> Result<Value, RpcError> {
        self.call("rclone.listRemotes", vec![]).await
    }

    pub async fn rclone_get_stats(&self) -> Result<RcloneStats, RpcError> {
        self.call_as("rclone.getStats", vec![]).await
    }

    pub async fn rclone_get_version(&self) -> Result<RcloneVersion, RpcError> {
        self.call_as("rclone.getVersion", vec![]).await
    }

    pub async fn rclone_create_remote(
        &self,
        name: &str,
        kind: &str,
        parameters: &JsonMap<String, Value>,
    ) -> Result<Value, RpcError> {
        self.call(
            "rclone.createRemote",
            vec![json!({"name": name, "type": kind, "parameters": parameters})],
        )
        .await
    }

    pub async fn rclone_delete_remote(&self, name: &str) -> Result<Value, RpcError> {
        self.call("rclone.deleteRemote", vec![json!({"name": name})])
            .await
    }
}

fn keys_param(keys: &[&str]) -> Vec<Value> {
    if keys.is_empty() {
        Vec::new()
    } else {
        vec![json!(keys)]
    }
}

async fn fail_pending(pending: &Pending, err: RpcError) {
    let drained = pending.lock().await.drain().collect::<Vec<_>>();
    for (_, tx) in drained {
        let _ = tx.send(Err(err.clone()));
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    pending: Pending,
    notifications: broadcast::Sender<Aria2Notification>,
    alive: watch::Sender<bool>,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                dispatch_frame(text.as_str(), &pending, &notifications).await;
            }
            Ok(Message::Binary(bytes)) => {
                if let Ok(text) = std::str::from_utf8(&bytes) {
                    dispatch_frame(text, &pending, &notifications).await;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!("aria2 websocket read error: {err}");
                break;
            }
        }
    }

    let _ = alive.send(false);
    fail_pending(&pending, RpcError::Closed).await;
}

async fn dispatch_frame(
    text: &str,
    pending: &Pending,
    notifications: &broadcast::Sender<Aria2Notification>,
) {
    let value = match serde_json::from_str::<Value>(text) {
        Ok(value) => value,
        Err(err) => {
            debug!("ignoring malformed aria2 frame: {err}");
            return;
        }
    };

    match value {
        Value::Array(items) => {
            for item in items {
                dispatch_message(item, pending, notifications).await;
            }
        }
        other => dispatch_message(other, pending, notifications).await,
    }
}

async fn dispatch_message(
    value: Value,
    pending: &Pending,
    notifications: &broadcast::Sender<Aria2Notification>,
) {
    if let Some(id) = response_id(&value) {
        if let Some(tx) = pending.lock().await.remove(&id) {
            let _ = tx.send(extract_result(&value));
        }
        return;
    }

    let Some(kind) = value
        .get("method")
        .and_then(Value::as_str)
        .and_then(NotificationKind::from_method)
    else {
        return;
    };

    let gids = value
        .get("params")
        .and_then(Value::as_array)
        .map(|params| {
            params
                .iter()
                .filter_map(|p| p.get("gid").and_then(Value::as_str))
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    for gid in gids {
        let _ = notifications.send(Aria2Notification { kind, gid });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("{addr}")
    }

    async fn fake_ws(ws: WebSocketUpgrade) -> impl IntoResponse {
        ws.on_upgrade(handle_fake_ws)
    }

    async fn handle_fake_ws(mut socket: WebSocket) {
        while let Some(Ok(msg)) = socket.recv().await {
            let AxumMessage::Text(text) = msg else {
                continue;
            };
            let req: Value = serde_json::from_str(text.as_str()).expect("request json");
            let id = req["id"].clone();
            let reply = match req["method"].as_str().unwrap_or_default() {
                "aria2.getVersion" => json!({"jsonrpc": "2.0", "id": id, "result": {"version": "1.37.0"}}),
                "aria2.tellStatus" => json!([{"jsonrpc": "2.0", "id": id, "result": {
                    "gid": req["params"][1], "status": "active", "totalLength": "100"
                }}]),
                "aria2.pause" => {
                    let note = json!({"jsonrpc": "2.0", "method": "aria2.onDownloadPause", "params": [{"gid": "2089b05ecca3d829"}]});
                    let _ = socket.send(AxumMessage::Text(note.to_string().into())).await;
                    json!({"jsonrpc": "2.0", "id": id, "result": "2089b05ecca3d829"})
                }
                "aria2.remove" => json!({"jsonrpc": "2.0", "id": id, "error": {"code": 1, "message": "GID not found"}}),
                _ => continue,
            };
            if socket
                .send(AxumMessage::Text(reply.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    }

    #[test]
    fn token_injection_rules() {
        let params = inject_token("s3cret", "aria2.tellActive", vec![]);
        assert_eq!(params, vec![json!("token:s3cret")]);

        let params = inject_token("s3cret", "aria2.pause", vec![json!("token:other"), json!("g")]);
        assert_eq!(params[0], "token:other");
        assert_eq!(params.len(), 2);

        let params = inject_token("s3cret", "rclone.listRemotes", vec![]);
        assert!(params.is_empty());

        let params = inject_token("", "aria2.pause", vec![json!("g")]);
        assert_eq!(params, vec![json!("g")]);

        let params = inject_token(
            "s3cret",
            "system.multicall",
            vec![json!([
                {"methodName": "aria2.tellStatus", "params": ["g1"]},
                {"methodName": "aria2.getVersion"}
            ])],
        );
        assert_eq!(params.len(), 1);
        assert_eq!(params[0][0]["params"], json!(["token:s3cret", "g1"]));
        assert_eq!(params[0][1]["params"], json!(["token:s3cret"]));
    }

    #[test]
    fn request_ids_are_base36() {
        let id = request_id();
        assert_eq!(id.len(), 7);
        assert!(id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn error_text_formats() {
        let mut task = Aria2Task {
            error_code: "3".to_string(),
            error_message: "Resource not found".to_string(),
            ..Default::default()
        };
        assert_eq!(task.error_text(), "[3] Resource not found");
        task.error_code.clear();
        assert_eq!(task.error_text(), "Resource not found");
        task.error_message.clear();
        assert_eq!(task.error_text(), "Unknown error");
    }

    #[tokio::test]
    async fn http_transport_maps_results_and_errors() {
        let app = Router::new()
            .route(
                "/jsonrpc",
                post(|Json(req): Json<Value>| async move {
                    assert_eq!(req["params"][0], "token:abc");
                    match req["method"].as_str().unwrap_or_default() {
                        "aria2.getVersion" => Json(json!({"id": req["id"], "result": {"version": "1.37.0", "enabledFeatures": ["BitTorrent"]}})),
                        _ => Json(json!({"id": req["id"], "error": {"code": 1, "message": "boom"}})),
                    }
                }),
            )
            .route(
                "/broken",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "nope") }),
            );
        let addr = serve(app).await;

        let client = Aria2Client::new(format!("http://{addr}/jsonrpc"), "abc");
        let version = client.get_version().await.expect("version");
        assert_eq!(version.version, "1.37.0");
        assert_eq!(version.enabled_features, vec!["BitTorrent".to_string()]);

        let err = client.pause("g").await.expect_err("rpc error");
        assert_eq!(err.to_string(), "RPC Error 1: boom");
        assert_eq!(err.code(), 1);

        let broken = Aria2Client::new(format!("http://{addr}/broken"), "");
        let err = broken.get_version().await.expect_err("http error");
        assert_eq!(err.to_string(), "HTTP Error: 500");
    }

    #[tokio::test]
    async fn websocket_transport_correlates_and_notifies() {
        let addr = serve(Router::new().route("/jsonrpc", get(fake_ws))).await;
        let client = Arc::new(Aria2Client::with_timeout(
            format!("ws://{addr}/jsonrpc"),
            "",
            Duration::from_millis(300),
        ));
        let mut notes = client.subscribe();

        let (a, b) = tokio::join!(client.get_version(), client.tell_status("g1", &[]));
        assert_eq!(a.expect("version").version, "1.37.0");
        let status = b.expect("batched status");
        assert_eq!(status.gid, "g1");
        assert_eq!(status.total(), 100);

        let paused = client.pause("2089b05ecca3d829").await.expect("pause");
        assert_eq!(paused, "2089b05ecca3d829");
        let note = notes.recv().await.expect("notification");
        assert_eq!(note.kind, NotificationKind::Pause);
        assert_eq!(note.gid, "2089b05ecca3d829");

        let err = client.remove("x").await.expect_err("rpc error");
        assert_eq!(err.to_string(), "RPC Error 1: GID not found");

        let err = client.unpause("x").await.expect_err("timeout");
        assert_eq!(err, RpcError::Timeout);
        assert!(client.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn config_change_fails_in_flight_requests() {
        let addr = serve(Router::new().route("/jsonrpc", get(fake_ws))).await;
        let client = Arc::new(Aria2Client::with_timeout(
            format!("ws://{addr}/jsonrpc"),
            "",
            Duration::from_secs(5),
        ));
        client.get_version().await.expect("connect");

        let pending_call = {
            let client = client.clone();
            tokio::spawn(async move { client.unpause("never-answered").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        client
            .update_config(format!("ws://{addr}/other"), "")
            .await;

        let result = pending_call.await.expect("join");
        assert_eq!(result, Err(RpcError::Closed));
        assert_eq!(client.url(), format!("ws://{addr}/other"));
    }

    #[tokio::test]
    async fn unreachable_websocket_reports_connect_failure() {
        let client = Aria2Client::new("ws://127.0.0.1:1/jsonrpc", "");
        let err = client.get_version().await.expect_err("connect error");
        assert_eq!(err.to_string(), "WebSocket connection failed");
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        // Accepts the socket and never answers the upgrade.
        let holder = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let client = Aria2Client::with_timeout(
            format!("ws://{addr}/jsonrpc"),
            "",
            Duration::from_millis(200),
        );
        let started = std::time::Instant::now();
        let err = client.get_version().await.expect_err("handshake timeout");
        assert_eq!(err, RpcError::ConnectFailed);
        assert!(started.elapsed() < Duration::from_secs(5));
        holder.abort();
    }

    #[test]
    fn only_unknown_gid_errors_count_as_not_found() {
        let missing = RpcError::Rpc {
            code: 1,
            message: "GID 2089b05ecca3d829 is not found".to_string(),
        };
        assert!(missing.is_not_found());
        assert!(!RpcError::Timeout.is_not_found());
        assert!(!RpcError::Transport("connection refused".to_string()).is_not_found());
        assert!(!RpcError::Rpc { code: 1, message: "cannot pause".to_string() }.is_not_found());
    }
}
