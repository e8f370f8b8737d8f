use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;

pub const ETA_UNKNOWN: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    #[serde(rename = "download.created")]
    DownloadCreated,
    #[serde(rename = "download.started")]
    DownloadStarted,
    #[serde(rename = "download.progress")]
    DownloadProgress,
    #[serde(rename = "download.paused")]
    DownloadPaused,
    #[serde(rename = "download.resumed")]
    DownloadResumed,
    #[serde(rename = "download.completed")]
    DownloadCompleted,
    #[serde(rename = "download.error")]
    DownloadError,
    #[serde(rename = "upload.started")]
    UploadStarted,
    #[serde(rename = "upload.progress")]
    UploadProgress,
    #[serde(rename = "upload.completed")]
    UploadCompleted,
    #[serde(rename = "upload.error")]
    UploadError,
    #[serde(rename = "settings.updated")]
    SettingsUpdated,
    #[serde(rename = "stats")]
    Stats,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DownloadCreated => "download.created",
            Self::DownloadStarted => "download.started",
            Self::DownloadProgress => "download.progress",
            Self::DownloadPaused => "download.paused",
            Self::DownloadResumed => "download.resumed",
            Self::DownloadCompleted => "download.completed",
            Self::DownloadError => "download.error",
            Self::UploadStarted => "upload.started",
            Self::UploadProgress => "upload.progress",
            Self::UploadCompleted => "upload.completed",
            Self::UploadError => "upload.error",
            Self::SettingsUpdated => "settings.updated",
            Self::Stats => "stats",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    Download,
    Upload,
}

/// High-frequency transfer update for a single task.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub downloaded: i64,
    pub uploaded: i64,
    pub size: i64,
    pub speed: i64,
    pub eta: i64,
    pub seeders: i64,
    pub peers: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub id: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(kind: EventType, id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            id: id.into(),
            data,
            error: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SpeedStats {
    pub download: i64,
    pub upload: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TaskCounts {
    pub active: i64,
    pub uploading: i64,
    pub waiting: i64,
    pub paused: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total_downloaded: i64,
    pub total_uploaded: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct StatsEvent {
    pub speeds: SpeedStats,
    pub tasks: TaskCounts,
    pub usage: UsageStats,
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Progress(ProgressEvent),
    Lifecycle(LifecycleEvent),
    Stats(StatsEvent),
}

impl ServerEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Progress(p) => match p.kind {
                ProgressKind::Download => EventType::DownloadProgress,
                ProgressKind::Upload => EventType::UploadProgress,
            },
            Self::Lifecycle(e) => e.kind,
            Self::Stats(_) => EventType::Stats,
        }
    }

    /// Wire frame shared by SSE and WebSocket clients: `{type, timestamp, data}`.
    pub fn as_json_value(&self) -> Value {
        let (timestamp, data) = match self {
            Self::Progress(p) => (Utc::now(), to_value(p)),
            Self::Lifecycle(e) => {
                let mut data = if e.data.is_null() {
                    json!({ "id": e.id })
                } else {
                    e.data.clone()
                };
                if !e.error.is_empty() {
                    if let Some(obj) = data.as_object_mut() {
                        obj.insert("error".to_string(), Value::String(e.error.clone()));
                    }
                }
                (e.timestamp, data)
            }
            Self::Stats(s) => (Utc::now(), to_value(s)),
        };

        json!({
            "type": self.event_type().as_str(),
            "timestamp": timestamp,
            "data": data,
        })
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Remaining seconds, 0 when done, [`ETA_UNKNOWN`] when stalled.
pub fn calculate_eta(remaining: i64, speed: i64) -> i64 {
    if remaining <= 0 {
        return 0;
    }
    if speed <= 0 {
        return ETA_UNKNOWN;
    }
    remaining / speed
}

/// Broadcast bus with a live-client count so publishers can idle when nobody
/// is listening.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
    subscribers: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn publish(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn lifecycle(&self, kind: EventType, id: &str, data: Value) {
        self.publish(ServerEvent::Lifecycle(LifecycleEvent::new(kind, id, data)));
    }

    pub fn lifecycle_error(&self, kind: EventType, id: &str, error: &str) {
        self.publish(ServerEvent::Lifecycle(
            LifecycleEvent::new(kind, id, Value::Null).with_error(error),
        ));
    }

    /// Receiver for internal consumers. Does not count as a client.
    pub fn receiver(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Receiver for an SSE/WebSocket client, counted until dropped.
    pub fn subscribe(&self) -> Subscription {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
        Subscription {
            rx: self.tx.subscribe(),
            counter: self.subscribers.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }
}

pub struct Subscription {
    pub rx: broadcast::Receiver<ServerEvent>,
    counter: Arc<AtomicUsize>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
