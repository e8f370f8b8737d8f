use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_RETRIES: i32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Waiting,
    Allocating,
    Active,
    Resolving,
    Paused,
    Uploading,
    Complete,
    Error,
    Processing,
    Removed,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Allocating => "allocating",
            Self::Active => "active",
            Self::Resolving => "resolving",
            Self::Paused => "paused",
            Self::Uploading => "uploading",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Processing => "processing",
            Self::Removed => "removed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Removed)
    }

    /// Still owned by aria2: the offload step has not picked it up yet.
    pub fn is_downloading(self) -> bool {
        matches!(
            self,
            Self::Waiting
                | Self::Allocating
                | Self::Active
                | Self::Resolving
                | Self::Paused
                | Self::Processing
        )
    }

    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        let allowed: &[DownloadStatus] = match self {
            Waiting => &[Allocating, Active, Paused, Error, Processing, Removed],
            Allocating => &[Active, Error, Waiting, Paused],
            Active => &[Paused, Complete, Uploading, Error, Resolving, Waiting, Removed],
            Resolving => &[Active, Error, Waiting, Paused],
            Paused => &[Waiting, Error, Active, Removed],
            Uploading => &[Complete, Error, Waiting],
            Complete => &[Waiting, Uploading],
            Error => &[Waiting],
            Processing => &[Active, Error, Waiting],
            Removed => &[Waiting],
        };
        allowed.contains(&next)
    }

    /// Maps an aria2 `status` field onto the task state machine.
    pub fn from_aria2(status: &str) -> Self {
        match status {
            "active" => Self::Active,
            "paused" => Self::Paused,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "removed" => Self::Removed,
            _ => Self::Waiting,
        }
    }
}

impl FromStr for DownloadStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "waiting" | "pending" => Self::Waiting,
            "allocating" => Self::Allocating,
            "active" | "downloading" => Self::Active,
            "resolving" => Self::Resolving,
            "paused" => Self::Paused,
            "uploading" => Self::Uploading,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "processing" => Self::Processing,
            "removed" => Self::Removed,
            _ => return Err(()),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    #[default]
    Idle,
    Pending,
    Running,
    Complete,
    Error,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl FromStr for UploadStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "idle" => Self::Idle,
            "pending" => Self::Pending,
            "running" => Self::Running,
            "complete" => Self::Complete,
            "error" => Self::Error,
            _ => return Err(()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFile {
    pub id: String,
    pub index: i64,
    pub path: String,
    pub name: String,
    pub size: i64,
    pub downloaded: i64,
    pub selected: bool,
}

/// One aria2 download plus its optional rclone offload. `id` is the aria2 gid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub url: String,
    pub uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torrent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metalink: Option<String>,
    pub options: JsonMap<String, Value>,
    pub name: String,
    pub dir: String,
    pub file_path: String,
    pub destination: String,
    pub provider: String,
    pub resolved_url: String,
    pub status: DownloadStatus,
    pub upload_status: UploadStatus,
    pub upload_job_id: i64,
    pub error: String,
    pub size: i64,
    pub downloaded: i64,
    pub uploaded: i64,
    pub speed: i64,
    pub upload_speed: i64,
    pub eta: i64,
    pub seeders: i64,
    pub peers: i64,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub is_magnet: bool,
    pub magnet_hash: String,
    pub selected_files: Vec<String>,
    pub files: Vec<DownloadFile>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            url: String::new(),
            uris: Vec::new(),
            torrent: None,
            metalink: None,
            options: JsonMap::new(),
            name: String::new(),
            dir: String::new(),
            file_path: String::new(),
            destination: String::new(),
            provider: String::new(),
            resolved_url: String::new(),
            status: DownloadStatus::Waiting,
            upload_status: UploadStatus::Idle,
            upload_job_id: 0,
            error: String::new(),
            size: 0,
            downloaded: 0,
            uploaded: 0,
            speed: 0,
            upload_speed: 0,
            eta: 0,
            seeders: 0,
            peers: 0,
            priority: DEFAULT_PRIORITY,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            is_magnet: false,
            magnet_hash: String::new(),
            selected_files: Vec::new(),
            files: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.size <= 0 {
            return 0.0;
        }
        (self.downloaded as f64 / self.size as f64 * 100.0).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateDownloadRequest {
    pub url: Option<String>,
    pub uris: Vec<String>,
    pub torrent: Option<String>,
    pub metalink: Option<String>,
    pub filename: Option<String>,
    pub dir: Option<String>,
    pub destination: Option<String>,
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
    pub selected_files: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub options: JsonMap<String, Value>,
}

impl CreateDownloadRequest {
    pub fn validate(&self) -> Result<(), String> {
        let has_url = self
            .url
            .as_deref()
            .map(|u| !u.trim().is_empty())
            .unwrap_or(false);
        let has_torrent = self.torrent.as_deref().is_some_and(|t| !t.is_empty());
        let has_metalink = self.metalink.as_deref().is_some_and(|m| !m.is_empty());
        if !has_url && self.uris.is_empty() && !has_torrent && !has_metalink {
            return Err("one of url, uris, torrent or metalink is required".to_string());
        }
        if let Some(priority) = self.priority {
            if !(0..=10).contains(&priority) {
                return Err("priority must be between 0 and 10".to_string());
            }
        }
        if self.max_retries.is_some_and(|v| v < 0) {
            return Err("maxRetries must not be negative".to_string());
        }
        if let Some(name) = self.filename.as_deref() {
            if !is_safe_filename(name) {
                return Err("invalid filename".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateDownloadRequest {
    pub filename: Option<String>,
    pub destination: Option<String>,
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub ids: Vec<String>,
    pub action: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriorityRequest {
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListMeta {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MagnetFile {
    pub id: String,
    pub name: String,
    pub path: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link: String,
    pub is_folder: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<MagnetFile>,
    #[serde(default)]
    pub index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MagnetInfo {
    pub source: String,
    pub cached: bool,
    pub magnet_id: String,
    pub name: String,
    pub hash: String,
    pub size: i64,
    pub files: Vec<MagnetFile>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MagnetDownloadRequest {
    pub magnet: String,
    pub torrent: Option<String>,
    pub source: String,
    pub magnet_id: String,
    pub name: String,
    pub selected_files: Vec<String>,
    pub destination: Option<String>,
    pub files: Vec<MagnetFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Remote {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    pub is_premium: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A file or folder recorded by the remote indexer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IndexedFile {
    pub id: String,
    pub remote: String,
    pub path: String,
    pub name: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<String>,
    pub is_dir: bool,
    pub last_indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    #[default]
    Idle,
    Indexing,
    Error,
}

impl IndexStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Indexing => "indexing",
            Self::Error => "error",
        }
    }
}

impl FromStr for IndexStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "idle" => Self::Idle,
            "indexing" => Self::Indexing,
            "error" => Self::Error,
            _ => return Err(()),
        })
    }
}

/// Per-remote indexing settings and state. `excluded_patterns` is a regex
/// matched against full paths, `included_extensions` a comma-separated list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIndexConfig {
    pub remote: String,
    pub auto_index_interval_min: i64,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub status: IndexStatus,
    pub error_msg: String,
    pub excluded_patterns: String,
    pub included_extensions: String,
    pub min_size_bytes: i64,
}

impl RemoteIndexConfig {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            ..Self::default()
        }
    }

    /// Auto-indexing is on and the last run is older than the interval.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.auto_index_interval_min <= 0 || self.status == IndexStatus::Indexing {
            return false;
        }
        match self.last_indexed_at {
            None => true,
            Some(at) => now - at > chrono::Duration::minutes(self.auto_index_interval_min),
        }
    }
}

/// Body of `POST /search/config/{remote}`. Omitted filters keep their value.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexConfigUpdate {
    #[serde(alias = "autoIndexIntervalMin")]
    pub interval: i64,
    pub excluded_patterns: Option<String>,
    pub included_extensions: Option<String>,
    pub min_size_bytes: Option<i64>,
}

/// Stored provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cached_hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_account: Option<AccountInfo>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub total_downloaded: i64,
    pub total_uploaded: i64,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub uploaded_tasks: i64,
    pub failed_tasks: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStats {
    pub downloads: i64,
    pub download_speed: i64,
    pub uploads: i64,
    pub upload_speed: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub paused: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TotalStats {
    pub total_downloaded: i64,
    pub total_uploaded: i64,
    pub tasks_finished: i64,
    pub tasks_failed: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Stats {
    pub active: ActiveStats,
    pub queue: QueueStats,
    pub totals: TotalStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadSettings {
    pub download_dir: String,
    pub max_concurrent_downloads: i64,
    pub max_connection_per_server: i64,
    pub split: i64,
    pub connect_timeout: i64,
    pub max_tries: i64,
    pub check_certificate: bool,
    pub auto_resume: bool,
    pub pre_allocate_space: bool,
    pub max_download_speed: String,
    pub max_upload_speed: String,
    pub user_agent: String,
    pub min_split_size: String,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            download_dir: String::new(),
            max_concurrent_downloads: 3,
            max_connection_per_server: 8,
            split: 8,
            connect_timeout: 60,
            max_tries: 5,
            check_certificate: true,
            auto_resume: true,
            pre_allocate_space: true,
            max_download_speed: "0".to_string(),
            max_upload_speed: "0".to_string(),
            user_agent: String::new(),
            min_split_size: "1M".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadSettings {
    pub default_remote: String,
    pub auto_upload: bool,
    pub remove_local: bool,
    pub concurrent_uploads: i64,
    pub max_retry_attempts: i64,
    pub chunk_size: String,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            default_remote: String::new(),
            auto_upload: false,
            remove_local: false,
            concurrent_uploads: 1,
            max_retry_attempts: 3,
            chunk_size: "64M".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSettings {
    pub proxy_enabled: bool,
    pub proxy_url: String,
    pub proxy_user: String,
    pub proxy_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TorrentSettings {
    pub seed_ratio: String,
    pub seed_time: i64,
    pub listen_port: i64,
    pub force_save: bool,
    pub enable_dht: bool,
    pub enable_pex: bool,
    pub enable_lpd: bool,
    pub encryption: String,
    pub max_peers: i64,
}

impl Default for TorrentSettings {
    fn default() -> Self {
        Self {
            seed_ratio: "1.0".to_string(),
            seed_time: 1440,
            listen_port: 6881,
            force_save: false,
            enable_dht: true,
            enable_pex: true,
            enable_lpd: true,
            encryption: "enabled".to_string(),
            max_peers: 55,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub path: String,
    pub extensions: Vec<String>,
    pub icon: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AutomationSettings {
    pub schedule_enabled: bool,
    pub on_complete_action: String,
    pub script_path: String,
    pub categories: Vec<Category>,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        let category = |id: &str, name: &str, path: &str, exts: &[&str], icon: &str| Category {
            id: id.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            extensions: exts.iter().map(|e| e.to_string()).collect(),
            icon: icon.to_string(),
            is_default: true,
        };
        Self {
            schedule_enabled: false,
            on_complete_action: "none".to_string(),
            script_path: String::new(),
            categories: vec![
                category(
                    "cat_comp",
                    "Compressed",
                    "Compressed",
                    &["zip", "rar", "7z", "tar", "gz", "iso"],
                    "archive",
                ),
                category(
                    "cat_doc",
                    "Documents",
                    "Documents",
                    &["pdf", "doc", "docx", "txt", "epub", "xls", "xlsx"],
                    "file-text",
                ),
                category(
                    "cat_music",
                    "Music",
                    "Music",
                    &["mp3", "flac", "wav", "m4a", "ogg"],
                    "music",
                ),
                category(
                    "cat_prog",
                    "Programs",
                    "Programs",
                    &["exe", "msi", "dmg", "pkg", "deb", "appimage"],
                    "cpu",
                ),
                category(
                    "cat_video",
                    "Video",
                    "Video",
                    &["mp4", "mkv", "avi", "mov", "webm"],
                    "video",
                ),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvancedSettings {
    pub log_level: String,
    pub debug_mode: bool,
    pub save_interval: i64,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            debug_mode: false,
            save_interval: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub download: DownloadSettings,
    pub upload: UploadSettings,
    pub network: NetworkSettings,
    pub torrent: TorrentSettings,
    pub automation: AutomationSettings,
    pub advanced: AdvancedSettings,
}

impl Settings {
    pub fn with_download_dir(download_dir: impl Into<String>) -> Self {
        let mut settings = Self::default();
        settings.download.download_dir = download_dir.into();
        settings
    }

    /// Global aria2 options derived from these settings.
    pub fn aria2_options(&self) -> JsonMap<String, Value> {
        let mut opts = JsonMap::new();
        let mut put = |key: &str, value: String| {
            opts.insert(key.to_string(), Value::String(value));
        };

        let d = &self.download;
        if !d.download_dir.is_empty() {
            put("dir", d.download_dir.clone());
        }
        put(
            "max-concurrent-downloads",
            d.max_concurrent_downloads.max(1).to_string(),
        );
        put("max-overall-download-limit", or_zero(&d.max_download_speed));
        put("max-overall-upload-limit", or_zero(&d.max_upload_speed));
        put("split", d.split.max(1).to_string());
        put(
            "max-connection-per-server",
            d.max_connection_per_server.clamp(1, 16).to_string(),
        );
        put("connect-timeout", d.connect_timeout.max(1).to_string());
        put("max-tries", d.max_tries.max(0).to_string());
        put("check-certificate", d.check_certificate.to_string());
        if !d.min_split_size.is_empty() {
            put("min-split-size", d.min_split_size.clone());
        }
        if !d.user_agent.is_empty() {
            put("user-agent", d.user_agent.clone());
        }

        let n = &self.network;
        if n.proxy_enabled && !n.proxy_url.is_empty() {
            put("all-proxy", n.proxy_url.clone());
            if !n.proxy_user.is_empty() {
                put("all-proxy-user", n.proxy_user.clone());
                put("all-proxy-passwd", n.proxy_password.clone());
            }
        } else {
            put("all-proxy", String::new());
        }

        let t = &self.torrent;
        put("seed-ratio", t.seed_ratio.clone());
        put("seed-time", t.seed_time.max(0).to_string());
        put("listen-port", t.listen_port.to_string());
        put("enable-dht", t.enable_dht.to_string());
        put("enable-peer-exchange", t.enable_pex.to_string());
        put("bt-enable-lpd", t.enable_lpd.to_string());
        put("bt-max-peers", t.max_peers.max(0).to_string());
        put("bt-force-encryption", (t.encryption == "forced").to_string());
        put("bt-save-metadata", t.force_save.to_string());

        opts
    }
}

fn or_zero(value: &str) -> String {
    if value.trim().is_empty() {
        "0".to_string()
    } else {
        value.trim().to_string()
    }
}

pub fn is_safe_filename(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty()
        && trimmed != "."
        && trimmed != ".."
        && !trimmed.contains('/')
        && !trimmed.contains('\\')
        && !trimmed.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table_allows_retry_only_through_waiting() {
        assert!(DownloadStatus::Error.can_transition_to(DownloadStatus::Waiting));
        assert!(!DownloadStatus::Error.can_transition_to(DownloadStatus::Active));
        assert!(!DownloadStatus::Complete.can_transition_to(DownloadStatus::Paused));
        assert!(DownloadStatus::Active.can_transition_to(DownloadStatus::Uploading));
        assert!(DownloadStatus::Complete.can_transition_to(DownloadStatus::Uploading));
        assert!(!DownloadStatus::Uploading.can_transition_to(DownloadStatus::Paused));
    }

    #[test]
    fn pending_is_accepted_as_waiting() {
        assert_eq!(
            "pending".parse::<DownloadStatus>(),
            Ok(DownloadStatus::Waiting)
        );
        assert!("bogus".parse::<DownloadStatus>().is_err());
        assert_eq!(DownloadStatus::from_aria2("complete"), DownloadStatus::Complete);
        assert_eq!(DownloadStatus::from_aria2("waiting"), DownloadStatus::Waiting);
    }

    #[test]
    fn create_request_requires_a_source() {
        let empty = CreateDownloadRequest::default();
        assert!(empty.validate().is_err());

        let ok = CreateDownloadRequest {
            url: Some("https://example.com/a.iso".to_string()),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());

        let bad_priority = CreateDownloadRequest {
            url: Some("https://example.com/a.iso".to_string()),
            priority: Some(11),
            ..Default::default()
        };
        assert!(bad_priority.validate().is_err());

        let bad_name = CreateDownloadRequest {
            url: Some("https://example.com/a.iso".to_string()),
            filename: Some("../etc/passwd".to_string()),
            ..Default::default()
        };
        assert!(bad_name.validate().is_err());
    }

    #[test]
    fn aria2_options_follow_settings() {
        let mut settings = Settings::with_download_dir("/data/downloads");
        settings.download.max_concurrent_downloads = 5;
        settings.network.proxy_enabled = true;
        settings.network.proxy_url = "http://proxy:3128".to_string();

        let opts = settings.aria2_options();
        assert_eq!(opts["dir"], "/data/downloads");
        assert_eq!(opts["max-concurrent-downloads"], "5");
        assert_eq!(opts["split"], "8");
        assert_eq!(opts["all-proxy"], "http://proxy:3128");
        assert_eq!(opts["seed-time"], "1440");
    }

    #[test]
    fn settings_deserialize_partial_documents() {
        let settings: Settings =
            serde_json::from_str(r#"{"download":{"split":4},"torrent":{"seedRatio":"2.0"}}"#)
                .expect("parse settings");
        assert_eq!(settings.download.split, 4);
        assert_eq!(settings.download.max_connection_per_server, 8);
        assert_eq!(settings.torrent.seed_ratio, "2.0");
        assert_eq!(settings.automation.categories.len(), 5);
    }
}
