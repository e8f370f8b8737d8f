//! Download, magnet, settings, provider and remote operations behind the REST
//! API. Every mutation goes through here so aria2, rclone and the task table
//! stay in step.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::db::TaskDb;
use crate::events::{EventBus, EventType};
use crate::filetree::{
    all_file_ids, build_tree, extract_hash_from_magnet, find_file, flatten, selected_size,
    set_selected,
};
use crate::models::{
    AccountInfo, ActiveStats, BatchRequest, CreateDownloadRequest, DEFAULT_PRIORITY,
    DEFAULT_MAX_RETRIES, DownloadFile, DownloadStatus, MagnetDownloadRequest, MagnetFile, MagnetInfo,
    ProviderRecord, Remote, Settings, Stats, Task, TotalStats,
    UpdateDownloadRequest, UploadStatus, is_safe_filename,
};
use crate::offload::{Offloader, UploadPlan, upload_plan};
use crate::providers::registry::ProviderSummary;
use crate::providers::{Headers, ProviderError, ProviderRegistry, ResolveResult};
use crate::rclone::{FileInfo, RcloneClient, RcloneError};
use crate::rpc::{Aria2Client, Aria2Task, RpcError, parse_num};
use crate::torrent::{
    TorrentMeta, generate_gid, is_magnet, magnet_display_name, magnet_info_hash, parse_torrent,
};

const METADATA_POLL: Duration = Duration::from_millis(500);
const SECRET_MASK: &str = "********";
/// Accepted by aria2 on the command line only.
const STARTUP_ONLY_OPTIONS: &[&str] = &["listen-port", "enable-dht"];
pub const BATCH_ACTIONS: &[&str] = &["pause", "resume", "retry", "delete"];

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    InvalidTransition(String),
    #[error("{0}")]
    InvalidOperation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::InvalidOperation(_) => "INVALID_OPERATION",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<RpcError> for ServiceError {
    fn from(err: RpcError) -> Self {
        Self::Internal(anyhow::Error::new(err).context("aria2 request failed"))
    }
}

impl From<RcloneError> for ServiceError {
    fn from(err: RcloneError) -> Self {
        match err {
            RcloneError::NotFound(path) => Self::NotFound(format!("file not found: {path}")),
            RcloneError::InvalidPath(msg) => Self::Validation(msg),
            other => Self::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(_) => Self::NotFound(err.to_string()),
            ProviderError::NotConfigured(_)
            | ProviderError::Unsupported(_)
            | ProviderError::CircuitOpen(_) => Self::InvalidOperation(err.to_string()),
            ProviderError::NoProvider => Self::Validation(err.to_string()),
            other => Self::Internal(anyhow::Error::new(other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: &'static str,
    pub build: String,
    pub aria2: Option<String>,
    pub rclone: Option<String>,
}

/// Where a download lands: a local directory plus an optional rclone target.
/// `remote:path` is an rclone target; absolute paths are taken as is and
/// anything else is joined onto the download dir.
pub fn split_destination(destination: &str, download_dir: &str) -> (String, String) {
    let dest = destination.trim();
    if dest.is_empty() {
        return (download_dir.to_string(), String::new());
    }
    let path = Path::new(dest);
    if path.is_absolute() {
        return (dest.to_string(), String::new());
    }
    if dest.contains(':') {
        return (download_dir.to_string(), dest.to_string());
    }
    (
        Path::new(download_dir).join(dest).to_string_lossy().into_owned(),
        String::new(),
    )
}

/// Recursive object merge; non-object values replace.
pub fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, patch) => *slot = patch,
    }
}

fn overlay_live(task: &mut Task, live: &Aria2Task) {
    task.downloaded = live.completed();
    if live.total() > 0 {
        task.size = live.total();
    }
    task.speed = live.speed();
    task.eta = crate::events::calculate_eta(task.size - task.downloaded, task.speed);
    task.seeders = live.seeders();
    task.peers = live.peers();
}

fn download_files(live: &Aria2Task) -> Vec<DownloadFile> {
    live.files
        .iter()
        .map(|f| DownloadFile {
            id: f.index.clone(),
            index: parse_num(&f.index),
            path: f.path.clone(),
            name: Path::new(&f.path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: parse_num(&f.length),
            downloaded: parse_num(&f.completed_length),
            selected: f.selected != "false",
        })
        .collect()
}

fn decode_torrent(encoded: &str) -> ServiceResult<TorrentMeta> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|err| ServiceError::Validation(format!("invalid torrent encoding: {err}")))?;
    parse_torrent(&bytes).map_err(|err| ServiceError::Validation(format!("invalid torrent: {err}")))
}

fn magnet_info_from_meta(meta: TorrentMeta) -> MagnetInfo {
    MagnetInfo {
        source: "aria2".to_string(),
        cached: false,
        magnet_id: String::new(),
        name: meta.name,
        hash: meta.info_hash,
        size: meta.size,
        files: build_tree(meta.files),
    }
}

fn mask_config(record: &ProviderRecord, summary: &ProviderSummary) -> BTreeMap<String, String> {
    record
        .config
        .iter()
        .map(|(key, value)| {
            let secret = summary
                .config_schema
                .iter()
                .any(|f| &f.key == key && f.kind == "password");
            let shown = if secret && !value.is_empty() {
                SECRET_MASK.to_string()
            } else {
                value.clone()
            };
            (key.clone(), shown)
        })
        .collect()
}

fn transition_error(task: &Task, next: DownloadStatus) -> ServiceError {
    ServiceError::InvalidTransition(format!(
        "cannot move download {} from {} to {}",
        task.id,
        task.status.as_str(),
        next.as_str()
    ))
}

pub struct DownloadService {
    aria2: Arc<Aria2Client>,
    rclone: RcloneClient,
    db: TaskDb,
    events: EventBus,
    providers: Arc<ProviderRegistry>,
    offloader: Arc<Offloader>,
    download_dir: String,
    metadata_dir: PathBuf,
}

impl DownloadService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        aria2: Arc<Aria2Client>,
        rclone: RcloneClient,
        db: TaskDb,
        events: EventBus,
        providers: Arc<ProviderRegistry>,
        offloader: Arc<Offloader>,
        download_dir: impl Into<String>,
        metadata_dir: PathBuf,
    ) -> Self {
        Self {
            aria2,
            rclone,
            db,
            events,
            providers,
            offloader,
            download_dir: download_dir.into(),
            metadata_dir,
        }
    }

    async fn task(&self, id: &str) -> ServiceResult<Task> {
        self.db
            .get_task(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("download {id} not found")))
    }

    /// Local dir and rclone target for a new download. An explicit `dir`
    /// wins over the local part of `destination`; with no destination the
    /// default remote applies when auto upload is on.
    fn placement(
        &self,
        destination: Option<&str>,
        dir: Option<&str>,
        settings: &Settings,
    ) -> (String, String) {
        let base = if settings.download.download_dir.is_empty() {
            self.download_dir.as_str()
        } else {
            settings.download.download_dir.as_str()
        };
        let (mut local, mut remote) = split_destination(destination.unwrap_or_default(), base);
        if let Some(dir) = dir.map(str::trim).filter(|d| !d.is_empty()) {
            local = dir.to_string();
        }
        if destination.is_none_or(|d| d.trim().is_empty())
            && settings.upload.auto_upload
            && !settings.upload.default_remote.is_empty()
        {
            remote = settings.upload.default_remote.clone();
        }
        (local, remote)
    }

    pub async fn create(&self, req: CreateDownloadRequest) -> ServiceResult<Task> {
        req.validate().map_err(ServiceError::Validation)?;
        let settings = self.settings().await?;
        let (dir, destination) =
            self.placement(req.destination.as_deref(), req.dir.as_deref(), &settings);

        let mut task = Task::new(generate_gid());
        task.dir = dir;
        task.destination = destination;
        task.priority = req.priority.filter(|p| *p > 0).unwrap_or(DEFAULT_PRIORITY);
        task.max_retries = req.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        task.selected_files = req.selected_files.clone();
        task.options = req.options.clone();
        let mut headers = req.headers.clone();
        let mut plain_url = false;

        if let Some(torrent) = req.torrent.as_deref().filter(|t| !t.is_empty()) {
            let meta = decode_torrent(torrent)?;
            task.name = meta.name;
            task.size = meta.size;
            task.magnet_hash = meta.info_hash;
            task.torrent = Some(torrent.to_string());
            task.uris = req.uris.clone();
        } else if let Some(metalink) = req.metalink.as_deref().filter(|m| !m.is_empty()) {
            task.metalink = Some(metalink.to_string());
        } else {
            let url = req
                .url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .or_else(|| req.uris.first().cloned())
                .unwrap_or_default();
            task.url = url.clone();
            if is_magnet(&url) {
                task.is_magnet = true;
                task.magnet_hash = magnet_info_hash(&url).unwrap_or_default();
                task.name = magnet_display_name(&url).unwrap_or_default();
                task.uris = vec![url];
            } else {
                plain_url = true;
                match self.providers.resolve(&url, &req.headers).await {
                    Ok((resolved, provider)) => {
                        task.provider = provider;
                        task.resolved_url = resolved.url.clone();
                        task.uris = vec![resolved.url];
                        task.name = resolved.name;
                        task.size = resolved.size;
                        headers.extend(resolved.headers);
                    }
                    Err(ProviderError::NoProvider) => {
                        debug!("no provider for {url}, handing it to aria2 as is");
                        task.uris = if req.uris.is_empty() {
                            vec![url]
                        } else {
                            req.uris.clone()
                        };
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if let Some(name) = req.filename.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            task.name = name.to_string();
        }
        if plain_url && is_safe_filename(&task.name) {
            task.options
                .insert("out".to_string(), Value::String(task.name.clone()));
        }
        if !headers.is_empty() {
            let lines: Vec<Value> = headers
                .iter()
                .map(|(k, v)| Value::String(format!("{k}: {v}")))
                .collect();
            task.options.insert("header".to_string(), Value::Array(lines));
        }
        let indexes: Vec<&str> = task
            .selected_files
            .iter()
            .map(String::as_str)
            .filter(|id| id.parse::<u32>().is_ok())
            .collect();
        if !indexes.is_empty() && (task.is_magnet || task.torrent.is_some()) {
            task.options
                .insert("select-file".to_string(), json!(indexes.join(",")));
        }

        self.submit(task).await
    }

    /// Persists a new task, hands it to aria2 and announces it.
    async fn submit(&self, mut task: Task) -> ServiceResult<Task> {
        if !task.destination.is_empty() {
            task.upload_status = UploadStatus::Pending;
        }
        self.db.save_task(&task).await?;
        self.db.increment_total_tasks().await?;

        if let Err(err) = self.offloader.requeue(&task).await {
            let message = err.message();
            self.db.update_error(&task.id, &message).await?;
            return Err(ServiceError::Internal(anyhow!(
                "failed adding download to aria2: {message}"
            )));
        }
        self.apply_position(&task.id, task.priority).await;

        info!(
            "download {} created{}",
            task.id,
            if task.destination.is_empty() {
                String::new()
            } else {
                format!(" for {}", task.destination)
            }
        );
        self.events.lifecycle(
            EventType::DownloadCreated,
            &task.id,
            serde_json::to_value(&task).unwrap_or(Value::Null),
        );
        Ok(task)
    }

    pub async fn list(
        &self,
        statuses: &[DownloadStatus],
        limit: i64,
        offset: i64,
    ) -> ServiceResult<(Vec<Task>, i64)> {
        let (mut tasks, total) = self.db.list_tasks(statuses, limit, offset).await?;
        if tasks.iter().any(|t| t.status == DownloadStatus::Active) {
            match self.aria2.tell_active(&[]).await {
                Ok(active) => {
                    let live: HashMap<&str, &Aria2Task> =
                        active.iter().map(|t| (t.gid.as_str(), t)).collect();
                    for task in tasks.iter_mut() {
                        if let Some(status) = live.get(task.id.as_str()) {
                            overlay_live(task, status);
                        }
                    }
                }
                Err(err) => debug!("live stats unavailable: {err}"),
            }
        }
        Ok((tasks, total))
    }

    pub async fn get(&self, id: &str) -> ServiceResult<Task> {
        let mut task = self.task(id).await?;
        if task.status.is_downloading() {
            if let Ok(live) = self.aria2.tell_status(id, &[]).await {
                overlay_live(&mut task, &live);
                task.files = download_files(&live);
            }
        }
        Ok(task)
    }

    pub async fn update(&self, id: &str, req: UpdateDownloadRequest) -> ServiceResult<Task> {
        let mut task = self.task(id).await?;
        if (req.filename.is_some() || req.destination.is_some())
            && task.status == DownloadStatus::Active
        {
            return Err(ServiceError::InvalidOperation(
                "cannot change filename or destination while downloading".to_string(),
            ));
        }

        if let Some(name) = req.filename.as_deref() {
            if !is_safe_filename(name) {
                return Err(ServiceError::Validation("invalid filename".to_string()));
            }
            task.name = name.trim().to_string();
            let mut change = JsonMap::new();
            change.insert("out".to_string(), Value::String(task.name.clone()));
            task.options.extend(change.clone());
            if task.status.is_downloading() {
                if let Err(err) = self.aria2.change_option(id, &change).await {
                    debug!("aria2 kept the old name for {id}: {err}");
                }
            }
        }
        if let Some(destination) = req.destination.as_deref() {
            let (dir, remote) = split_destination(destination, &task.dir);
            if remote.is_empty() {
                task.dir = dir;
            }
            task.destination = remote;
            task.upload_status = if task.destination.is_empty() {
                UploadStatus::Idle
            } else {
                UploadStatus::Pending
            };
        }
        if let Some(max_retries) = req.max_retries {
            if max_retries < 0 {
                return Err(ServiceError::Validation(
                    "maxRetries must not be negative".to_string(),
                ));
            }
            task.max_retries = max_retries;
        }
        if let Some(priority) = req.priority {
            if !(1..=10).contains(&priority) {
                return Err(ServiceError::Validation(
                    "priority must be between 1 and 10".to_string(),
                ));
            }
            task.priority = priority;
        }

        self.db.save_task(&task).await?;
        if req.priority.is_some() {
            self.apply_position(id, task.priority).await;
        }
        Ok(task)
    }

    pub async fn pause(&self, id: &str) -> ServiceResult<Task> {
        let task = self.task(id).await?;
        if !task.status.can_transition_to(DownloadStatus::Paused) {
            return Err(transition_error(&task, DownloadStatus::Paused));
        }
        if let Err(err) = self.aria2.force_pause(id).await {
            warn!("aria2 refused to pause {id}: {err}");
        }
        self.db.update_status(id, DownloadStatus::Paused).await?;
        self.events
            .lifecycle(EventType::DownloadPaused, id, json!({ "id": id }));
        self.task(id).await
    }

    pub async fn resume(&self, id: &str) -> ServiceResult<Task> {
        let task = self.task(id).await?;
        if task.status != DownloadStatus::Paused {
            return Err(transition_error(&task, DownloadStatus::Waiting));
        }
        if let Err(err) = self.aria2.unpause(id).await {
            debug!("aria2 lost {id} ({err}), submitting it again");
            self.offloader.requeue(&task).await?;
        }
        self.db.update_status(id, DownloadStatus::Waiting).await?;
        self.events
            .lifecycle(EventType::DownloadResumed, id, json!({ "id": id }));
        self.task(id).await
    }

    pub async fn retry(&self, id: &str) -> ServiceResult<Task> {
        let task = self.task(id).await?;
        if !matches!(task.status, DownloadStatus::Error | DownloadStatus::Complete) {
            return Err(ServiceError::InvalidTransition(format!(
                "cannot retry download in status {}",
                task.status.as_str()
            )));
        }
        self.db.reset_for_retry(id).await?;
        if let Err(err) = self.aria2.remove_download_result(id).await {
            debug!("no aria2 result to clear for {id}: {err}");
        }
        if let Err(err) = self.offloader.requeue(&task).await {
            let message = err.message();
            self.db.update_error(id, &message).await?;
            return Err(ServiceError::Internal(anyhow!("retry failed: {message}")));
        }
        info!("download {id} retried");
        self.events
            .lifecycle(EventType::DownloadStarted, id, json!({ "id": id }));
        self.task(id).await
    }

    pub async fn delete(&self, id: &str, delete_files: bool) -> ServiceResult<()> {
        let task = self.task(id).await?;
        if task.status.is_downloading() {
            if let Err(err) = self.aria2.force_remove(id).await {
                debug!("aria2 had nothing to remove for {id}: {err}");
            }
        }
        if let Err(err) = self.aria2.remove_download_result(id).await {
            debug!("no aria2 result to clear for {id}: {err}");
        }
        self.offloader.stop_upload(&task).await;

        if delete_files {
            self.remove_local_files(&task).await;
        }
        self.db.delete_task(id).await?;
        info!("download {id} deleted");
        Ok(())
    }

    /// Removes what the task wrote under its dir, plus the aria2 control file.
    async fn remove_local_files(&self, task: &Task) {
        let path = if task.file_path.is_empty() {
            if task.name.is_empty() {
                return;
            }
            Path::new(&task.dir)
                .join(&task.name)
                .to_string_lossy()
                .into_owned()
        } else {
            task.file_path.clone()
        };
        let target = match upload_plan(&task.dir, &path, "") {
            UploadPlan::Folder { src_fs, .. } => PathBuf::from(src_fs),
            UploadPlan::File { src_fs, name, .. } => Path::new(&src_fs).join(name),
        };
        if target.as_os_str().len() <= 5 || target == Path::new(&task.dir) {
            warn!("refusing to delete {}", target.display());
            return;
        }

        let result = match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await,
            Ok(_) => tokio::fs::remove_file(&target).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => info!("removed {}", target.display()),
            Err(err) => debug!("could not remove {}: {err}", target.display()),
        }
        let mut control = target.into_os_string();
        control.push(".aria2");
        let _ = tokio::fs::remove_file(&control).await;
    }

    pub async fn update_priority(&self, id: &str, priority: i32) -> ServiceResult<Task> {
        if !(1..=10).contains(&priority) {
            return Err(ServiceError::Validation(
                "priority must be between 1 and 10".to_string(),
            ));
        }
        let mut task = self.task(id).await?;
        task.priority = priority;
        self.db.save_task(&task).await?;
        self.apply_position(id, priority).await;
        Ok(task)
    }

    /// High priorities jump the aria2 queue, low ones go to its end.
    async fn apply_position(&self, id: &str, priority: i32) {
        let (pos, how) = match priority {
            p if p >= 8 => (0, "POS_SET"),
            p if p <= 3 => (0, "POS_END"),
            _ => return,
        };
        if let Err(err) = self.aria2.change_position(id, pos, how).await {
            debug!("could not reposition {id}: {err}");
        }
    }

    pub async fn batch(&self, req: BatchRequest) -> ServiceResult<BatchOutcome> {
        if !BATCH_ACTIONS.contains(&req.action.as_str()) {
            return Err(ServiceError::Validation(format!(
                "unknown batch action {}",
                req.action
            )));
        }
        let mut outcome = BatchOutcome::default();
        for id in req.ids {
            let result = match req.action.as_str() {
                "pause" => self.pause(&id).await.map(|_| ()),
                "resume" => self.resume(&id).await.map(|_| ()),
                "retry" => self.retry(&id).await.map(|_| ()),
                _ => self.delete(&id, false).await,
            };
            match result {
                Ok(()) => outcome.succeeded.push(id),
                Err(err) => outcome.failed.push(BatchFailure {
                    id,
                    error: err.to_string(),
                }),
            }
        }
        Ok(outcome)
    }

    /// Cached debrid listing when a provider has the magnet, otherwise the
    /// torrent metadata fetched through aria2.
    pub async fn check_magnet(&self, magnet: &str) -> ServiceResult<MagnetInfo> {
        if !is_magnet(magnet) {
            return Err(ServiceError::Validation("invalid magnet link".to_string()));
        }
        if let Some(info) = self.cached_magnet(magnet).await {
            return Ok(info);
        }
        let timeout = Duration::from_secs(self.settings().await?.download.connect_timeout.max(1) as u64);
        let meta = self.fetch_magnet_metadata(magnet, timeout).await?;
        Ok(magnet_info_from_meta(meta))
    }

    pub async fn check_torrent(&self, encoded: &str) -> ServiceResult<MagnetInfo> {
        let meta = decode_torrent(encoded)?;
        let magnet = format!("magnet:?xt=urn:btih:{}", meta.info_hash);
        if let Some(info) = self.cached_magnet(&magnet).await {
            return Ok(info);
        }
        Ok(magnet_info_from_meta(meta))
    }

    async fn cached_magnet(&self, magnet: &str) -> Option<MagnetInfo> {
        for provider in self.providers.magnet_providers() {
            match provider.check_magnet(magnet).await {
                Ok(Some(mut info)) if info.cached => {
                    if info.hash.is_empty() {
                        info.hash = extract_hash_from_magnet(magnet);
                    }
                    return Some(info);
                }
                Ok(_) => {}
                Err(err) => warn!("{} magnet check failed: {err}", provider.name()),
            }
        }
        None
    }

    async fn fetch_magnet_metadata(
        &self,
        magnet: &str,
        timeout: Duration,
    ) -> ServiceResult<TorrentMeta> {
        tokio::fs::create_dir_all(&self.metadata_dir)
            .await
            .with_context(|| format!("failed creating {}", self.metadata_dir.display()))?;
        let gid = generate_gid();
        let mut options = JsonMap::new();
        for (key, value) in [
            ("gid", gid.clone()),
            ("dir", self.metadata_dir.to_string_lossy().into_owned()),
            ("bt-metadata-only", "true".to_string()),
            ("bt-save-metadata", "true".to_string()),
            ("follow-torrent", "false".to_string()),
        ] {
            options.insert(key.to_string(), Value::String(value));
        }
        self.aria2.add_uri(&[magnet.to_string()], &options).await?;
        debug!("fetching magnet metadata under {gid}");

        let result = self.await_metadata(&gid, magnet, timeout).await;
        if let Err(err) = self.aria2.force_remove(&gid).await {
            debug!("metadata task {gid} already gone: {err}");
        }
        if let Err(err) = self.aria2.remove_download_result(&gid).await {
            debug!("no result to clear for {gid}: {err}");
        }
        result
    }

    async fn await_metadata(
        &self,
        gid: &str,
        magnet: &str,
        timeout: Duration,
    ) -> ServiceResult<TorrentMeta> {
        let deadline = Instant::now() + timeout;
        let hash = loop {
            let status = self
                .aria2
                .tell_status(gid, &["status", "infoHash", "errorCode", "errorMessage"])
                .await?;
            match status.status.as_str() {
                "complete" => break status.info_hash,
                "error" | "removed" => {
                    return Err(ServiceError::Internal(anyhow!(
                        "metadata fetch failed: {}",
                        status.error_text()
                    )));
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(ServiceError::Internal(anyhow!(
                    "timed out fetching magnet metadata"
                )));
            }
            tokio::time::sleep(METADATA_POLL).await;
        };

        let hash = if hash.is_empty() {
            magnet_info_hash(magnet).unwrap_or_default()
        } else {
            hash.to_ascii_lowercase()
        };
        let path = self.metadata_dir.join(format!("{hash}.torrent"));
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed reading {}", path.display()))?;
        let _ = tokio::fs::remove_file(&path).await;
        Ok(parse_torrent(&bytes)?)
    }

    /// Starts the files picked from a magnet listing. Debrid sources get one
    /// task per unlocked link; aria2 downloads the torrent itself with
    /// `select-file`.
    pub async fn download_magnet(&self, req: MagnetDownloadRequest) -> ServiceResult<Vec<Task>> {
        if req.magnet.is_empty() && req.torrent.as_deref().is_none_or(str::is_empty) {
            return Err(ServiceError::Validation(
                "magnet or torrent is required".to_string(),
            ));
        }
        if req.selected_files.is_empty() {
            return Err(ServiceError::Validation("no files selected".to_string()));
        }
        let settings = self.settings().await?;
        let (dir, destination) = self.placement(req.destination.as_deref(), None, &settings);
        let hash = magnet_info_hash(&req.magnet).unwrap_or_default();

        if let Some(unknown) = req
            .selected_files
            .iter()
            .find(|id| find_file(&req.files, id).is_none())
        {
            return Err(ServiceError::Validation(format!("unknown file {unknown}")));
        }
        // Picking a folder picks everything under it.
        let mut selected = HashSet::new();
        for id in &req.selected_files {
            set_selected(&req.files, &mut selected, id, true);
        }
        let leaves: Vec<&MagnetFile> = flatten(&req.files)
            .into_iter()
            .filter(|f| selected.contains(&f.id))
            .collect();

        let source = req.source.as_str();
        if !source.is_empty() && source != "aria2" {
            let provider = self
                .providers
                .get(source)
                .filter(|p| p.supports_magnets())
                .ok_or_else(|| ServiceError::Validation(format!("unknown magnet source {source}")))?;

            let mut created = Vec::new();
            let mut last_error = None;
            for file in &leaves {
                if file.link.is_empty() {
                    continue;
                }
                let resolved = match self.providers.resolve(&file.link, &Headers::new()).await {
                    Ok((resolved, _)) => resolved,
                    Err(ProviderError::NoProvider) => ResolveResult {
                        url: file.link.clone(),
                        ..ResolveResult::default()
                    },
                    Err(err) => {
                        warn!("could not unlock {}: {err}", file.name);
                        last_error = Some(ServiceError::from(err));
                        continue;
                    }
                };

                let mut task = Task::new(generate_gid());
                task.url = file.link.clone();
                task.resolved_url = resolved.url.clone();
                task.uris = vec![resolved.url];
                task.provider = provider.name().to_string();
                task.name = file.name.clone();
                task.size = file.size;
                task.dir = dir.clone();
                task.destination = destination.clone();
                task.is_magnet = true;
                task.magnet_hash = hash.clone();
                let out = if file.path.is_empty() { &file.name } else { &file.path };
                task.options
                    .insert("out".to_string(), Value::String(out.clone()));
                match self.submit(task).await {
                    Ok(task) => created.push(task),
                    Err(err) => last_error = Some(err),
                }
            }
            if created.is_empty() {
                return Err(last_error.unwrap_or_else(|| {
                    ServiceError::Validation("selected files have no download links".to_string())
                }));
            }
            return Ok(created);
        }

        let mut indexes: Vec<i64> = leaves
            .iter()
            .filter(|f| f.index > 0)
            .map(|f| f.index)
            .collect();
        indexes.sort_unstable();
        indexes.dedup();
        if indexes.is_empty() {
            return Err(ServiceError::Validation("no files selected".to_string()));
        }

        let mut task = Task::new(generate_gid());
        task.dir = dir;
        task.destination = destination;
        task.is_magnet = true;
        task.magnet_hash = hash;
        task.name = if req.name.is_empty() {
            magnet_display_name(&req.magnet).unwrap_or_default()
        } else {
            req.name.clone()
        };
        task.size = selected_size(&req.files, &selected);
        task.selected_files = leaves.iter().map(|f| f.id.clone()).collect();
        // A full selection downloads the whole torrent.
        let everything = all_file_ids(&req.files)
            .iter()
            .all(|id| selected.contains(id));
        if !everything {
            let selection: Vec<String> = indexes.iter().map(i64::to_string).collect();
            task.options
                .insert("select-file".to_string(), json!(selection.join(",")));
        }
        match req.torrent.filter(|t| !t.is_empty()) {
            Some(torrent) => task.torrent = Some(torrent),
            None => {
                task.url = req.magnet.clone();
                task.uris = vec![req.magnet];
            }
        }
        Ok(vec![self.submit(task).await?])
    }

    pub async fn stats(&self) -> ServiceResult<Stats> {
        let mut stats = Stats::default();
        match self.aria2.get_global_stat().await {
            Ok(global) => {
                stats.active = ActiveStats {
                    downloads: parse_num(&global.num_active),
                    download_speed: parse_num(&global.download_speed),
                    ..ActiveStats::default()
                };
                stats.queue.pending = parse_num(&global.num_waiting);
            }
            Err(err) => debug!("aria2 stats unavailable: {err}"),
        }
        stats.active.uploads = self.db.uploading_count().await?;
        if stats.active.uploads > 0 {
            match self.rclone.stats().await {
                Ok(transfer) => stats.active.upload_speed = transfer.speed,
                Err(err) => debug!("rclone stats unavailable: {err}"),
            }
        }
        let counts = self.db.count_by_status().await?;
        stats.queue.paused = counts.get(&DownloadStatus::Paused).copied().unwrap_or(0);
        let totals = self.db.global_stats().await?;
        stats.totals = TotalStats {
            total_downloaded: totals.total_downloaded,
            total_uploaded: totals.total_uploaded,
            tasks_finished: totals.completed_tasks,
            tasks_failed: totals.failed_tasks,
        };
        Ok(stats)
    }

    pub async fn settings(&self) -> ServiceResult<Settings> {
        Ok(self
            .db
            .get_settings()
            .await?
            .unwrap_or_else(|| Settings::with_download_dir(self.download_dir.clone())))
    }

    /// Merges a partial settings document, persists it and pushes the aria2
    /// side to the running daemon.
    pub async fn update_settings(&self, patch: Value) -> ServiceResult<Settings> {
        if !patch.is_object() {
            return Err(ServiceError::Validation(
                "settings must be a JSON object".to_string(),
            ));
        }
        let current = self.settings().await?;
        let mut doc = serde_json::to_value(&current).context("failed encoding settings")?;
        merge_json(&mut doc, patch);
        let updated: Settings = serde_json::from_value(doc)
            .map_err(|err| ServiceError::Validation(format!("invalid settings: {err}")))?;
        self.store_settings(updated).await
    }

    pub async fn reset_settings(&self) -> ServiceResult<Settings> {
        self.store_settings(Settings::with_download_dir(self.download_dir.clone()))
            .await
    }

    async fn store_settings(&self, settings: Settings) -> ServiceResult<Settings> {
        self.db.put_settings(&settings).await?;
        self.apply_settings(&settings).await;
        self.events.lifecycle(
            EventType::SettingsUpdated,
            "settings",
            serde_json::to_value(&settings).unwrap_or(Value::Null),
        );
        Ok(settings)
    }

    pub async fn apply_settings(&self, settings: &Settings) {
        let mut options = settings.aria2_options();
        for key in STARTUP_ONLY_OPTIONS {
            options.remove(*key);
        }
        if let Err(err) = self.aria2.change_global_option(&options).await {
            warn!("failed to apply settings to aria2: {err}");
        }
    }

    pub async fn remotes(&self) -> ServiceResult<Vec<Remote>> {
        Ok(self.rclone.list_remotes().await?)
    }

    pub async fn create_remote(
        &self,
        name: &str,
        kind: &str,
        parameters: &JsonMap<String, Value>,
    ) -> ServiceResult<()> {
        if name.trim().is_empty() || kind.trim().is_empty() {
            return Err(ServiceError::Validation(
                "remote name and type are required".to_string(),
            ));
        }
        self.rclone.create_remote(name.trim(), kind.trim(), parameters).await?;
        info!("remote {name} created");
        Ok(())
    }

    pub async fn delete_remote(&self, name: &str) -> ServiceResult<()> {
        self.rclone.delete_remote(name).await?;
        info!("remote {name} deleted");
        Ok(())
    }

    pub async fn test_remote(&self, name: &str) -> ServiceResult<()> {
        Ok(self.rclone.test_remote(name).await?)
    }

    pub async fn list_files(&self, path: &str) -> ServiceResult<Vec<FileInfo>> {
        Ok(self.rclone.list(path).await?)
    }

    pub async fn make_dir(&self, path: &str) -> ServiceResult<()> {
        Ok(self.rclone.mkdir(path).await?)
    }

    pub async fn delete_path(&self, path: &str) -> ServiceResult<()> {
        Ok(self.rclone.delete(path).await?)
    }

    /// `copy` and `move` run as rclone jobs and return the job id; `rename`
    /// takes the new name in `dst`.
    pub async fn file_operation(&self, op: &str, src: &str, dst: &str) -> ServiceResult<Option<i64>> {
        if src.is_empty() || dst.is_empty() {
            return Err(ServiceError::Validation(
                "src and dst are required".to_string(),
            ));
        }
        match op {
            "copy" => Ok(Some(self.rclone.copy(src, dst).await?)),
            "move" => Ok(Some(self.rclone.move_path(src, dst).await?)),
            "rename" => {
                self.rclone.rename(src, dst).await?;
                Ok(None)
            }
            other => Err(ServiceError::Validation(format!(
                "unknown file operation {other}"
            ))),
        }
    }

    /// Applies every stored provider record to the registry.
    /// Restores stored provider records. Providers without one are
    /// configured with their defaults.
    pub async fn load_providers(&self) -> ServiceResult<()> {
        let records = self.db.list_providers().await?;
        for record in &records {
            if let Err(err) = self.providers.apply_record(record).await {
                warn!("provider {} not restored: {err}", record.name);
            }
        }
        for name in self.providers.names() {
            if records.iter().any(|r| r.name == name) {
                continue;
            }
            if let Err(err) = self.providers.reset(name).await {
                warn!("provider {name} not initialised: {err}");
            }
        }
        Ok(())
    }

    pub async fn providers(&self) -> ServiceResult<Vec<ProviderSummary>> {
        let records: HashMap<String, ProviderRecord> = self
            .db
            .list_providers()
            .await?
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();
        Ok(self
            .providers
            .summaries()
            .into_iter()
            .map(|mut summary| {
                if let Some(record) = records.get(&summary.name) {
                    summary.config = mask_config(record, &summary);
                    summary.account = record.cached_account.clone();
                }
                summary
            })
            .collect())
    }

    pub async fn provider(&self, name: &str) -> ServiceResult<ProviderSummary> {
        let mut summary = self
            .providers
            .summary(name)
            .ok_or_else(|| ServiceError::NotFound(format!("provider {name} not found")))?;
        if let Some(record) = self.db.get_provider(name).await? {
            summary.config = mask_config(&record, &summary);
            summary.account = record.cached_account;
        }
        Ok(summary)
    }

    /// Masked values sent back by the dashboard keep the stored secret;
    /// empty values clear the key.
    pub async fn configure_provider(
        &self,
        name: &str,
        enabled: Option<bool>,
        priority: Option<i32>,
        config: BTreeMap<String, String>,
    ) -> ServiceResult<ProviderSummary> {
        if self.providers.get(name).is_none() {
            return Err(ServiceError::NotFound(format!("provider {name} not found")));
        }
        let mut record = self
            .db
            .get_provider(name)
            .await?
            .unwrap_or_else(|| ProviderRecord {
                name: name.to_string(),
                enabled: true,
                priority: 0,
                config: BTreeMap::new(),
                cached_hosts: Vec::new(),
                cached_account: None,
                updated_at: chrono::Utc::now(),
            });
        if let Some(enabled) = enabled {
            record.enabled = enabled;
        }
        if let Some(priority) = priority {
            record.priority = priority;
        }
        for (key, value) in config {
            if value == SECRET_MASK {
                continue;
            }
            if value.trim().is_empty() {
                record.config.remove(&key);
            } else {
                record.config.insert(key, value.trim().to_string());
            }
        }
        record.updated_at = chrono::Utc::now();

        self.providers.apply_record(&record).await?;
        self.db.put_provider(&record).await?;
        info!("provider {name} configured");
        self.provider(name).await
    }

    pub async fn delete_provider(&self, name: &str) -> ServiceResult<()> {
        self.providers.reset(name).await?;
        self.db.delete_provider(name).await?;
        info!("provider {name} reset");
        Ok(())
    }

    /// Live account check; the answer is cached on the stored record.
    pub async fn provider_status(&self, name: &str) -> ServiceResult<AccountInfo> {
        let account = self.providers.test(name).await?;
        if let Some(mut record) = self.db.get_provider(name).await? {
            record.cached_account = Some(account.clone());
            record.updated_at = chrono::Utc::now();
            self.db.put_provider(&record).await?;
        }
        Ok(account)
    }

    pub async fn provider_hosts(&self, name: &str) -> ServiceResult<Vec<String>> {
        let provider = self
            .providers
            .get(name)
            .ok_or_else(|| ServiceError::NotFound(format!("provider {name} not found")))?;
        let hosts = provider.hosts().await?;
        if !hosts.is_empty() {
            if let Some(mut record) = self.db.get_provider(name).await? {
                record.cached_hosts = hosts.clone();
                self.db.put_provider(&record).await?;
            }
        }
        Ok(hosts)
    }

    pub async fn resolve_url(
        &self,
        url: &str,
        headers: &Headers,
    ) -> ServiceResult<(ResolveResult, String)> {
        if url.trim().is_empty() {
            return Err(ServiceError::Validation("url is required".to_string()));
        }
        Ok(self.providers.resolve(url.trim(), headers).await?)
    }

    pub async fn version(&self) -> VersionInfo {
        let aria2 = self.aria2.get_version().await.ok().map(|v| v.version);
        let rclone = self.rclone.version().await.ok();
        VersionInfo {
            version: env!("CARGO_PKG_VERSION"),
            build: option_env!("BUILD_HASH").unwrap_or("unknown").to_string(),
            aria2,
            rclone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutil::{FakeAria2, FakeRclone, temp_db};

    struct Harness {
        _dir: tempfile::TempDir,
        work: tempfile::TempDir,
        aria2: FakeAria2,
        rclone: FakeRclone,
        db: TaskDb,
        events: EventBus,
        service: DownloadService,
    }

    async fn harness() -> Harness {
        let (dir, db) = temp_db().await;
        let work = tempfile::tempdir().expect("workdir");
        let aria2 = FakeAria2::start().await;
        let rclone = FakeRclone::start().await;
        let client = Arc::new(Aria2Client::new(aria2.url.clone(), ""));
        let rc = RcloneClient::new(rclone.url.clone());
        let events = EventBus::new(64);
        let offloader = Arc::new(Offloader::new(
            client.clone(),
            rc.clone(),
            db.clone(),
            events.clone(),
        ));
        let service = DownloadService::new(
            client,
            rc,
            db.clone(),
            events.clone(),
            Arc::new(ProviderRegistry::new()),
            offloader,
            work.path().join("downloads").to_string_lossy().into_owned(),
            work.path().join("metadata"),
        );
        Harness {
            _dir: dir,
            work,
            aria2,
            rclone,
            db,
            events,
            service,
        }
    }

    fn request(url: &str) -> CreateDownloadRequest {
        CreateDownloadRequest {
            url: Some(url.to_string()),
            ..CreateDownloadRequest::default()
        }
    }

    #[test]
    fn destinations_split_into_local_dir_and_remote() {
        assert_eq!(
            split_destination("", "/dl"),
            ("/dl".to_string(), String::new())
        );
        assert_eq!(
            split_destination("gdrive:/movies", "/dl"),
            ("/dl".to_string(), "gdrive:/movies".to_string())
        );
        assert_eq!(
            split_destination("/srv/media", "/dl"),
            ("/srv/media".to_string(), String::new())
        );
        assert_eq!(
            split_destination("tv", "/dl"),
            ("/dl/tv".to_string(), String::new())
        );
    }

    #[test]
    fn merge_replaces_leaves_and_keeps_siblings() {
        let mut base = json!({ "a": { "x": 1, "y": 2 }, "b": [1] });
        merge_json(&mut base, json!({ "a": { "y": 3 }, "b": [2, 3] }));
        assert_eq!(base, json!({ "a": { "x": 1, "y": 3 }, "b": [2, 3] }));
    }

    #[tokio::test]
    async fn create_hands_url_to_aria2_and_records_task() {
        let h = harness().await;
        let mut events = h.events.subscribe();
        let mut req = request("https://example.com/file.iso");
        req.destination = Some("gdrive:/iso".to_string());
        req.filename = Some("renamed.iso".to_string());
        req.headers
            .insert("Cookie".to_string(), "session=1".to_string());

        let task = h.service.create(req).await.expect("create");
        assert_eq!(task.destination, "gdrive:/iso");
        assert_eq!(task.upload_status, UploadStatus::Pending);

        let calls = h.aria2.calls_to("aria2.addUri");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], json!(["https://example.com/file.iso"]));
        let options = &calls[0][1];
        assert_eq!(options["gid"], json!(task.id));
        assert_eq!(options["out"], json!("renamed.iso"));
        assert_eq!(options["header"], json!(["Cookie: session=1"]));
        assert!(
            options["dir"]
                .as_str()
                .is_some_and(|d| d.ends_with("downloads"))
        );

        let stored = h.db.get_task(&task.id).await.unwrap().expect("stored");
        assert_eq!(stored.status, DownloadStatus::Waiting);
        assert_eq!(h.db.global_stats().await.unwrap().total_tasks, 1);
        let event = events.rx.recv().await.expect("event");
        assert_eq!(event.event_type(), EventType::DownloadCreated);
    }

    #[tokio::test]
    async fn create_rejects_empty_requests() {
        let h = harness().await;
        let err = h
            .service
            .create(CreateDownloadRequest::default())
            .await
            .expect_err("must fail");
        assert_eq!(err.code(), "VALIDATION_FAILED");
        assert!(h.aria2.calls().is_empty());
    }

    #[tokio::test]
    async fn aria2_rejection_marks_the_task_failed() {
        let h = harness().await;
        h.aria2.fail("aria2.addUri", 1, "bad uri");
        let err = h
            .service
            .create(request("https://example.com/x"))
            .await
            .expect_err("must fail");
        assert_eq!(err.code(), "INTERNAL_ERROR");
        let (tasks, _) = h.db.list_tasks(&[], 10, 0).await.unwrap();
        assert_eq!(tasks[0].status, DownloadStatus::Error);
        assert_eq!(tasks[0].error, "bad uri");
    }

    #[tokio::test]
    async fn pause_and_resume_follow_the_state_machine() {
        let h = harness().await;
        let task = h
            .service
            .create(request("https://example.com/a"))
            .await
            .unwrap();

        let paused = h.service.pause(&task.id).await.expect("pause");
        assert_eq!(paused.status, DownloadStatus::Paused);
        assert_eq!(h.aria2.calls_to("aria2.forcePause").len(), 1);

        let err = h.service.pause(&task.id).await.expect_err("already paused");
        assert_eq!(err.code(), "INVALID_TRANSITION");

        let resumed = h.service.resume(&task.id).await.expect("resume");
        assert_eq!(resumed.status, DownloadStatus::Waiting);
        assert_eq!(h.aria2.calls_to("aria2.unpause").len(), 1);

        let err = h.service.pause("missing").await.expect_err("missing");
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn resume_resubmits_when_aria2_forgot_the_task() {
        let h = harness().await;
        let task = h
            .service
            .create(request("https://example.com/a"))
            .await
            .unwrap();
        h.service.pause(&task.id).await.unwrap();
        h.aria2.fail("aria2.unpause", 1, "GID not found");

        h.service.resume(&task.id).await.expect("resume");
        assert_eq!(h.aria2.calls_to("aria2.addUri").len(), 2);
    }

    #[tokio::test]
    async fn retry_only_applies_to_finished_tasks() {
        let h = harness().await;
        let task = h
            .service
            .create(request("https://example.com/a"))
            .await
            .unwrap();
        let err = h.service.retry(&task.id).await.expect_err("waiting");
        assert_eq!(err.code(), "INVALID_TRANSITION");

        h.db.update_error(&task.id, "boom").await.unwrap();
        let retried = h.service.retry(&task.id).await.expect("retry");
        assert_eq!(retried.status, DownloadStatus::Waiting);
        assert!(retried.error.is_empty());
        assert_eq!(h.aria2.calls_to("aria2.removeDownloadResult").len(), 1);
        assert_eq!(h.aria2.calls_to("aria2.addUri").len(), 2);
    }

    #[tokio::test]
    async fn delete_with_files_removes_download_and_control_file() {
        let h = harness().await;
        let dir = h.work.path().join("downloads");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let file = dir.join("movie.mkv");
        tokio::fs::write(&file, b"data").await.unwrap();
        tokio::fs::write(dir.join("movie.mkv.aria2"), b"ctl").await.unwrap();

        let mut task = Task::new("00000000000000aa");
        task.dir = dir.to_string_lossy().into_owned();
        task.file_path = file.to_string_lossy().into_owned();
        task.status = DownloadStatus::Error;
        h.db.save_task(&task).await.unwrap();

        h.service.delete(&task.id, true).await.expect("delete");
        assert!(!file.exists());
        assert!(!dir.join("movie.mkv.aria2").exists());
        assert!(dir.exists());
        assert!(h.db.get_task(&task.id).await.unwrap().is_none());
        assert!(h.aria2.calls_to("aria2.forceRemove").is_empty());
    }

    #[tokio::test]
    async fn priority_moves_the_aria2_queue_position() {
        let h = harness().await;
        let task = h
            .service
            .create(request("https://example.com/a"))
            .await
            .unwrap();

        let updated = h.service.update_priority(&task.id, 9).await.expect("priority");
        assert_eq!(updated.priority, 9);
        assert_eq!(
            h.aria2.calls_to("aria2.changePosition"),
            vec![json!([task.id, 0, "POS_SET"])]
        );

        let err = h
            .service
            .update_priority(&task.id, 11)
            .await
            .expect_err("out of range");
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn update_refuses_renames_while_active() {
        let h = harness().await;
        let task = h
            .service
            .create(request("https://example.com/a"))
            .await
            .unwrap();
        h.db.update_status(&task.id, DownloadStatus::Active).await.unwrap();

        let err = h
            .service
            .update(
                &task.id,
                UpdateDownloadRequest {
                    filename: Some("b".to_string()),
                    ..UpdateDownloadRequest::default()
                },
            )
            .await
            .expect_err("active");
        assert_eq!(err.code(), "INVALID_OPERATION");

        let updated = h
            .service
            .update(
                &task.id,
                UpdateDownloadRequest {
                    max_retries: Some(7),
                    ..UpdateDownloadRequest::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.max_retries, 7);
    }

    #[tokio::test]
    async fn batch_collects_failures_per_id() {
        let h = harness().await;
        let task = h
            .service
            .create(request("https://example.com/a"))
            .await
            .unwrap();

        let outcome = h
            .service
            .batch(BatchRequest {
                ids: vec![task.id.clone(), "missing".to_string()],
                action: "pause".to_string(),
            })
            .await
            .expect("batch");
        assert_eq!(outcome.succeeded, vec![task.id.clone()]);
        assert_eq!(outcome.failed[0].id, "missing");

        let err = h
            .service
            .batch(BatchRequest {
                ids: vec![task.id],
                action: "explode".to_string(),
            })
            .await
            .expect_err("unknown action");
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn settings_merge_and_skip_startup_only_options() {
        let h = harness().await;
        let mut events = h.events.subscribe();
        let updated = h
            .service
            .update_settings(json!({ "download": { "maxConcurrentDownloads": 7 } }))
            .await
            .expect("update");
        assert_eq!(updated.download.max_concurrent_downloads, 7);
        assert_eq!(updated.download.split, 8);
        assert_eq!(h.service.settings().await.unwrap(), updated);

        let calls = h.aria2.calls_to("aria2.changeGlobalOption");
        assert_eq!(calls[0][0]["max-concurrent-downloads"], json!("7"));
        assert!(calls[0][0].get("listen-port").is_none());
        let event = events.rx.recv().await.expect("event");
        assert_eq!(event.event_type(), EventType::SettingsUpdated);

        let reset = h.service.reset_settings().await.expect("reset");
        assert_eq!(reset.download.max_concurrent_downloads, 3);

        let err = h
            .service
            .update_settings(json!({ "download": { "split": "many" } }))
            .await
            .expect_err("bad type");
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn magnet_metadata_comes_from_aria2() {
        let h = harness().await;
        let hash = "0123456789abcdef0123456789abcdef01234567";
        let metadata = h.work.path().join("metadata");
        tokio::fs::create_dir_all(&metadata).await.unwrap();
        let torrent = b"d4:infod5:filesld6:lengthi10e4:pathl5:a.txteed6:lengthi5e4:pathl5:b.txteee4:name4:packee";
        tokio::fs::write(metadata.join(format!("{hash}.torrent")), torrent)
            .await
            .unwrap();
        h.aria2
            .reply("aria2.tellStatus", json!({ "status": "complete", "infoHash": hash }));

        let info = h
            .service
            .check_magnet(&format!("magnet:?xt=urn:btih:{hash}"))
            .await
            .expect("metadata");
        assert_eq!(info.source, "aria2");
        assert_eq!(info.name, "pack");
        assert_eq!(info.size, 15);
        assert!(!info.files.is_empty());

        let added = h.aria2.calls_to("aria2.addUri");
        assert_eq!(added[0][1]["bt-metadata-only"], json!("true"));
        assert_eq!(h.aria2.calls_to("aria2.forceRemove").len(), 1);
        assert!(!metadata.join(format!("{hash}.torrent")).exists());

        let err = h
            .service
            .check_magnet("https://example.com")
            .await
            .expect_err("not a magnet");
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn torrent_check_decodes_base64() {
        let h = harness().await;
        let torrent = STANDARD.encode(
            b"d4:infod6:lengthi1024e4:name8:file.iso12:piece lengthi16384e6:pieces0:ee",
        );
        let info = h.service.check_torrent(&torrent).await.expect("torrent");
        assert_eq!(info.name, "file.iso");
        assert_eq!(info.hash.len(), 40);

        let err = h
            .service
            .check_torrent("!!not base64!!")
            .await
            .expect_err("invalid");
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn magnet_download_selects_file_indexes() {
        let h = harness().await;
        let file = |id: &str, index: i64, size: i64| MagnetFile {
            id: id.to_string(),
            name: format!("{id}.mkv"),
            path: format!("show/{id}.mkv"),
            size,
            index,
            ..MagnetFile::default()
        };
        let req = MagnetDownloadRequest {
            magnet: "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=show"
                .to_string(),
            source: "aria2".to_string(),
            selected_files: vec!["3".to_string(), "1".to_string()],
            files: vec![file("1", 1, 10), file("2", 2, 20), file("3", 3, 30)],
            ..MagnetDownloadRequest::default()
        };

        let tasks = h.service.download_magnet(req).await.expect("download");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].size, 40);
        assert_eq!(tasks[0].name, "show");
        let calls = h.aria2.calls_to("aria2.addUri");
        assert_eq!(calls[0][1]["select-file"], json!("1,3"));

        let err = h
            .service
            .download_magnet(MagnetDownloadRequest {
                magnet: "magnet:?xt=urn:btih:00".to_string(),
                ..MagnetDownloadRequest::default()
            })
            .await
            .expect_err("nothing selected");
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn magnet_folder_selection_cascades_to_its_files() {
        let h = harness().await;
        let file = |id: &str, path: &str, index: i64, size: i64| MagnetFile {
            id: id.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            size,
            index,
            ..MagnetFile::default()
        };
        let tree = build_tree(vec![
            file("1", "Show/S01/e01.mkv", 1, 100),
            file("2", "Show/S01/e02.mkv", 2, 200),
            file("3", "Show/extras.txt", 3, 5),
        ]);
        let season = tree[0].children[0].id.clone();
        let magnet = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567".to_string();

        let tasks = h
            .service
            .download_magnet(MagnetDownloadRequest {
                magnet: magnet.clone(),
                selected_files: vec![season],
                files: tree.clone(),
                ..MagnetDownloadRequest::default()
            })
            .await
            .expect("folder download");
        assert_eq!(tasks[0].size, 300);
        assert_eq!(tasks[0].selected_files, vec!["1", "2"]);
        let calls = h.aria2.calls_to("aria2.addUri");
        assert_eq!(calls[0][1]["select-file"], json!("1,2"));

        let tasks = h
            .service
            .download_magnet(MagnetDownloadRequest {
                magnet: magnet.clone(),
                selected_files: vec![tree[0].id.clone()],
                files: tree.clone(),
                ..MagnetDownloadRequest::default()
            })
            .await
            .expect("full download");
        assert_eq!(tasks[0].size, 305);
        let calls = h.aria2.calls_to("aria2.addUri");
        assert!(calls[1][1].get("select-file").is_none());

        let err = h
            .service
            .download_magnet(MagnetDownloadRequest {
                magnet,
                selected_files: vec!["99".to_string()],
                files: tree,
                ..MagnetDownloadRequest::default()
            })
            .await
            .expect_err("unknown id");
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn stats_combine_aria2_rclone_and_totals() {
        let h = harness().await;
        h.aria2.reply(
            "aria2.getGlobalStat",
            json!({ "downloadSpeed": "2048", "numActive": "2", "numWaiting": "4" }),
        );
        let mut task = Task::new("00000000000000bb");
        task.status = DownloadStatus::Uploading;
        h.db.save_task(&task).await.unwrap();
        h.rclone.reply("core/stats", json!({ "speed": 512.0, "bytes": 10 }));
        h.db.increment_completed_tasks().await.unwrap();

        let stats = h.service.stats().await.expect("stats");
        assert_eq!(stats.active.downloads, 2);
        assert_eq!(stats.active.download_speed, 2048);
        assert_eq!(stats.active.uploads, 1);
        assert_eq!(stats.active.upload_speed, 512);
        assert_eq!(stats.queue.pending, 4);
        assert_eq!(stats.totals.tasks_finished, 1);
    }

    #[tokio::test]
    async fn file_operations_validate_their_verb() {
        let h = harness().await;
        h.rclone.reply("sync/copy", json!({ "jobid": 12 }));
        let job = h
            .service
            .file_operation("copy", "/gdrive", "/backup/gdrive")
            .await
            .expect("copy");
        assert_eq!(job, Some(12));

        let err = h
            .service
            .file_operation("shred", "/gdrive", "/backup")
            .await
            .expect_err("unknown");
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn unknown_providers_are_not_found() {
        let h = harness().await;
        let err = h
            .service
            .configure_provider("nope", Some(true), None, BTreeMap::new())
            .await
            .expect_err("missing");
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(h.service.providers().await.unwrap().is_empty());
    }
}
