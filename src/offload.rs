//! Moves finished aria2 downloads to their rclone destination.

use std::path::{Component, Path};
use std::sync::Arc;

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::db::TaskDb;
use crate::events::{EventBus, EventType};
use crate::models::{DownloadStatus, Task};
use crate::rclone::RcloneClient;
use crate::rpc::{Aria2Client, Aria2Task, RpcError};
use crate::torrent::gid_to_job_id;

/// What rclone should copy for a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPlan {
    /// The download created a folder under the download dir; copy all of it.
    Folder { src_fs: String, dst_fs: String },
    File {
        src_fs: String,
        name: String,
        dst_fs: String,
    },
}

/// Folder uploads keep the top-level folder name on the remote. Anything else
/// is copied as a single file next to the remote root.
pub fn upload_plan(base_dir: &str, path: &str, remote: &str) -> UploadPlan {
    let full = Path::new(path);
    if !base_dir.is_empty() {
        if let Ok(rel) = full.strip_prefix(base_dir) {
            let parts: Vec<_> = rel
                .components()
                .filter_map(|c| match c {
                    Component::Normal(part) => part.to_str(),
                    _ => None,
                })
                .collect();
            if parts.len() > 1 {
                let top = parts[0];
                return UploadPlan::Folder {
                    src_fs: Path::new(base_dir).join(top).to_string_lossy().into_owned(),
                    dst_fs: format!("{}/{top}", remote.trim_end_matches('/')),
                };
            }
        }
    }

    let name = full
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let src_fs = if base_dir.is_empty() {
        full.parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        base_dir.to_string()
    };
    UploadPlan::File {
        src_fs,
        name,
        dst_fs: remote.to_string(),
    }
}

pub struct Offloader {
    aria2: Arc<Aria2Client>,
    rclone: RcloneClient,
    db: TaskDb,
    events: EventBus,
}

impl Offloader {
    pub fn new(aria2: Arc<Aria2Client>, rclone: RcloneClient, db: TaskDb, events: EventBus) -> Self {
        Self {
            aria2,
            rclone,
            db,
            events,
        }
    }

    async fn record_completion(&self, total: i64) -> Result<()> {
        if total > 0 {
            self.db.add_downloaded_bytes(total).await?;
        }
        self.db.increment_completed_tasks().await
    }

    /// `onDownloadComplete`: hands the task to [`Offloader::offload`].
    /// Unknown gids are recorded as finished local downloads.
    pub async fn handle_complete(&self, gid: &str) -> Result<()> {
        let status = match self.aria2.tell_status(gid, &[]).await {
            Ok(status) => status,
            Err(err) => {
                warn!("complete: failed to get status for {gid}: {err}");
                return Ok(());
            }
        };

        let Some(task) = self.db.get_task(gid).await? else {
            info!("task {gid} completed but was not tracked; adopting as local-only");
            let mut task = task_from_aria2(&status);
            task.id = gid.to_string();
            task.status = DownloadStatus::Complete;
            task.completed_at = Some(chrono::Utc::now());
            self.db.save_task(&task).await?;
            self.record_completion(status.total()).await?;
            self.events.lifecycle(
                EventType::DownloadCompleted,
                gid,
                json!({ "id": gid, "name": task.name }),
            );
            return Ok(());
        };

        if !task.status.is_downloading() {
            debug!("complete: task {gid} already {}", task.status.as_str());
            return Ok(());
        }

        self.offload(&task, &status).await
    }

    /// Completes a task aria2 reports as done: adopts `followedBy` children,
    /// counts the download once, then marks it complete locally or starts
    /// the rclone copy.
    pub async fn offload(&self, task: &Task, status: &Aria2Task) -> Result<()> {
        let gid = task.id.as_str();
        for child in &status.followed_by {
            if self.db.adopt_child_task(child, task).await? {
                info!("magnet handoff: adopting child {child} from {gid}");
            }
        }

        let path = status.first_path();
        let total = status.total();
        if path.is_empty() {
            warn!("no file path reported for completed task {gid}");
            return Ok(());
        }

        // Only the first completion of a downloading task is counted.
        if task.status.is_downloading() {
            self.record_completion(total).await?;
        }

        // Metadata-only parents: the children carry the real payload.
        if task.destination.is_empty() || !status.followed_by.is_empty() {
            info!("task {gid} completed locally");
            self.db.mark_complete(gid, &path, total).await?;
            self.events.lifecycle(
                EventType::DownloadCompleted,
                gid,
                json!({ "id": gid, "name": task.name, "filePath": path, "size": total }),
            );
            return Ok(());
        }

        let job_id = gid_to_job_id(gid);
        let started = match upload_plan(&status.dir, &path, &task.destination) {
            UploadPlan::Folder { src_fs, dst_fs } => {
                info!("uploading folder {src_fs} to {dst_fs}");
                self.rclone.copy_dir_async(&src_fs, &dst_fs, job_id).await
            }
            UploadPlan::File {
                src_fs,
                name,
                dst_fs,
            } => {
                info!("uploading {path} to {dst_fs}");
                self.rclone
                    .copy_file_async(&src_fs, &name, &dst_fs, &name, job_id)
                    .await
            }
        };

        match started {
            Ok(job_id) => {
                if !self.db.start_upload(gid, job_id, &path, total).await? {
                    debug!("upload for {gid} already started elsewhere");
                    return Ok(());
                }
                info!("started upload for {gid} (job {job_id})");
                self.events.lifecycle(
                    EventType::DownloadCompleted,
                    gid,
                    json!({ "id": gid, "name": task.name, "filePath": path, "size": total }),
                );
                self.events.lifecycle(
                    EventType::UploadStarted,
                    gid,
                    json!({ "id": gid, "destination": task.destination, "jobId": job_id }),
                );
            }
            Err(err) => {
                warn!("failed to start upload for {gid}: {err}");
                let message = format!("upload failed to start: {err}");
                self.db.update_error(gid, &message).await?;
                self.db.increment_failed_tasks().await?;
                self.events
                    .lifecycle_error(EventType::UploadError, gid, &message);
            }
        }
        Ok(())
    }

    /// Re-submits a stored task to aria2 under its own gid.
    pub async fn requeue(&self, task: &Task) -> Result<(), RpcError> {
        let mut options = task.options.clone();
        options.insert("gid".to_string(), Value::String(task.id.clone()));
        if !task.dir.is_empty() && !options.contains_key("dir") {
            options.insert("dir".to_string(), Value::String(task.dir.clone()));
        }

        if let Some(torrent) = task.torrent.as_deref().filter(|t| !t.is_empty()) {
            self.aria2.add_torrent(torrent, &task.uris, &options).await?;
        } else if let Some(metalink) = task.metalink.as_deref().filter(|m| !m.is_empty()) {
            self.aria2.add_metalink(metalink, &options).await?;
        } else {
            let uris = if task.uris.is_empty() {
                vec![task.url.clone()]
            } else {
                task.uris.clone()
            };
            self.aria2.add_uri(&uris, &options).await?;
        }
        Ok(())
    }

    /// Cancels the rclone job of an uploading task, if any.
    pub async fn stop_upload(&self, task: &Task) {
        if task.status != DownloadStatus::Uploading || task.upload_job_id <= 0 {
            return;
        }
        info!("stopping rclone job {} for {}", task.upload_job_id, task.id);
        if let Err(err) = self.rclone.stop_job(task.upload_job_id).await {
            warn!("failed to stop rclone job {}: {err}", task.upload_job_id);
        }
    }
}

/// Task record for a download gravity did not create itself.
pub fn task_from_aria2(status: &Aria2Task) -> Task {
    let mut task = Task::new(status.gid.clone());
    task.status = DownloadStatus::from_aria2(&status.status);
    task.name = status.display_name();
    task.dir = status.dir.clone();
    task.file_path = status.first_path();
    task.size = status.total();
    task.downloaded = status.completed();
    task.speed = status.speed();
    task.seeders = status.seeders();
    task.peers = status.peers();
    task.error = if task.status == DownloadStatus::Error {
        status.error_text()
    } else {
        String::new()
    };
    task.uris = status
        .files
        .iter()
        .flat_map(|f| f.uris.iter().map(|u| u.uri.clone()))
        .collect::<Vec<_>>();
    task.uris.dedup();
    task.url = task.uris.first().cloned().unwrap_or_default();
    task.magnet_hash = status.info_hash.clone();
    task.is_magnet = !status.info_hash.is_empty();
    if task.status == DownloadStatus::Active {
        task.started_at = Some(chrono::Utc::now());
    }
    task
}
