//! Keeps the task table in step with aria2 and rclone: startup import,
//! aria2 push notifications, a slow reconciliation poll and the live
//! progress/stats publisher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::db::TaskDb;
use crate::events::{
    EventBus, EventType, ProgressEvent, ProgressKind, ServerEvent, SpeedStats, StatsEvent,
    TaskCounts, UsageStats, calculate_eta,
};
use crate::models::{DownloadStatus, Task};
use crate::offload::{Offloader, task_from_aria2};
use crate::rclone::{JobStatus, RcloneClient, RcloneError};
use crate::rpc::{Aria2Client, Aria2Notification, Aria2Task, NotificationKind, parse_num};

pub const STARTUP_WAIT: Duration = Duration::from_secs(10);
const STARTUP_TICK: Duration = Duration::from_millis(200);
const STOPPED_IMPORT_LIMIT: i64 = 100;
const MISSING_GRACE_SECS: i64 = 60;

pub struct Monitor {
    aria2: Arc<Aria2Client>,
    rclone: RcloneClient,
    db: TaskDb,
    events: EventBus,
    offloader: Arc<Offloader>,
    poll_interval: Duration,
    publish_interval: Duration,
}

impl Monitor {
    pub fn new(
        aria2: Arc<Aria2Client>,
        rclone: RcloneClient,
        db: TaskDb,
        events: EventBus,
        offloader: Arc<Offloader>,
        poll_interval: Duration,
        publish_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            aria2,
            rclone,
            db,
            events,
            offloader,
            poll_interval,
            publish_interval,
        })
    }

    /// Polls `getVersion` until aria2 answers or `budget` runs out.
    pub async fn wait_for_aria2(&self, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        let mut ticker = tokio::time::interval(STARTUP_TICK);
        loop {
            ticker.tick().await;
            if self.aria2.get_version().await.is_ok() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Imports what aria2 currently holds, resets interrupted uploads and
    /// re-adds downloads aria2 lost across a restart.
    pub async fn startup_sync(&self) -> Result<()> {
        match self.aria2.tell_active(&[]).await {
            Ok(tasks) => {
                for status in &tasks {
                    self.import(status).await?;
                }
                info!("imported {} active aria2 tasks", tasks.len());
            }
            Err(err) => warn!("startup: tellActive failed: {err}"),
        }
        match self.aria2.tell_stopped(0, STOPPED_IMPORT_LIMIT, &[]).await {
            Ok(tasks) => {
                for status in &tasks {
                    self.import(status).await?;
                }
                debug!("imported {} stopped aria2 tasks", tasks.len());
            }
            Err(err) => warn!("startup: tellStopped failed: {err}"),
        }

        let reset = self.db.reset_stuck_uploads().await?;
        if reset > 0 {
            warn!("reset {reset} uploads interrupted by the previous run");
        }

        let pending = self.db.pending_tasks().await?;
        info!("checking {} pending tasks for restoration", pending.len());
        for task in pending {
            match self.aria2.tell_status(&task.id, &["gid", "status"]).await {
                Ok(_) => continue,
                Err(err) if !err.is_not_found() => {
                    warn!("cannot check {} in aria2: {err}", task.id);
                    continue;
                }
                Err(_) => {}
            }
            info!(
                "restoring {} (remote: {})",
                task.id,
                if task.destination.is_empty() {
                    "local"
                } else {
                    task.destination.as_str()
                }
            );
            if let Err(err) = self.offloader.requeue(&task).await {
                warn!("failed to restore {}: {err}", task.id);
                self.db.increment_retry(&task.id).await?;
            }
        }
        Ok(())
    }

    /// Records an aria2 task without stepping on upload bookkeeping: tracked
    /// tasks that are uploading, or that finished downloading but have not
    /// been offloaded yet, only get their progress refreshed.
    async fn import(&self, status: &Aria2Task) -> Result<()> {
        if status.gid.is_empty() {
            return Ok(());
        }
        if let Some(existing) = self.db.get_task(&status.gid).await? {
            let awaiting_offload =
                existing.status.is_downloading() && status.status == "complete";
            if existing.status == DownloadStatus::Uploading || awaiting_offload {
                return self.record_progress(&status.gid, status).await;
            }
        }
        self.db.import_task(task_from_aria2(status)).await
    }

    async fn record_progress(&self, gid: &str, status: &Aria2Task) -> Result<()> {
        let (done, total, speed) = (status.completed(), status.total(), status.speed());
        self.db
            .update_progress(
                gid,
                done,
                total,
                speed,
                calculate_eta(total - done, speed),
                status.seeders(),
                status.peers(),
            )
            .await
    }

    /// Starts the notification listener, the notification handler, the
    /// poller and the publisher. All of them stop once `shutdown` flips.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let aria2 = self.aria2.clone();
        let listener_shutdown = shutdown.clone();
        vec![
            tokio::spawn(async move { aria2.run_notification_listener(listener_shutdown).await }),
            tokio::spawn(self.clone().run_notifications(shutdown.clone())),
            tokio::spawn(self.clone().run_poller(shutdown.clone())),
            tokio::spawn(self.clone().run_publisher(shutdown)),
        ]
    }

    async fn run_notifications(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.aria2.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                msg = rx.recv() => match msg {
                    Ok(note) => {
                        if let Err(err) = self.handle_notification(&note).await {
                            warn!("failed handling {:?} for {}: {err:#}", note.kind, note.gid);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("dropped {skipped} aria2 notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    async fn run_poller(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => self.poll_once().await,
            }
        }
    }

    async fn run_publisher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.publish_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    if !self.events.has_subscribers() {
                        continue;
                    }
                    if let Err(err) = self.publish_once().await {
                        debug!("publisher: {err:#}");
                    }
                }
            }
        }
    }

    pub async fn handle_notification(&self, note: &Aria2Notification) -> Result<()> {
        let gid = note.gid.as_str();
        match note.kind {
            NotificationKind::Start => self.on_start(gid).await,
            NotificationKind::Pause => self.on_pause(gid).await,
            NotificationKind::Stop => self.on_stop(gid).await,
            NotificationKind::Error => self.on_error(gid).await,
            NotificationKind::Complete => self.offloader.handle_complete(gid).await,
            NotificationKind::BtComplete => {
                // Seeding continues; the upload waits for onDownloadComplete.
                debug!("torrent {gid} finished downloading, seeding");
                match self.aria2.tell_status(gid, &[]).await {
                    Ok(status) => self.record_progress(gid, &status).await,
                    Err(_) => Ok(()),
                }
            }
        }
    }

    async fn on_start(&self, gid: &str) -> Result<()> {
        if let Some(task) = self.db.get_task(gid).await? {
            self.db.update_status(gid, DownloadStatus::Active).await?;
            let kind = if task.status == DownloadStatus::Paused {
                EventType::DownloadResumed
            } else {
                EventType::DownloadStarted
            };
            self.events
                .lifecycle(kind, gid, json!({ "id": gid, "name": task.name }));
            return Ok(());
        }

        let status = match self.aria2.tell_status(gid, &[]).await {
            Ok(status) => status,
            Err(err) => {
                warn!("failed to fetch status for new task {gid}: {err}");
                return Ok(());
            }
        };
        info!("task {gid} started outside gravity; importing");
        let task = task_from_aria2(&status);
        self.db.import_task(task.clone()).await?;
        self.events.lifecycle(
            EventType::DownloadStarted,
            gid,
            json!({ "id": gid, "name": task.name }),
        );
        Ok(())
    }

    async fn on_pause(&self, gid: &str) -> Result<()> {
        match self.aria2.tell_status(gid, &[]).await {
            Ok(status) => {
                self.record_progress(gid, &status).await?;
                self.db
                    .update_status(gid, DownloadStatus::from_aria2(&status.status))
                    .await?;
            }
            Err(_) => {
                self.db.update_status(gid, DownloadStatus::Paused).await?;
            }
        }
        self.events
            .lifecycle(EventType::DownloadPaused, gid, json!({ "id": gid }));
        Ok(())
    }

    async fn on_stop(&self, gid: &str) -> Result<()> {
        match self.aria2.tell_status(gid, &[]).await {
            Ok(status) => {
                self.record_progress(gid, &status).await?;
                self.db
                    .update_status(gid, DownloadStatus::from_aria2(&status.status))
                    .await?;
            }
            Err(_) => {
                info!("task {gid} removed outside gravity");
                self.db.update_status(gid, DownloadStatus::Removed).await?;
            }
        }
        Ok(())
    }

    async fn on_error(&self, gid: &str) -> Result<()> {
        let message = match self.aria2.tell_status(gid, &[]).await {
            Ok(status) => {
                self.record_progress(gid, &status).await?;
                status.error_text()
            }
            Err(_) => "Unknown error".to_string(),
        };
        warn!("task {gid} failed: {message}");
        self.db.update_error(gid, &message).await?;
        self.db.increment_failed_tasks().await?;
        self.events
            .lifecycle_error(EventType::DownloadError, gid, &message);
        Ok(())
    }

    /// One reconciliation pass. Catches completions the socket missed and
    /// follows rclone jobs to the end.
    pub async fn poll_once(&self) {
        if let Err(err) = self.sync_pending().await {
            warn!("poller: pending sync failed: {err:#}");
        }
        if let Err(err) = self.sync_uploads().await {
            warn!("poller: upload sync failed: {err:#}");
        }
        if let Err(err) = self.checkpoint_active().await {
            debug!("poller: checkpoint skipped: {err:#}");
        }
    }

    async fn sync_pending(&self) -> Result<()> {
        for task in self.db.pending_tasks().await? {
            let status = match self.aria2.tell_status(&task.id, &[]).await {
                Ok(status) => status,
                Err(err) if !err.is_not_found() => {
                    debug!("poller: status of {} unavailable: {err}", task.id);
                    continue;
                }
                Err(_) => {
                    if (Utc::now() - task.created_at).num_seconds() > MISSING_GRACE_SECS {
                        self.fail_download(&task.id, "download not found in aria2")
                            .await?;
                    }
                    continue;
                }
            };

            for child in &status.followed_by {
                if self.db.adopt_child_task(child, &task).await? {
                    info!("magnet handoff: adopting child {child} from {}", task.id);
                }
            }

            match status.status.as_str() {
                "complete" => {
                    info!("poller: {} complete (missed notification)", task.id);
                    self.offloader.offload(&task, &status).await?;
                }
                "error" => self.fail_download(&task.id, &status.error_text()).await?,
                "removed" => self.fail_download(&task.id, "download removed from aria2").await?,
                other => {
                    let observed = DownloadStatus::from_aria2(other);
                    if observed != task.status {
                        self.db.update_status(&task.id, observed).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn fail_download(&self, gid: &str, message: &str) -> Result<()> {
        warn!("task {gid} failed: {message}");
        self.db.update_error(gid, message).await?;
        self.db.increment_failed_tasks().await?;
        self.events
            .lifecycle_error(EventType::DownloadError, gid, message);
        Ok(())
    }

    async fn sync_uploads(&self) -> Result<()> {
        for task in self.db.uploading_tasks().await? {
            if task.upload_job_id <= 0 {
                warn!("task {} is uploading without a job; requeueing offload", task.id);
                self.db.update_status(&task.id, DownloadStatus::Waiting).await?;
                continue;
            }

            match self.rclone.job_status(task.upload_job_id).await {
                Ok(JobStatus::Running) => {
                    if let Ok(stats) = self.rclone.job_stats(task.upload_job_id).await {
                        self.db
                            .update_upload_progress(&task.id, stats.bytes, stats.speed)
                            .await?;
                    }
                }
                Ok(JobStatus::Success) => self.upload_succeeded(&task).await?,
                Ok(JobStatus::Failed(message)) => self.upload_failed(&task, &message).await?,
                Err(RcloneError::Http { message, .. }) => {
                    self.upload_failed(&task, &message).await?
                }
                Err(err) => debug!("job {} status unavailable: {err}", task.upload_job_id),
            }
        }
        Ok(())
    }

    async fn upload_succeeded(&self, task: &Task) -> Result<()> {
        info!("upload job {} for {} succeeded", task.upload_job_id, task.id);
        self.db.mark_complete(&task.id, &task.file_path, task.size).await?;
        if task.size > 0 {
            self.db.add_uploaded_bytes(task.size).await?;
        }
        self.db.increment_uploaded_tasks().await?;
        self.events.lifecycle(
            EventType::UploadCompleted,
            &task.id,
            json!({
                "id": task.id,
                "name": task.name,
                "destination": task.destination,
                "size": task.size,
            }),
        );
        Ok(())
    }

    async fn upload_failed(&self, task: &Task, message: &str) -> Result<()> {
        if task.retry_count < task.max_retries {
            let attempt = self.db.increment_retry(&task.id).await?;
            self.db.reset_for_retry(&task.id).await?;
            warn!(
                "upload of {} failed ({message}); retry {attempt}/{}",
                task.id, task.max_retries
            );
            self.events.lifecycle_error(
                EventType::UploadError,
                &task.id,
                &format!("{message} (retrying)"),
            );
            return Ok(());
        }

        let message = format!("upload failed: {message}");
        warn!("task {}: {message}", task.id);
        self.db.update_error(&task.id, &message).await?;
        self.db.increment_failed_tasks().await?;
        self.events
            .lifecycle_error(EventType::UploadError, &task.id, &message);
        Ok(())
    }

    async fn checkpoint_active(&self) -> Result<()> {
        for status in self.aria2.tell_active(&[]).await? {
            self.record_progress(&status.gid, &status).await?;
        }
        Ok(())
    }

    /// Progress for every running transfer, then one stats frame.
    pub async fn publish_once(&self) -> Result<()> {
        let active = self.aria2.tell_active(&[]).await.unwrap_or_default();
        let mut download_speed = 0;
        for status in &active {
            let (done, total, speed) = (status.completed(), status.total(), status.speed());
            download_speed += speed;
            self.events.publish(ServerEvent::Progress(ProgressEvent {
                id: status.gid.clone(),
                kind: ProgressKind::Download,
                downloaded: done,
                uploaded: parse_num(&status.upload_length),
                size: total,
                speed,
                eta: calculate_eta(total - done, speed),
                seeders: status.seeders(),
                peers: status.peers(),
            }));
        }

        let mut upload_speed = 0;
        for task in self.db.uploading_tasks().await? {
            if task.upload_job_id <= 0 {
                continue;
            }
            let Ok(stats) = self.rclone.job_stats(task.upload_job_id).await else {
                continue;
            };
            upload_speed += stats.speed;
            self.db
                .update_upload_progress(&task.id, stats.bytes, stats.speed)
                .await?;
            self.events.publish(ServerEvent::Progress(ProgressEvent {
                id: task.id.clone(),
                kind: ProgressKind::Upload,
                downloaded: task.downloaded,
                uploaded: stats.bytes,
                size: task.size,
                speed: stats.speed,
                eta: calculate_eta(task.size - stats.bytes, stats.speed),
                seeders: 0,
                peers: 0,
            }));
        }

        let counts = self.db.count_by_status().await?;
        let count = |status: DownloadStatus| counts.get(&status).copied().unwrap_or(0);
        let totals = self.db.global_stats().await?;
        self.events.publish(ServerEvent::Stats(StatsEvent {
            speeds: SpeedStats {
                download: download_speed,
                upload: upload_speed,
            },
            tasks: TaskCounts {
                active: count(DownloadStatus::Active),
                uploading: count(DownloadStatus::Uploading),
                waiting: count(DownloadStatus::Waiting),
                paused: count(DownloadStatus::Paused),
                completed: count(DownloadStatus::Complete),
                failed: count(DownloadStatus::Error),
            },
            usage: UsageStats {
                total_downloaded: totals.total_downloaded,
                total_uploaded: totals.total_uploaded,
            },
        }));
        Ok(())
    }

    /// Last progress checkpoint before the process exits.
    pub async fn final_sync(&self) {
        let active = match self.aria2.tell_active(&[]).await {
            Ok(active) => active,
            Err(err) => {
                warn!("final sync skipped: {err}");
                return;
            }
        };
        info!("final sync of {} active tasks", active.len());
        for status in &active {
            if let Err(err) = self.record_progress(&status.gid, status).await {
                warn!("final sync of {} failed: {err:#}", status.gid);
                continue;
            }
            let observed = DownloadStatus::from_aria2(&status.status);
            if let Err(err) = self.db.update_status(&status.gid, observed).await {
                warn!("final sync of {} failed: {err:#}", status.gid);
            }
        }
    }
}
