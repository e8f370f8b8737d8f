use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::models::{
    AccountInfo, DownloadFile, DownloadStatus, GlobalStats, IndexStatus, IndexedFile,
    ProviderRecord, RemoteIndexConfig, Settings, Task, UploadStatus,
};

/// Statuses in which aria2 still owns the task.
const DOWNLOADING_STATUSES: &str =
    "('waiting', 'allocating', 'active', 'resolving', 'paused', 'processing')";
const FINISHED_STATUSES: &str = "('complete', 'error', 'removed')";

#[derive(Clone)]
pub struct TaskDb {
    pool: SqlitePool,
}

impl TaskDb {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed creating database directory {parent:?}"))?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(opts)
            .await
            .context("failed to connect to sqlite")?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL DEFAULT '',
                uris_json TEXT NOT NULL DEFAULT '[]',
                torrent TEXT,
                metalink TEXT,
                options_json TEXT NOT NULL DEFAULT '{}',
                name TEXT NOT NULL DEFAULT '',
                dir TEXT NOT NULL DEFAULT '',
                file_path TEXT NOT NULL DEFAULT '',
                destination TEXT NOT NULL DEFAULT '',
                provider TEXT NOT NULL DEFAULT '',
                resolved_url TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                upload_status TEXT NOT NULL DEFAULT 'idle',
                upload_job_id INTEGER NOT NULL DEFAULT 0,
                error TEXT NOT NULL DEFAULT '',
                size INTEGER NOT NULL DEFAULT 0,
                downloaded INTEGER NOT NULL DEFAULT 0,
                uploaded INTEGER NOT NULL DEFAULT 0,
                speed INTEGER NOT NULL DEFAULT 0,
                upload_speed INTEGER NOT NULL DEFAULT 0,
                eta INTEGER NOT NULL DEFAULT 0,
                seeders INTEGER NOT NULL DEFAULT 0,
                peers INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 5,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                is_magnet INTEGER NOT NULL DEFAULT 0,
                magnet_hash TEXT NOT NULL DEFAULT '',
                selected_files_json TEXT NOT NULL DEFAULT '[]',
                files_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed creating tasks table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS global_stats (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                total_downloaded INTEGER NOT NULL DEFAULT 0,
                total_uploaded INTEGER NOT NULL DEFAULT 0,
                total_tasks INTEGER NOT NULL DEFAULT 0,
                completed_tasks INTEGER NOT NULL DEFAULT 0,
                uploaded_tasks INTEGER NOT NULL DEFAULT 0,
                failed_tasks INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed creating global_stats table")?;

        sqlx::query("INSERT OR IGNORE INTO global_stats (id) VALUES (1)")
            .execute(&self.pool)
            .await
            .context("failed seeding global_stats")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                document TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed creating settings table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS providers (
                name TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL,
                priority INTEGER NOT NULL,
                config_json TEXT NOT NULL DEFAULT '{}',
                cached_hosts_json TEXT NOT NULL DEFAULT '[]',
                cached_account_json TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed creating providers table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS indexed_files (
                id TEXT PRIMARY KEY,
                remote TEXT NOT NULL,
                path TEXT NOT NULL,
                filename TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                mod_time TEXT,
                is_dir INTEGER NOT NULL DEFAULT 0,
                last_indexed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed creating indexed_files table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS remote_index_config (
                remote TEXT PRIMARY KEY,
                auto_index_interval_mins INTEGER NOT NULL DEFAULT 0,
                last_indexed_at TEXT,
                status TEXT NOT NULL DEFAULT 'idle',
                error_msg TEXT NOT NULL DEFAULT '',
                excluded_patterns TEXT NOT NULL DEFAULT '',
                included_extensions TEXT NOT NULL DEFAULT '',
                min_size_bytes INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed creating remote_index_config table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_indexed_files_remote ON indexed_files(remote)")
            .execute(&self.pool)
            .await
            .context("failed creating idx_indexed_files_remote")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_indexed_files_name ON indexed_files(filename)")
            .execute(&self.pool)
            .await
            .context("failed creating idx_indexed_files_name")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
            .execute(&self.pool)
            .await
            .context("failed creating idx_tasks_status")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at DESC)")
            .execute(&self.pool)
            .await
            .context("failed creating idx_tasks_created")?;

        Ok(())
    }

    pub async fn save_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, url, uris_json, torrent, metalink, options_json, name, dir, file_path,
                destination, provider, resolved_url, status, upload_status, upload_job_id,
                error, size, downloaded, uploaded, speed, upload_speed, eta, seeders, peers,
                priority, retry_count, max_retries, is_magnet, magnet_hash,
                selected_files_json, files_json, created_at, updated_at, started_at,
                completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                uris_json = excluded.uris_json,
                torrent = excluded.torrent,
                metalink = excluded.metalink,
                options_json = excluded.options_json,
                name = excluded.name,
                dir = excluded.dir,
                file_path = excluded.file_path,
                destination = excluded.destination,
                provider = excluded.provider,
                resolved_url = excluded.resolved_url,
                status = excluded.status,
                upload_status = excluded.upload_status,
                upload_job_id = excluded.upload_job_id,
                error = excluded.error,
                size = excluded.size,
                downloaded = excluded.downloaded,
                uploaded = excluded.uploaded,
                speed = excluded.speed,
                upload_speed = excluded.upload_speed,
                eta = excluded.eta,
                seeders = excluded.seeders,
                peers = excluded.peers,
                priority = excluded.priority,
                retry_count = excluded.retry_count,
                max_retries = excluded.max_retries,
                is_magnet = excluded.is_magnet,
                magnet_hash = excluded.magnet_hash,
                selected_files_json = excluded.selected_files_json,
                files_json = excluded.files_json,
                updated_at = excluded.updated_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(&task.id)
        .bind(&task.url)
        .bind(vec_to_json(&task.uris))
        .bind(task.torrent.clone())
        .bind(task.metalink.clone())
        .bind(map_to_json(&task.options))
        .bind(&task.name)
        .bind(&task.dir)
        .bind(&task.file_path)
        .bind(&task.destination)
        .bind(&task.provider)
        .bind(&task.resolved_url)
        .bind(task.status.as_str())
        .bind(task.upload_status.as_str())
        .bind(task.upload_job_id)
        .bind(&task.error)
        .bind(task.size)
        .bind(task.downloaded)
        .bind(task.uploaded)
        .bind(task.speed)
        .bind(task.upload_speed)
        .bind(task.eta)
        .bind(task.seeders)
        .bind(task.peers)
        .bind(task.priority)
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(task.is_magnet)
        .bind(&task.magnet_hash)
        .bind(vec_to_json(&task.selected_files))
        .bind(serde_json::to_string(&task.files).unwrap_or_else(|_| "[]".to_string()))
        .bind(task.created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .context("failed saving task")?;

        Ok(())
    }

    /// Records a task observed in aria2. Fields aria2 knows nothing about
    /// (destination, options, metalink, resolved url, selection, retry
    /// count, upload job) survive from any existing row.
    pub async fn import_task(&self, mut task: Task) -> Result<()> {
        if let Some(existing) = self.get_task(&task.id).await? {
            if task.destination.is_empty() {
                task.destination = existing.destination;
            }
            if task.options.is_empty() {
                task.options = existing.options;
            }
            if task.url.is_empty() {
                task.url = existing.url;
            }
            if task.uris.is_empty() {
                task.uris = existing.uris;
            }
            if task.torrent.is_none() {
                task.torrent = existing.torrent;
            }
            if task.metalink.is_none() {
                task.metalink = existing.metalink;
            }
            if task.resolved_url.is_empty() {
                task.resolved_url = existing.resolved_url;
            }
            if task.selected_files.is_empty() {
                task.selected_files = existing.selected_files;
            }
            if task.magnet_hash.is_empty() {
                task.magnet_hash = existing.magnet_hash;
            }
            task.is_magnet |= existing.is_magnet;
            task.completed_at = task.completed_at.or(existing.completed_at);
            if task.upload_job_id == 0 {
                task.upload_job_id = existing.upload_job_id;
            }
            task.upload_status = existing.upload_status;
            task.retry_count = existing.retry_count;
            task.max_retries = existing.max_retries;
            task.priority = existing.priority;
            task.provider = existing.provider;
            task.created_at = existing.created_at;
            task.started_at = task.started_at.or(existing.started_at);
        }
        self.save_task(&task).await
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed loading task")?;

        row.map(row_to_task).transpose()
    }

    /// Newest first. An empty status filter lists everything.
    pub async fn list_tasks(
        &self,
        statuses: &[DownloadStatus],
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Task>, i64)> {
        let filter = status_filter(statuses);

        let total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM tasks {filter}"))
            .fetch_one(&self.pool)
            .await
            .context("failed counting tasks")?
            .try_get("n")?;

        let rows = sqlx::query(&format!(
            "SELECT * FROM tasks {filter} ORDER BY created_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("failed listing tasks")?;

        let tasks = rows.into_iter().map(row_to_task).collect::<Result<Vec<_>>>()?;
        Ok((tasks, total))
    }

    pub async fn update_status(&self, id: &str, status: DownloadStatus) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?,
                updated_at = ?,
                started_at = CASE WHEN ? = 'active' AND started_at IS NULL THEN ? ELSE started_at END,
                completed_at = CASE WHEN ? = 'complete' THEN ? ELSE completed_at END
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(&now)
        .bind(status.as_str())
        .bind(&now)
        .bind(status.as_str())
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed updating task status")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_progress(
        &self,
        id: &str,
        downloaded: i64,
        size: i64,
        speed: i64,
        eta: i64,
        seeders: i64,
        peers: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET downloaded = ?, size = ?, speed = ?, eta = ?, seeders = ?, peers = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(downloaded)
        .bind(size)
        .bind(speed)
        .bind(eta)
        .bind(seeders)
        .bind(peers)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed updating task progress")?;

        Ok(())
    }

    pub async fn update_upload_progress(&self, id: &str, uploaded: i64, speed: i64) -> Result<()> {
        sqlx::query("UPDATE tasks SET uploaded = ?, upload_speed = ?, updated_at = ? WHERE id = ?")
            .bind(uploaded)
            .bind(speed)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed updating upload progress")?;

        Ok(())
    }

    /// Moves the task to `error`, failing an in-flight upload alongside it.
    pub async fn update_error(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'error',
                error = ?,
                speed = 0,
                upload_speed = 0,
                upload_status = CASE WHEN upload_status IN ('pending', 'running') THEN 'error' ELSE upload_status END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed updating task error")?;

        Ok(())
    }

    /// Merges `options` into the stored option map.
    pub async fn update_options(&self, id: &str, options: &JsonMap<String, Value>) -> Result<bool> {
        let Some(mut task) = self.get_task(id).await? else {
            return Ok(false);
        };
        for (key, value) in options {
            task.options.insert(key.clone(), value.clone());
        }
        sqlx::query("UPDATE tasks SET options_json = ?, updated_at = ? WHERE id = ?")
            .bind(map_to_json(&task.options))
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed updating task options")?;
        Ok(true)
    }

    /// Flips a downloading task to `uploading`. Returns false when another
    /// path already claimed it.
    pub async fn start_upload(
        &self,
        id: &str,
        job_id: i64,
        file_path: &str,
        size: i64,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET status = 'uploading',
                upload_status = 'running',
                upload_job_id = ?,
                file_path = ?,
                size = ?,
                downloaded = ?,
                speed = 0,
                uploaded = 0,
                updated_at = ?
            WHERE id = ? AND status IN {DOWNLOADING_STATUSES}
            "#
        ))
        .bind(job_id)
        .bind(file_path)
        .bind(size)
        .bind(size)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed starting upload")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_complete(&self, id: &str, file_path: &str, size: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'complete',
                upload_status = CASE WHEN upload_status = 'running' THEN 'complete' ELSE upload_status END,
                uploaded = CASE WHEN upload_status = 'running' THEN ? ELSE uploaded END,
                file_path = CASE WHEN ? = '' THEN file_path ELSE ? END,
                size = CASE WHEN ? > 0 THEN ? ELSE size END,
                downloaded = CASE WHEN ? > 0 THEN ? ELSE downloaded END,
                speed = 0,
                upload_speed = 0,
                eta = 0,
                error = '',
                completed_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(size)
        .bind(file_path)
        .bind(file_path)
        .bind(size)
        .bind(size)
        .bind(size)
        .bind(size)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed marking task complete")?;

        Ok(())
    }

    /// Back to `waiting` with error and upload state cleared.
    pub async fn reset_for_retry(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'waiting',
                error = '',
                speed = 0,
                upload_speed = 0,
                eta = 0,
                uploaded = 0,
                upload_job_id = 0,
                upload_status = CASE WHEN destination = '' THEN 'idle' ELSE 'pending' END,
                completed_at = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed resetting task for retry")?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns the new retry count.
    pub async fn increment_retry(&self, id: &str) -> Result<i32> {
        sqlx::query("UPDATE tasks SET retry_count = retry_count + 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed incrementing retry count")?;

        let row = sqlx::query("SELECT retry_count FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed loading retry count")?;
        Ok(row
            .map(|r| r.try_get::<i32, _>("retry_count"))
            .transpose()?
            .unwrap_or(0))
    }

    /// Tracks a follow-up gid (magnet metadata → real torrent) under the
    /// parent's destination and options. Returns false when already tracked.
    pub async fn adopt_child_task(&self, child_id: &str, parent: &Task) -> Result<bool> {
        if self.get_task(child_id).await?.is_some() {
            return Ok(false);
        }

        let mut child = Task::new(child_id);
        child.url = parent.url.clone();
        child.name = parent.name.clone();
        child.dir = parent.dir.clone();
        child.destination = parent.destination.clone();
        child.options = parent.options.clone();
        child.priority = parent.priority;
        child.max_retries = parent.max_retries;
        child.is_magnet = parent.is_magnet;
        child.magnet_hash = parent.magnet_hash.clone();
        child.selected_files = parent.selected_files.clone();
        child.status = DownloadStatus::Active;
        child.started_at = Some(Utc::now());
        self.save_task(&child).await?;
        Ok(true)
    }

    /// Uploads interrupted by a restart go back to waiting for offload.
    pub async fn reset_stuck_uploads(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'waiting', upload_status = 'pending', upload_speed = 0, updated_at = ?
            WHERE status = 'uploading'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed resetting stuck uploads")?;

        Ok(result.rows_affected())
    }

    /// Tasks aria2 still owns.
    pub async fn pending_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM tasks WHERE status IN {DOWNLOADING_STATUSES} ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed listing pending tasks")?;

        rows.into_iter().map(row_to_task).collect()
    }

    pub async fn uploading_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = 'uploading' ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await
            .context("failed listing uploading tasks")?;

        rows.into_iter().map(row_to_task).collect()
    }

    pub async fn active_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = 'active' ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed listing active tasks")?;

        rows.into_iter().map(row_to_task).collect()
    }

    /// Finished tasks, most recently touched first, plus the total count.
    pub async fn stopped_tasks(&self, offset: i64, num: i64) -> Result<(Vec<Task>, i64)> {
        let total: i64 = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM tasks WHERE status IN {FINISHED_STATUSES}"
        ))
        .fetch_one(&self.pool)
        .await
        .context("failed counting stopped tasks")?
        .try_get("n")?;

        let rows = sqlx::query(&format!(
            "SELECT * FROM tasks WHERE status IN {FINISHED_STATUSES} ORDER BY updated_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(num)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("failed listing stopped tasks")?;

        let tasks = rows.into_iter().map(row_to_task).collect::<Result<Vec<_>>>()?;
        Ok((tasks, total))
    }

    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed deleting task")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn purge_finished(&self) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM tasks WHERE status IN {FINISHED_STATUSES}"
        ))
        .execute(&self.pool)
        .await
        .context("failed purging finished tasks")?;
        Ok(result.rows_affected())
    }

    pub async fn count_by_status(&self) -> Result<HashMap<DownloadStatus, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .context("failed counting tasks by status")?;

        let mut counts = HashMap::new();
        for row in rows {
            let raw = row.try_get::<String, _>("status")?;
            if let Ok(status) = DownloadStatus::from_str(&raw) {
                *counts.entry(status).or_insert(0) += row.try_get::<i64, _>("n")?;
            }
        }
        Ok(counts)
    }

    pub async fn uploading_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tasks WHERE status = 'uploading'")
            .fetch_one(&self.pool)
            .await
            .context("failed counting uploading tasks")?;
        Ok(row.try_get("n")?)
    }

    pub async fn global_stats(&self) -> Result<GlobalStats> {
        let row = sqlx::query("SELECT * FROM global_stats WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .context("failed loading global stats")?;

        Ok(GlobalStats {
            total_downloaded: row.try_get("total_downloaded")?,
            total_uploaded: row.try_get("total_uploaded")?,
            total_tasks: row.try_get("total_tasks")?,
            completed_tasks: row.try_get("completed_tasks")?,
            uploaded_tasks: row.try_get("uploaded_tasks")?,
            failed_tasks: row.try_get("failed_tasks")?,
        })
    }

    async fn bump_stat(&self, column: StatColumn, delta: i64) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE global_stats SET {col} = {col} + ? WHERE id = 1",
            col = column.as_str()
        ))
        .bind(delta)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed incrementing {}", column.as_str()))?;
        Ok(())
    }

    pub async fn add_downloaded_bytes(&self, bytes: i64) -> Result<()> {
        self.bump_stat(StatColumn::TotalDownloaded, bytes.max(0)).await
    }

    pub async fn add_uploaded_bytes(&self, bytes: i64) -> Result<()> {
        self.bump_stat(StatColumn::TotalUploaded, bytes.max(0)).await
    }

    pub async fn increment_total_tasks(&self) -> Result<()> {
        self.bump_stat(StatColumn::TotalTasks, 1).await
    }

    pub async fn increment_completed_tasks(&self) -> Result<()> {
        self.bump_stat(StatColumn::CompletedTasks, 1).await
    }

    pub async fn increment_uploaded_tasks(&self) -> Result<()> {
        self.bump_stat(StatColumn::UploadedTasks, 1).await
    }

    pub async fn increment_failed_tasks(&self) -> Result<()> {
        self.bump_stat(StatColumn::FailedTasks, 1).await
    }

    pub async fn get_settings(&self) -> Result<Option<Settings>> {
        let row = sqlx::query("SELECT document FROM settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("failed loading settings")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw = row.try_get::<String, _>("document")?;
        let settings = serde_json::from_str(&raw).context("failed decoding settings document")?;
        Ok(Some(settings))
    }

    pub async fn put_settings(&self, settings: &Settings) -> Result<()> {
        let document = serde_json::to_string(settings).context("failed encoding settings")?;
        sqlx::query(
            r#"
            INSERT INTO settings (id, document, updated_at) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET document = excluded.document, updated_at = excluded.updated_at
            "#,
        )
        .bind(document)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed saving settings")?;
        Ok(())
    }

    pub async fn list_providers(&self) -> Result<Vec<ProviderRecord>> {
        let rows = sqlx::query("SELECT * FROM providers ORDER BY priority DESC, name ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed listing providers")?;

        rows.into_iter().map(row_to_provider).collect()
    }

    pub async fn get_provider(&self, name: &str) -> Result<Option<ProviderRecord>> {
        let row = sqlx::query("SELECT * FROM providers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("failed loading provider")?;

        row.map(row_to_provider).transpose()
    }

    pub async fn put_provider(&self, record: &ProviderRecord) -> Result<()> {
        let config_json = serde_json::to_string(&record.config).unwrap_or_else(|_| "{}".to_string());
        let account_json = record
            .cached_account
            .as_ref()
            .and_then(|a| serde_json::to_string(a).ok());

        sqlx::query(
            r#"
            INSERT INTO providers (name, enabled, priority, config_json, cached_hosts_json, cached_account_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                enabled = excluded.enabled,
                priority = excluded.priority,
                config_json = excluded.config_json,
                cached_hosts_json = excluded.cached_hosts_json,
                cached_account_json = excluded.cached_account_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.name)
        .bind(record.enabled)
        .bind(record.priority)
        .bind(config_json)
        .bind(vec_to_json(&record.cached_hosts))
        .bind(account_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed saving provider")?;
        Ok(())
    }

    pub async fn delete_provider(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM providers WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .context("failed deleting provider")?;
        Ok(result.rows_affected() > 0)
    }
}

impl TaskDb {
    /// Replaces everything indexed for `remote` in one transaction.
    pub async fn replace_indexed_files(&self, remote: &str, files: &[IndexedFile]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed starting index transaction")?;
        sqlx::query("DELETE FROM indexed_files WHERE remote = ?")
            .bind(remote)
            .execute(&mut *tx)
            .await
            .context("failed clearing indexed files")?;

        let now = Utc::now().to_rfc3339();
        for file in files {
            sqlx::query(
                r#"
                INSERT INTO indexed_files (id, remote, path, filename, size, mod_time, is_dir, last_indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&file.id)
            .bind(remote)
            .bind(&file.path)
            .bind(&file.name)
            .bind(file.size)
            .bind(&file.mod_time)
            .bind(file.is_dir)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("failed inserting indexed file")?;
        }

        tx.commit().await.context("failed committing indexed files")?;
        Ok(())
    }

    /// Files whose name or path contains every whitespace-separated term,
    /// case-insensitively. Returns one page and the total match count.
    pub async fn search_files(
        &self,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<IndexedFile>, i64)> {
        let patterns: Vec<String> = query
            .replace('"', "")
            .split_whitespace()
            .map(|term| format!("%{}%", escape_like(term)))
            .collect();
        if patterns.is_empty() {
            return Ok((Vec::new(), 0));
        }
        let clause = vec![
            r"(filename LIKE ? ESCAPE '\' OR path LIKE ? ESCAPE '\')";
            patterns.len()
        ]
        .join(" AND ");

        let count_sql = format!("SELECT COUNT(*) FROM indexed_files WHERE {clause}");
        let mut count = sqlx::query_scalar::<_, i64>(&count_sql);
        for pattern in &patterns {
            count = count.bind(pattern).bind(pattern);
        }
        let total = count
            .fetch_one(&self.pool)
            .await
            .context("failed counting search results")?;

        let page_sql = format!(
            "SELECT * FROM indexed_files WHERE {clause} ORDER BY is_dir ASC, filename ASC, path ASC LIMIT ? OFFSET ?"
        );
        let mut page = sqlx::query(&page_sql);
        for pattern in &patterns {
            page = page.bind(pattern).bind(pattern);
        }
        let rows = page
            .bind(limit.max(1))
            .bind(offset.max(0))
            .fetch_all(&self.pool)
            .await
            .context("failed searching indexed files")?;

        let files = rows
            .into_iter()
            .map(row_to_indexed_file)
            .collect::<Result<Vec<_>>>()?;
        Ok((files, total))
    }

    pub async fn index_configs(&self) -> Result<Vec<RemoteIndexConfig>> {
        let rows = sqlx::query("SELECT * FROM remote_index_config ORDER BY remote ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed listing index configs")?;
        rows.into_iter().map(row_to_index_config).collect()
    }

    pub async fn index_config(&self, remote: &str) -> Result<Option<RemoteIndexConfig>> {
        let row = sqlx::query("SELECT * FROM remote_index_config WHERE remote = ?")
            .bind(remote)
            .fetch_optional(&self.pool)
            .await
            .context("failed loading index config")?;
        row.map(row_to_index_config).transpose()
    }

    pub async fn put_index_config(&self, config: &RemoteIndexConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO remote_index_config (
                remote, auto_index_interval_mins, last_indexed_at, status, error_msg,
                excluded_patterns, included_extensions, min_size_bytes
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(remote) DO UPDATE SET
                auto_index_interval_mins = excluded.auto_index_interval_mins,
                last_indexed_at = excluded.last_indexed_at,
                status = excluded.status,
                error_msg = excluded.error_msg,
                excluded_patterns = excluded.excluded_patterns,
                included_extensions = excluded.included_extensions,
                min_size_bytes = excluded.min_size_bytes
            "#,
        )
        .bind(&config.remote)
        .bind(config.auto_index_interval_min)
        .bind(config.last_indexed_at.map(|t| t.to_rfc3339()))
        .bind(config.status.as_str())
        .bind(&config.error_msg)
        .bind(&config.excluded_patterns)
        .bind(&config.included_extensions)
        .bind(config.min_size_bytes)
        .execute(&self.pool)
        .await
        .context("failed saving index config")?;
        Ok(())
    }

    /// Sets status and error, creating the row when the remote has none.
    pub async fn set_index_status(&self, remote: &str, status: IndexStatus, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO remote_index_config (remote, status, error_msg) VALUES (?, ?, ?)
            ON CONFLICT(remote) DO UPDATE SET status = excluded.status, error_msg = excluded.error_msg
            "#,
        )
        .bind(remote)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .context("failed updating index status")?;
        Ok(())
    }

    /// Records a successful run: idle, no error, `last_indexed_at` = `at`.
    pub async fn mark_indexed(&self, remote: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO remote_index_config (remote, last_indexed_at, status, error_msg)
            VALUES (?, ?, 'idle', '')
            ON CONFLICT(remote) DO UPDATE SET
                last_indexed_at = excluded.last_indexed_at,
                status = excluded.status,
                error_msg = excluded.error_msg
            "#,
        )
        .bind(remote)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed marking remote indexed")?;
        Ok(())
    }

    /// Runs interrupted by a restart are left in `indexing`; they go back to idle.
    pub async fn reset_stuck_indexing(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE remote_index_config SET status = 'idle' WHERE status = 'indexing'",
        )
        .execute(&self.pool)
        .await
        .context("failed resetting stuck indexing")?;
        Ok(result.rows_affected())
    }
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn row_to_indexed_file(row: sqlx::sqlite::SqliteRow) -> Result<IndexedFile> {
    Ok(IndexedFile {
        id: row.try_get("id")?,
        remote: row.try_get("remote")?,
        path: row.try_get("path")?,
        name: row.try_get("filename")?,
        size: row.try_get("size")?,
        mod_time: row.try_get("mod_time")?,
        is_dir: row.try_get("is_dir")?,
        last_indexed_at: parse_timestamp(row.try_get::<String, _>("last_indexed_at")?)?,
    })
}

fn row_to_index_config(row: sqlx::sqlite::SqliteRow) -> Result<RemoteIndexConfig> {
    let last_indexed_at = row
        .try_get::<Option<String>, _>("last_indexed_at")?
        .map(parse_timestamp)
        .transpose()?;
    Ok(RemoteIndexConfig {
        remote: row.try_get("remote")?,
        auto_index_interval_min: row.try_get("auto_index_interval_mins")?,
        last_indexed_at,
        status: row
            .try_get::<String, _>("status")?
            .parse()
            .unwrap_or_default(),
        error_msg: row.try_get("error_msg")?,
        excluded_patterns: row.try_get("excluded_patterns")?,
        included_extensions: row.try_get("included_extensions")?,
        min_size_bytes: row.try_get("min_size_bytes")?,
    })
}

#[derive(Clone, Copy)]
enum StatColumn {
    TotalDownloaded,
    TotalUploaded,
    TotalTasks,
    CompletedTasks,
    UploadedTasks,
    FailedTasks,
}

impl StatColumn {
    fn as_str(self) -> &'static str {
        match self {
            Self::TotalDownloaded => "total_downloaded",
            Self::TotalUploaded => "total_uploaded",
            Self::TotalTasks => "total_tasks",
            Self::CompletedTasks => "completed_tasks",
            Self::UploadedTasks => "uploaded_tasks",
            Self::FailedTasks => "failed_tasks",
        }
    }
}

fn status_filter(statuses: &[DownloadStatus]) -> String {
    if statuses.is_empty() {
        return String::new();
    }
    let list = statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("WHERE status IN ({list})")
}

fn row_to_task(row: sqlx::sqlite::SqliteRow) -> Result<Task> {
    let status =
        DownloadStatus::from_str(&row.try_get::<String, _>("status")?).unwrap_or(DownloadStatus::Waiting);
    let upload_status = UploadStatus::from_str(&row.try_get::<String, _>("upload_status")?)
        .unwrap_or(UploadStatus::Idle);
    let files: Vec<DownloadFile> =
        serde_json::from_str(&row.try_get::<String, _>("files_json")?).unwrap_or_default();

    Ok(Task {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        uris: json_to_vec(&row.try_get::<String, _>("uris_json")?),
        torrent: row.try_get::<Option<String>, _>("torrent")?,
        metalink: row.try_get::<Option<String>, _>("metalink")?,
        options: json_to_map(&row.try_get::<String, _>("options_json")?),
        name: row.try_get("name")?,
        dir: row.try_get("dir")?,
        file_path: row.try_get("file_path")?,
        destination: row.try_get("destination")?,
        provider: row.try_get("provider")?,
        resolved_url: row.try_get("resolved_url")?,
        status,
        upload_status,
        upload_job_id: row.try_get("upload_job_id")?,
        error: row.try_get("error")?,
        size: row.try_get("size")?,
        downloaded: row.try_get("downloaded")?,
        uploaded: row.try_get("uploaded")?,
        speed: row.try_get("speed")?,
        upload_speed: row.try_get("upload_speed")?,
        eta: row.try_get("eta")?,
        seeders: row.try_get("seeders")?,
        peers: row.try_get("peers")?,
        priority: row.try_get("priority")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        is_magnet: row.try_get("is_magnet")?,
        magnet_hash: row.try_get("magnet_hash")?,
        selected_files: json_to_vec(&row.try_get::<String, _>("selected_files_json")?),
        files,
        created_at: parse_timestamp(row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(row.try_get::<String, _>("updated_at")?)?,
        started_at: row
            .try_get::<Option<String>, _>("started_at")?
            .map(parse_timestamp)
            .transpose()?,
        completed_at: row
            .try_get::<Option<String>, _>("completed_at")?
            .map(parse_timestamp)
            .transpose()?,
    })
}

fn row_to_provider(row: sqlx::sqlite::SqliteRow) -> Result<ProviderRecord> {
    let config: BTreeMap<String, String> =
        serde_json::from_str(&row.try_get::<String, _>("config_json")?).unwrap_or_default();
    let cached_account: Option<AccountInfo> = row
        .try_get::<Option<String>, _>("cached_account_json")?
        .and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(ProviderRecord {
        name: row.try_get("name")?,
        enabled: row.try_get("enabled")?,
        priority: row.try_get("priority")?,
        config,
        cached_hosts: json_to_vec(&row.try_get::<String, _>("cached_hosts_json")?),
        cached_account,
        updated_at: parse_timestamp(row.try_get::<String, _>("updated_at")?)?,
    })
}

fn parse_timestamp(s: String) -> Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(&s)
        .with_context(|| format!("invalid timestamp {s}"))?
        .with_timezone(&Utc);
    Ok(dt)
}

fn vec_to_json(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn json_to_vec(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn map_to_json(map: &JsonMap<String, Value>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

fn json_to_map(raw: &str) -> JsonMap<String, Value> {
    serde_json::from_str(raw).unwrap_or_default()
}
