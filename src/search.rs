//! Remote file index.
//!
//! Each remote is walked through rclone, filtered by its index config and
//! stored in SQLite so files can be found by name without listing remotes
//! again. A background loop re-indexes remotes whose interval has passed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::db::TaskDb;
use crate::models::{IndexConfigUpdate, IndexStatus, IndexedFile, RemoteIndexConfig};
use crate::rclone::{FileInfo, RcloneClient};
use crate::service::{ServiceError, ServiceResult};

pub const AUTO_INDEX_TICK: Duration = Duration::from_secs(300);

type Running = Arc<Mutex<HashSet<String>>>;

/// Marks a remote as being indexed until dropped.
struct IndexClaim {
    running: Running,
    remote: String,
}

impl Drop for IndexClaim {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.remote);
        }
    }
}

/// File filters from a [`RemoteIndexConfig`]. Folders always pass.
struct IndexFilter {
    min_size: i64,
    extensions: Vec<String>,
    exclude: Option<Regex>,
}

impl IndexFilter {
    fn new(config: &RemoteIndexConfig) -> Self {
        let exclude = match config.excluded_patterns.trim() {
            "" => None,
            pattern => Regex::new(pattern)
                .inspect_err(|err| warn!("ignoring bad exclude pattern for {}: {err}", config.remote))
                .ok(),
        };
        Self {
            min_size: config.min_size_bytes,
            extensions: parse_extensions(&config.included_extensions),
            exclude,
        }
    }

    fn keeps(&self, file: &FileInfo) -> bool {
        if file.is_dir {
            return true;
        }
        if self.min_size > 0 && file.size < self.min_size {
            return false;
        }
        if !self.extensions.is_empty() {
            let name = file.name.to_ascii_lowercase();
            if !self.extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
                return false;
            }
        }
        !self.exclude.as_ref().is_some_and(|re| re.is_match(&file.path))
    }
}

/// `"mkv, .MP4"` becomes `[".mkv", ".mp4"]`.
fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!(".{ext}"))
        .collect()
}

fn validate_remote(remote: &str) -> ServiceResult<()> {
    if remote.trim().is_empty() || remote.contains('/') || remote.contains(':') {
        return Err(ServiceError::Validation(format!("invalid remote name {remote:?}")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct SearchService {
    db: TaskDb,
    rclone: RcloneClient,
    running: Running,
}

impl SearchService {
    pub fn new(db: TaskDb, rclone: RcloneClient) -> Self {
        Self {
            db,
            rclone,
            running: Arc::default(),
        }
    }

    pub fn is_indexing(&self, remote: &str) -> bool {
        self.running
            .lock()
            .map(|running| running.contains(remote))
            .unwrap_or(false)
    }

    fn claim(&self, remote: &str) -> ServiceResult<IndexClaim> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| ServiceError::Internal(anyhow::anyhow!("index registry poisoned")))?;
        if !running.insert(remote.to_string()) {
            return Err(ServiceError::InvalidTransition(format!(
                "indexing already in progress for {remote}"
            )));
        }
        Ok(IndexClaim {
            running: self.running.clone(),
            remote: remote.to_string(),
        })
    }

    /// Page of indexed files matching `query`, plus the total match count.
    pub async fn search(
        &self,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> ServiceResult<(Vec<IndexedFile>, i64)> {
        if query.replace('"', "").trim().is_empty() {
            return Err(ServiceError::Validation("missing query".to_string()));
        }
        Ok(self.db.search_files(query, limit, offset).await?)
    }

    /// One config per rclone remote, stored values where they exist. Falls
    /// back to the stored configs when rclone cannot list remotes.
    pub async fn configs(&self) -> ServiceResult<Vec<RemoteIndexConfig>> {
        let stored = self.db.index_configs().await?;
        let remotes = match self.rclone.list_remotes().await {
            Ok(remotes) => remotes,
            Err(err) => {
                debug!("remotes unavailable, listing stored index configs: {err}");
                return Ok(stored);
            }
        };
        let mut by_remote: HashMap<String, RemoteIndexConfig> = stored
            .into_iter()
            .map(|config| (config.remote.clone(), config))
            .collect();
        Ok(remotes
            .into_iter()
            .map(|remote| {
                by_remote
                    .remove(&remote.name)
                    .unwrap_or_else(|| RemoteIndexConfig::new(remote.name))
            })
            .collect())
    }

    pub async fn update_config(
        &self,
        remote: &str,
        update: IndexConfigUpdate,
    ) -> ServiceResult<RemoteIndexConfig> {
        validate_remote(remote)?;
        if update.interval < 0 {
            return Err(ServiceError::Validation(
                "interval must not be negative".to_string(),
            ));
        }
        if let Some(pattern) = update.excluded_patterns.as_deref().map(str::trim) {
            if !pattern.is_empty() {
                Regex::new(pattern).map_err(|err| {
                    ServiceError::Validation(format!("invalid exclude pattern: {err}"))
                })?;
            }
        }

        let mut config = self
            .db
            .index_config(remote)
            .await?
            .unwrap_or_else(|| RemoteIndexConfig::new(remote));
        config.auto_index_interval_min = update.interval;
        if let Some(patterns) = update.excluded_patterns {
            config.excluded_patterns = patterns.trim().to_string();
        }
        if let Some(extensions) = update.included_extensions {
            config.included_extensions = extensions.trim().to_string();
        }
        if let Some(min_size) = update.min_size_bytes {
            config.min_size_bytes = min_size.max(0);
        }
        self.db.put_index_config(&config).await?;
        Ok(config)
    }

    /// Indexes `remote` and waits for the result. Returns the number of
    /// entries stored.
    pub async fn index_remote(&self, remote: &str) -> ServiceResult<usize> {
        validate_remote(remote)?;
        let claim = self.claim(remote)?;
        self.run_index(claim).await
    }

    /// Starts indexing in the background. Fails only when the remote is
    /// invalid or already being indexed.
    pub fn start_index(&self, remote: &str) -> ServiceResult<JoinHandle<()>> {
        validate_remote(remote)?;
        let claim = self.claim(remote)?;
        let this = self.clone();
        Ok(tokio::spawn(async move {
            let remote = claim.remote.clone();
            if let Err(err) = this.run_index(claim).await {
                warn!("indexing {remote} failed: {err}");
            }
        }))
    }

    async fn run_index(&self, claim: IndexClaim) -> ServiceResult<usize> {
        let remote = claim.remote.as_str();
        info!("indexing remote {remote}");
        self.db
            .set_index_status(remote, IndexStatus::Indexing, "")
            .await?;

        let result = self.collect(remote).await;
        let stored = match result {
            Ok(files) => self
                .db
                .replace_indexed_files(remote, &files)
                .await
                .map(|()| files.len())
                .map_err(ServiceError::from),
            Err(err) => Err(err),
        };

        match stored {
            Ok(count) => {
                self.db.mark_indexed(remote, Utc::now()).await?;
                info!("indexed {count} entries on {remote}");
                Ok(count)
            }
            Err(err) => {
                self.db
                    .set_index_status(remote, IndexStatus::Error, &err.to_string())
                    .await?;
                Err(err)
            }
        }
    }

    /// Walks the remote depth-first. A failing root listing fails the run;
    /// unreadable subfolders are skipped.
    async fn collect(&self, remote: &str) -> ServiceResult<Vec<IndexedFile>> {
        let config = self
            .db
            .index_config(remote)
            .await?
            .unwrap_or_else(|| RemoteIndexConfig::new(remote));
        let filter = IndexFilter::new(&config);
        let prefix = format!("/{remote}/");
        let now = Utc::now();

        let mut files = Vec::new();
        let mut pending = vec![String::new()];
        while let Some(dir) = pending.pop() {
            let listing = match self.rclone.list(&format!("{prefix}{dir}")).await {
                Ok(listing) => listing,
                Err(err) if !dir.is_empty() => {
                    warn!("skipping {prefix}{dir} while indexing: {err}");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            for item in listing {
                if !filter.keeps(&item) {
                    continue;
                }
                if item.is_dir {
                    let sub = item.path.strip_prefix(&prefix).unwrap_or(&item.path);
                    pending.push(sub.trim_matches('/').to_string());
                }
                files.push(IndexedFile {
                    id: uuid::Uuid::new_v4().to_string(),
                    remote: remote.to_string(),
                    path: item.path,
                    name: item.name,
                    size: item.size,
                    mod_time: item.mod_time,
                    is_dir: item.is_dir,
                    last_indexed_at: now,
                });
            }
        }
        Ok(files)
    }

    /// Starts every remote whose interval has passed. Returns the remotes
    /// started.
    pub async fn auto_index_once(&self) -> Vec<String> {
        let configs = match self.db.index_configs().await {
            Ok(configs) => configs,
            Err(err) => {
                warn!("auto-index skipped: {err:#}");
                return Vec::new();
            }
        };
        let now = Utc::now();
        let mut started = Vec::new();
        for config in configs {
            if !config.is_due(now) || self.is_indexing(&config.remote) {
                continue;
            }
            match self.start_index(&config.remote) {
                Ok(_) => started.push(config.remote),
                Err(err) => debug!("auto-index of {} not started: {err}", config.remote),
            }
        }
        started
    }

    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run_auto_index(AUTO_INDEX_TICK, shutdown))
    }

    async fn run_auto_index(self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        match self.db.reset_stuck_indexing().await {
            Ok(0) => {}
            Ok(n) => info!("reset {n} interrupted index runs"),
            Err(err) => warn!("failed resetting index state: {err:#}"),
        }
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    self.auto_index_once().await;
                }
            }
        }
    }
}
