use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, TimeZone};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::db::TaskDb;
use crate::engines::Engines;
use crate::events::EventBus;
use crate::gateway::Gateway;
use crate::offload::Offloader;
use crate::providers::ProviderRegistry;
use crate::rclone::RcloneClient;
use crate::rpc::Aria2Client;
use crate::search::SearchService;
use crate::service::DownloadService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: TaskDb,
    pub aria2: Arc<Aria2Client>,
    pub rclone: RcloneClient,
    pub events: EventBus,
    pub offloader: Arc<Offloader>,
    pub service: Arc<DownloadService>,
    pub gateway: Arc<Gateway>,
    pub search: Arc<SearchService>,
    pub engines: Arc<Engines>,
    pub build: BuildStamp,
    pub config_path: PathBuf,
    pub api_key: Arc<RwLock<String>>,
}

impl AppState {
    /// Wires the service layer on top of the clients.
    pub fn assemble(
        config: Arc<AppConfig>,
        db: TaskDb,
        aria2: Arc<Aria2Client>,
        rclone: RcloneClient,
        providers: Arc<ProviderRegistry>,
        events: EventBus,
    ) -> Self {
        let offloader = Arc::new(Offloader::new(
            aria2.clone(),
            rclone.clone(),
            db.clone(),
            events.clone(),
        ));
        let service = Arc::new(DownloadService::new(
            aria2.clone(),
            rclone.clone(),
            db.clone(),
            events.clone(),
            providers,
            offloader.clone(),
            config.download_dir().to_string_lossy().into_owned(),
            config.metadata_dir(),
        ));
        let gateway = Arc::new(Gateway::new(
            aria2.clone(),
            rclone.clone(),
            db.clone(),
            offloader.clone(),
        ));
        let search = Arc::new(SearchService::new(db.clone(), rclone.clone()));
        let engines = Arc::new(Engines::new(config.clone()));
        Self {
            config_path: config.config_path.clone(),
            api_key: Arc::new(RwLock::new(config.api_key.clone())),
            config,
            db,
            aria2,
            rclone,
            events,
            offloader,
            service,
            gateway,
            search,
            engines,
            build: BuildStamp::capture(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildStamp {
    pub version: &'static str,
    pub hash: String,
    pub timestamp: String,
    pub epoch: i64,
}

impl BuildStamp {
    pub fn capture() -> Self {
        let now = Local::now();
        let epoch = option_env!("BUILD_EPOCH")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or_else(|| now.timestamp());
        let built_at = Local.timestamp_opt(epoch, 0).single().unwrap_or(now);
        let hash = option_env!("BUILD_HASH")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or("unknown")
            .to_string();

        Self {
            version: env!("CARGO_PKG_VERSION"),
            hash,
            timestamp: built_at.format("%Y-%m-%d %H:%M:%S %Z").to_string(),
            epoch: built_at.timestamp(),
        }
    }
}
