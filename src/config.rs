use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::RngCore;
use serde::Deserialize;
use uuid::Uuid;

use crate::torrent::hex;

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    bind_addr: Option<String>,
    data_dir: Option<String>,
    database_path: Option<String>,
    download_dir: Option<String>,
    static_dir: Option<String>,
    aria2_rpc_url: Option<String>,
    aria2_secret: Option<String>,
    rclone_rc_url: Option<String>,
    api_key: Option<String>,
    poll_interval_secs: Option<u64>,
    publish_interval_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    manage_engines: Option<bool>,
    aria2_cmd: Option<String>,
    rclone_cmd: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ApiConfig {
    api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RootConfig {
    #[serde(default, flatten)]
    top: FileConfig,
    gravity: Option<FileConfig>,
    api: Option<ApiConfig>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: String,
    pub database_path: String,
    pub download_dir: String,
    pub static_dir: String,
    pub aria2_rpc_url: String,
    pub aria2_secret: String,
    pub rclone_rc_url: String,
    pub api_key: String,
    pub poll_interval_secs: u64,
    pub publish_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub manage_engines: bool,
    pub aria2_cmd: String,
    pub rclone_cmd: String,
    pub config_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            data_dir: "./gravity-data".to_string(),
            database_path: String::new(),
            download_dir: String::new(),
            static_dir: String::new(),
            aria2_rpc_url: "ws://127.0.0.1:6800/jsonrpc".to_string(),
            aria2_secret: String::new(),
            rclone_rc_url: "http://127.0.0.1:5572".to_string(),
            api_key: String::new(),
            poll_interval_secs: 30,
            publish_interval_ms: 1000,
            request_timeout_secs: 30,
            manage_engines: false,
            aria2_cmd: "aria2c".to_string(),
            rclone_cmd: "rclone".to_string(),
            config_path: PathBuf::from("gravity.toml"),
        }
    }
}

impl AppConfig {
    pub fn load() -> Self {
        let mut cfg = Self::default();

        let config_path = find_config_file().unwrap_or_else(|| config_search_paths()[0].clone());
        cfg.config_path = config_path.clone();

        let RootConfig { top, gravity, api } = load_root_config(&config_path).unwrap_or_default();

        cfg.apply_file(top);
        if let Some(section) = gravity {
            cfg.apply_file(section);
        }

        if cfg.api_key.is_empty() {
            if let Some(api_key) = api.and_then(|entry| entry.api_key) {
                cfg.api_key = api_key;
            }
        }

        cfg.apply_env();

        cfg.ensure_aria2_secret();
        cfg
    }

    /// The RPC secret always exists before any engine starts or any client connects.
    fn ensure_aria2_secret(&mut self) {
        if self.aria2_secret.trim().is_empty() {
            self.aria2_secret = generate_secret();
        }
    }

    fn apply_file(&mut self, file_cfg: FileConfig) {
        set_opt(&mut self.bind_addr, file_cfg.bind_addr);
        set_opt(&mut self.data_dir, file_cfg.data_dir);
        set_opt(&mut self.database_path, file_cfg.database_path);
        set_opt(&mut self.download_dir, file_cfg.download_dir);
        set_opt(&mut self.static_dir, file_cfg.static_dir);
        set_opt(&mut self.aria2_rpc_url, file_cfg.aria2_rpc_url);
        set_opt(&mut self.aria2_secret, file_cfg.aria2_secret);
        set_opt(&mut self.rclone_rc_url, file_cfg.rclone_rc_url);
        set_opt(&mut self.api_key, file_cfg.api_key);
        set_opt_u64_min(&mut self.poll_interval_secs, file_cfg.poll_interval_secs, 1);
        set_opt_u64_min(
            &mut self.publish_interval_ms,
            file_cfg.publish_interval_ms,
            100,
        );
        set_opt_u64_min(
            &mut self.request_timeout_secs,
            file_cfg.request_timeout_secs,
            1,
        );
        set_opt(&mut self.manage_engines, file_cfg.manage_engines);
        set_opt(&mut self.aria2_cmd, file_cfg.aria2_cmd);
        set_opt(&mut self.rclone_cmd, file_cfg.rclone_cmd);
    }

    fn apply_env(&mut self) {
        let env_cfg = FileConfig {
            bind_addr: env_string("GRAVITY_BIND_ADDR").or_else(|| {
                env_parse::<u16>("GRAVITY_PORT").map(|port| format!("0.0.0.0:{port}"))
            }),
            data_dir: env_string("GRAVITY_DATA_DIR"),
            database_path: env_string("GRAVITY_DATABASE_PATH"),
            download_dir: env_string("GRAVITY_DOWNLOAD_DIR"),
            static_dir: env_string("GRAVITY_STATIC_DIR"),
            aria2_rpc_url: env_string("GRAVITY_ARIA2_RPC_URL"),
            aria2_secret: env_string("GRAVITY_ARIA2_SECRET"),
            rclone_rc_url: env_string("GRAVITY_RCLONE_RC_URL"),
            api_key: env_string("GRAVITY_API_KEY"),
            poll_interval_secs: env_parse("GRAVITY_POLL_INTERVAL_SECS"),
            publish_interval_ms: env_parse("GRAVITY_PUBLISH_INTERVAL_MS"),
            request_timeout_secs: env_parse("GRAVITY_REQUEST_TIMEOUT_SECS"),
            manage_engines: env_parse("GRAVITY_MANAGE_ENGINES"),
            aria2_cmd: env_string("GRAVITY_ARIA2_CMD"),
            rclone_cmd: env_string("GRAVITY_RCLONE_CMD"),
        };
        self.apply_file(env_cfg);
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        if self.database_path.is_empty() {
            self.data_dir().join("gravity.db")
        } else {
            PathBuf::from(&self.database_path)
        }
    }

    pub fn download_dir(&self) -> PathBuf {
        if self.download_dir.is_empty() {
            self.data_dir().join("downloads")
        } else {
            PathBuf::from(&self.download_dir)
        }
    }

    /// Where aria2 drops `.torrent` files fetched for magnet inspection.
    pub fn metadata_dir(&self) -> PathBuf {
        self.data_dir().join("metadata")
    }

    pub fn static_dir(&self) -> Option<PathBuf> {
        if self.static_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.static_dir))
        }
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("gravity.toml"), PathBuf::from("config.toml")];
    if let Some(home) = dirs_home() {
        paths.push(home.join(".config").join("gravity").join("config.toml"));
    }
    paths
}

pub fn find_config_file() -> Option<PathBuf> {
    config_search_paths().into_iter().find(|path| path.exists())
}

pub fn persist_api_key(path: &Path, api_key: &str) -> Result<()> {
    let mut table = load_toml_table(path).unwrap_or_default();

    // Top-level and [gravity] keys take precedence on load.
    table.remove("api_key");
    if let Some(section) = table.get_mut("gravity").and_then(toml::Value::as_table_mut) {
        section.remove("api_key");
    }

    let mut api = table
        .remove("api")
        .and_then(|v| v.as_table().cloned())
        .unwrap_or_default();
    api.insert(
        "api_key".to_string(),
        toml::Value::String(api_key.to_string()),
    );
    table.insert("api".to_string(), toml::Value::Table(api));

    let encoded = toml::to_string(&table).context("failed encoding toml")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating config dir {parent:?}"))?;
    }
    fs::write(path, encoded).with_context(|| format!("failed writing config to {path:?}"))?;
    Ok(())
}

pub fn generate_api_key() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// 16 random bytes as hex, used as the aria2 RPC secret.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex(&bytes)
}

fn load_toml_table(path: &Path) -> Result<toml::value::Table> {
    if !path.exists() {
        return Ok(Default::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("failed reading {path:?}"))?;
    let value = toml::from_str::<toml::Value>(&raw).context("failed parsing toml")?;
    Ok(value.as_table().cloned().unwrap_or_default())
}

fn dirs_home() -> Option<PathBuf> {
    env::var("HOME").ok().map(PathBuf::from)
}

fn load_root_config(path: &Path) -> Result<RootConfig> {
    if !path.exists() {
        return Ok(RootConfig::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("failed reading {path:?}"))?;
    parse_root_config(&raw)
}

fn parse_root_config(raw: &str) -> Result<RootConfig> {
    toml::from_str::<RootConfig>(raw).context("failed parsing config as root structure")
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn set_opt<T>(dst: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *dst = v;
    }
}

fn set_opt_u64_min(dst: &mut u64, value: Option<u64>, min: u64) {
    if let Some(v) = value {
        *dst = v.max(min);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_overrides_top_level() {
        let root = parse_root_config(
            r#"
            bind_addr = "127.0.0.1:9000"
            poll_interval_secs = 0

            [gravity]
            aria2_rpc_url = "http://10.0.0.2:6800/jsonrpc"

            [api]
            api_key = "from-api-section"
            "#,
        )
        .expect("parse config");

        let mut cfg = AppConfig::default();
        cfg.apply_file(root.top);
        if let Some(section) = root.gravity {
            cfg.apply_file(section);
        }

        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.poll_interval_secs, 1);
        assert_eq!(cfg.aria2_rpc_url, "http://10.0.0.2:6800/jsonrpc");
        assert_eq!(
            root.api.and_then(|a| a.api_key).as_deref(),
            Some("from-api-section")
        );
    }

    #[test]
    fn derived_paths_follow_data_dir() {
        let cfg = AppConfig {
            data_dir: "/srv/gravity".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(cfg.database_path(), PathBuf::from("/srv/gravity/gravity.db"));
        assert_eq!(cfg.download_dir(), PathBuf::from("/srv/gravity/downloads"));
        assert!(cfg.static_dir().is_none());
    }

    #[test]
    fn api_key_round_trips_through_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gravity.toml");
        fs::write(&path, "bind_addr = \"0.0.0.0:1\"\n").expect("seed config");

        persist_api_key(&path, "abc123").expect("persist key");
        let root = load_root_config(&path).expect("reload");
        assert_eq!(root.top.bind_addr.as_deref(), Some("0.0.0.0:1"));
        assert_eq!(root.api.and_then(|a| a.api_key).as_deref(), Some("abc123"));
    }

    #[test]
    fn empty_aria2_secret_is_generated_without_managed_engines() {
        let mut cfg = AppConfig::default();
        assert!(!cfg.manage_engines);
        cfg.ensure_aria2_secret();
        assert_eq!(cfg.aria2_secret.len(), 32);

        let mut configured = AppConfig {
            aria2_secret: "s3cret".to_string(),
            ..AppConfig::default()
        };
        configured.ensure_aria2_secret();
        assert_eq!(configured.aria2_secret, "s3cret");
    }

    #[test]
    fn generated_secrets_are_hex() {
        assert_eq!(generate_secret().len(), 32);
        assert_eq!(generate_api_key().len(), 64);
    }
}
