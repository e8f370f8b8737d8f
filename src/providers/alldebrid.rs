use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{
    ConfigField, Headers, Provider, ProviderError, ProviderKind, ResolveResult, url_host,
};
use crate::models::{AccountInfo, MagnetFile, MagnetInfo};
use crate::torrent::is_magnet;

const BASE_URL: &str = "https://api.alldebrid.com/v4.1";
const AGENT: &str = "gravity";
const NAME: &str = "alldebrid";

#[derive(Debug, Deserialize, Default)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// AllDebrid's `{status, data, error}` envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<ApiError>,
}

impl Envelope {
    fn into_data(self) -> Result<Value, ProviderError> {
        if self.status == "success" {
            Ok(self.data)
        } else {
            let message = self
                .error
                .map(|e| e.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "request failed".to_string());
            Err(ProviderError::api(NAME, message))
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct UploadedMagnet {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct FileNode {
    #[serde(rename = "n", default)]
    name: String,
    #[serde(rename = "s", default)]
    size: i64,
    #[serde(rename = "l", default)]
    link: String,
    #[serde(rename = "e", default)]
    children: Vec<FileNode>,
}

pub struct AllDebridProvider {
    base_url: String,
    http: reqwest::Client,
    api_key: RwLock<String>,
    hosts: RwLock<Vec<String>>,
}

impl Default for AllDebridProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AllDebridProvider {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            api_key: RwLock::new(String::new()),
            hosts: RwLock::new(Vec::new()),
        }
    }

    fn api_key(&self) -> String {
        self.api_key.read().map(|k| k.clone()).unwrap_or_default()
    }

    fn cached_hosts(&self) -> Vec<String> {
        self.hosts.read().map(|h| h.clone()).unwrap_or_default()
    }

    fn require_key(&self) -> Result<String, ProviderError> {
        let key = self.api_key();
        if key.is_empty() {
            Err(ProviderError::NotConfigured(NAME.to_string()))
        } else {
            Ok(key)
        }
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ProviderError> {
        let key = self.api_key();
        let envelope = self
            .http
            .get(format!("{}/{path}", self.base_url))
            .query(&[("agent", AGENT), ("apikey", key.as_str())])
            .query(query)
            .send()
            .await?
            .json::<Envelope>()
            .await?;
        envelope.into_data()
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<Value, ProviderError> {
        let key = self.api_key();
        let envelope = self
            .http
            .post(format!("{}/{path}", self.base_url))
            .query(&[("agent", AGENT), ("apikey", key.as_str())])
            .form(form)
            .send()
            .await?
            .json::<Envelope>()
            .await?;
        envelope.into_data()
    }

    async fn fetch_hosts(&self) -> Result<Vec<String>, ProviderError> {
        let data = self.get("hosts", &[]).await?;
        let mut hosts = data
            .get("hosts")
            .and_then(Value::as_object)
            .map(|map| {
                map.values()
                    .filter_map(|h| h.get("domain").and_then(Value::as_str))
                    .map(str::to_ascii_lowercase)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        hosts.sort();
        hosts.dedup();
        Ok(hosts)
    }
}

/// Converts AllDebrid's `{n, s, l, e}` tree. Files use their link as id so a
/// selection maps straight back to unlockable URLs.
fn parse_file_nodes(nodes: Vec<FileNode>, parent: &str) -> Vec<MagnetFile> {
    nodes
        .into_iter()
        .enumerate()
        .map(|(i, node)| {
            let path = if parent.is_empty() {
                node.name.clone()
            } else {
                format!("{parent}/{}", node.name)
            };
            if node.children.is_empty() {
                MagnetFile {
                    id: node.link.clone(),
                    name: node.name,
                    path,
                    size: node.size,
                    link: node.link,
                    is_folder: false,
                    children: Vec::new(),
                    index: 0,
                }
            } else {
                let children = parse_file_nodes(node.children, &path);
                let size = children.iter().map(|c| c.size).sum();
                MagnetFile {
                    id: format!("folder_{i}_{path}"),
                    name: node.name,
                    path,
                    size,
                    link: String::new(),
                    is_folder: true,
                    children,
                    index: 0,
                }
            }
        })
        .collect()
}

#[async_trait]
impl Provider for AllDebridProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn display_name(&self) -> &'static str {
        "AllDebrid"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Debrid
    }

    fn config_schema(&self) -> Vec<ConfigField> {
        vec![ConfigField::api_key(
            "Get your API key from alldebrid.com/apikeys",
        )]
    }

    async fn configure(&self, config: &BTreeMap<String, String>) -> Result<(), ProviderError> {
        let key = config.get("api_key").cloned().unwrap_or_default();
        if let Ok(mut guard) = self.api_key.write() {
            *guard = key.clone();
        }
        if key.is_empty() {
            return Ok(());
        }
        match self.fetch_hosts().await {
            Ok(hosts) => {
                if let Ok(mut guard) = self.hosts.write() {
                    *guard = hosts;
                }
            }
            Err(err) => debug!("alldebrid host list unavailable: {err}"),
        }
        Ok(())
    }

    fn is_configured(&self) -> bool {
        !self.api_key().is_empty()
    }

    fn supports(&self, url: &str) -> bool {
        if is_magnet(url) {
            return true;
        }
        let Some(host) = url_host(url) else {
            return false;
        };
        self.cached_hosts()
            .iter()
            .any(|h| host == *h || host.ends_with(&format!(".{h}")))
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn resolve(&self, url: &str, _headers: &Headers) -> Result<ResolveResult, ProviderError> {
        self.require_key()?;
        let data = self.get("link/unlock", &[("link", url)]).await?;
        let link = data
            .get("link")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if link.is_empty() {
            return Err(ProviderError::api(NAME, "no download link returned"));
        }
        Ok(ResolveResult {
            url: link,
            name: data
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            size: data.get("filesize").and_then(Value::as_i64).unwrap_or(0),
            ..Default::default()
        })
    }

    async fn test(&self) -> Result<AccountInfo, ProviderError> {
        self.require_key()?;
        let data = self.get("user", &[]).await?;
        let user = data.get("user").cloned().unwrap_or(Value::Null);
        let expires_at = user
            .get("premiumUntil")
            .and_then(Value::as_i64)
            .filter(|ts| *ts > 0)
            .and_then(|ts| DateTime::from_timestamp(ts, 0));
        Ok(AccountInfo {
            username: user
                .get("username")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            is_premium: user
                .get("isPremium")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            expires_at,
        })
    }

    async fn hosts(&self) -> Result<Vec<String>, ProviderError> {
        let cached = self.cached_hosts();
        if !cached.is_empty() {
            return Ok(cached);
        }
        let hosts = self.fetch_hosts().await?;
        if let Ok(mut guard) = self.hosts.write() {
            *guard = hosts.clone();
        }
        Ok(hosts)
    }

    fn supports_magnets(&self) -> bool {
        true
    }

    /// Uploads the magnet; cached ones come back ready with their file tree.
    async fn check_magnet(&self, magnet: &str) -> Result<Option<MagnetInfo>, ProviderError> {
        self.require_key()?;
        let data = self.post_form("magnet/upload", &[("magnets[]", magnet)]).await?;
        let uploaded: Vec<UploadedMagnet> = data
            .get("magnets")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| ProviderError::api(NAME, err.to_string()))?
            .unwrap_or_default();
        let Some(m) = uploaded.into_iter().next() else {
            return Err(ProviderError::api(NAME, "failed to upload/check"));
        };
        if let Some(err) = m.error {
            return Err(ProviderError::api(NAME, err.message));
        }

        let magnet_id = m.id.to_string();
        let files = if m.ready {
            self.magnet_files(&magnet_id).await?
        } else {
            Vec::new()
        };
        Ok(Some(MagnetInfo {
            source: NAME.to_string(),
            cached: m.ready,
            magnet_id,
            name: m.name,
            hash: m.hash.to_ascii_lowercase(),
            size: m.size,
            files,
        }))
    }

    async fn magnet_files(&self, magnet_id: &str) -> Result<Vec<MagnetFile>, ProviderError> {
        self.require_key()?;
        let data = self.get("magnet/status", &[("id", magnet_id)]).await?;
        let magnets = data.get("magnets").cloned().unwrap_or(Value::Null);
        let entry = match magnets {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            other => other,
        };
        let nodes: Vec<FileNode> = entry
            .get("files")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| ProviderError::api(NAME, err.to_string()))?
            .unwrap_or_default();
        Ok(parse_file_nodes(nodes, ""))
    }

    async fn delete_magnet(&self, magnet_id: &str) -> Result<(), ProviderError> {
        self.require_key()?;
        self.post_form("magnet/delete", &[("id", magnet_id)]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use axum::extract::Query;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve() -> String {
        let app = Router::new()
            .route(
                "/hosts",
                get(|| async {
                    Json(json!({"status": "success", "data": {"hosts": {
                        "rapidgator": {"domain": "rapidgator.net"},
                        "uptobox": {"domain": "uptobox.com"}
                    }}}))
                }),
            )
            .route(
                "/link/unlock",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    if q.get("apikey").map(String::as_str) != Some("secret") {
                        return Json(json!({"status": "error", "error": {"code": "AUTH_BAD_APIKEY", "message": "bad key"}}));
                    }
                    Json(json!({"status": "success", "data": {
                        "link": "https://cdn.alldebrid.com/abc/file.mkv",
                        "filename": "file.mkv",
                        "filesize": 2048
                    }}))
                }),
            )
            .route(
                "/magnet/upload",
                post(|| async {
                    Json(json!({"status": "success", "data": {"magnets": [
                        {"id": 77, "hash": "ABCDEF", "name": "Pack", "size": 30, "ready": true}
                    ]}}))
                }),
            )
            .route(
                "/magnet/status",
                get(|| async {
                    Json(json!({"status": "success", "data": {"magnets": {"id": 77, "files": [
                        {"n": "Pack", "e": [
                            {"n": "a.mkv", "s": 10, "l": "https://ad/l/a"},
                            {"n": "b.mkv", "s": 20, "l": "https://ad/l/b"}
                        ]}
                    ]}}}))
                }),
            )
            .route(
                "/user",
                get(|| async {
                    Json(json!({"status": "success", "data": {"user": {
                        "username": "neo", "isPremium": true, "premiumUntil": 1893456000
                    }}}))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    async fn configured(base: &str, key: &str) -> AllDebridProvider {
        let provider = AllDebridProvider::with_base_url(base);
        provider
            .configure(&BTreeMap::from([("api_key".to_string(), key.to_string())]))
            .await
            .expect("configure");
        provider
    }

    #[tokio::test]
    async fn configure_loads_hosts_for_support_checks() {
        let base = serve().await;
        let provider = configured(&base, "secret").await;
        assert!(provider.is_configured());
        assert!(provider.supports("https://rapidgator.net/file/1"));
        assert!(provider.supports("https://www.uptobox.com/x"));
        assert!(provider.supports("magnet:?xt=urn:btih:abc"));
        assert!(!provider.supports("https://example.com/x"));
    }

    #[tokio::test]
    async fn unlock_and_api_errors() {
        let base = serve().await;
        let provider = configured(&base, "secret").await;
        let res = provider
            .resolve("https://rapidgator.net/file/1", &Headers::new())
            .await
            .expect("unlock");
        assert_eq!(res.name, "file.mkv");
        assert_eq!(res.size, 2048);

        let bad = configured(&base, "wrong").await;
        let err = bad
            .resolve("https://rapidgator.net/file/1", &Headers::new())
            .await
            .expect_err("bad key");
        assert_eq!(err, ProviderError::api(NAME, "bad key"));

        let unconfigured = AllDebridProvider::with_base_url(&base);
        assert!(matches!(
            unconfigured.test().await,
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn cached_magnet_comes_back_with_nested_files() {
        let base = serve().await;
        let provider = configured(&base, "secret").await;
        let info = provider
            .check_magnet("magnet:?xt=urn:btih:abcdef")
            .await
            .expect("check")
            .expect("info");
        assert!(info.cached);
        assert_eq!(info.magnet_id, "77");
        assert_eq!(info.hash, "abcdef");
        assert_eq!(info.files.len(), 1);
        let folder = &info.files[0];
        assert!(folder.is_folder);
        assert_eq!(folder.size, 30);
        assert_eq!(folder.children[1].path, "Pack/b.mkv");
        assert_eq!(folder.children[1].id, "https://ad/l/b");

        let account = provider.test().await.expect("account");
        assert_eq!(account.username, "neo");
        assert!(account.is_premium);
        assert!(account.expires_at.is_some());
    }
}
