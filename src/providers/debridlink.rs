use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{ConfigField, Headers, Provider, ProviderError, ProviderKind, ResolveResult, proxied_client};
use crate::models::AccountInfo;
use crate::torrent::is_magnet;

const BASE_URL: &str = "https://debrid-link.com/api/v2";
const NAME: &str = "debridlink";

/// Debrid-Link's `{success, value, error}` envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    value: Option<T>,
    #[serde(default)]
    error: String,
}

impl<T> Envelope<T> {
    fn into_value(self) -> Result<T, ProviderError> {
        match self.value {
            Some(value) if self.success => Ok(value),
            _ if self.error.is_empty() => Err(ProviderError::api(NAME, "request failed")),
            _ => Err(ProviderError::api(NAME, self.error)),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct Download {
    download_link: String,
    name: String,
    size: i64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct Account {
    pseudo: String,
    account_type: i64,
    expiration: i64,
}

pub struct DebridLinkProvider {
    base_url: String,
    api_key: RwLock<String>,
    http: RwLock<reqwest::Client>,
}

impl Default for DebridLinkProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DebridLinkProvider {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: RwLock::new(String::new()),
            http: RwLock::new(proxied_client(Duration::from_secs(10), "")),
        }
    }

    fn require_key(&self) -> Result<String, ProviderError> {
        let key = self.api_key.read().map(|k| k.clone()).unwrap_or_default();
        if key.is_empty() {
            Err(ProviderError::NotConfigured(NAME.to_string()))
        } else {
            Ok(key)
        }
    }

    fn client(&self) -> reqwest::Client {
        self.http.read().map(|c| c.clone()).unwrap_or_default()
    }

    async fn read<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, ProviderError> {
        let key = self.require_key()?;
        req.bearer_auth(key)
            .send()
            .await?
            .json::<Envelope<T>>()
            .await?
            .into_value()
    }
}

#[async_trait]
impl Provider for DebridLinkProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn display_name(&self) -> &'static str {
        "Debrid-Link"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Debrid
    }

    fn config_schema(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::api_key("Get your API key from debrid-link.com/webapp/apikey"),
            ConfigField::proxy_url(),
        ]
    }

    async fn configure(&self, config: &BTreeMap<String, String>) -> Result<(), ProviderError> {
        let proxy = config.get("proxy_url").map(String::as_str).unwrap_or_default();
        if let Ok(mut guard) = self.http.write() {
            *guard = proxied_client(Duration::from_secs(10), proxy);
        }
        if let Ok(mut guard) = self.api_key.write() {
            *guard = config.get("api_key").cloned().unwrap_or_default();
        }
        Ok(())
    }

    fn is_configured(&self) -> bool {
        self.require_key().is_ok()
    }

    fn supports(&self, url: &str) -> bool {
        is_magnet(url) || url.contains("debrid-link.com")
    }

    fn priority(&self) -> i32 {
        85
    }

    async fn resolve(&self, url: &str, _headers: &Headers) -> Result<ResolveResult, ProviderError> {
        let req = self
            .client()
            .post(format!("{}/downloader/add", self.base_url))
            .form(&[("url", url)]);
        let download: Download = self.read(req).await?;
        if download.download_link.is_empty() {
            return Err(ProviderError::api(NAME, "no download link returned"));
        }
        Ok(ResolveResult {
            url: download.download_link,
            name: download.name,
            size: download.size,
            ..Default::default()
        })
    }

    async fn test(&self) -> Result<AccountInfo, ProviderError> {
        let req = self.client().get(format!("{}/account/infos", self.base_url));
        let account: Account = self.read(req).await?;
        Ok(AccountInfo {
            username: account.pseudo,
            is_premium: account.account_type == 1,
            expires_at: DateTime::from_timestamp(account.expiration, 0)
                .filter(|_| account.expiration > 0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use serde_json::{Value, json};

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer dl-key")
    }

    async fn serve() -> String {
        let app = Router::new()
            .route(
                "/downloader/add",
                post(|headers: HeaderMap, Form(form): Form<BTreeMap<String, String>>| async move {
                    if !authorized(&headers) {
                        return Json(json!({"success": false, "error": "badToken"}));
                    }
                    if form.get("url").map(String::as_str) == Some("https://dead.host/x") {
                        return Json(json!({"success": false, "error": "fileNotFound"}));
                    }
                    Json(json!({"success": true, "value": {
                        "downloadLink": "https://dl.debrid-link.com/abc/movie.mkv",
                        "name": "movie.mkv",
                        "size": 4096
                    }}))
                }),
            )
            .route(
                "/account/infos",
                get(|headers: HeaderMap| async move {
                    let body: Value = if authorized(&headers) {
                        json!({"success": true, "value": {
                            "pseudo": "trinity", "accountType": 1, "expiration": 1893456000
                        }})
                    } else {
                        json!({"success": false, "error": "badToken"})
                    };
                    Json(body)
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

    async fn configured(base: &str, key: &str) -> DebridLinkProvider {
        let provider = DebridLinkProvider::with_base_url(base);
        provider
            .configure(&BTreeMap::from([("api_key".to_string(), key.to_string())]))
            .await
            .expect("configure");
        provider
    }

    #[tokio::test]
    async fn adds_link_to_downloader() {
        let base = serve().await;
        let provider = configured(&base, "dl-key").await;
        let res = provider
            .resolve("https://debrid-link.com/f/abc", &Headers::new())
            .await
            .expect("resolve");
        assert_eq!(res.url, "https://dl.debrid-link.com/abc/movie.mkv");
        assert_eq!(res.name, "movie.mkv");
        assert_eq!(res.size, 4096);

        let err = provider
            .resolve("https://dead.host/x", &Headers::new())
            .await
            .expect_err("dead link");
        assert_eq!(err, ProviderError::api(NAME, "fileNotFound"));
    }

    #[tokio::test]
    async fn account_and_bad_key() {
        let base = serve().await;
        let account = configured(&base, "dl-key").await.test().await.expect("account");
        assert_eq!(account.username, "trinity");
        assert!(account.is_premium);
        assert!(account.expires_at.is_some());

        let err = configured(&base, "wrong").await.test().await.expect_err("bad key");
        assert_eq!(err, ProviderError::api(NAME, "badToken"));

        let unconfigured = DebridLinkProvider::with_base_url(&base);
        assert!(matches!(
            unconfigured.test().await,
            Err(ProviderError::NotConfigured(_))
        ));
    }
}
