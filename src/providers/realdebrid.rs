use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{ConfigField, Headers, Provider, ProviderError, ProviderKind, ResolveResult};
use crate::models::AccountInfo;
use crate::torrent::is_magnet;

const BASE_URL: &str = "https://api.real-debrid.com/rest/1.0";
const NAME: &str = "realdebrid";

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UnrestrictResponse {
    link: String,
    download: String,
    filename: String,
    filesize: i64,
    error: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UserResponse {
    username: String,
    #[serde(rename = "type")]
    kind: String,
    expiration: String,
    error: String,
}

pub struct RealDebridProvider {
    base_url: String,
    http: reqwest::Client,
    api_key: RwLock<String>,
}

impl Default for RealDebridProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RealDebridProvider {
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
}

#[async_trait]
impl Provider for RealDebridProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn display_name(&self) -> &'static str {
        "Real-Debrid"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Debrid
    }

    fn config_schema(&self) -> Vec<ConfigField> {
        vec![ConfigField::api_key(
            "Get your API token from real-debrid.com/apitoken",
        )]
    }

    async fn configure(&self, config: &BTreeMap<String, String>) -> Result<(), ProviderError> {
        if let Ok(mut guard) = self.api_key.write() {
            *guard = config.get("api_key").cloned().unwrap_or_default();
        }
        Ok(())
    }

    fn is_configured(&self) -> bool {
        self.require_key().is_ok()
    }

    fn supports(&self, url: &str) -> bool {
        is_magnet(url) || url.contains("1fichier.com") || url.contains("rapidgator.net")
    }

    fn priority(&self) -> i32 {
        90
    }

    async fn resolve(&self, url: &str, _headers: &Headers) -> Result<ResolveResult, ProviderError> {
        let key = self.require_key()?;
        let result = self
            .http
            .post(format!("{}/unrestrict/link", self.base_url))
            .bearer_auth(key)
            .form(&[("link", url)])
            .send()
            .await?
            .json::<UnrestrictResponse>()
            .await?;
        if !result.error.is_empty() {
            return Err(ProviderError::api(NAME, result.error));
        }
        let link = if result.download.is_empty() {
            result.link
        } else {
            result.download
        };
        Ok(ResolveResult {
            url: link,
            name: result.filename,
            size: result.filesize,
            ..Default::default()
        })
    }

    async fn test(&self) -> Result<AccountInfo, ProviderError> {
        let key = self.require_key()?;
        let user = self
            .http
            .get(format!("{}/user", self.base_url))
            .bearer_auth(key)
            .send()
            .await?
            .json::<UserResponse>()
            .await?;
        if !user.error.is_empty() {
            return Err(ProviderError::api(NAME, user.error));
        }
        let expires_at = DateTime::parse_from_rfc3339(&user.expiration)
            .ok()
            .map(|t| t.with_timezone(&Utc));
        Ok(AccountInfo {
            username: user.username,
            is_premium: user.kind == "premium",
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use serde_json::json;

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            == Some("Bearer token123")
    }

    async fn serve() -> String {
        let app = Router::new()
            .route(
                "/unrestrict/link",
                post(
                    |headers: HeaderMap, Form(form): Form<BTreeMap<String, String>>| async move {
                        if !authorized(&headers) {
                            return Json(json!({"error": "bad_token", "error_code": 8}));
                        }
                        Json(json!({
                            "link": form.get("link"),
                            "download": "https://rd.cdn/dl/file.rar",
                            "filename": "file.rar",
                            "filesize": 999
                        }))
                    },
                ),
            )
            .route(
                "/user",
                get(|| async {
                    Json(json!({
                        "username": "trinity",
                        "type": "premium",
                        "expiration": "2030-01-01T00:00:00.000Z"
                    }))
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

    async fn provider(base: &str, key: &str) -> RealDebridProvider {
        let p = RealDebridProvider::with_base_url(base);
        p.configure(&BTreeMap::from([("api_key".to_string(), key.to_string())]))
            .await
            .expect("configure");
        p
    }

    #[tokio::test]
    async fn unrestricts_with_bearer_token() {
        let base = serve().await;
        let p = provider(&base, "token123").await;
        let res = p
            .resolve("https://1fichier.com/?abc", &Headers::new())
            .await
            .expect("resolve");
        assert_eq!(res.url, "https://rd.cdn/dl/file.rar");
        assert_eq!(res.name, "file.rar");
        assert_eq!(res.size, 999);

        let bad = provider(&base, "nope").await;
        let err = bad
            .resolve("https://1fichier.com/?abc", &Headers::new())
            .await
            .expect_err("bad token");
        assert_eq!(err, ProviderError::api(NAME, "bad_token"));
    }

    #[tokio::test]
    async fn account_info_reports_premium() {
        let base = serve().await;
        let p = provider(&base, "token123").await;
        let account = p.test().await.expect("test");
        assert_eq!(account.username, "trinity");
        assert!(account.is_premium);
        assert!(account.expires_at.is_some());
    }

    #[test]
    fn supported_hosts() {
        let p = RealDebridProvider::new();
        assert!(!p.is_configured());
        assert!(p.supports("magnet:?xt=urn:btih:abc"));
        assert!(p.supports("https://rapidgator.net/file/x"));
        assert!(!p.supports("https://example.org/file"));
    }
}
