use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{ConfigField, Headers, Provider, ProviderError, ProviderKind, ResolveResult, proxied_client};
use crate::models::AccountInfo;
use crate::torrent::is_magnet;

const BASE_URL: &str = "https://api.torbox.app/v1";
const NAME: &str = "torbox";

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UserData {
    email: String,
    plan: i64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UserResponse {
    success: bool,
    error: Value,
    data: UserData,
}

/// TorBox account checks. Links are not unlocked, only magnets are accepted.
pub struct TorBoxProvider {
    base_url: String,
    api_key: RwLock<String>,
    http: RwLock<reqwest::Client>,
}

impl Default for TorBoxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TorBoxProvider {
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
}

#[async_trait]
impl Provider for TorBoxProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn display_name(&self) -> &'static str {
        "TorBox"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Debrid
    }

    fn config_schema(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::api_key("Get your API key from torbox.app/settings"),
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
        is_magnet(url)
    }

    fn priority(&self) -> i32 {
        70
    }

    async fn resolve(&self, _url: &str, _headers: &Headers) -> Result<ResolveResult, ProviderError> {
        Err(ProviderError::api(NAME, "only magnets are supported"))
    }

    async fn test(&self) -> Result<AccountInfo, ProviderError> {
        let key = self.require_key()?;
        let result = self
            .client()
            .get(format!("{}/user/me", self.base_url))
            .bearer_auth(key)
            .send()
            .await?
            .json::<UserResponse>()
            .await?;
        if !result.success {
            let message = match result.error {
                Value::String(s) => s,
                Value::Null => "request failed".to_string(),
                other => other.to_string(),
            };
            return Err(ProviderError::api(NAME, message));
        }
        Ok(AccountInfo {
            username: result.data.email,
            is_premium: result.data.plan > 0,
            expires_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve() -> String {
        let app = Router::new().route(
            "/user/me",
            get(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if auth != "Bearer tb-key" {
                    return Json(json!({"success": false, "error": "BAD_TOKEN", "data": null}));
                }
                Json(json!({"success": true, "error": null, "data": {"email": "neo@zion.io", "plan": 2}}))
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

    async fn configured(base: &str, key: &str) -> TorBoxProvider {
        let provider = TorBoxProvider::with_base_url(base);
        provider
            .configure(&BTreeMap::from([("api_key".to_string(), key.to_string())]))
            .await
            .expect("configure");
        provider
    }

    #[tokio::test]
    async fn account_uses_bearer_key() {
        let base = serve().await;
        let account = configured(&base, "tb-key").await.test().await.expect("account");
        assert_eq!(account.username, "neo@zion.io");
        assert!(account.is_premium);

        let err = configured(&base, "nope").await.test().await.expect_err("bad key");
        assert_eq!(err, ProviderError::api(NAME, "BAD_TOKEN"));
    }

    #[tokio::test]
    async fn accepts_only_magnets() {
        let provider = TorBoxProvider::with_base_url("http://127.0.0.1:9");
        assert!(!provider.is_configured());
        assert!(provider.supports("magnet:?xt=urn:btih:abc"));
        assert!(!provider.supports("https://rapidgator.net/file/1"));
        assert!(provider
            .resolve("magnet:?xt=urn:btih:abc", &Headers::new())
            .await
            .is_err());
    }
}
