use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    ConfigField, Headers, Provider, ProviderError, ProviderKind, ResolveResult, domain_patterns,
    proxied_client,
};
use crate::models::AccountInfo;
use crate::torrent::is_magnet;

const BASE_URL: &str = "https://www.mega-debrid.eu/api.php";
const NAME: &str = "megadebrid";

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ApiResponse {
    response_code: String,
    response_text: String,
    token: String,
    hosters: Vec<String>,
    #[serde(rename = "debridLink")]
    debrid_link: String,
    filename: String,
    filesize: Value,
}

impl ApiResponse {
    fn check(self) -> Result<Self, ProviderError> {
        if self.response_code == "ok" {
            Ok(self)
        } else {
            let message = if self.response_text.is_empty() {
                self.response_code
            } else {
                self.response_text
            };
            Err(ProviderError::api(NAME, message))
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Credentials {
    username: String,
    password: String,
    token: String,
}

/// MegaDebrid.eu. Logs in with username/password for a session token unless a
/// permanent token is configured; an expired token is dropped and the call
/// retried once.
pub struct MegaDebridProvider {
    base_url: String,
    credentials: RwLock<Credentials>,
    session: Mutex<String>,
    http: RwLock<reqwest::Client>,
    patterns: RwLock<Vec<Regex>>,
}

impl Default for MegaDebridProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MegaDebridProvider {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            credentials: RwLock::new(Credentials::default()),
            session: Mutex::new(String::new()),
            http: RwLock::new(proxied_client(Duration::from_secs(15), "")),
            patterns: RwLock::new(Vec::new()),
        }
    }

    fn credentials(&self) -> Credentials {
        self.credentials.read().map(|c| c.clone()).unwrap_or_default()
    }

    fn client(&self) -> reqwest::Client {
        self.http.read().map(|c| c.clone()).unwrap_or_default()
    }

    async fn token(&self) -> Result<String, ProviderError> {
        let mut session = self.session.lock().await;
        if !session.is_empty() {
            return Ok(session.clone());
        }
        let creds = self.credentials();
        if !creds.token.is_empty() {
            *session = creds.token;
            return Ok(session.clone());
        }
        if creds.username.is_empty() || creds.password.is_empty() {
            return Err(ProviderError::NotConfigured(NAME.to_string()));
        }
        let response = self
            .client()
            .post(&self.base_url)
            .query(&[("action", "connectUser")])
            .form(&[("login", creds.username.as_str()), ("password", creds.password.as_str())])
            .send()
            .await?
            .json::<ApiResponse>()
            .await?
            .check()?;
        *session = response.token;
        Ok(session.clone())
    }

    async fn forget_token(&self) {
        self.session.lock().await.clear();
    }

    async fn fetch_patterns(&self) -> Result<Vec<Regex>, ProviderError> {
        let token = self.token().await?;
        let response = self
            .client()
            .get(&self.base_url)
            .query(&[("action", "getHostersList"), ("token", token.as_str())])
            .send()
            .await?
            .json::<ApiResponse>()
            .await?
            .check()?;
        Ok(domain_patterns(&response.hosters))
    }

    async fn get_link(&self, url: &str) -> Result<ApiResponse, ProviderError> {
        let token = self.token().await?;
        Ok(self
            .client()
            .post(&self.base_url)
            .query(&[("action", "getLink"), ("token", token.as_str())])
            .form(&[("link", url)])
            .send()
            .await?
            .json::<ApiResponse>()
            .await?)
    }
}

fn size_of(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

#[async_trait]
impl Provider for MegaDebridProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn display_name(&self) -> &'static str {
        "MegaDebrid.eu"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Debrid
    }

    fn config_schema(&self) -> Vec<ConfigField> {
        let field = |key: &str, label: &str, kind: &str, description: &str| ConfigField {
            key: key.to_string(),
            label: label.to_string(),
            kind: kind.to_string(),
            required: false,
            description: description.to_string(),
        };
        vec![
            field("username", "Username", "text", "Your MegaDebrid.eu username (optional if a token is set)"),
            field("password", "Password", "password", "Your MegaDebrid.eu password (optional if a token is set)"),
            field("token", "Token", "password", "Permanent API token, if you have one"),
            ConfigField::proxy_url(),
        ]
    }

    async fn configure(&self, config: &BTreeMap<String, String>) -> Result<(), ProviderError> {
        let value = |key: &str| config.get(key).cloned().unwrap_or_default();
        if let Ok(mut guard) = self.credentials.write() {
            *guard = Credentials {
                username: value("username"),
                password: value("password"),
                token: value("token"),
            };
        }
        if let Ok(mut guard) = self.http.write() {
            *guard = proxied_client(Duration::from_secs(15), &value("proxy_url"));
        }
        self.forget_token().await;

        let patterns = if self.is_configured() {
            self.fetch_patterns().await.unwrap_or_else(|err| {
                debug!("megadebrid host list unavailable: {err}");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        if let Ok(mut guard) = self.patterns.write() {
            *guard = patterns;
        }
        Ok(())
    }

    fn is_configured(&self) -> bool {
        let creds = self.credentials();
        !creds.token.is_empty() || (!creds.username.is_empty() && !creds.password.is_empty())
    }

    fn supports(&self, url: &str) -> bool {
        if is_magnet(url) {
            return true;
        }
        let patterns = self.patterns.read();
        match patterns.as_deref() {
            Ok(list) if !list.is_empty() => list.iter().any(|re| re.is_match(url)),
            _ => url.contains("mega-debrid.eu"),
        }
    }

    fn priority(&self) -> i32 {
        60
    }

    async fn resolve(&self, url: &str, _headers: &Headers) -> Result<ResolveResult, ProviderError> {
        let mut response = self.get_link(url).await?;
        if response.response_code == "error_token" {
            debug!("megadebrid token expired, logging in again");
            self.forget_token().await;
            response = self.get_link(url).await?;
        }
        let response = response.check()?;
        Ok(ResolveResult {
            url: response.debrid_link,
            name: response.filename,
            size: size_of(&response.filesize),
            ..Default::default()
        })
    }

    async fn test(&self) -> Result<AccountInfo, ProviderError> {
        self.token().await?;
        Ok(AccountInfo {
            username: self.credentials().username,
            is_premium: true,
            expires_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Query, State};
    use axum::routing::get;
    use axum::{Form, Json, Router};
    use serde_json::json;

    type Logins = Arc<AtomicUsize>;

    async fn get_handler(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        match q.get("action").map(String::as_str) {
            Some("getHostersList") => Json(json!({
                "response_code": "ok",
                "hosters": ["1fichier.com", "rapidgator.net"]
            })),
            _ => Json(json!({"response_code": "error", "response_text": "unknown action"})),
        }
    }

    async fn post_handler(
        State(logins): State<Logins>,
        Query(q): Query<HashMap<String, String>>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Json<Value> {
        match q.get("action").map(String::as_str) {
            Some("connectUser") => {
                if form.get("password").map(String::as_str) != Some("hunter2") {
                    return Json(json!({"response_code": "error", "response_text": "bad login"}));
                }
                let n = logins.fetch_add(1, Ordering::SeqCst) + 1;
                Json(json!({"response_code": "ok", "token": format!("tok{n}")}))
            }
            Some("getLink") => {
                // Only the most recent session token is accepted.
                let current = format!("tok{}", logins.load(Ordering::SeqCst));
                if q.get("token") != Some(&current) && q.get("token").map(String::as_str) != Some("perm") {
                    return Json(json!({"response_code": "error_token", "response_text": "expired"}));
                }
                Json(json!({
                    "response_code": "ok",
                    "debridLink": "https://dl.mega-debrid.eu/abc/file.bin",
                    "filename": "file.bin",
                    "filesize": "777"
                }))
            }
            _ => Json(json!({"response_code": "error", "response_text": "unknown action"})),
        }
    }

    async fn serve() -> (String, Logins) {
        let logins = Logins::default();
        let app = Router::new()
            .route("/api.php", get(get_handler).post(post_handler))
            .with_state(logins.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/api.php"), logins)
    }

    fn login(user: &str, password: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("username".to_string(), user.to_string()),
            ("password".to_string(), password.to_string()),
        ])
    }

    #[tokio::test]
    async fn logs_in_and_loads_hosters() {
        let (base, logins) = serve().await;
        let provider = MegaDebridProvider::with_base_url(&base);
        assert!(!provider.is_configured());
        provider.configure(&login("morpheus", "hunter2")).await.expect("configure");

        assert_eq!(logins.load(Ordering::SeqCst), 1);
        assert!(provider.supports("https://1fichier.com/?abc"));
        assert!(provider.supports("https://www.rapidgator.net/file/1"));
        assert!(!provider.supports("https://example.com/file"));

        let res = provider
            .resolve("https://1fichier.com/?abc", &Headers::new())
            .await
            .expect("resolve");
        assert_eq!(res.name, "file.bin");
        assert_eq!(res.size, 777);
        assert_eq!(provider.test().await.expect("account").username, "morpheus");
    }

    #[tokio::test]
    async fn expired_token_triggers_one_new_login() {
        let (base, logins) = serve().await;
        let provider = MegaDebridProvider::with_base_url(&base);
        provider.configure(&login("morpheus", "hunter2")).await.expect("configure");
        // Another client logged in, so the cached session is stale.
        logins.fetch_add(1, Ordering::SeqCst);

        provider
            .resolve("https://1fichier.com/?abc", &Headers::new())
            .await
            .expect("resolve after relogin");
        assert_eq!(logins.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_token_skips_login_and_bad_password_fails() {
        let (base, logins) = serve().await;
        let provider = MegaDebridProvider::with_base_url(&base);
        provider
            .configure(&BTreeMap::from([("token".to_string(), "perm".to_string())]))
            .await
            .expect("configure");
        provider
            .resolve("https://1fichier.com/?abc", &Headers::new())
            .await
            .expect("resolve");
        assert_eq!(logins.load(Ordering::SeqCst), 0);

        let wrong = MegaDebridProvider::with_base_url(&base);
        wrong.configure(&login("morpheus", "nope")).await.expect("configure");
        assert_eq!(
            wrong.test().await.expect_err("bad login"),
            ProviderError::api(NAME, "bad login")
        );
    }
}
