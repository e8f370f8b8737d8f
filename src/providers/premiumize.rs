use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::{
    ConfigField, Headers, Provider, ProviderError, ProviderKind, ResolveResult, domain_patterns,
    proxied_client,
};
use crate::models::AccountInfo;
use crate::torrent::is_magnet;

const BASE_URL: &str = "https://www.premiumize.me/api";
const NAME: &str = "premiumize";

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ServiceList {
    directdl: Vec<String>,
    regexpatterns: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct DirectDl {
    status: String,
    message: String,
    location: String,
    filename: String,
    filesize: i64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct AccountResponse {
    status: String,
    message: String,
    premium_until: f64,
    customer_id: Option<serde_json::Value>,
}

pub struct PremiumizeProvider {
    base_url: String,
    api_key: RwLock<String>,
    http: RwLock<reqwest::Client>,
    patterns: RwLock<Vec<Regex>>,
}

impl Default for PremiumizeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PremiumizeProvider {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: RwLock::new(String::new()),
            http: RwLock::new(proxied_client(Duration::from_secs(10), "")),
            patterns: RwLock::new(Vec::new()),
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

    /// Host patterns from `services/list`. Domains stand in when no regexes
    /// compile.
    async fn fetch_patterns(&self) -> Result<Vec<Regex>, ProviderError> {
        let key = self.require_key()?;
        let list = self
            .client()
            .get(format!("{}/services/list", self.base_url))
            .query(&[("apikey", key.as_str())])
            .send()
            .await?
            .json::<ServiceList>()
            .await?;
        let compiled: Vec<Regex> = list
            .regexpatterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        if compiled.is_empty() {
            Ok(domain_patterns(&list.directdl))
        } else {
            Ok(compiled)
        }
    }
}

#[async_trait]
impl Provider for PremiumizeProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn display_name(&self) -> &'static str {
        "Premiumize"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Debrid
    }

    fn config_schema(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::api_key("Get your API key from premiumize.me/account"),
            ConfigField::proxy_url(),
        ]
    }

    async fn configure(&self, config: &BTreeMap<String, String>) -> Result<(), ProviderError> {
        let proxy = config.get("proxy_url").map(String::as_str).unwrap_or_default();
        if let Ok(mut guard) = self.http.write() {
            *guard = proxied_client(Duration::from_secs(10), proxy);
        }
        let key = config.get("api_key").cloned().unwrap_or_default();
        if let Ok(mut guard) = self.api_key.write() {
            *guard = key.clone();
        }
        let patterns = if key.is_empty() {
            Vec::new()
        } else {
            self.fetch_patterns().await.unwrap_or_else(|err| {
                debug!("premiumize host list unavailable: {err}");
                Vec::new()
            })
        };
        if let Ok(mut guard) = self.patterns.write() {
            *guard = patterns;
        }
        Ok(())
    }

    fn is_configured(&self) -> bool {
        self.require_key().is_ok()
    }

    fn supports(&self, url: &str) -> bool {
        if is_magnet(url) {
            return true;
        }
        let patterns = self.patterns.read();
        match patterns.as_deref() {
            Ok(list) if !list.is_empty() => list.iter().any(|re| re.is_match(url)),
            _ => url.contains("premiumize.me"),
        }
    }

    fn priority(&self) -> i32 {
        80
    }

    async fn resolve(&self, url: &str, _headers: &Headers) -> Result<ResolveResult, ProviderError> {
        let key = self.require_key()?;
        let result = self
            .client()
            .post(format!("{}/transfer/directdl", self.base_url))
            .form(&[("src", url), ("apikey", key.as_str())])
            .send()
            .await?
            .json::<DirectDl>()
            .await?;
        if result.status != "success" {
            return Err(ProviderError::api(NAME, result.message));
        }
        Ok(ResolveResult {
            url: result.location,
            name: result.filename,
            size: result.filesize,
            ..Default::default()
        })
    }

    async fn test(&self) -> Result<AccountInfo, ProviderError> {
        let key = self.require_key()?;
        let result = self
            .client()
            .get(format!("{}/account/info", self.base_url))
            .query(&[("apikey", key.as_str())])
            .send()
            .await?
            .json::<AccountResponse>()
            .await?;
        if result.status != "success" {
            return Err(ProviderError::api(NAME, result.message));
        }
        let expires_at = Some(result.premium_until as i64)
            .filter(|ts| *ts > 0)
            .and_then(|ts| DateTime::from_timestamp(ts, 0));
        let username = match result.customer_id {
            Some(serde_json::Value::String(id)) => id,
            Some(serde_json::Value::Number(id)) => id.to_string(),
            _ => String::new(),
        };
        Ok(AccountInfo {
            username,
            is_premium: expires_at.is_some_and(|at| at > Utc::now()),
            expires_at,
        })
    }
}
