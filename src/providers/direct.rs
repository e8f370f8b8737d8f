use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, RANGE};

use super::{ConfigField, Headers, Provider, ProviderError, ProviderKind, ResolveResult};
use crate::models::AccountInfo;
use crate::torrent::is_magnet;

/// Plain HTTP(S) links: only looks up the filename and size.
pub struct DirectProvider {
    http: reqwest::Client,
}

impl Default for DirectProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectProvider {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    fn request(&self, method: reqwest::Method, url: &str, headers: &Headers) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url);
        for (key, value) in headers {
            req = req.header(key.as_str(), value.as_str());
        }
        req
    }
}

#[async_trait]
impl Provider for DirectProvider {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn display_name(&self) -> &'static str {
        "Direct Download"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Direct
    }

    fn config_schema(&self) -> Vec<ConfigField> {
        Vec::new()
    }

    async fn configure(&self, _config: &BTreeMap<String, String>) -> Result<(), ProviderError> {
        Ok(())
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn supports(&self, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://") || is_magnet(url)
    }

    fn priority(&self) -> i32 {
        0
    }

    async fn resolve(&self, url: &str, headers: &Headers) -> Result<ResolveResult, ProviderError> {
        if is_magnet(url) {
            return Ok(ResolveResult {
                url: url.to_string(),
                is_magnet: true,
                ..Default::default()
            });
        }

        let head = self.request(reqwest::Method::HEAD, url, headers).send().await;
        let (final_url, response_headers) = match head {
            Ok(resp) if resp.status().is_success() => (resp.url().clone(), resp.headers().clone()),
            _ => {
                let resp = self
                    .request(reqwest::Method::GET, url, headers)
                    .header(RANGE, "bytes=0-0")
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(ProviderError::Status(resp.status().as_u16()));
                }
                (resp.url().clone(), resp.headers().clone())
            }
        };

        let name = filename_from_headers(&response_headers)
            .or_else(|| filename_from_url(&final_url))
            .ok_or_else(|| ProviderError::api("direct", "file name wasn't found in url"))?;

        Ok(ResolveResult {
            url: url.to_string(),
            name,
            size: size_from_headers(&response_headers),
            headers: headers.clone(),
            ..Default::default()
        })
    }

    async fn test(&self) -> Result<AccountInfo, ProviderError> {
        Ok(AccountInfo {
            username: "Guest".to_string(),
            is_premium: false,
            expires_at: None,
        })
    }
}

fn filename_from_headers(headers: &HeaderMap) -> Option<String> {
    let disposition = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    for part in disposition.split(';') {
        let part = part.trim();
        let value = if let Some(rest) = part.strip_prefix("filename*=") {
            rest.split_once("''").map(|(_, v)| v).unwrap_or(rest)
        } else if let Some(rest) = part.strip_prefix("filename=") {
            rest
        } else {
            continue;
        };
        let cleaned = value.trim_matches('"').replace('\\', "/");
        let base = cleaned.rsplit('/').next().unwrap_or_default().trim();
        if !base.is_empty() {
            return Some(base.to_string());
        }
    }
    None
}

fn filename_from_url(url: &reqwest::Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != ".")
        .map(str::to_string)
}

/// Total size from `Content-Range: bytes 0-0/<total>`, else `Content-Length`,
/// else -1.
fn size_from_headers(headers: &HeaderMap) -> i64 {
    let from_range = headers
        .get(CONTENT_RANGE)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.rsplit_once('/'))
        .and_then(|(_, total)| total.trim().parse::<i64>().ok());
    if let Some(total) = from_range {
        return total;
    }
    headers
        .get(CONTENT_LENGTH)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.trim().parse::<i64>().ok())
        .unwrap_or(-1)
}
