use std::collections::{BTreeMap, HashSet};
use std::process::Stdio;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_RANGE, RANGE};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{ConfigField, Headers, Provider, ProviderError, ProviderKind, ResolveResult, url_host};
use crate::models::AccountInfo;

const NAME: &str = "ytdlp";
const DEFAULT_BINARY: &str = "yt-dlp";

/// Fields read from `yt-dlp -j`.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct VideoInfo {
    url: String,
    title: String,
    ext: String,
    filesize: Option<i64>,
    filesize_approx: Option<f64>,
    http_headers: BTreeMap<String, String>,
    #[serde(rename = "_filename")]
    filename: String,
    cookies: String,
}

/// Media pages yt-dlp has an extractor for. The binary picks a single-file
/// format and aria2 downloads the direct media URL it reports.
pub struct YtDlpProvider {
    binary: String,
    http: reqwest::Client,
    extractors: RwLock<HashSet<String>>,
}

impl Default for YtDlpProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl YtDlpProvider {
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_BINARY)
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            binary: binary.into(),
            http,
            extractors: RwLock::new(HashSet::new()),
        }
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>, ProviderError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| ProviderError::api(NAME, format!("failed to run {}: {err}", self.binary)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProviderError::api(NAME, format!("yt-dlp failed: {stderr}")));
        }
        Ok(output.stdout)
    }

    async fn load_extractors(&self) {
        let extractors = match self.run(&["--list-extractors".to_string()]).await {
            Ok(stdout) => parse_extractors(&String::from_utf8_lossy(&stdout)),
            Err(err) => {
                debug!("yt-dlp extractors unavailable: {err}");
                HashSet::new()
            }
        };
        if let Ok(mut guard) = self.extractors.write() {
            *guard = extractors;
        }
    }

    /// Follows redirects with a one-byte range request. Returns the final URL
    /// and the total size from `Content-Range`/`Content-Length`.
    async fn final_location(&self, url: &str, headers: &Headers) -> Option<(String, i64)> {
        let mut req = self.http.get(url).header(RANGE, "bytes=0-0");
        for (key, value) in headers {
            req = req.header(key.as_str(), value.as_str());
        }
        let resp = req.send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let total = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .or_else(|| resp.content_length().and_then(|n| i64::try_from(n).ok()))
            .unwrap_or(0);
        Some((resp.url().to_string(), total))
    }
}

/// Extractor names from `--list-extractors`, reduced to their site key
/// (`twitch:stream` becomes `twitch`). Broken and generic extractors are
/// dropped.
fn parse_extractors(listing: &str) -> HashSet<String> {
    let mut out: HashSet<String> = listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "generic")
        .filter(|line| !line.to_ascii_lowercase().contains("broken"))
        .map(|line| line.split(':').next().unwrap_or(line).to_ascii_lowercase())
        .collect();
    // youtu.be
    out.insert("youtu".to_string());
    out
}

fn sanitize_filename(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

#[async_trait]
impl Provider for YtDlpProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn display_name(&self) -> &'static str {
        "yt-dlp"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::FileHost
    }

    fn config_schema(&self) -> Vec<ConfigField> {
        Vec::new()
    }

    async fn configure(&self, _config: &BTreeMap<String, String>) -> Result<(), ProviderError> {
        self.load_extractors().await;
        Ok(())
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn supports(&self, url: &str) -> bool {
        let Some(host) = url_host(url) else {
            return false;
        };
        let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
        let Ok(extractors) = self.extractors.read() else {
            return false;
        };
        host.split(['.', '-'])
            .filter(|part| !part.is_empty())
            .any(|part| extractors.contains(part))
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn resolve(&self, url: &str, headers: &Headers) -> Result<ResolveResult, ProviderError> {
        let mut args: Vec<String> = [
            "-j",
            "--no-playlist",
            "-f",
            "best",
            "-o",
            "%(title)s.%(ext)s",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        for (key, value) in headers {
            args.push("--add-header".to_string());
            args.push(format!("{key}:{value}"));
        }
        args.push(url.to_string());

        let stdout = self.run(&args).await?;
        let info: VideoInfo = serde_json::from_slice(&stdout)
            .map_err(|err| ProviderError::api(NAME, format!("unreadable yt-dlp output: {err}")))?;
        if info.url.is_empty() {
            return Err(ProviderError::api(NAME, "yt-dlp returned no media url"));
        }

        let mut media_headers = info.http_headers;
        if !info.cookies.is_empty() {
            media_headers.insert("Cookie".to_string(), info.cookies);
        }
        let mut size = info
            .filesize
            .or(info.filesize_approx.map(|n| n as i64))
            .unwrap_or(0);
        let mut final_url = info.url.clone();
        if let Some((location, total)) = self.final_location(&info.url, &media_headers).await {
            final_url = location;
            if size == 0 {
                size = total;
            }
        }

        let name = if !info.filename.is_empty() {
            info.filename
        } else if info.ext.is_empty() {
            info.title
        } else {
            format!("{}.{}", info.title, info.ext)
        };
        Ok(ResolveResult {
            url: final_url,
            name: sanitize_filename(&name),
            size,
            headers: media_headers,
            ..Default::default()
        })
    }

    async fn test(&self) -> Result<AccountInfo, ProviderError> {
        self.run(&["--version".to_string()]).await?;
        Ok(AccountInfo {
            username: "System".to_string(),
            is_premium: true,
            expires_at: None,
        })
    }
}
