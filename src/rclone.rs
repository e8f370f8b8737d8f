use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value, json};

use crate::models::Remote;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RcloneError {
    #[error("rclone error ({status}): {message}")]
    Http { status: u16, message: String },
    #[error("rclone request failed: {0}")]
    Transport(String),
    #[error("invalid rclone response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    InvalidPath(String),
    #[error("file not found: {0}")]
    NotFound(String),
}

/// Maps gateway method names onto rclone rc endpoints. Anything already
/// shaped like an rc path passes through.
pub fn resolve_method(method: &str) -> String {
    let method = method.strip_prefix("rclone.").unwrap_or(method);
    if method.contains('/') {
        return method.to_string();
    }
    match method {
        "listRemotes" => "config/listremotes",
        "createRemote" => "config/create",
        "deleteRemote" => "config/delete",
        "getStats" => "core/stats",
        "getVersion" => "core/version",
        other => other,
    }
    .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Success,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub path: String,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<String>,
    pub is_dir: bool,
    #[serde(rename = "type")]
    pub kind: String,
}

impl FileInfo {
    fn folder(path: String, name: String) -> Self {
        Self {
            path,
            name,
            mime_type: "inode/directory".to_string(),
            is_dir: true,
            kind: "folder".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListItem {
    #[serde(rename = "Path", default)]
    path: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Size", default)]
    size: i64,
    #[serde(rename = "MimeType", default)]
    mime_type: String,
    #[serde(rename = "ModTime", default)]
    mod_time: Option<String>,
    #[serde(rename = "IsDir", default)]
    is_dir: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    pub bytes: i64,
    pub speed: i64,
    pub transfers: i64,
    pub transferring: i64,
}

/// Splits `/remote/some/path` into `("remote", "some/path")`.
pub fn parse_virtual_path(path: &str) -> (String, String) {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return (String::new(), String::new());
    }
    match trimmed.split_once('/') {
        Some((remote, rest)) => (remote.to_string(), rest.to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}

fn parent_and_name(remote_path: &str) -> (String, String) {
    match remote_path.rsplit_once('/') {
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => (String::new(), remote_path.to_string()),
    }
}

fn job_id_of(value: &Value) -> Option<i64> {
    match value.get("jobid")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn transfer_stats(res: &Value) -> TransferStats {
    let as_i64 = |key: &str| res.get(key).and_then(Value::as_f64).unwrap_or(0.0) as i64;
    let transferring = res
        .get("transferring")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    TransferStats {
        bytes: as_i64("bytes"),
        speed: as_i64("speed"),
        transfers: as_i64("transfers"),
        transferring: transferring as i64,
    }
}

#[derive(Clone)]
pub struct RcloneClient {
    url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl RcloneClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POSTs `params` to `{url}/{method}`. Statuses >= 400 surface the body's
    /// `error` field.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RcloneError> {
        let body = if params.is_null() { json!({}) } else { params };
        let response = self
            .http
            .post(format!("{}/{}", self.url, method.trim_start_matches('/')))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| RcloneError::Transport(err.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| RcloneError::Transport(err.to_string()))?;
        let value = if text.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
        };

        if status.as_u16() >= 400 {
            let message = value
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            return Err(RcloneError::Http {
                status: status.as_u16(),
                message,
            });
        }

        Ok(value)
    }

    pub async fn copy_file_async(
        &self,
        src_fs: &str,
        src_remote: &str,
        dst_fs: &str,
        dst_remote: &str,
        job_id: i64,
    ) -> Result<i64, RcloneError> {
        let res = self
            .call(
                "operations/copyfile",
                json!({
                    "srcFs": src_fs,
                    "srcRemote": src_remote,
                    "dstFs": dst_fs,
                    "dstRemote": dst_remote,
                    "_async": true,
                    "_jobid": job_id,
                }),
            )
            .await?;
        Ok(job_id_of(&res).unwrap_or(job_id))
    }

    pub async fn copy_dir_async(
        &self,
        src_fs: &str,
        dst_fs: &str,
        job_id: i64,
    ) -> Result<i64, RcloneError> {
        let res = self
            .call(
                "sync/copy",
                json!({
                    "srcFs": src_fs,
                    "dstFs": dst_fs,
                    "_async": true,
                    "_jobid": job_id,
                }),
            )
            .await?;
        Ok(job_id_of(&res).unwrap_or(job_id))
    }

    pub async fn job_status(&self, job_id: i64) -> Result<JobStatus, RcloneError> {
        let res = self.call("job/status", json!({ "jobid": job_id })).await?;
        let finished = res.get("finished").and_then(Value::as_bool).unwrap_or(false);
        let success = res.get("success").and_then(Value::as_bool).unwrap_or(false);
        if !finished {
            return Ok(JobStatus::Running);
        }
        if success {
            return Ok(JobStatus::Success);
        }
        let message = res
            .get("error")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
            .unwrap_or("upload failed")
            .to_string();
        Ok(JobStatus::Failed(message))
    }

    pub async fn stop_job(&self, job_id: i64) -> Result<(), RcloneError> {
        self.call("job/stop", json!({ "jobid": job_id })).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<TransferStats, RcloneError> {
        let res = self.call("core/stats", Value::Null).await?;
        Ok(transfer_stats(&res))
    }

    /// Stats of one async job; rclone groups them as `job/<id>`.
    pub async fn job_stats(&self, job_id: i64) -> Result<TransferStats, RcloneError> {
        let res = self
            .call("core/stats", json!({ "group": format!("job/{job_id}") }))
            .await?;
        Ok(transfer_stats(&res))
    }

    pub async fn version(&self) -> Result<String, RcloneError> {
        let res = self.call("core/version", Value::Null).await?;
        Ok(res
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn list_remotes(&self) -> Result<Vec<Remote>, RcloneError> {
        let res = self.call("config/listremotes", Value::Null).await?;
        let names = res
            .get("remotes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(names
            .iter()
            .filter_map(Value::as_str)
            .map(|name| Remote {
                name: name.to_string(),
                kind: String::new(),
                connected: true,
            })
            .collect())
    }

    pub async fn create_remote(
        &self,
        name: &str,
        kind: &str,
        parameters: &JsonMap<String, Value>,
    ) -> Result<(), RcloneError> {
        self.call(
            "config/create",
            json!({ "name": name, "type": kind, "parameters": parameters }),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_remote(&self, name: &str) -> Result<(), RcloneError> {
        self.call("config/delete", json!({ "name": name })).await?;
        Ok(())
    }

    pub async fn test_remote(&self, name: &str) -> Result<(), RcloneError> {
        self.call("operations/list", json!({ "fs": format!("{name}:"), "remote": "" }))
            .await?;
        Ok(())
    }

    /// Lists a virtual path. `/` yields one folder per remote.
    pub async fn list(&self, virtual_path: &str) -> Result<Vec<FileInfo>, RcloneError> {
        let (remote, remote_path) = parse_virtual_path(virtual_path);
        if remote.is_empty() {
            let remotes = self.list_remotes().await?;
            return Ok(remotes
                .into_iter()
                .map(|r| FileInfo::folder(format!("/{}", r.name), r.name))
                .collect());
        }
        self.list_remote(&remote, &remote_path).await
    }

    async fn list_remote(&self, remote: &str, remote_path: &str) -> Result<Vec<FileInfo>, RcloneError> {
        let res = self
            .call(
                "operations/list",
                json!({
                    "fs": format!("{remote}:"),
                    "remote": remote_path,
                    "opt": { "showHash": false, "showModTime": true },
                }),
            )
            .await?;

        let items: Vec<ListItem> = serde_json::from_value(
            res.get("list").cloned().unwrap_or_else(|| json!([])),
        )
        .map_err(|err| RcloneError::InvalidResponse(err.to_string()))?;

        Ok(items
            .into_iter()
            .map(|item| FileInfo {
                path: format!("/{remote}/{}", item.path),
                name: item.name,
                size: item.size,
                mime_type: item.mime_type,
                mod_time: item.mod_time,
                is_dir: item.is_dir,
                kind: if item.is_dir { "folder" } else { "file" }.to_string(),
            })
            .collect())
    }

    pub async fn stat(&self, virtual_path: &str) -> Result<FileInfo, RcloneError> {
        let (remote, remote_path) = parse_virtual_path(virtual_path);
        if remote.is_empty() {
            return Ok(FileInfo::folder("/".to_string(), "Root".to_string()));
        }
        if remote_path.is_empty() {
            return Ok(FileInfo::folder(format!("/{remote}"), remote));
        }

        let (parent, name) = parent_and_name(&remote_path);
        self.list_remote(&remote, &parent)
            .await?
            .into_iter()
            .find(|item| item.name == name)
            .ok_or_else(|| RcloneError::NotFound(virtual_path.to_string()))
    }

    pub async fn mkdir(&self, virtual_path: &str) -> Result<(), RcloneError> {
        let (remote, remote_path) = parse_virtual_path(virtual_path);
        if remote.is_empty() {
            return Err(RcloneError::InvalidPath(
                "cannot create folder in root".to_string(),
            ));
        }
        self.call(
            "operations/mkdir",
            json!({ "fs": format!("{remote}:"), "remote": remote_path }),
        )
        .await?;
        Ok(())
    }

    pub async fn delete(&self, virtual_path: &str) -> Result<(), RcloneError> {
        let (remote, remote_path) = parse_virtual_path(virtual_path);
        if remote.is_empty() || remote_path.is_empty() {
            return Err(RcloneError::InvalidPath("cannot delete root items".to_string()));
        }
        let info = self.stat(virtual_path).await?;
        if info.is_dir {
            self.call(
                "operations/purge",
                json!({ "fs": format!("{remote}:"), "remote": remote_path }),
            )
            .await?;
        } else {
            self.call(
                "operations/deletefile",
                json!({ "fs": format!("{remote}:"), "remote": remote_path }),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn rename(&self, virtual_path: &str, new_name: &str) -> Result<(), RcloneError> {
        let (remote, remote_path) = parse_virtual_path(virtual_path);
        if remote.is_empty() || remote_path.is_empty() {
            return Err(RcloneError::InvalidPath("cannot rename root items".to_string()));
        }
        if new_name.is_empty() || new_name.contains('/') {
            return Err(RcloneError::InvalidPath(format!("invalid name {new_name:?}")));
        }
        let (parent, _) = parent_and_name(&remote_path);
        let dst_remote = if parent.is_empty() {
            new_name.to_string()
        } else {
            format!("{parent}/{new_name}")
        };
        self.call(
            "operations/movefile",
            json!({
                "srcFs": format!("{remote}:"),
                "srcRemote": remote_path,
                "dstFs": format!("{remote}:"),
                "dstRemote": dst_remote,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn copy(&self, src: &str, dst: &str) -> Result<i64, RcloneError> {
        self.transfer(src, dst, "sync/copy", "operations/copyfile")
            .await
    }

    pub async fn move_path(&self, src: &str, dst: &str) -> Result<i64, RcloneError> {
        self.transfer(src, dst, "sync/move", "operations/movefile")
            .await
    }

    async fn transfer(
        &self,
        src: &str,
        dst: &str,
        dir_method: &str,
        file_method: &str,
    ) -> Result<i64, RcloneError> {
        let info = self.stat(src).await?;
        let (src_remote, src_path) = parse_virtual_path(src);
        let (dst_remote, dst_path) = parse_virtual_path(dst);
        if src_remote.is_empty() || dst_remote.is_empty() {
            return Err(RcloneError::InvalidPath(
                "source and destination must be inside a remote".to_string(),
            ));
        }

        let res = if info.is_dir {
            self.call(
                dir_method,
                json!({
                    "srcFs": format!("{src_remote}:{src_path}"),
                    "dstFs": format!("{dst_remote}:{dst_path}"),
                    "_async": true,
                }),
            )
            .await?
        } else {
            self.call(
                file_method,
                json!({
                    "srcFs": format!("{src_remote}:"),
                    "srcRemote": src_path,
                    "dstFs": format!("{dst_remote}:"),
                    "dstRemote": dst_path,
                    "_async": true,
                }),
            )
            .await?
        };
        job_id_of(&res).ok_or_else(|| RcloneError::InvalidResponse("missing jobid".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::sync::Mutex;

    type Calls = Arc<Mutex<Vec<(String, Value)>>>;

    async fn fake_rc(
        State(calls): State<Calls>,
        Path((group, op)): Path<(String, String)>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let method = format!("{group}/{op}");
        calls.lock().await.push((method.clone(), body.clone()));
        match method.as_str() {
            "config/listremotes" => (StatusCode::OK, Json(json!({"remotes": ["gdrive", "s3"]}))),
            "core/version" => (StatusCode::OK, Json(json!({"version": "v1.66.0"}))),
            "core/stats" => (
                StatusCode::OK,
                Json(json!({"bytes": 2048, "speed": 512.5, "transfers": 3, "transferring": [{}, {}]})),
            ),
            "job/status" => match body["jobid"].as_i64() {
                Some(1) => (StatusCode::OK, Json(json!({"finished": false}))),
                Some(2) => (StatusCode::OK, Json(json!({"finished": true, "success": true}))),
                _ => (
                    StatusCode::OK,
                    Json(json!({"finished": true, "success": false, "error": "quota exceeded"})),
                ),
            },
            "operations/list" => (
                StatusCode::OK,
                Json(json!({"list": [
                    {"Path": "movies/a.mkv", "Name": "a.mkv", "Size": 10, "IsDir": false},
                    {"Path": "movies/extras", "Name": "extras", "Size": -1, "IsDir": true}
                ]})),
            ),
            "operations/copyfile" | "sync/copy" => (
                StatusCode::OK,
                Json(json!({"jobid": body.get("_jobid").cloned().unwrap_or(json!(77))})),
            ),
            _ => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "couldn't find method", "status": 404})),
            ),
        }
    }

    async fn start() -> (RcloneClient, Calls) {
        let calls: Calls = Arc::default();
        let app = Router::new()
            .route("/{group}/{op}", post(fake_rc))
            .with_state(calls.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (RcloneClient::new(format!("http://{addr}/")), calls)
    }

    #[test]
    fn method_aliases() {
        assert_eq!(resolve_method("listRemotes"), "config/listremotes");
        assert_eq!(resolve_method("rclone.getStats"), "core/stats");
        assert_eq!(resolve_method("rclone.createRemote"), "config/create");
        assert_eq!(resolve_method("operations/list"), "operations/list");
        assert_eq!(resolve_method("somethingElse"), "somethingElse");
    }

    #[test]
    fn virtual_paths() {
        assert_eq!(parse_virtual_path("/"), (String::new(), String::new()));
        assert_eq!(parse_virtual_path("/gdrive"), ("gdrive".to_string(), String::new()));
        assert_eq!(
            parse_virtual_path("/gdrive/movies/a.mkv/"),
            ("gdrive".to_string(), "movies/a.mkv".to_string())
        );
    }

    #[tokio::test]
    async fn job_status_and_errors() {
        let (client, _) = start().await;
        assert_eq!(client.job_status(1).await, Ok(JobStatus::Running));
        assert_eq!(client.job_status(2).await, Ok(JobStatus::Success));
        assert_eq!(
            client.job_status(3).await,
            Ok(JobStatus::Failed("quota exceeded".to_string()))
        );

        let err = client.call("nope/method", Value::Null).await.expect_err("404");
        assert_eq!(
            err,
            RcloneError::Http {
                status: 404,
                message: "couldn't find method".to_string()
            }
        );
    }

    #[tokio::test]
    async fn async_copy_uses_supplied_job_id() {
        let (client, calls) = start().await;
        let job = client
            .copy_file_async("/downloads", "a.mkv", "gdrive:", "movies/a.mkv", 4242)
            .await
            .expect("copy");
        assert_eq!(job, 4242);

        let calls = calls.lock().await;
        let (method, body) = calls.last().expect("recorded call");
        assert_eq!(method, "operations/copyfile");
        assert_eq!(body["_async"], true);
        assert_eq!(body["dstFs"], "gdrive:");
    }

    #[tokio::test]
    async fn remotes_stats_and_listing() {
        let (client, _) = start().await;
        let remotes = client.list_remotes().await.expect("remotes");
        assert_eq!(remotes.len(), 2);
        assert!(remotes.iter().all(|r| r.connected));

        let stats = client.stats().await.expect("stats");
        assert_eq!(stats.speed, 512);
        assert_eq!(stats.transferring, 2);
        assert_eq!(client.version().await.as_deref(), Ok("v1.66.0"));

        let root = client.list("/").await.expect("root listing");
        assert_eq!(root[0].path, "/gdrive");
        assert!(root[0].is_dir);

        let files = client.list("/gdrive/movies").await.expect("listing");
        assert_eq!(files[0].path, "/gdrive/movies/a.mkv");
        assert_eq!(files[1].kind, "folder");

        let info = client.stat("/gdrive/movies/extras").await.expect("stat");
        assert!(info.is_dir);
        assert!(matches!(
            client.stat("/gdrive/movies/missing").await,
            Err(RcloneError::NotFound(_))
        ));
        assert!(matches!(
            client.mkdir("/").await,
            Err(RcloneError::InvalidPath(_))
        ));
    }
}
