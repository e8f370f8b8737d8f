//! aria2-compatible JSON-RPC endpoint.
//!
//! Calls are forwarded to aria2 with the secret injected. A handful of methods
//! are intercepted so gravity can track tasks, attach rclone state to aria2's
//! answers and route `rclone.*` calls to the rclone rc API.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value, json};
use tracing::{debug, info, warn};

use crate::db::TaskDb;
use crate::models::{DownloadStatus, Task, UploadStatus};
use crate::offload::Offloader;
use crate::rclone::{RcloneClient, resolve_method};
use crate::rpc::{Aria2Client, RpcError};
use crate::torrent::{generate_gid, magnet_display_name, magnet_info_hash};

pub const GATEWAY_ERROR_CODE: i64 = -32000;
const TARGET_OPTION: &str = "rclone-target";

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub id: Value,
}

fn gateway_error(message: impl std::fmt::Display) -> RpcError {
    RpcError::Rpc {
        code: GATEWAY_ERROR_CODE,
        message: message.to_string(),
    }
}

fn error_object(err: &RpcError) -> Value {
    json!({ "code": err.code(), "message": err.message() })
}

/// Pulls a leading `token:...` param off so positional handling sees the
/// same shape with or without a client-supplied secret.
fn split_token(mut params: Vec<Value>) -> (Option<Value>, Vec<Value>) {
    let has_token = params
        .first()
        .and_then(Value::as_str)
        .is_some_and(|p| p.starts_with("token:"));
    if has_token {
        let token = params.remove(0);
        (Some(token), params)
    } else {
        (None, params)
    }
}

fn with_token(token: &Option<Value>, mut params: Vec<Value>) -> Vec<Value> {
    if let Some(token) = token {
        params.insert(0, token.clone());
    }
    params
}

/// The upload-centric status older clients expect under `rclone.status`.
fn legacy_status(task: &Task) -> &'static str {
    match task.status {
        DownloadStatus::Uploading => "uploading",
        DownloadStatus::Complete => "complete",
        DownloadStatus::Error => "error",
        DownloadStatus::Removed => "removed",
        _ => "pending",
    }
}

fn rclone_info(task: &Task) -> Value {
    let job_id = if task.upload_job_id > 0 {
        task.upload_job_id.to_string()
    } else {
        String::new()
    };
    json!({
        "status": legacy_status(task),
        "targetRemote": task.destination,
        "jobId": job_id,
    })
}

fn name_hint(uris: &[String], options: &JsonMap<String, Value>) -> String {
    if let Some(out) = options.get("out").and_then(Value::as_str) {
        return out.to_string();
    }
    let Some(first) = uris.first() else {
        return String::new();
    };
    if let Some(name) = magnet_display_name(first) {
        return name;
    }
    reqwest::Url::parse(first)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|n| !n.is_empty())
        .unwrap_or_default()
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddKind {
    Uri,
    Torrent,
    Metalink,
}

pub struct Gateway {
    aria2: Arc<Aria2Client>,
    rclone: RcloneClient,
    db: TaskDb,
    offloader: Arc<Offloader>,
}

impl Gateway {
    pub fn new(
        aria2: Arc<Aria2Client>,
        rclone: RcloneClient,
        db: TaskDb,
        offloader: Arc<Offloader>,
    ) -> Self {
        Self {
            aria2,
            rclone,
            db,
            offloader,
        }
    }

    pub async fn handle(&self, req: RpcRequest) -> RpcResponse {
        let (result, error) = match self.dispatch(&req.method, req.params).await {
            Ok(value) => (Some(value), None),
            Err(err) => {
                debug!("jsonrpc {} failed: {err}", req.method);
                (None, Some(error_object(&err)))
            }
        };
        RpcResponse {
            jsonrpc: "2.0",
            result,
            error,
            id: req.id,
        }
    }

    async fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        if method.starts_with("rclone.") {
            return self.rclone_call(method, params).await;
        }

        let (token, params) = split_token(params);
        match method {
            "aria2.addUri" => self.add(AddKind::Uri, token, params).await,
            "aria2.addTorrent" => self.add(AddKind::Torrent, token, params).await,
            "aria2.addMetalink" => self.add(AddKind::Metalink, token, params).await,
            "aria2.tellActive" | "aria2.tellWaiting" | "aria2.tellStopped" => {
                let mut result = self.forward(&token, method, params).await?;
                if let Some(tasks) = result.as_array_mut() {
                    for task in tasks.iter_mut() {
                        self.augment(task).await;
                    }
                }
                Ok(result)
            }
            "aria2.tellStatus" => self.tell_status(token, params).await,
            "aria2.getGlobalStat" => self.global_stat(token, params).await,
            "aria2.changeOption" => {
                let result = self.forward(&token, method, params.clone()).await?;
                if let (Some(gid), Some(options)) = (
                    params.first().and_then(Value::as_str),
                    params.get(1).and_then(Value::as_object),
                ) {
                    if let Err(err) = self.db.update_options(gid, options).await {
                        warn!("failed persisting options for {gid}: {err:#}");
                    }
                }
                Ok(result)
            }
            "aria2.remove" | "aria2.forceRemove" => {
                let result = self.forward(&token, method, params.clone()).await?;
                if let Some(gid) = params.first().and_then(Value::as_str) {
                    self.mark_removed(gid).await;
                }
                Ok(result)
            }
            "aria2.retryTask" => self.retry(params).await,
            "aria2.removeDownloadResult" => {
                let result = self.forward(&token, method, params.clone()).await?;
                if let Some(gid) = params.first().and_then(Value::as_str) {
                    match self.db.delete_task(gid).await {
                        Ok(true) => info!("deleted task {gid}"),
                        Ok(false) => {}
                        Err(err) => warn!("failed deleting task {gid}: {err:#}"),
                    }
                }
                Ok(result)
            }
            "aria2.purgeDownloadResult" => {
                let result = self.forward(&token, method, params).await?;
                match self.db.purge_finished().await {
                    Ok(n) => info!("purged {n} finished tasks"),
                    Err(err) => warn!("failed purging tasks: {err:#}"),
                }
                Ok(result)
            }
            "system.multicall" => self.multicall(params).await,
            _ => self.forward(&token, method, params).await,
        }
    }

    async fn forward(
        &self,
        token: &Option<Value>,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.aria2.call(method, with_token(token, params)).await
    }

    async fn rclone_call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let body = params.into_iter().next().unwrap_or(Value::Null);
        self.rclone
            .call(&resolve_method(method), body)
            .await
            .map_err(gateway_error)
    }

    async fn add(
        &self,
        kind: AddKind,
        token: Option<Value>,
        mut params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let (payload, search_from) = match kind {
            AddKind::Uri => (None, 0),
            AddKind::Torrent | AddKind::Metalink => {
                let payload = params
                    .first()
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| gateway_error("missing payload"))?;
                (Some(payload), 1)
            }
        };

        let mut uris = Vec::new();
        let mut options_idx = None;
        for (i, param) in params.iter().enumerate().skip(search_from) {
            match param {
                Value::Array(_) if kind != AddKind::Metalink => uris.extend(string_list(param)),
                Value::Object(_) if options_idx.is_none() => options_idx = Some(i),
                _ => {}
            }
        }

        let mut options = options_idx
            .and_then(|i| params[i].as_object().cloned())
            .unwrap_or_default();
        let target = options
            .remove(TARGET_OPTION)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let gid = options
            .get("gid")
            .and_then(Value::as_str)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_gid);
        let stored_options = options.clone();
        options.insert("gid".to_string(), Value::String(gid.clone()));

        match options_idx {
            Some(i) => params[i] = Value::Object(options.clone()),
            None => {
                if kind == AddKind::Torrent && params.len() < 2 {
                    params.push(json!([]));
                }
                params.push(Value::Object(options.clone()));
            }
        }

        let mut task = Task::new(gid.clone());
        task.url = uris.first().cloned().unwrap_or_default();
        task.name = name_hint(&uris, &options);
        task.uris = uris;
        match kind {
            AddKind::Torrent => task.torrent = payload,
            AddKind::Metalink => task.metalink = payload,
            AddKind::Uri => {}
        }
        task.dir = options
            .get("dir")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        task.options = stored_options;
        task.destination = target;
        if !task.destination.is_empty() {
            task.upload_status = UploadStatus::Pending;
        }
        if let Some(hash) = magnet_info_hash(&task.url) {
            task.is_magnet = true;
            task.magnet_hash = hash;
        }

        self.db.save_task(&task).await.map_err(gateway_error)?;
        if let Err(err) = self.db.increment_total_tasks().await {
            warn!("failed counting task {gid}: {err:#}");
        }
        info!(
            "tracking {gid} (remote: {})",
            if task.destination.is_empty() {
                "local"
            } else {
                task.destination.as_str()
            }
        );

        let method = match kind {
            AddKind::Uri => "aria2.addUri",
            AddKind::Torrent => "aria2.addTorrent",
            AddKind::Metalink => "aria2.addMetalink",
        };
        match self.forward(&token, method, params).await {
            Ok(result) => Ok(result),
            Err(err) => {
                if let Err(db_err) = self.db.update_error(&gid, &err.message()).await {
                    warn!("failed recording add error for {gid}: {db_err:#}");
                }
                Err(err)
            }
        }
    }

    async fn augment(&self, task: &mut Value) {
        let Some(gid) = task.get("gid").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        let Ok(Some(record)) = self.db.get_task(&gid).await else {
            return;
        };
        if let Some(obj) = task.as_object_mut() {
            obj.insert("rclone".to_string(), rclone_info(&record));
        }
    }

    /// Answers from the database when aria2 has already forgotten the gid.
    async fn tell_status(&self, token: Option<Value>, params: Vec<Value>) -> Result<Value, RpcError> {
        let gid = params
            .first()
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut result = match self.forward(&token, "aria2.tellStatus", params).await {
            Ok(result) => result,
            Err(err @ RpcError::Rpc { .. }) => {
                let record = match gid.as_deref() {
                    Some(gid) => self.db.get_task(gid).await.map_err(gateway_error)?,
                    None => None,
                };
                let Some(task) = record else {
                    return Err(err);
                };
                json!({
                    "gid": task.id,
                    "status": legacy_status(&task),
                    "totalLength": task.size.to_string(),
                    "completedLength": task.downloaded.to_string(),
                    "files": [{ "index": "1", "path": task.file_path }],
                })
            }
            Err(err) => return Err(err),
        };
        self.augment(&mut result).await;
        Ok(result)
    }

    async fn global_stat(&self, token: Option<Value>, params: Vec<Value>) -> Result<Value, RpcError> {
        let mut result = self.forward(&token, "aria2.getGlobalStat", params).await?;
        let Some(stats) = result.as_object_mut() else {
            return Ok(result);
        };

        match self.rclone.stats().await {
            Ok(rc) => {
                stats.insert("cloudUploadSpeed".to_string(), json!(rc.speed.to_string()));
                stats.insert("numUploading".to_string(), json!(rc.transfers.to_string()));
            }
            Err(err) => debug!("rclone stats unavailable: {err}"),
        }
        match self.db.uploading_count().await {
            Ok(count) if count > 0 => {
                stats.insert("numUploading".to_string(), json!(count.to_string()));
            }
            _ => {}
        }
        if let Ok(totals) = self.db.global_stats().await {
            stats.insert("totalDownloaded".to_string(), json!(totals.total_downloaded.to_string()));
            stats.insert("totalUploaded".to_string(), json!(totals.total_uploaded.to_string()));
            stats.insert("totalTasks".to_string(), json!(totals.total_tasks.to_string()));
            stats.insert("completedTasks".to_string(), json!(totals.completed_tasks.to_string()));
            stats.insert("uploadedTasks".to_string(), json!(totals.uploaded_tasks.to_string()));
        }
        Ok(result)
    }

    async fn mark_removed(&self, gid: &str) {
        match self.db.get_task(gid).await {
            Ok(Some(task)) => {
                self.offloader.stop_upload(&task).await;
                if let Err(err) = self.db.update_status(gid, DownloadStatus::Removed).await {
                    warn!("failed marking {gid} removed: {err:#}");
                } else {
                    info!("marked {gid} as removed");
                }
            }
            Ok(None) => {}
            Err(err) => warn!("failed loading {gid}: {err:#}"),
        }
    }

    /// Resets the record and puts the gid back into aria2 when it is missing
    /// or stuck in `error` there.
    async fn retry(&self, params: Vec<Value>) -> Result<Value, RpcError> {
        let gid = params
            .first()
            .ok_or_else(|| gateway_error("GID required"))?
            .as_str()
            .ok_or_else(|| gateway_error("invalid GID"))?
            .to_string();
        let task = self
            .db
            .get_task(&gid)
            .await
            .map_err(gateway_error)?
            .ok_or_else(|| gateway_error(format!("task {gid} not found")))?;

        self.db.reset_for_retry(&gid).await.map_err(gateway_error)?;

        let requeue = match self.aria2.tell_status(&gid, &["status"]).await {
            Err(_) => {
                info!("retry: re-adding {gid} to aria2");
                true
            }
            Ok(status) if status.status == "error" => {
                info!("retry: {gid} errored in aria2, re-adding");
                if let Err(err) = self.aria2.remove_download_result(&gid).await {
                    debug!("retry: removeDownloadResult {gid}: {err}");
                }
                true
            }
            Ok(_) => false,
        };
        if requeue {
            if let Err(err) = self.offloader.requeue(&task).await {
                warn!("retry: failed to re-add {gid}: {err}");
            }
        }
        Ok(json!("OK"))
    }

    async fn multicall(&self, params: Vec<Value>) -> Result<Value, RpcError> {
        let calls = match params.into_iter().next() {
            Some(Value::Array(calls)) => calls,
            Some(_) => return Err(gateway_error("invalid params")),
            None => return Err(gateway_error("params required")),
        };

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let Some(obj) = call.as_object() else {
                results.push(json!({ "code": 1, "message": "Invalid call format" }));
                continue;
            };
            let method = obj
                .get("methodName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let inner = obj
                .get("params")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if method.is_empty() || method == "system.multicall" {
                results.push(json!({ "code": 1, "message": "Invalid call format" }));
                continue;
            }

            match Box::pin(self.dispatch(&method, inner)).await {
                Ok(value) => results.push(json!([value])),
                Err(err) => results.push(json!({ "error": error_object(&err) })),
            }
        }
        Ok(Value::Array(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::events::EventBus;
    use crate::testutil::{FakeAria2, FakeRclone, temp_db};

    struct Harness {
        _dir: tempfile::TempDir,
        aria2: FakeAria2,
        rclone: FakeRclone,
        db: TaskDb,
        gateway: Gateway,
    }

    async fn harness() -> Harness {
        let (dir, db) = temp_db().await;
        let aria2 = FakeAria2::start().await;
        let rclone = FakeRclone::start().await;
        let client = Arc::new(Aria2Client::new(aria2.url.clone(), "s3cret"));
        let rc = RcloneClient::new(rclone.url.clone());
        let offloader = Arc::new(Offloader::new(
            client.clone(),
            rc.clone(),
            db.clone(),
            EventBus::new(8),
        ));
        let gateway = Gateway::new(client, rc, db.clone(), offloader);
        Harness {
            _dir: dir,
            aria2,
            rclone,
            db,
            gateway,
        }
    }

    fn request(method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            id: json!("req1"),
            params: params.as_array().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn add_uri_extracts_target_and_tracks_task() {
        let h = harness().await;
        h.aria2.reply("aria2.addUri", json!("ignored"));

        let resp = h
            .gateway
            .handle(request(
                "aria2.addUri",
                json!([["https://example.com/files/big.iso"], {"rclone-target": "gdrive:/isos", "split": "4"}]),
            ))
            .await;
        assert!(resp.error.is_none());
        assert_eq!(resp.id, json!("req1"));

        let sent = h.aria2.calls_to("aria2.addUri");
        assert_eq!(sent.len(), 1);
        let opts = &sent[0][1];
        assert!(opts.get("rclone-target").is_none());
        let gid = opts["gid"].as_str().expect("gid").to_string();
        assert_eq!(gid.len(), 16);

        let task = h.db.get_task(&gid).await.expect("get").expect("task");
        assert_eq!(task.destination, "gdrive:/isos");
        assert_eq!(task.upload_status, UploadStatus::Pending);
        assert_eq!(task.name, "big.iso");
        assert_eq!(task.options["split"], "4");
        assert_eq!(h.db.global_stats().await.expect("stats").total_tasks, 1);
    }

    #[tokio::test]
    async fn add_torrent_keeps_supplied_gid_and_fills_uri_slot() {
        let h = harness().await;
        let resp = h
            .gateway
            .handle(request(
                "aria2.addTorrent",
                json!(["token:mine", "ZDg6YW5ub3VuY2U="]),
            ))
            .await;
        assert!(resp.error.is_none());
        let sent = h.aria2.calls_to("aria2.addTorrent");
        assert_eq!(sent[0][0], "ZDg6YW5ub3VuY2U=");
        assert_eq!(sent[0][1], json!([]));
        let gid = sent[0][2]["gid"].as_str().expect("gid");
        let task = h.db.get_task(gid).await.expect("get").expect("task");
        assert_eq!(task.torrent.as_deref(), Some("ZDg6YW5ub3VuY2U="));
        assert!(task.destination.is_empty());
    }

    #[tokio::test]
    async fn rclone_calls_use_aliases() {
        let h = harness().await;
        h.rclone
            .reply("config/listremotes", json!({"remotes": ["gdrive", "s3"]}));
        let resp = h.gateway.handle(request("rclone.listRemotes", json!([]))).await;
        assert_eq!(resp.result, Some(json!({"remotes": ["gdrive", "s3"]})));

        h.gateway
            .handle(request("rclone.operations/list", json!([{"fs": "gdrive:", "remote": ""}])))
            .await;
        let listed = h.rclone.calls_to("operations/list");
        assert_eq!(listed[0]["fs"], "gdrive:");
        assert!(h.aria2.calls().is_empty());
    }

    #[tokio::test]
    async fn tell_active_is_augmented_and_tell_status_falls_back() {
        let h = harness().await;
        let mut task = Task::new("abc");
        task.destination = "r:".to_string();
        task.status = DownloadStatus::Uploading;
        task.upload_job_id = 42;
        task.size = 10;
        task.downloaded = 10;
        task.file_path = "/dl/x".to_string();
        h.db.save_task(&task).await.expect("save");

        h.aria2.reply(
            "aria2.tellActive",
            json!([{"gid": "abc", "status": "active"}, {"gid": "zzz", "status": "active"}]),
        );
        let resp = h.gateway.handle(request("aria2.tellActive", json!([]))).await;
        let list = resp.result.expect("result");
        assert_eq!(list[0]["rclone"]["status"], "uploading");
        assert_eq!(list[0]["rclone"]["jobId"], "42");
        assert!(list[1].get("rclone").is_none());

        h.aria2.fail("aria2.tellStatus", 1, "GID abc is not found");
        let resp = h.gateway.handle(request("aria2.tellStatus", json!(["abc"]))).await;
        let status = resp.result.expect("synthesized");
        assert_eq!(status["gid"], "abc");
        assert_eq!(status["totalLength"], "10");
        assert_eq!(status["files"][0]["path"], "/dl/x");
        assert_eq!(status["rclone"]["targetRemote"], "r:");

        let resp = h.gateway.handle(request("aria2.tellStatus", json!(["nope"]))).await;
        assert_eq!(resp.error.expect("error")["code"], 1);
    }

    #[tokio::test]
    async fn global_stat_gets_upload_extras() {
        let h = harness().await;
        h.aria2.reply(
            "aria2.getGlobalStat",
            json!({"downloadSpeed": "100", "numActive": "1"}),
        );
        h.rclone
            .reply("core/stats", json!({"speed": 2048.4, "transfers": 3, "bytes": 10}));
        h.db.increment_total_tasks().await.expect("inc");

        let resp = h.gateway.handle(request("aria2.getGlobalStat", json!([]))).await;
        let stats = resp.result.expect("stats");
        assert_eq!(stats["downloadSpeed"], "100");
        assert_eq!(stats["cloudUploadSpeed"], "2048");
        assert_eq!(stats["numUploading"], "3");
        assert_eq!(stats["totalTasks"], "1");
    }

    #[tokio::test]
    async fn remove_and_purge_update_the_database() {
        let h = harness().await;
        let mut up = Task::new("u1");
        up.status = DownloadStatus::Uploading;
        up.upload_job_id = 7;
        h.db.save_task(&up).await.expect("save");
        let mut done = Task::new("d1");
        done.status = DownloadStatus::Complete;
        h.db.save_task(&done).await.expect("save");

        h.gateway.handle(request("aria2.forceRemove", json!(["u1"]))).await;
        let removed = h.db.get_task("u1").await.expect("get").expect("task");
        assert_eq!(removed.status, DownloadStatus::Removed);
        assert_eq!(h.rclone.calls_to("job/stop")[0]["jobid"], 7);

        h.gateway
            .handle(request("aria2.purgeDownloadResult", json!([])))
            .await;
        assert!(h.db.get_task("d1").await.expect("get").is_none());
        assert!(h.db.get_task("u1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn retry_readds_missing_tasks() {
        let h = harness().await;
        let mut task = Task::new("r1");
        task.url = "https://example.com/a".to_string();
        task.uris = vec![task.url.clone()];
        task.status = DownloadStatus::Error;
        task.error = "[3] not found".to_string();
        h.db.save_task(&task).await.expect("save");
        h.aria2.fail("aria2.tellStatus", 1, "GID r1 is not found");

        let resp = h.gateway.handle(request("aria2.retryTask", json!(["r1"]))).await;
        assert_eq!(resp.result, Some(json!("OK")));
        let saved = h.db.get_task("r1").await.expect("get").expect("task");
        assert_eq!(saved.status, DownloadStatus::Waiting);
        assert!(saved.error.is_empty());
        let added = h.aria2.calls_to("aria2.addUri");
        assert_eq!(added[0][1]["gid"], "r1");

        let resp = h.gateway.handle(request("aria2.retryTask", json!([]))).await;
        assert_eq!(resp.error.expect("error")["message"], "GID required");
    }

    #[tokio::test]
    async fn multicall_routes_each_call() {
        let h = harness().await;
        h.aria2.reply("aria2.getVersion", json!({"version": "1.37.0"}));
        h.aria2.fail("aria2.pause", 1, "cannot pause");

        let resp = h
            .gateway
            .handle(request(
                "system.multicall",
                json!([[
                    {"methodName": "aria2.getVersion", "params": []},
                    {"methodName": "aria2.pause", "params": ["g"]},
                    "garbage",
                    {"methodName": "rclone.getVersion"}
                ]]),
            ))
            .await;
        let results = resp.result.expect("results");
        assert_eq!(results[0], json!([{"version": "1.37.0"}]));
        assert_eq!(results[1]["error"]["message"], "cannot pause");
        assert_eq!(results[2], json!({"code": 1, "message": "Invalid call format"}));
        assert_eq!(results[3], json!([{}]));

        let resp = h.gateway.handle(request("system.multicall", json!([]))).await;
        assert_eq!(resp.error.expect("error")["code"], GATEWAY_ERROR_CODE);
    }
}
