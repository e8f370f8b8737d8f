//! In-process stand-ins for aria2 and rclone rc used by the async tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::db::TaskDb;

type Responses = Arc<Mutex<HashMap<String, Value>>>;
type Calls = Arc<Mutex<Vec<(String, Value)>>>;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

pub async fn temp_db() -> (tempfile::TempDir, TaskDb) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = TaskDb::new(&dir.path().join("gravity.db"))
        .await
        .expect("open db");
    (dir, db)
}

/// aria2 over HTTP. Replies are looked up by `method:firstArg`, then by
/// `method`; unknown methods answer `"OK"`. The `token:` param is stripped
/// before matching and recording.
#[derive(Clone)]
pub struct FakeAria2 {
    pub url: String,
    responses: Responses,
    calls: Calls,
}

impl FakeAria2 {
    pub async fn start() -> Self {
        let responses: Responses = Arc::default();
        let calls: Calls = Arc::default();
        let app = Router::new()
            .route("/jsonrpc", post(aria2_handler))
            .with_state((responses.clone(), calls.clone()));
        let base = serve(app).await;
        Self {
            url: format!("{base}/jsonrpc"),
            responses,
            calls,
        }
    }

    pub fn reply(&self, key: &str, result: Value) {
        self.responses
            .lock()
            .expect("responses")
            .insert(key.to_string(), json!({ "result": result }));
    }

    pub fn fail(&self, key: &str, code: i64, message: &str) {
        self.responses.lock().expect("responses").insert(
            key.to_string(),
            json!({ "error": { "code": code, "message": message } }),
        );
    }

    pub fn forget(&self, key: &str) {
        self.responses.lock().expect("responses").remove(key);
    }

    /// Recorded `(method, params)` pairs, token removed.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p)
            .collect()
    }
}

async fn aria2_handler(
    State((responses, calls)): State<(Responses, Calls)>,
    Json(req): Json<Value>,
) -> Json<Value> {
    let method = req["method"].as_str().unwrap_or_default().to_string();
    let mut params = req["params"].as_array().cloned().unwrap_or_default();
    if params
        .first()
        .and_then(Value::as_str)
        .is_some_and(|p| p.starts_with("token:"))
    {
        params.remove(0);
    }
    calls
        .lock()
        .expect("calls")
        .push((method.clone(), Value::Array(params.clone())));

    let keyed = params
        .first()
        .and_then(Value::as_str)
        .map(|arg| format!("{method}:{arg}"));
    let canned = {
        let responses = responses.lock().expect("responses");
        keyed
            .and_then(|k| responses.get(&k).cloned())
            .or_else(|| responses.get(&method).cloned())
    };
    let mut body = canned.unwrap_or_else(|| json!({ "result": "OK" }));
    body["jsonrpc"] = json!("2.0");
    body["id"] = req["id"].clone();
    Json(body)
}

/// rclone rc. Replies are looked up by `path:fs+remote` (such as
/// `operations/list:gdrive:Movies`), then by rc path; unknown paths answer `{}`.
#[derive(Clone)]
pub struct FakeRclone {
    pub url: String,
    responses: Responses,
    calls: Calls,
}

impl FakeRclone {
    pub async fn start() -> Self {
        let responses: Responses = Arc::default();
        let calls: Calls = Arc::default();
        let app = Router::new()
            .route("/{*path}", post(rclone_handler))
            .with_state((responses.clone(), calls.clone()));
        let url = serve(app).await;
        Self {
            url,
            responses,
            calls,
        }
    }

    pub fn reply(&self, path: &str, body: Value) {
        self.responses
            .lock()
            .expect("responses")
            .insert(path.to_string(), body);
    }

    pub fn calls_to(&self, path: &str) -> Vec<Value> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

async fn rclone_handler(
    State((responses, calls)): State<(Responses, Calls)>,
    Path(path): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let keyed = body["fs"].as_str().map(|fs| {
        format!("{path}:{fs}{}", body["remote"].as_str().unwrap_or_default())
    });
    calls.lock().expect("calls").push((path.clone(), body));
    let reply = {
        let responses = responses.lock().expect("responses");
        keyed
            .and_then(|k| responses.get(&k).cloned())
            .or_else(|| responses.get(&path).cloned())
            .unwrap_or_else(|| json!({}))
    };
    Json(reply)
}
