//! Supervision of locally spawned aria2c and rclone rcd processes.

use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde_json::{Map as JsonMap, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AppConfig;

const DEFAULT_ARIA2_PORT: u16 = 6800;
const DEFAULT_RCLONE_ADDR: &str = "127.0.0.1:5572";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Aria2,
    Rclone,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aria2 => "aria2",
            Self::Rclone => "rclone",
        }
    }
}

impl FromStr for EngineKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aria2" | "aria2c" => Ok(Self::Aria2),
            "rclone" => Ok(Self::Rclone),
            _ => Err(()),
        }
    }
}

fn url_port(url: &str) -> Option<u16> {
    reqwest::Url::parse(url).ok().and_then(|u| u.port_or_known_default())
}

fn url_addr(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    Some(format!(
        "{}:{}",
        parsed.host_str()?,
        parsed.port_or_known_default()?
    ))
}

/// aria2c command line. `options` are global aria2 options, passed as
/// `--key=value`; empty values are left out.
pub fn aria2_args(config: &AppConfig, options: &JsonMap<String, Value>) -> Vec<String> {
    let port = url_port(&config.aria2_rpc_url).unwrap_or(DEFAULT_ARIA2_PORT);
    let session = config.data_dir().join("aria2.session");
    let mut args = vec![
        "--enable-rpc=true".to_string(),
        "--rpc-listen-all=false".to_string(),
        format!("--rpc-listen-port={port}"),
        format!("--dir={}", config.download_dir().display()),
        "--continue=true".to_string(),
        format!("--save-session={}", session.display()),
        "--save-session-interval=60".to_string(),
    ];
    if session.exists() {
        args.push(format!("--input-file={}", session.display()));
    }
    if !config.aria2_secret.is_empty() {
        args.push(format!("--rpc-secret={}", config.aria2_secret));
    }
    for (key, value) in options {
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Null => continue,
            other => other.to_string(),
        };
        if value.is_empty() || key == "dir" {
            continue;
        }
        args.push(format!("--{key}={value}"));
    }
    args
}

pub fn rclone_args(config: &AppConfig) -> Vec<String> {
    let addr = url_addr(&config.rclone_rc_url).unwrap_or_else(|| DEFAULT_RCLONE_ADDR.to_string());
    vec![
        "rcd".to_string(),
        "--rc-no-auth".to_string(),
        format!("--rc-addr={addr}"),
    ]
}

fn spawn_log_reader<R>(stream: R, engine: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if !line.trim().is_empty() => debug!(engine, "{line}"),
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    debug!(engine, "output read error: {err}");
                    break;
                }
            }
        }
    });
}

#[derive(Default)]
struct Processes {
    aria2: Option<Child>,
    rclone: Option<Child>,
    aria2_options: JsonMap<String, Value>,
}

impl Processes {
    fn slot(&mut self, kind: EngineKind) -> &mut Option<Child> {
        match kind {
            EngineKind::Aria2 => &mut self.aria2,
            EngineKind::Rclone => &mut self.rclone,
        }
    }
}

pub struct Engines {
    config: Arc<AppConfig>,
    processes: Mutex<Processes>,
}

impl Engines {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            config,
            processes: Mutex::new(Processes::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.manage_engines
    }

    /// Starts both engines. `aria2_options` are remembered for restarts.
    pub async fn start_all(&self, aria2_options: JsonMap<String, Value>) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        self.processes.lock().await.aria2_options = aria2_options;
        self.start(EngineKind::Aria2).await?;
        self.start(EngineKind::Rclone).await
    }

    pub async fn start(&self, kind: EngineKind) -> Result<()> {
        let mut processes = self.processes.lock().await;
        if let Some(child) = processes.slot(kind).as_mut() {
            if child.try_wait().ok().flatten().is_none() {
                debug!("{} already running", kind.as_str());
                return Ok(());
            }
        }

        let (program, args) = match kind {
            EngineKind::Aria2 => {
                tokio::fs::create_dir_all(self.config.download_dir())
                    .await
                    .context("failed to create download dir")?;
                (
                    self.config.aria2_cmd.clone(),
                    aria2_args(&self.config, &processes.aria2_options),
                )
            }
            EngineKind::Rclone => (self.config.rclone_cmd.clone(), rclone_args(&self.config)),
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed checking {program} startup"))?
        {
            return Err(anyhow!("{program} exited immediately with status {status}"));
        }

        if let Some(stdout) = child.stdout.take() {
            spawn_log_reader(stdout, kind.as_str());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_reader(stderr, kind.as_str());
        }
        info!(
            "started {} (pid {})",
            kind.as_str(),
            child.id().unwrap_or_default()
        );
        *processes.slot(kind) = Some(child);
        Ok(())
    }

    pub async fn stop(&self, kind: EngineKind) {
        let child = self.processes.lock().await.slot(kind).take();
        if let Some(mut child) = child {
            if let Err(err) = child.kill().await {
                warn!("failed to stop {}: {err}", kind.as_str());
            }
            let _ = child.wait().await;
            info!("stopped {}", kind.as_str());
        }
    }

    pub async fn restart(&self, kind: EngineKind) -> Result<()> {
        if !self.enabled() {
            return Err(anyhow!("engines are not managed by gravity"));
        }
        self.stop(kind).await;
        self.start(kind).await
    }

    pub async fn stop_all(&self) {
        self.stop(EngineKind::Aria2).await;
        self.stop(EngineKind::Rclone).await;
    }
}
