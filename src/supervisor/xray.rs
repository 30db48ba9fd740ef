//! Control surface for an Xray-compatible core binary.
//!
//! # Responsibilities
//! - Write the rendered document and spawn `<binary> run -c <file>`
//! - Forward the core's stdout/stderr into tracing
//! - Probe liveness (exit status, then a TCP connect to the API inbound)
//! - Terminate with SIGTERM, then kill after the grace period
//! - Read cumulative counters through `<binary> api statsquery`

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

use crate::compiler::API_TAG;
use crate::config::CoreConfig;
use crate::store::TrafficEntity;
use crate::supervisor::control::{ControlError, CoreControl, CounterSample, ProcessHandle};

#[derive(Deserialize)]
struct StatsResponse {
    #[serde(default)]
    stat: Vec<StatEntry>,
}

#[derive(Deserialize)]
struct StatEntry {
    name: String,
    #[serde(default)]
    value: i64,
}

/// Parse `api statsquery` output into per-entity samples.
///
/// Counter names look like `user>>>alice>>>traffic>>>uplink` or
/// `inbound>>>vless-443>>>traffic>>>downlink`. Outbound and API counters
/// are ignored.
pub fn parse_stats(output: &str) -> Result<Vec<CounterSample>, ControlError> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    let response: StatsResponse =
        serde_json::from_str(output).map_err(|e| ControlError::Query(format!("bad stats output: {}", e)))?;

    let mut totals: BTreeMap<TrafficEntity, (u64, u64)> = BTreeMap::new();
    for entry in response.stat {
        let parts: Vec<&str> = entry.name.split(">>>").collect();
        let [kind, name, "traffic", direction] = parts.as_slice() else {
            continue;
        };
        let entity = match *kind {
            "user" => TrafficEntity::client(*name),
            "inbound" if *name != API_TAG => TrafficEntity::inbound(*name),
            _ => continue,
        };
        let value = u64::try_from(entry.value).unwrap_or(0);
        let slot = totals.entry(entity).or_default();
        match *direction {
            "uplink" => slot.0 = value,
            "downlink" => slot.1 = value,
            _ => {}
        }
    }

    Ok(totals
        .into_iter()
        .map(|(entity, (up, down))| CounterSample::new(entity, up, down))
        .collect())
}

fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "corewarden::core", stream, "{}", line);
        }
    });
}

/// Drives a local core binary.
pub struct XrayCore {
    binary: PathBuf,
    config_path: PathBuf,
    access_log: PathBuf,
    api_address: String,
    children: Mutex<HashMap<Uuid, Child>>,
}

impl XrayCore {
    pub fn new(core: &CoreConfig) -> Self {
        Self {
            binary: core.binary_path.clone(),
            config_path: core.config_path.clone(),
            access_log: core.access_log_path.clone(),
            api_address: core.api_address(),
            children: Mutex::new(HashMap::new()),
        }
    }

    async fn check_binary(&self) -> Result<(), ControlError> {
        let meta = tokio::fs::metadata(&self.binary)
            .await
            .map_err(|e| ControlError::BinaryUnavailable(format!("{}: {}", self.binary.display(), e)))?;
        if !meta.is_file() {
            return Err(ControlError::BinaryUnavailable(format!(
                "{} is not a file",
                self.binary.display()
            )));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(ControlError::BinaryUnavailable(format!(
                    "{} is not executable",
                    self.binary.display()
                )));
            }
        }
        Ok(())
    }

    async fn write_document(&self, document: &Value) -> Result<(), ControlError> {
        if let Some(parent) = self.config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&self.config_path, bytes).await?;
        Ok(())
    }

    async fn truncate_access_log(&self) {
        if let Err(e) = tokio::fs::write(&self.access_log, b"").await {
            tracing::warn!(path = %self.access_log.display(), error = %e, "Could not truncate access log");
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM delivery failed");
    }
}

#[async_trait]
impl CoreControl for XrayCore {
    async fn launch(&self, document: &Value) -> Result<ProcessHandle, ControlError> {
        self.check_binary().await?;
        self.write_document(document).await?;
        self.truncate_access_log().await;

        let mut child = Command::new(&self.binary)
            .arg("run")
            .arg("-c")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    ControlError::BinaryUnavailable(format!("{}: {}", self.binary.display(), e))
                }
                _ => ControlError::Io(e),
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        let handle = ProcessHandle::new(child.id());
        tracing::info!(pid = ?handle.pid, binary = %self.binary.display(), "Core process spawned");
        self.children.lock().await.insert(handle.id, child);
        Ok(handle)
    }

    async fn terminate(&self, handle: &ProcessHandle, grace: Duration) -> Result<(), ControlError> {
        let Some(mut child) = self.children.lock().await.remove(&handle.id) else {
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            if !grace.is_zero() {
                send_sigterm(pid);
            }
        }

        match timeout(grace, child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::debug!(%status, "Core exited");
            }
            Err(_) => {
                tracing::warn!(pid = ?handle.pid, "Core ignored termination, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }

    async fn probe(&self, handle: &ProcessHandle) -> bool {
        {
            let mut children = self.children.lock().await;
            let Some(child) = children.get_mut(&handle.id) else {
                return false;
            };
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    tracing::warn!(pid = ?handle.pid, %status, "Core process has exited");
                    return false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Could not poll core process");
                    return false;
                }
            }
        }
        TcpStream::connect(&self.api_address).await.is_ok()
    }

    async fn query_traffic(&self, handle: &ProcessHandle) -> Result<Vec<CounterSample>, ControlError> {
        if !self.children.lock().await.contains_key(&handle.id) {
            return Err(ControlError::UnknownProcess(handle.id));
        }
        let output = Command::new(&self.binary)
            .arg("api")
            .arg("statsquery")
            .arg(format!("--server={}", self.api_address))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ControlError::Query(format!("{}: {}", output.status, stderr.trim())));
        }
        parse_stats(&String::from_utf8_lossy(&output.stdout))
    }
}
