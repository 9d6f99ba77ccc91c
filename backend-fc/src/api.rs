//! Firecracker API client: HTTP/1.1 over a Unix domain socket.
//!
//! Firecracker speaks plain HTTP on its API UDS; requests are small JSON
//! PUT/PATCH calls and responses are `204 No Content` on success. The
//! transport is hand-rolled on `UnixStream` — no HTTP stack is worth
//! carrying for this — with a small idle-connection pool per socket and a
//! process-wide socket → client map evicted on VM stop.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::trace;

/// Connections kept alive per API socket.
const MAX_IDLE: usize = 2;

/// Poll interval while waiting for the API socket to appear.
const READY_POLL: Duration = Duration::from_millis(50);

/// Bound on any single API request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("api socket not ready: {0}")]
    NotReady(String),

    #[error("api returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed api response: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// HTTP client bound to one Firecracker API socket.
pub(crate) struct ApiClient {
    socket: PathBuf,
    idle: tokio::sync::Mutex<Vec<UnixStream>>,
}

impl ApiClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            idle: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Wait for the socket file to exist and accept connections.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.socket.exists() {
                match UnixStream::connect(&self.socket).await {
                    Ok(stream) => {
                        let mut idle = self.idle.lock().await;
                        if idle.len() < MAX_IDLE {
                            idle.push(stream);
                        }
                        return Ok(());
                    }
                    Err(e) => trace!(error = %e, "api socket not accepting yet"),
                }
            }
            if Instant::now() + READY_POLL >= deadline {
                return Err(ApiError::NotReady(format!(
                    "{} did not accept within the deadline",
                    self.socket.display()
                )));
            }
            sleep(READY_POLL).await;
        }
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<()> {
        self.request("PUT", path, Some(&body)).await.map(|_| ())
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<()> {
        self.request("PATCH", path, Some(&body)).await.map(|_| ())
    }

    /// Send one request, reusing an idle connection when possible. A stale
    /// idle connection gets one silent retry on a fresh one.
    async fn request(&self, method: &str, path: &str, body: Option<&Value>) -> Result<String> {
        let deadline = Instant::now() + REQUEST_TIMEOUT;

        // Pop under a short lock; round_trip re-locks to return the stream.
        let reused = { self.idle.lock().await.pop() };
        if let Some(stream) = reused {
            match self.round_trip(stream, method, path, body, deadline).await {
                Ok(response) => return Ok(response),
                Err(ApiError::Status { status, body }) => {
                    return Err(ApiError::Status { status, body });
                }
                Err(e) => trace!(error = %e, "idle api connection failed, redialing"),
            }
        }

        let stream = timeout_at(deadline, UnixStream::connect(&self.socket))
            .await
            .map_err(|_| ApiError::NotReady("connect timed out".into()))??;
        self.round_trip(stream, method, path, body, deadline).await
    }

    async fn round_trip(
        &self,
        mut stream: UnixStream,
        method: &str,
        path: &str,
        body: Option<&Value>,
        deadline: Instant,
    ) -> Result<String> {
        let payload = match body {
            Some(v) => serde_json::to_vec(v).map_err(|e| ApiError::Malformed(e.to_string()))?,
            None => Vec::new(),
        };
        let head = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            payload.len()
        );
        let mut request = head.into_bytes();
        request.extend_from_slice(&payload);

        timeout_at(deadline, stream.write_all(&request))
            .await
            .map_err(|_| ApiError::NotReady("write timed out".into()))??;

        let (status, response_body, keep_alive) =
            timeout_at(deadline, read_response(&mut stream))
                .await
                .map_err(|_| ApiError::NotReady("read timed out".into()))??;

        if keep_alive {
            let mut idle = self.idle.lock().await;
            if idle.len() < MAX_IDLE {
                idle.push(stream);
            }
        }

        trace!(method, path, status, "api call");
        if status >= 300 {
            return Err(ApiError::Status {
                status,
                body: response_body,
            });
        }
        Ok(response_body)
    }
}

/// Read one HTTP/1.1 response: status line, headers, then a
/// `Content-Length` body (absent means empty).
async fn read_response(stream: &mut UnixStream) -> Result<(u16, String, bool)> {
    let mut header = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await?;
        header.push(byte[0]);
        if header.len() > 16 * 1024 {
            return Err(ApiError::Malformed("response headers too large".into()));
        }
    }

    let text = String::from_utf8_lossy(&header);
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ApiError::Malformed(format!("bad status line: {status_line:?}")))?;

    let mut content_length = 0usize;
    let mut keep_alive = true;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        if name == "content-length" {
            content_length = value
                .parse()
                .map_err(|_| ApiError::Malformed(format!("bad content-length: {value:?}")))?;
        } else if name == "connection" && value.eq_ignore_ascii_case("close") {
            keep_alive = false;
        }
    }

    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).await?;
    Ok((status, String::from_utf8_lossy(&body).into_owned(), keep_alive))
}

// ---------------------------------------------------------------------------
// Firecracker endpoints
// ---------------------------------------------------------------------------

impl ApiClient {
    pub async fn put_logger(&self, log_path: &Path) -> Result<()> {
        self.put(
            "/logger",
            json!({
                "log_path": log_path.display().to_string(),
                "level": "Info",
                "show_level": true,
                "show_log_origin": false,
            }),
        )
        .await
    }

    pub async fn put_boot_source(&self, kernel: &Path, boot_args: &str) -> Result<()> {
        self.put(
            "/boot-source",
            json!({
                "kernel_image_path": kernel.display().to_string(),
                "boot_args": boot_args,
            }),
        )
        .await
    }

    pub async fn put_drive(
        &self,
        drive_id: &str,
        path: &Path,
        is_root: bool,
        rate_limiter: Option<Value>,
    ) -> Result<()> {
        let mut body = json!({
            "drive_id": drive_id,
            "path_on_host": path.display().to_string(),
            "is_root_device": is_root,
            "is_read_only": true,
            "io_engine": "Async",
        });
        if let (Some(obj), Some(limiter)) = (body.as_object_mut(), rate_limiter) {
            obj.insert("rate_limiter".into(), limiter);
        }
        self.put(&format!("/drives/{drive_id}"), body).await
    }

    pub async fn put_network_interface(
        &self,
        iface_id: &str,
        guest_mac: &str,
        host_dev: &str,
        rx_rate_limiter: Option<Value>,
        tx_rate_limiter: Option<Value>,
    ) -> Result<()> {
        let mut body = json!({
            "iface_id": iface_id,
            "guest_mac": guest_mac,
            "host_dev_name": host_dev,
        });
        if let Some(obj) = body.as_object_mut() {
            if let Some(rx) = rx_rate_limiter {
                obj.insert("rx_rate_limiter".into(), rx);
            }
            if let Some(tx) = tx_rate_limiter {
                obj.insert("tx_rate_limiter".into(), tx);
            }
        }
        self.put(&format!("/network-interfaces/{iface_id}"), body).await
    }

    pub async fn put_vsock(&self, guest_cid: u32, uds_path: &Path) -> Result<()> {
        self.put(
            "/vsock",
            json!({
                "guest_cid": guest_cid,
                "uds_path": uds_path.display().to_string(),
            }),
        )
        .await
    }

    pub async fn put_machine_config(&self, vcpus: u32, memory_mb: u32) -> Result<()> {
        self.put(
            "/machine-config",
            json!({
                "vcpu_count": vcpus,
                "mem_size_mib": memory_mb,
            }),
        )
        .await
    }

    pub async fn start_instance(&self) -> Result<()> {
        self.put("/actions", json!({"action_type": "InstanceStart"})).await
    }

    pub async fn pause_vm(&self) -> Result<()> {
        self.patch("/vm", json!({"state": "Paused"})).await
    }

    pub async fn resume_vm(&self) -> Result<()> {
        self.patch("/vm", json!({"state": "Resumed"})).await
    }

    pub async fn create_snapshot(&self, snapshot: &Path, memory: &Path) -> Result<()> {
        self.put(
            "/snapshot/create",
            json!({
                "snapshot_type": "Full",
                "snapshot_path": snapshot.display().to_string(),
                "mem_file_path": memory.display().to_string(),
            }),
        )
        .await
    }

    /// Load a snapshot, rebinding the recorded interface to a new TAP and
    /// resuming immediately.
    pub async fn load_snapshot(
        &self,
        snapshot: &Path,
        memory: &Path,
        network_overrides: &[(String, String)],
        resume: bool,
    ) -> Result<()> {
        let overrides: Vec<Value> = network_overrides
            .iter()
            .map(|(iface, tap)| json!({"iface_id": iface, "host_dev_name": tap}))
            .collect();
        self.put(
            "/snapshot/load",
            json!({
                "snapshot_path": snapshot.display().to_string(),
                "mem_backend": {
                    "backend_path": memory.display().to_string(),
                    "backend_type": "File",
                },
                "network_overrides": overrides,
                "resume_vm": resume,
            }),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Process-wide socket → client map
// ---------------------------------------------------------------------------

fn clients() -> &'static StdMutex<HashMap<PathBuf, Arc<ApiClient>>> {
    static CLIENTS: OnceLock<StdMutex<HashMap<PathBuf, Arc<ApiClient>>>> = OnceLock::new();
    CLIENTS.get_or_init(|| StdMutex::new(HashMap::new()))
}

fn clients_lock() -> std::sync::MutexGuard<'static, HashMap<PathBuf, Arc<ApiClient>>> {
    match clients().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The shared client for an API socket, created on first use.
pub(crate) fn client_for(socket: &Path) -> Arc<ApiClient> {
    let mut map = clients_lock();
    Arc::clone(
        map.entry(socket.to_path_buf())
            .or_insert_with(|| Arc::new(ApiClient::new(socket))),
    )
}

/// Drop the client for a stopped VM's socket.
pub(crate) fn evict_client(socket: &Path) {
    clients_lock().remove(socket);
}

/// Drop clients whose socket file no longer exists. Keeps the map bounded
/// on long-running hosts.
pub(crate) fn sweep_stale_clients() {
    clients_lock().retain(|socket, _| socket.exists());
}
