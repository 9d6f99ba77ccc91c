//! Host-side vsock client for the guest agent.
//!
//! Firecracker exposes each VM's vsock as a Unix domain socket. Reaching a
//! guest port means dialing that UDS, writing the ASCII handshake
//! `CONNECT <port>\n`, and reading one reply line — only lines starting
//! with `OK` are accepted. After the handshake the connection carries
//! length-prefixed JSON frames (see [`vsock_proto`]).
//!
//! ## Connection Flow
//!
//! 1. Dial the VM's vsock UDS
//! 2. `CONNECT <agent_port>\n` → `OK <assigned>\n`
//! 3. Send `Init` (cached from the first [`AgentClient::init`] call)
//! 4. Send `Exec`, read one `Resp` (unary) or `Stream` frames until
//!    `is_last` (streaming)
//! 5. Close; connections are per-call
//!
//! Broken connections (EOF, EPIPE, ECONNRESET, ECONNABORTED, ENOTCONN) are
//! retried with a short backoff, re-dialing and re-sending `Init`. Every
//! call is bounded by the caller's timeout plus a fixed grace.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, trace};

use vsock_proto::{
    DEFAULT_MAX_FRAME, Envelope, ExecPayload, InitPayload, MsgType, ProtocolError, ReloadPayload,
    RespPayload, StreamPayload, validate_frame_len,
};

/// Grace added to the caller-provided timeout for transport latency.
const CALL_GRACE: Duration = Duration::from_secs(5);

/// Bound on the liveness probe.
const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause after closing a connection so the UDS shim releases its state.
const UDS_RELEASE_DELAY: Duration = Duration::from_millis(10);

/// Backoff before each retry of a broken connection.
const RETRY_BACKOFF_MS: [u64; 3] = [10, 25, 50];

/// Longest accepted handshake reply line.
const MAX_HANDSHAKE_LINE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum VsockError {
    #[error("handshake rejected: {0:?}")]
    Handshake(String),

    #[error("deadline exceeded")]
    Deadline,

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unexpected message type: {0}")]
    Unexpected(u8),

    #[error("stream aborted by caller: {0}")]
    Aborted(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, VsockError>;

/// Whether an error indicates a connection the peer tore down, worth a
/// re-dial.
fn is_broken(err: &VsockError) -> bool {
    match err {
        VsockError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
        ),
        _ => false,
    }
}

/// Client for one VM's guest agent.
///
/// Connections are short-lived (one per call). At most one `execute*` is in
/// flight at a time; concurrent callers queue on an internal lock.
pub struct AgentClient {
    vsock_path: PathBuf,
    port: u32,
    max_frame: usize,
    /// Init parameters, cached on the first [`init`](Self::init) call and
    /// replayed on every fresh connection.
    init: Mutex<Option<InitPayload>>,
    /// Serializes executes; one request in flight per client.
    call: Mutex<()>,
}

impl AgentClient {
    pub fn new(vsock_path: impl Into<PathBuf>, port: u32) -> Self {
        Self::with_max_frame(vsock_path, port, DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(vsock_path: impl Into<PathBuf>, port: u32, max_frame: usize) -> Self {
        Self {
            vsock_path: vsock_path.into(),
            port,
            max_frame,
            init: Mutex::new(None),
            call: Mutex::new(()),
        }
    }

    /// Dial a vsock UDS and run the `CONNECT` handshake without sending any
    /// message. Used as a boot-time readiness probe.
    pub async fn probe(vsock_path: &Path, port: u32, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let stream = dial(vsock_path, port, deadline).await?;
        drop(stream);
        Ok(())
    }

    /// Cache the Init payload for this VM's connections.
    pub async fn init(&self, payload: InitPayload) {
        *self.init.lock().await = Some(payload);
    }

    /// Run one unary invocation.
    pub async fn execute(
        &self,
        request_id: &str,
        input: serde_json::Value,
        timeout_s: u64,
    ) -> Result<RespPayload> {
        self.execute_traced(request_id, input, timeout_s, None, None)
            .await
    }

    /// Run one unary invocation with W3C trace context attached.
    pub async fn execute_traced(
        &self,
        request_id: &str,
        input: serde_json::Value,
        timeout_s: u64,
        traceparent: Option<String>,
        tracestate: Option<String>,
    ) -> Result<RespPayload> {
        let exec = ExecPayload {
            request_id: request_id.to_string(),
            input,
            timeout_s,
            traceparent,
            tracestate,
            stream: None,
        };

        let _guard = self.call.lock().await;
        let deadline = Instant::now() + Duration::from_secs(timeout_s) + CALL_GRACE;

        let mut attempt = 0;
        loop {
            let result = self.unary_attempt(&exec, deadline).await;
            match result {
                Ok(resp) => return Ok(resp),
                Err(e) if is_broken(&e) && attempt < RETRY_BACKOFF_MS.len() => {
                    let backoff = Duration::from_millis(RETRY_BACKOFF_MS[attempt]);
                    attempt += 1;
                    debug!(
                        path = %self.vsock_path.display(),
                        attempt,
                        error = %e,
                        "connection broke, retrying"
                    );
                    if Instant::now() + backoff >= deadline {
                        return Err(VsockError::Deadline);
                    }
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run one streaming invocation, delivering chunks to `on_chunk` in send
    /// order until `is_last`. A callback error aborts the stream and closes
    /// the connection.
    pub async fn execute_stream<F>(
        &self,
        request_id: &str,
        input: serde_json::Value,
        timeout_s: u64,
        mut on_chunk: F,
    ) -> Result<()>
    where
        F: FnMut(StreamPayload) -> std::result::Result<(), String> + Send,
    {
        let exec = ExecPayload {
            request_id: request_id.to_string(),
            input,
            timeout_s,
            traceparent: None,
            tracestate: None,
            stream: Some(true),
        };

        let _guard = self.call.lock().await;
        let deadline = Instant::now() + Duration::from_secs(timeout_s) + CALL_GRACE;

        let mut attempt = 0;
        loop {
            let mut delivered = false;
            let result = self
                .stream_attempt(&exec, deadline, &mut delivered, &mut on_chunk)
                .await;
            match result {
                Ok(()) => return Ok(()),
                // Once a chunk reached the caller the stream cannot be
                // replayed; only an untouched attempt is retried.
                Err(e) if is_broken(&e) && !delivered && attempt < RETRY_BACKOFF_MS.len() => {
                    let backoff = Duration::from_millis(RETRY_BACKOFF_MS[attempt]);
                    attempt += 1;
                    debug!(
                        path = %self.vsock_path.display(),
                        attempt,
                        error = %e,
                        "connection broke before first chunk, retrying"
                    );
                    if Instant::now() + backoff >= deadline {
                        return Err(VsockError::Deadline);
                    }
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Liveness probe: dial, send `Ping`, expect a `Resp` within 3 s.
    pub async fn ping(&self) -> Result<()> {
        let deadline = Instant::now() + PING_TIMEOUT;
        let mut stream = dial(&self.vsock_path, self.port, deadline).await?;
        let result = async {
            send_frame(&mut stream, &Envelope::empty(MsgType::Ping)?, self.max_frame, deadline)
                .await?;
            let env = recv_frame(&mut stream, self.max_frame, deadline).await?;
            match env.msg_type()? {
                MsgType::Resp => Ok(()),
                other => Err(VsockError::Unexpected(other as u8)),
            }
        }
        .await;
        close(stream).await;
        result
    }

    /// Best-effort graceful shutdown request. Does not wait for an answer.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let deadline = Instant::now() + grace;
        let mut stream = dial(&self.vsock_path, self.port, deadline).await?;
        let result =
            send_frame(&mut stream, &Envelope::empty(MsgType::Stop)?, self.max_frame, deadline)
                .await;
        close(stream).await;
        result
    }

    /// Push updated code files into a persistent-mode guest. The agent
    /// acknowledges with a `Resp`.
    pub async fn reload(
        &self,
        files: HashMap<String, Vec<u8>>,
        timeout: Duration,
    ) -> Result<RespPayload> {
        let _guard = self.call.lock().await;
        let deadline = Instant::now() + timeout;
        let mut stream = dial(&self.vsock_path, self.port, deadline).await?;
        let result = async {
            let payload = ReloadPayload { files };
            send_frame(
                &mut stream,
                &Envelope::new(MsgType::Reload, &payload)?,
                self.max_frame,
                deadline,
            )
            .await?;
            let env = recv_frame(&mut stream, self.max_frame, deadline).await?;
            match env.msg_type()? {
                MsgType::Resp => Ok(env.parse::<RespPayload>()?),
                other => Err(VsockError::Unexpected(other as u8)),
            }
        }
        .await;
        close(stream).await;
        result
    }

    async fn unary_attempt(&self, exec: &ExecPayload, deadline: Instant) -> Result<RespPayload> {
        let mut stream = dial(&self.vsock_path, self.port, deadline).await?;
        let result = self.unary_on(&mut stream, exec, deadline).await;
        close(stream).await;
        result
    }

    async fn unary_on(
        &self,
        stream: &mut UnixStream,
        exec: &ExecPayload,
        deadline: Instant,
    ) -> Result<RespPayload> {
        self.send_init(stream, deadline).await?;
        send_frame(stream, &Envelope::new(MsgType::Exec, exec)?, self.max_frame, deadline).await?;

        loop {
            let env = recv_frame(stream, self.max_frame, deadline).await?;
            match env.msg_type()? {
                MsgType::Resp => {
                    let resp: RespPayload = env.parse()?;
                    if resp.request_id.is_empty() || resp.request_id == exec.request_id {
                        return Ok(resp);
                    }
                    trace!(
                        got = %resp.request_id,
                        want = %exec.request_id,
                        "dropping response for stale request"
                    );
                }
                other => return Err(VsockError::Unexpected(other as u8)),
            }
        }
    }

    async fn stream_attempt<F>(
        &self,
        exec: &ExecPayload,
        deadline: Instant,
        delivered: &mut bool,
        on_chunk: &mut F,
    ) -> Result<()>
    where
        F: FnMut(StreamPayload) -> std::result::Result<(), String> + Send,
    {
        let mut stream = dial(&self.vsock_path, self.port, deadline).await?;
        let result = async {
            self.send_init(&mut stream, deadline).await?;
            send_frame(
                &mut stream,
                &Envelope::new(MsgType::Exec, exec)?,
                self.max_frame,
                deadline,
            )
            .await?;

            loop {
                let env = recv_frame(&mut stream, self.max_frame, deadline).await?;
                match env.msg_type()? {
                    MsgType::Stream => {
                        let chunk: StreamPayload = env.parse()?;
                        let last = chunk.is_last;
                        *delivered = true;
                        on_chunk(chunk).map_err(VsockError::Aborted)?;
                        if last {
                            return Ok(());
                        }
                    }
                    other => return Err(VsockError::Unexpected(other as u8)),
                }
            }
        }
        .await;
        close(stream).await;
        result
    }

    async fn send_init(&self, stream: &mut UnixStream, deadline: Instant) -> Result<()> {
        let init = self.init.lock().await.clone();
        if let Some(init) = init {
            send_frame(stream, &Envelope::new(MsgType::Init, &init)?, self.max_frame, deadline)
                .await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport helpers
// ---------------------------------------------------------------------------

async fn dial(vsock_path: &Path, port: u32, deadline: Instant) -> Result<UnixStream> {
    let mut stream = timeout_at(deadline, UnixStream::connect(vsock_path))
        .await
        .map_err(|_| VsockError::Deadline)??;

    let connect = format!("CONNECT {port}\n");
    timeout_at(deadline, stream.write_all(connect.as_bytes()))
        .await
        .map_err(|_| VsockError::Deadline)??;

    let line = timeout_at(deadline, read_line(&mut stream))
        .await
        .map_err(|_| VsockError::Deadline)??;
    if !line.starts_with("OK") {
        return Err(VsockError::Handshake(line));
    }
    Ok(stream)
}

/// Read one `\n`-terminated line, bounded at [`MAX_HANDSHAKE_LINE`] bytes.
async fn read_line(stream: &mut UnixStream) -> io::Result<String> {
    let mut line = Vec::with_capacity(16);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        line.push(byte[0]);
        if line.len() > MAX_HANDSHAKE_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake reply too long",
            ));
        }
    }
}

async fn send_frame(
    stream: &mut UnixStream,
    envelope: &Envelope,
    max_frame: usize,
    deadline: Instant,
) -> Result<()> {
    let buf = vsock_proto::encode_frame(envelope, max_frame)?;
    timeout_at(deadline, stream.write_all(&buf))
        .await
        .map_err(|_| VsockError::Deadline)??;
    Ok(())
}

async fn recv_frame(stream: &mut UnixStream, max_frame: usize, deadline: Instant) -> Result<Envelope> {
    let mut header = [0u8; vsock_proto::HEADER_SIZE];
    timeout_at(deadline, stream.read_exact(&mut header))
        .await
        .map_err(|_| VsockError::Deadline)??;

    // Validate before allocating; a 9 MiB advert must not cost 9 MiB.
    let len = validate_frame_len(u32::from_be_bytes(header), max_frame)?;

    let mut body = vec![0u8; len];
    timeout_at(deadline, stream.read_exact(&mut body))
        .await
        .map_err(|_| VsockError::Deadline)??;

    let envelope: Envelope = serde_json::from_slice(&body).map_err(ProtocolError::Json)?;
    Ok(envelope)
}

/// Drop the connection and give the UDS shim a moment to release state.
async fn close(stream: UnixStream) {
    drop(stream);
    sleep(UDS_RELEASE_DELAY).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    /// Read the `CONNECT <port>\n` line and answer `OK <port>\n`.
    async fn agent_handshake(stream: &mut UnixStream) {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        let text = String::from_utf8(line).unwrap();
        assert!(text.starts_with("CONNECT "), "unexpected handshake: {text}");
        stream.write_all(b"OK 5000\n").await.unwrap();
    }

    async fn agent_recv(stream: &mut UnixStream) -> Envelope {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn agent_send(stream: &mut UnixStream, env: &Envelope) {
        let buf = vsock_proto::encode_frame(env, DEFAULT_MAX_FRAME).unwrap();
        stream.write_all(&buf).await.unwrap();
    }

    fn resp(request_id: &str) -> Envelope {
        Envelope::new(
            MsgType::Resp,
            &RespPayload {
                request_id: request_id.into(),
                output: serde_json::json!({"ok": true}),
                error: String::new(),
                duration_ms: 3,
                stdout: None,
                stderr: None,
            },
        )
        .unwrap()
    }

    fn test_init() -> InitPayload {
        InitPayload {
            runtime: "python".into(),
            handler: "main.handler".into(),
            env_vars: HashMap::new(),
            command: None,
            extension: None,
            mode: None,
            function_name: "hello".into(),
            function_version: "1".into(),
            memory_mb: 128,
            timeout_s: 5,
            layer_count: None,
            volume_mounts: None,
        }
    }

    #[tokio::test]
    async fn probe_accepts_ok_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            agent_handshake(&mut stream).await;
        });

        AgentClient::probe(&path, 5000, Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn probe_rejects_non_ok_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
            stream.write_all(b"ERR no such port\n").await.unwrap();
        });

        let err = AgentClient::probe(&path, 5000, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, VsockError::Handshake(_)));
    }

    #[tokio::test]
    async fn execute_sends_init_then_exec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            agent_handshake(&mut stream).await;

            let init = agent_recv(&mut stream).await;
            assert_eq!(init.msg_type().unwrap(), MsgType::Init);
            let init: InitPayload = init.parse().unwrap();
            assert_eq!(init.function_name, "hello");

            let exec = agent_recv(&mut stream).await;
            assert_eq!(exec.msg_type().unwrap(), MsgType::Exec);
            let exec: ExecPayload = exec.parse().unwrap();
            assert_eq!(exec.request_id, "req-1");

            agent_send(&mut stream, &resp("req-1")).await;
        });

        let client = AgentClient::new(&path, 5000);
        client.init(test_init()).await;
        let out = client
            .execute("req-1", serde_json::json!({"a": 1}), 5)
            .await
            .unwrap();
        assert_eq!(out.request_id, "req-1");
        assert_eq!(out.output["ok"], true);
        assert!(out.error.is_empty());
    }

    #[tokio::test]
    async fn execute_retries_after_broken_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            // First connection: handshake, then hang up before responding.
            let (mut stream, _) = listener.accept().await.unwrap();
            agent_handshake(&mut stream).await;
            drop(stream);

            // Second connection: behave.
            let (mut stream, _) = listener.accept().await.unwrap();
            agent_handshake(&mut stream).await;
            let _exec = agent_recv(&mut stream).await;
            agent_send(&mut stream, &resp("req-2")).await;
        });

        let client = AgentClient::new(&path, 5000);
        let out = client
            .execute("req-2", serde_json::Value::Null, 5)
            .await
            .unwrap();
        assert_eq!(out.request_id, "req-2");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_without_reading_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            agent_handshake(&mut stream).await;
            let _exec = agent_recv(&mut stream).await;
            // Declare a 9 MiB frame but send no body.
            let header = (9 * 1024 * 1024u32).to_be_bytes();
            stream.write_all(&header).await.unwrap();
            // Keep the connection open so the client fails on the length,
            // not on EOF.
            let mut hold = [0u8; 1];
            let _ = stream.read(&mut hold).await;
        });

        let client = AgentClient::new(&path, 5000);
        let err = client
            .execute("req-3", serde_json::Value::Null, 5)
            .await
            .unwrap_err();
        assert!(
            matches!(err, VsockError::Protocol(ProtocolError::FrameTooLarge { .. })),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn stream_delivers_chunks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            agent_handshake(&mut stream).await;
            let _exec = agent_recv(&mut stream).await;
            for (i, last) in [(0u8, false), (1, false), (2, true)] {
                let chunk = StreamPayload {
                    request_id: "req-4".into(),
                    data: vec![i],
                    is_last: last,
                    error: String::new(),
                };
                agent_send(&mut stream, &Envelope::new(MsgType::Stream, &chunk).unwrap()).await;
            }
        });

        let client = AgentClient::new(&path, 5000);
        let mut seen = Vec::new();
        client
            .execute_stream("req-4", serde_json::Value::Null, 5, |chunk| {
                seen.push(chunk.data[0]);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn stream_callback_error_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            agent_handshake(&mut stream).await;
            let _exec = agent_recv(&mut stream).await;
            for last in [false, true] {
                let chunk = StreamPayload {
                    request_id: "req-5".into(),
                    data: b"x".to_vec(),
                    is_last: last,
                    error: String::new(),
                };
                agent_send(&mut stream, &Envelope::new(MsgType::Stream, &chunk).unwrap()).await;
            }
        });

        let client = AgentClient::new(&path, 5000);
        let mut calls = 0;
        let err = client
            .execute_stream("req-5", serde_json::Value::Null, 5, |_| {
                calls += 1;
                Err("enough".to_string())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VsockError::Aborted(ref m) if m == "enough"));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            agent_handshake(&mut stream).await;
            let ping = agent_recv(&mut stream).await;
            assert_eq!(ping.msg_type().unwrap(), MsgType::Ping);
            agent_send(&mut stream, &resp("")).await;
        });

        let client = AgentClient::new(&path, 5000);
        client.ping().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_hits_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            agent_handshake(&mut stream).await;
            // Swallow everything, answer nothing.
            let mut buf = [0u8; 4096];
            while stream.read(&mut buf).await.is_ok_and(|n| n > 0) {}
        });

        let client = AgentClient::new(&path, 5000);
        let err = client
            .execute("req-6", serde_json::Value::Null, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, VsockError::Deadline));
    }

    #[tokio::test]
    async fn reload_returns_ack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            agent_handshake(&mut stream).await;
            let reload = agent_recv(&mut stream).await;
            assert_eq!(reload.msg_type().unwrap(), MsgType::Reload);
            let reload: ReloadPayload = reload.parse().unwrap();
            assert_eq!(reload.files["handler.py"], b"print(2)");
            agent_send(&mut stream, &resp("")).await;
        });

        let client = AgentClient::new(&path, 5000);
        let files = HashMap::from([("handler.py".to_string(), b"print(2)".to_vec())]);
        let ack = client.reload(files, Duration::from_secs(5)).await.unwrap();
        assert!(ack.error.is_empty());
    }
}
