use std::sync::Arc;

use async_trait::async_trait;
use backend::{
    ChunkHandler, Error, ExecMode, ExecResponse, FunctionSpec, Result, StreamChunk, Vm, VmBackend,
    VmClient,
};
use vsock_host::{AgentClient, VsockError};
use vsock_proto::{InitPayload, Mount, RespPayload};

use crate::config::FirecrackerConfig;
use crate::manager::VmManager;
use crate::prerequisites;

/// The Firecracker implementation of the backend capability set.
pub struct FirecrackerBackend {
    manager: Arc<VmManager>,
}

impl FirecrackerBackend {
    /// Check host prerequisites and build the manager.
    pub fn new(config: FirecrackerConfig) -> Result<Self> {
        prerequisites::check(&config)?;
        Ok(Self {
            manager: Arc::new(VmManager::new(config)?),
        })
    }

    /// Wrap an existing manager, skipping host checks. For embedders that
    /// ran their own validation.
    pub fn with_manager(manager: Arc<VmManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<VmManager> {
        &self.manager
    }
}

#[async_trait]
impl VmBackend for FirecrackerBackend {
    async fn create_vm(&self, f: &FunctionSpec, code: &[u8]) -> Result<Arc<Vm>> {
        self.manager.create_vm(f, code).await
    }

    async fn stop_vm(&self, id: &str) -> Result<()> {
        self.manager.stop_vm(id).await
    }

    fn new_client(&self, vm: &Vm) -> Result<Box<dyn VmClient>> {
        let config = self.manager.config();
        Ok(Box::new(FcClient {
            agent: AgentClient::with_max_frame(
                vm.vsock_path.clone(),
                config.vsock_port,
                config.max_vsock_frame(),
            ),
        }))
    }

    async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

/// `VmClient` over the vsock agent connection.
struct FcClient {
    agent: AgentClient,
}

#[async_trait]
impl VmClient for FcClient {
    async fn init(&self, f: &FunctionSpec) -> Result<()> {
        self.agent.init(init_payload(f)).await;
        Ok(())
    }

    async fn execute(
        &self,
        request_id: &str,
        input: &[u8],
        timeout_s: u64,
    ) -> Result<ExecResponse> {
        let input = parse_input(input)?;
        let resp = self
            .agent
            .execute(request_id, input, timeout_s)
            .await
            .map_err(|e| map_vsock_error(e, timeout_s))?;
        Ok(to_exec_response(resp))
    }

    async fn execute_with_trace(
        &self,
        request_id: &str,
        input: &[u8],
        timeout_s: u64,
        traceparent: &str,
        tracestate: &str,
    ) -> Result<ExecResponse> {
        let input = parse_input(input)?;
        let resp = self
            .agent
            .execute_traced(
                request_id,
                input,
                timeout_s,
                Some(traceparent.to_string()),
                Some(tracestate.to_string()),
            )
            .await
            .map_err(|e| map_vsock_error(e, timeout_s))?;
        Ok(to_exec_response(resp))
    }

    async fn execute_stream(
        &self,
        request_id: &str,
        input: &[u8],
        timeout_s: u64,
        mut on_chunk: ChunkHandler,
    ) -> Result<()> {
        let input = parse_input(input)?;
        self.agent
            .execute_stream(request_id, input, timeout_s, |chunk| {
                on_chunk(StreamChunk {
                    request_id: chunk.request_id,
                    data: chunk.data,
                    is_last: chunk.is_last,
                    error: chunk.error,
                })
                .map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| map_vsock_error(e, timeout_s))?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.agent
            .ping()
            .await
            .map_err(|e| Error::AgentUnreachable(e.to_string()))
    }

    async fn close(&self) {
        // Connections are per-call; nothing held open.
    }
}

fn parse_input(input: &[u8]) -> Result<serde_json::Value> {
    if input.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_slice(input).map_err(|e| Error::Protocol(format!("invalid input JSON: {e}")))
}

fn to_exec_response(resp: RespPayload) -> ExecResponse {
    ExecResponse {
        request_id: resp.request_id,
        output: resp.output,
        error: resp.error,
        duration_ms: resp.duration_ms,
        stdout: resp.stdout,
        stderr: resp.stderr,
    }
}

fn map_vsock_error(err: VsockError, timeout_s: u64) -> Error {
    match err {
        VsockError::Deadline => Error::InvocationTimeout(timeout_s),
        VsockError::Protocol(p) => Error::Protocol(p.to_string()),
        VsockError::Unexpected(t) => Error::Protocol(format!("unexpected message type {t}")),
        VsockError::Aborted(m) => Error::Invocation(m),
        VsockError::Handshake(m) => Error::AgentUnreachable(format!("handshake rejected: {m}")),
        VsockError::Io(e) => Error::AgentUnreachable(e.to_string()),
    }
}

fn init_payload(f: &FunctionSpec) -> InitPayload {
    InitPayload {
        runtime: f.runtime.clone(),
        handler: f.handler.clone(),
        env_vars: f.env_vars.clone(),
        command: None,
        extension: None,
        mode: Some(
            match f.mode {
                ExecMode::Process => "process",
                ExecMode::Persistent => "persistent",
            }
            .to_string(),
        ),
        function_name: f.name.clone(),
        function_version: f.version.clone(),
        memory_mb: f.memory_mb,
        timeout_s: f.timeout_s,
        layer_count: (!f.layer_paths.is_empty()).then(|| f.layer_paths.len() as u32),
        volume_mounts: (!f.resolved_mounts.is_empty()).then(|| {
            f.resolved_mounts
                .iter()
                .map(|m| Mount {
                    source: m.source.clone(),
                    target: m.target.clone(),
                    read_only: m.read_only,
                })
                .collect()
        }),
    }
}
