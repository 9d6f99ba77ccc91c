use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::function::FunctionSpec;
use crate::vm::Vm;

/// Result of a single invocation, as reported by the guest agent.
///
/// A non-empty `error` means the function itself failed; the VM stays
/// healthy and the caller decides how to surface it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResponse {
    pub request_id: String,
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

/// One chunk of a streaming invocation.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub request_id: String,
    pub data: Vec<u8>,
    pub is_last: bool,
    pub error: String,
}

/// Callback invoked per stream chunk. Returning an error aborts the stream
/// and closes the connection.
pub type ChunkHandler = Box<dyn FnMut(StreamChunk) -> Result<()> + Send>;

/// Connection to one VM's guest agent.
///
/// At most one `execute*` call is in flight per client at a time; the
/// implementation serializes callers.
#[async_trait]
pub trait VmClient: Send + Sync {
    /// Record the function's Init parameters. Sent on every fresh
    /// connection before `Exec`.
    async fn init(&self, f: &FunctionSpec) -> Result<()>;

    /// Run one invocation and wait for its response. `input` is raw JSON.
    async fn execute(&self, request_id: &str, input: &[u8], timeout_s: u64)
    -> Result<ExecResponse>;

    /// Like [`execute`](Self::execute) with W3C trace context attached.
    async fn execute_with_trace(
        &self,
        request_id: &str,
        input: &[u8],
        timeout_s: u64,
        traceparent: &str,
        tracestate: &str,
    ) -> Result<ExecResponse>;

    /// Run one invocation, delivering output as ordered chunks until one
    /// with `is_last`.
    async fn execute_stream(
        &self,
        request_id: &str,
        input: &[u8],
        timeout_s: u64,
        on_chunk: ChunkHandler,
    ) -> Result<()>;

    /// Liveness probe, bounded at a few seconds.
    async fn ping(&self) -> Result<()>;

    /// Release client-side resources. Connections are per-call, so this is
    /// usually a no-op.
    async fn close(&self);
}

/// Capability set the pool drives a backend through.
///
/// Implementations exist for Firecracker, container runtimes, and WASM; the
/// pool depends only on this contract.
#[async_trait]
pub trait VmBackend: Send + Sync {
    /// Boot a VM for `f` carrying `code`, ready to serve invocations.
    async fn create_vm(&self, f: &FunctionSpec, code: &[u8]) -> Result<Arc<Vm>>;

    /// Tear down a VM and release every resource it held.
    async fn stop_vm(&self, id: &str) -> Result<()>;

    /// Build a client for a VM's guest agent.
    fn new_client(&self, vm: &Vm) -> Result<Box<dyn VmClient>>;

    /// Stop all live VMs and release backend-level resources.
    async fn shutdown(&self);
}
