use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How the guest agent runs the function between invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Spawn a fresh process per invocation.
    #[default]
    Process,
    /// Keep one process alive and feed it invocations.
    Persistent,
}

/// Optional per-function I/O throttles, applied to the code drive and the
/// network interface when set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Disk operations per second.
    pub disk_iops: Option<u64>,
    /// Disk bandwidth in bytes per second.
    pub disk_bw: Option<u64>,
    /// Network receive bandwidth in bytes per second.
    pub net_rx_bw: Option<u64>,
    /// Network transmit bandwidth in bytes per second.
    pub net_tx_bw: Option<u64>,
}

/// Network isolation level for a function's VMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationMode {
    /// Default-deny egress; only explicit rules pass.
    #[serde(rename = "strict")]
    Strict,
    /// Outbound traffic allowed, inbound blocked.
    #[serde(rename = "egress-only")]
    EgressOnly,
}

/// One allow rule for egress or ingress traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetRule {
    pub host: String,
    pub port: u16,
    /// "tcp" or "udp".
    pub protocol: String,
}

/// Per-function network policy. When `isolation_mode` is unset the VM gets a
/// plain TAP on the shared bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicy {
    pub isolation_mode: Option<IsolationMode>,
    pub egress_rules: Vec<NetRule>,
    pub ingress_rules: Vec<NetRule>,
}

/// A host directory exposed to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Function descriptor, owned by the metadata store and treated as input
/// here. `code_hash` gates VM reuse: any change evicts warm VMs and
/// invalidates the function's snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Runtime tag; selects the read-only rootfs image unless
    /// `runtime_image` overrides it.
    pub runtime: String,
    pub handler: String,
    pub code_hash: String,
    pub memory_mb: u32,
    pub timeout_s: u64,
    pub vcpus: u32,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default)]
    pub min_replicas: u32,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_replicas: u32,
    #[serde(default)]
    pub mode: ExecMode,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub network_policy: Option<NetworkPolicy>,
    #[serde(default)]
    pub resolved_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub layer_paths: Vec<String>,
    /// Explicit rootfs image name, overriding the runtime tag.
    #[serde(default)]
    pub runtime_image: Option<String>,
}

impl FunctionSpec {
    /// Whether this function's VMs need a dedicated network namespace.
    pub fn isolated(&self) -> bool {
        self.network_policy
            .as_ref()
            .is_some_and(|p| p.isolation_mode.is_some())
    }
}
