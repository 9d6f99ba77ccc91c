use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Firecracker backend configuration.
///
/// Every knob has a default suitable for a single-host deployment; loading
/// from JSON/TOML only needs to name the overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirecrackerConfig {
    /// Firecracker binary.
    pub firecracker_bin: PathBuf,
    /// Guest kernel image.
    pub kernel_path: PathBuf,
    /// Directory of read-only rootfs images, one per runtime tag
    /// (`<runtime>.ext4`).
    pub rootfs_dir: PathBuf,
    /// Snapshot artifact directory.
    pub snapshot_dir: PathBuf,
    /// Firecracker API sockets and code drives.
    pub socket_dir: PathBuf,
    /// Vsock multiplexer sockets.
    pub vsock_dir: PathBuf,
    /// Per-VM log files.
    pub log_dir: PathBuf,

    /// Host bridge device.
    pub bridge_name: String,
    /// Guest subnet in CIDR form; `.1` is the bridge gateway.
    pub subnet: String,

    /// Guest agent vsock port.
    pub vsock_port: u32,
    /// Maximum vsock frame size in MiB.
    pub max_vsock_message_mb: usize,

    /// Bound on the whole boot sequence (spawn, API, configure, vsock).
    pub boot_timeout_s: u64,

    /// Default code drive size in MiB; drives that fit use the cached
    /// template image.
    pub code_drive_size_mb: u64,
    /// Lower clamp for custom-sized code drives in MiB.
    pub min_code_drive_size_mb: u64,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            firecracker_bin: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_path: PathBuf::from("/var/lib/nova/vmlinux"),
            rootfs_dir: PathBuf::from("/var/lib/nova/rootfs"),
            snapshot_dir: PathBuf::from("/var/lib/nova/snapshots"),
            socket_dir: PathBuf::from("/run/nova"),
            vsock_dir: PathBuf::from("/run/nova/vsock"),
            log_dir: PathBuf::from("/var/log/nova"),
            bridge_name: "nova-br0".into(),
            subnet: "172.30.0.0/24".into(),
            vsock_port: vsock_proto::DEFAULT_AGENT_PORT,
            max_vsock_message_mb: 8,
            boot_timeout_s: 30,
            code_drive_size_mb: 16,
            min_code_drive_size_mb: 4,
        }
    }
}

impl FirecrackerConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_s)
    }

    pub fn max_vsock_frame(&self) -> usize {
        self.max_vsock_message_mb * 1024 * 1024
    }
}
