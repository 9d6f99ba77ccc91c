use std::path::PathBuf;

use crate::config::FirecrackerConfig;

/// Per-VM ephemeral file paths derived from the configured directories.
pub(crate) struct VmPaths {
    pub api_sock: PathBuf,
    pub vsock: PathBuf,
    pub log: PathBuf,
    pub code_drive: PathBuf,
}

impl VmPaths {
    pub fn new(config: &FirecrackerConfig, vm_id: &str) -> Self {
        Self {
            api_sock: config.socket_dir.join(format!("{vm_id}.sock")),
            vsock: config.vsock_dir.join(format!("{vm_id}.vsock")),
            log: config.log_dir.join(format!("{vm_id}.log")),
            code_drive: config.socket_dir.join(format!("{vm_id}-code.ext4")),
        }
    }
}

impl FirecrackerConfig {
    /// Rootfs image path for an image name (`python` → `python.ext4`).
    pub(crate) fn rootfs_image(&self, name: &str) -> PathBuf {
        if name.ends_with(".ext4") {
            self.rootfs_dir.join(name)
        } else {
            self.rootfs_dir.join(format!("{name}.ext4"))
        }
    }

    /// Cached empty code-drive template, formatted once per process.
    pub(crate) fn template_path(&self) -> PathBuf {
        self.socket_dir.join("code-template.ext4")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_vm_paths_follow_layout() {
        let cfg = FirecrackerConfig::default();
        let paths = VmPaths::new(&cfg, "ab12cd34");
        assert_eq!(paths.api_sock, PathBuf::from("/run/nova/ab12cd34.sock"));
        assert_eq!(paths.vsock, PathBuf::from("/run/nova/vsock/ab12cd34.vsock"));
        assert_eq!(paths.log, PathBuf::from("/var/log/nova/ab12cd34.log"));
        assert_eq!(
            paths.code_drive,
            PathBuf::from("/run/nova/ab12cd34-code.ext4")
        );
    }

    #[test]
    fn rootfs_image_appends_extension_once() {
        let cfg = FirecrackerConfig::default();
        assert_eq!(
            cfg.rootfs_image("python"),
            PathBuf::from("/var/lib/nova/rootfs/python.ext4")
        );
        assert_eq!(
            cfg.rootfs_image("custom.ext4"),
            PathBuf::from("/var/lib/nova/rootfs/custom.ext4")
        );
    }

    #[test]
    fn socket_paths_fit_sun_path_limit() {
        let cfg = FirecrackerConfig::default();
        let paths = VmPaths::new(&cfg, "ffffffff");
        // sun_path limit is 108 bytes (including NUL terminator).
        assert!(paths.api_sock.as_os_str().len() <= 107);
        assert!(paths.vsock.as_os_str().len() <= 107);
    }
}
