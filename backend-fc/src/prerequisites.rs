use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use backend::{Error, Result};

use crate::config::FirecrackerConfig;

/// Commands the data plane shells out to.
const REQUIRED_COMMANDS: [&str; 6] = ["ip", "iptables", "ip6tables", "sysctl", "mkfs.ext4", "debugfs"];

/// Verify the host before the backend starts: firecracker binary, kernel,
/// rootfs directory, KVM, and the external commands. All failures are
/// collected into one `fatal_setup` error.
pub(crate) fn check(config: &FirecrackerConfig) -> Result<()> {
    let mut problems = Vec::new();

    if !config.firecracker_bin.is_file() {
        problems.push(format!(
            "firecracker binary missing at {}",
            config.firecracker_bin.display()
        ));
    } else if !has_exec_bit(&config.firecracker_bin) {
        problems.push(format!(
            "firecracker binary at {} lacks execute permission",
            config.firecracker_bin.display()
        ));
    }

    if !config.kernel_path.is_file() {
        problems.push(format!(
            "kernel image missing at {}",
            config.kernel_path.display()
        ));
    }
    if !config.rootfs_dir.is_dir() {
        problems.push(format!(
            "rootfs directory missing: {}",
            config.rootfs_dir.display()
        ));
    }

    if let Some(problem) = kvm_problem() {
        problems.push(problem);
    }

    for cmd in REQUIRED_COMMANDS {
        if which::which(cmd).is_err() {
            problems.push(format!("required command not found: {cmd}"));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::FatalSetup(problems.join("; ")))
    }
}

fn has_exec_bit(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// KVM must be present and opened read-write by this process; a single
/// open attempt answers both questions.
fn kvm_problem() -> Option<String> {
    match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/kvm")
    {
        Ok(_) => None,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Some("KVM is unavailable (no /dev/kvm)".to_string())
        }
        Err(e) => Some(format!("cannot open /dev/kvm read-write: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_everything_collects_all_failures() {
        let config = FirecrackerConfig {
            firecracker_bin: "/nonexistent/firecracker".into(),
            kernel_path: "/nonexistent/vmlinux".into(),
            rootfs_dir: "/nonexistent/rootfs".into(),
            ..FirecrackerConfig::default()
        };
        let err = check(&config).unwrap_err();
        assert_eq!(err.code(), "fatal_setup");
        let message = err.to_string();
        assert!(message.contains("firecracker binary missing"));
        assert!(message.contains("kernel image missing"));
        assert!(message.contains("rootfs directory missing"));
    }

    #[test]
    fn exec_bit_detection() {
        // Any shell on the host is executable; a fresh temp file is not.
        let sh = which::which("sh").unwrap();
        assert!(has_exec_bit(&sh));

        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("data");
        std::fs::write(&plain, b"x").unwrap();
        assert!(!has_exec_bit(&plain));
        assert!(!has_exec_bit(&dir.path().join("missing")));
    }
}
