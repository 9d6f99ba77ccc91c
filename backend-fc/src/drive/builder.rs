use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::FirecrackerConfig;

use super::template::ensure_template;

/// Hard upper bound on a code drive.
const MAX_DRIVE_MB: u64 = 512;

/// Usable fraction of an ext4 image after filesystem overhead.
const EXT4_USABLE: f64 = 0.85;

/// Fixed filesystem UUID so repeated builds produce matching metadata.
const DRIVE_UUID: &str = "9aa7cdd2-1e44-4c30-9d67-2da66f4aa15e";

/// Extensions that mark a file executable regardless of content.
const EXEC_EXTENSIONS: [&str; 3] = [".sh", ".py", ".rb"];

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mkfs.ext4 failed: {0}")]
    Mkfs(String),

    #[error("file injection failed: {0}")]
    Inject(String),
}

/// Builds per-VM ext4 code drives by offline injection — the image is never
/// mounted. Files land via `debugfs -w`, which ships with e2fsprogs.
pub struct CodeDriveBuilder {
    default_size_mb: u64,
    min_size_mb: u64,
    template: PathBuf,
}

impl CodeDriveBuilder {
    pub fn new(config: &FirecrackerConfig) -> Self {
        Self {
            default_size_mb: config.code_drive_size_mb,
            min_size_mb: config.min_code_drive_size_mb,
            template: config.template_path(),
        }
    }

    /// Build a drive holding one file, `/handler`, mode `0100755`.
    ///
    /// Small payloads copy the cached template; larger ones get a
    /// custom-sized image.
    pub async fn build_single(&self, dest: &Path, code: &[u8]) -> Result<(), DriveError> {
        let required = required_single_mb(code.len());
        if required <= self.default_size_mb {
            ensure_template(&self.template, self.default_size_mb).await?;
            tokio::fs::copy(&self.template, dest).await?;
        } else {
            format_ext4(dest, required.clamp(self.min_size_mb, MAX_DRIVE_MB)).await?;
        }

        let staging = tempfile::tempdir()?;
        let src = staging.path().join("handler");
        tokio::fs::write(&src, code).await?;
        let entries = vec![ScriptEntry {
            src,
            dest: "/handler".to_string(),
            exec: true,
        }];
        inject(dest, &entries).await
    }

    /// Build a drive holding a file tree. Directories are created
    /// parents-first; executables are detected by name, extension, shebang,
    /// or ELF magic.
    pub async fn build_multi(
        &self,
        dest: &Path,
        files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), DriveError> {
        let total: usize = files.values().map(Vec::len).sum();
        format_ext4(dest, multi_size_mb(total, self.min_size_mb)).await?;

        let staging = tempfile::tempdir()?;
        let mut entries = Vec::with_capacity(files.len());
        for (i, (path, content)) in files.iter().enumerate() {
            let src = staging.path().join(format!("f{i}"));
            tokio::fs::write(&src, content).await?;
            let dest_path = normalize_guest_path(path);
            let exec = is_executable(&dest_path, content);
            entries.push(ScriptEntry {
                src,
                dest: dest_path,
                exec,
            });
        }
        inject(dest, &entries).await
    }
}

/// Required image size for a single-file drive: payload scaled by ext4
/// overhead, plus 2 MiB of metadata headroom.
pub(crate) fn required_single_mb(code_len: usize) -> u64 {
    let code_mb = code_len as f64 / (1024.0 * 1024.0);
    (code_mb / EXT4_USABLE).ceil() as u64 + 2
}

/// Image size for a multi-file drive: 1.5x headroom over the requested
/// total, scaled by ext4 overhead, floored at the configured minimum and
/// capped at 512 MiB.
pub(crate) fn multi_size_mb(total_len: usize, min_mb: u64) -> u64 {
    let total_mb = total_len as f64 / (1024.0 * 1024.0);
    let sized = (total_mb * 1.5 / EXT4_USABLE).ceil() as u64 + 4;
    sized.max(min_mb).min(MAX_DRIVE_MB)
}

/// Whether a file should carry the executable bit on the drive.
pub(crate) fn is_executable(path: &str, content: &[u8]) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    if name == "handler" || name.starts_with("handler.") {
        return true;
    }
    if EXEC_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
        return true;
    }
    content.starts_with(b"#!") || content.starts_with(b"\x7fELF")
}

fn normalize_guest_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

/// Directories needed for a set of guest paths, parents before children.
pub(crate) fn parent_dirs_bfs<'a>(paths: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut dirs = BTreeSet::new();
    for path in paths {
        let trimmed = path.trim_start_matches('/');
        let mut prefix = String::new();
        let Some((dir_part, _file)) = trimmed.rsplit_once('/') else {
            continue;
        };
        for component in dir_part.split('/').filter(|c| !c.is_empty()) {
            prefix.push('/');
            prefix.push_str(component);
            dirs.insert((prefix.matches('/').count(), prefix.clone()));
        }
    }
    dirs.into_iter().map(|(_, dir)| dir).collect()
}

pub(crate) struct ScriptEntry {
    pub src: PathBuf,
    pub dest: String,
    pub exec: bool,
}

/// Render the debugfs command script for a set of staged files.
pub(crate) fn injection_script(entries: &[ScriptEntry]) -> String {
    let mut script = String::new();
    let dirs = parent_dirs_bfs(entries.iter().map(|e| e.dest.as_str()));
    for dir in dirs {
        script.push_str(&format!("mkdir \"{dir}\"\n"));
    }
    for entry in entries {
        let mode = if entry.exec { "0100755" } else { "0100644" };
        script.push_str(&format!(
            "write \"{}\" \"{}\"\nset_inode_field \"{}\" mode {}\n",
            entry.src.display(),
            entry.dest,
            entry.dest,
            mode
        ));
    }
    script
}

/// Create a sparse file of `size_mb` and format it as ext4 with a pinned
/// UUID.
pub(crate) async fn format_ext4(path: &Path, size_mb: u64) -> Result<(), DriveError> {
    tokio::fs::File::create(path)
        .await?
        .set_len(size_mb * 1024 * 1024)
        .await?;

    // Command invoked directly to avoid shell quoting on the path.
    let output = tokio::process::Command::new("mkfs.ext4")
        .args(["-F", "-q", "-U", DRIVE_UUID])
        .arg(path)
        .output()
        .await
        .map_err(|e| DriveError::Mkfs(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DriveError::Mkfs(stderr.trim().to_string()));
    }
    Ok(())
}

/// Apply an injection script with `debugfs -w`.
///
/// debugfs exits zero even when individual commands fail, so its output is
/// scanned for the failure markers it actually prints.
async fn inject(image: &Path, entries: &[ScriptEntry]) -> Result<(), DriveError> {
    let script = injection_script(entries);
    debug!(image = %image.display(), files = entries.len(), "injecting code drive");

    let staging = tempfile::tempdir()?;
    let script_path = staging.path().join("cmds");
    tokio::fs::write(&script_path, &script).await?;

    let output = tokio::process::Command::new("debugfs")
        .arg("-w")
        .arg("-f")
        .arg(&script_path)
        .arg(image)
        .output()
        .await
        .map_err(|e| DriveError::Inject(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DriveError::Inject(stderr.trim().to_string()));
    }

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    for marker in ["not found", "Could not allocate", "No space left"] {
        if combined.contains(marker) {
            return Err(DriveError::Inject(
                combined.lines().take(4).collect::<Vec<_>>().join("; "),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sizing_small_payload_fits_template() {
        // 2 KiB blob: well inside the 16 MiB default.
        assert_eq!(required_single_mb(2 * 1024), 3);
        assert!(required_single_mb(2 * 1024) <= 16);
    }

    #[test]
    fn single_sizing_scales_with_overhead() {
        // 20 MiB payload → ceil(20 / 0.85) + 2 = 26.
        assert_eq!(required_single_mb(20 * 1024 * 1024), 26);
    }

    #[test]
    fn single_sizing_zero_payload() {
        assert_eq!(required_single_mb(0), 2);
    }

    #[test]
    fn multi_sizing_floors_at_min() {
        assert_eq!(multi_size_mb(1024, 4), 5);
        assert_eq!(multi_size_mb(0, 8), 8);
    }

    #[test]
    fn multi_sizing_caps_at_512() {
        assert_eq!(multi_size_mb(900 * 1024 * 1024, 4), 512);
    }

    #[test]
    fn multi_sizing_headroom() {
        // 100 MiB → ceil(100 * 1.5 / 0.85) + 4 = 181.
        assert_eq!(multi_size_mb(100 * 1024 * 1024, 4), 181);
    }

    #[test]
    fn executable_detection_by_name() {
        assert!(is_executable("/handler", b"anything"));
        assert!(is_executable("/app/handler.bin", b"anything"));
        assert!(!is_executable("/app/nothandler.txt", b"anything"));
    }

    #[test]
    fn executable_detection_by_extension() {
        assert!(is_executable("/app/run.sh", b"echo hi"));
        assert!(is_executable("/app/main.py", b"print(1)"));
        assert!(is_executable("/app/main.rb", b"puts 1"));
        assert!(!is_executable("/app/data.json", b"{}"));
    }

    #[test]
    fn executable_detection_by_content() {
        assert!(is_executable("/app/run", b"#!/bin/sh\necho hi"));
        assert!(is_executable("/app/bin", b"\x7fELF\x02\x01\x01"));
        assert!(!is_executable("/app/readme", b"hello"));
    }

    #[test]
    fn parent_dirs_are_breadth_first() {
        let dirs = parent_dirs_bfs(["/a/b/c/file.py", "/a/x.txt", "/d/e.txt"]);
        assert_eq!(dirs, vec!["/a", "/d", "/a/b", "/a/b/c"]);
    }

    #[test]
    fn parent_dirs_dedupe() {
        let dirs = parent_dirs_bfs(["/lib/a.py", "/lib/b.py"]);
        assert_eq!(dirs, vec!["/lib"]);
    }

    #[test]
    fn root_level_files_need_no_dirs() {
        assert!(parent_dirs_bfs(["/handler"]).is_empty());
        assert!(parent_dirs_bfs(["handler"]).is_empty());
    }

    #[test]
    fn injection_script_shape() {
        let entries = vec![
            ScriptEntry {
                src: PathBuf::from("/tmp/stage/f0"),
                dest: "/lib/util.py".into(),
                exec: true,
            },
            ScriptEntry {
                src: PathBuf::from("/tmp/stage/f1"),
                dest: "/data.json".into(),
                exec: false,
            },
        ];
        let script = injection_script(&entries);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "mkdir \"/lib\"");
        assert_eq!(lines[1], "write \"/tmp/stage/f0\" \"/lib/util.py\"");
        assert_eq!(lines[2], "set_inode_field \"/lib/util.py\" mode 0100755");
        assert_eq!(lines[3], "write \"/tmp/stage/f1\" \"/data.json\"");
        assert_eq!(lines[4], "set_inode_field \"/data.json\" mode 0100644");
    }

    #[test]
    fn guest_paths_are_rooted() {
        assert_eq!(normalize_guest_path("a/b.py"), "/a/b.py");
        assert_eq!(normalize_guest_path("/a/b.py"), "/a/b.py");
    }
}
