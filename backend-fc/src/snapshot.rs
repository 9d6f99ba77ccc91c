use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Bindings Firecracker baked into a snapshot. The restore path must
/// recreate exactly these before `PUT /snapshot/load`; this file is the
/// sole source of truth for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Vsock UDS path recorded in the snapshot.
    pub vsock_path: PathBuf,
    /// Guest CID recorded in the snapshot.
    pub vsock_cid: u32,
    /// Code-drive path recorded in the snapshot.
    pub code_drive: PathBuf,
    /// Persistent copy of the code drive, under the snapshot directory.
    pub code_drive_backup: PathBuf,
    pub guest_ip: String,
    pub guest_mac: String,
}

/// Filesystem store of snapshot artifact sets, keyed by function id:
/// `<id>.snap`, `<id>.mem`, `<id>-code.ext4`, `<id>.meta`.
///
/// A set missing any file is treated as absent and wiped before a cold
/// start, so a crash mid-write can never produce a half-restorable VM.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn snap_path(&self, fn_id: &str) -> PathBuf {
        self.dir.join(format!("{fn_id}.snap"))
    }

    pub fn mem_path(&self, fn_id: &str) -> PathBuf {
        self.dir.join(format!("{fn_id}.mem"))
    }

    pub fn code_backup_path(&self, fn_id: &str) -> PathBuf {
        self.dir.join(format!("{fn_id}-code.ext4"))
    }

    pub fn meta_path(&self, fn_id: &str) -> PathBuf {
        self.dir.join(format!("{fn_id}.meta"))
    }

    /// Whether a snapshot exists: device state and memory image both
    /// present.
    pub fn exists(&self, fn_id: &str) -> bool {
        self.snap_path(fn_id).exists() && self.mem_path(fn_id).exists()
    }

    /// Whether the full artifact set is present.
    pub fn complete(&self, fn_id: &str) -> bool {
        self.exists(fn_id)
            && self.code_backup_path(fn_id).exists()
            && self.meta_path(fn_id).exists()
    }

    /// Delete every artifact for a function. Called on function update,
    /// code change, delete, and failed restore.
    pub async fn invalidate(&self, fn_id: &str) {
        for path in [
            self.snap_path(fn_id),
            self.mem_path(fn_id),
            self.code_backup_path(fn_id),
            self.meta_path(fn_id),
        ] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "snapshot artifact removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove artifact"),
            }
        }
    }

    /// Write the meta file atomically: temp file, fsync, rename.
    pub async fn put_meta(&self, fn_id: &str, meta: &SnapshotMeta) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(meta)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let target = self.meta_path(fn_id);
        let tmp = self.dir.join(format!("{fn_id}.meta.tmp"));

        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    pub async fn get_meta(&self, fn_id: &str) -> std::io::Result<SnapshotMeta> {
        let bytes = tokio::fs::read(self.meta_path(fn_id)).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Fsync the state and memory files. Run after Firecracker reports the
    /// snapshot written, before the set counts as present.
    pub async fn sync_artifacts(&self, fn_id: &str) -> std::io::Result<()> {
        for path in [self.snap_path(fn_id), self.mem_path(fn_id)] {
            let file = tokio::fs::File::open(&path).await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> SnapshotMeta {
        SnapshotMeta {
            vsock_path: "/run/nova/vsock/ab12cd34.vsock".into(),
            vsock_cid: 103,
            code_drive: "/run/nova/ab12cd34-code.ext4".into(),
            code_drive_backup: "/var/lib/nova/snapshots/fn-1-code.ext4".into(),
            guest_ip: "172.30.0.7".into(),
            guest_mac: "02:FC:00:11:22:33".into(),
        }
    }

    #[tokio::test]
    async fn meta_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        store.put_meta("fn-1", &meta()).await.unwrap();
        let got = store.get_meta("fn-1").await.unwrap();
        assert_eq!(got, meta());
    }

    #[tokio::test]
    async fn put_meta_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.put_meta("fn-1", &meta()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["fn-1.meta"]);
    }

    #[tokio::test]
    async fn exists_requires_snap_and_mem() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        assert!(!store.exists("fn-1"));
        std::fs::write(store.snap_path("fn-1"), b"state").unwrap();
        assert!(!store.exists("fn-1"));
        std::fs::write(store.mem_path("fn-1"), b"ram").unwrap();
        assert!(store.exists("fn-1"));
        assert!(!store.complete("fn-1"));
    }

    #[tokio::test]
    async fn complete_requires_all_four() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        std::fs::write(store.snap_path("fn-1"), b"state").unwrap();
        std::fs::write(store.mem_path("fn-1"), b"ram").unwrap();
        std::fs::write(store.code_backup_path("fn-1"), b"ext4").unwrap();
        store.put_meta("fn-1", &meta()).await.unwrap();
        assert!(store.complete("fn-1"));
    }

    #[tokio::test]
    async fn invalidate_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        std::fs::write(store.snap_path("fn-1"), b"state").unwrap();
        std::fs::write(store.mem_path("fn-1"), b"ram").unwrap();
        std::fs::write(store.code_backup_path("fn-1"), b"ext4").unwrap();
        store.put_meta("fn-1", &meta()).await.unwrap();

        store.invalidate("fn-1").await;
        assert!(!store.exists("fn-1"));
        assert!(!store.snap_path("fn-1").exists());
        assert!(!store.mem_path("fn-1").exists());
        assert!(!store.code_backup_path("fn-1").exists());
        assert!(!store.meta_path("fn-1").exists());
    }

    #[tokio::test]
    async fn invalidate_tolerates_partial_sets() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        std::fs::write(store.mem_path("fn-1"), b"ram").unwrap();

        store.invalidate("fn-1").await;
        assert!(!store.mem_path("fn-1").exists());
    }

    #[tokio::test]
    async fn sync_artifacts_errors_on_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store.sync_artifacts("fn-1").await.is_err());
    }
}
