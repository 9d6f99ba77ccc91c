use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::info;

use super::builder::{DriveError, format_ext4};

/// Set once the template image exists; reset is implicit because failures
/// never set it, so later callers retry.
static TEMPLATE_READY: AtomicBool = AtomicBool::new(false);

static TEMPLATE_LOCK: Mutex<()> = Mutex::const_new(());

/// Ensure the pre-formatted empty code-drive template exists.
///
/// Formatting an ext4 image costs tens of milliseconds; doing it once per
/// process and copying the file per VM keeps cold starts flat.
pub(crate) async fn ensure_template(path: &Path, size_mb: u64) -> Result<(), DriveError> {
    if TEMPLATE_READY.load(Ordering::Acquire) && path.exists() {
        return Ok(());
    }

    let _guard = TEMPLATE_LOCK.lock().await;
    if TEMPLATE_READY.load(Ordering::Acquire) && path.exists() {
        return Ok(());
    }

    match format_ext4(path, size_mb).await {
        Ok(()) => {
            TEMPLATE_READY.store(true, Ordering::Release);
            info!(path = %path.display(), size_mb, "code-drive template created");
            Ok(())
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(path).await;
            Err(e)
        }
    }
}
