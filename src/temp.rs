use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{debug, warn};
use uuid::Uuid;

/// Owns a scratch path on disk for the lifetime of one request.
///
/// The path does not need to exist yet: resolvers that write intermediate
/// files create it on demand. Whatever is there when the guard is dropped is
/// removed, so cleanup happens on every exit path of the owning handler.
#[derive(Debug)]
pub struct TempResourceGuard {
    path: PathBuf,
}

impl TempResourceGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Reserves a fresh, request-unique path under `transfer_dir`.
    pub fn unique_in(transfer_dir: &Path) -> Self {
        Self::new(transfer_dir.join(Uuid::new_v4().to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the scratch path without blocking the runtime. The `Drop`
    /// impl only covers handlers that never reach this call.
    pub async fn close(mut self) {
        let path = std::mem::take(&mut self.path);
        remove_path(&path).await;
    }
}

impl Drop for TempResourceGuard {
    fn drop(&mut self) {
        if self.path.as_os_str().is_empty() {
            return;
        }

        let result = match std::fs::symlink_metadata(&self.path) {
            Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(&self.path),
            Ok(_) => std::fs::remove_file(&self.path),
            Err(error) => Err(error),
        };
        log_removal(&self.path, result);
    }
}

async fn remove_path(path: &Path) {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(error) => Err(error),
    };
    log_removal(path, result);
}

fn log_removal(path: &Path, result: std::io::Result<()>) {
    match result {
        Ok(()) => debug!("Removed temporary path {:?}", path),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!("Could not remove temporary path {:?}: {error}", path),
    }
}

/// Deletes scratch entries left behind by a previous process.
pub async fn cleanup_stale_transfers(transfer_dir: &Path, older_than: Duration) {
    if older_than.is_zero() {
        return;
    }

    let mut entries = match tokio::fs::read_dir(transfer_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open transfer directory for cleanup: {error}");
            }
            return;
        }
    };

    let now = SystemTime::now();

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not iterate transfer directory for cleanup: {error}");
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let path = entry.path();
        let modified_at = match entry.metadata().await.and_then(|metadata| metadata.modified()) {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not read modification time of {:?}: {error}", path);
                continue;
            }
        };

        let age = now.duration_since(modified_at).unwrap_or_default();
        if age < older_than {
            continue;
        }

        remove_path(&path).await;
    }
}
