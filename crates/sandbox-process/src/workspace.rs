use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sandbox::{Cleanup, SandboxError};
use tracing::{info, warn};

use crate::process::Identity;

/// Directory name prefix for session workspaces.
pub const WORKSPACE_PREFIX: &str = "memhawk-";

/// Pause before the single removal retry.
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Ephemeral per-session directory: `<root>/memhawk-<id>/`.
///
/// Removed by [`Workspace::close`]; a workspace dropped without being closed
/// is removed synchronously in `Drop`.
pub struct Workspace {
    path: PathBuf,
    removed: AtomicBool,
}

impl Workspace {
    /// Create a fresh private (mode 0700) directory under `root`, or under the
    /// system temp dir when `root` is `None`. Never reuses an existing path.
    pub async fn open(root: Option<&Path>, id: &str) -> sandbox::Result<Self> {
        let root = root.map_or_else(std::env::temp_dir, Path::to_path_buf);
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            SandboxError::WorkspaceFailed(format!("create {}: {e}", root.display()))
        })?;

        let path = root.join(format!("{WORKSPACE_PREFIX}{id}"));
        tokio::fs::DirBuilder::new()
            .mode(0o700)
            .create(&path)
            .await
            .map_err(|e| SandboxError::WorkspaceFailed(format!("create {}: {e}", path.display())))?;

        info!(path = %path.display(), "workspace created");
        Ok(Self {
            path,
            removed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand the directory to the unprivileged user children run as.
    pub(crate) fn chown(&self, identity: &Identity) -> sandbox::Result<()> {
        nix::unistd::chown(&self.path, Some(identity.uid), Some(identity.gid)).map_err(|e| {
            SandboxError::WorkspaceFailed(format!(
                "chown {} to {}: {e}",
                self.path.display(),
                identity.name
            ))
        })
    }

    /// Recursively remove the directory. Safe to call repeatedly and after the
    /// directory was removed by someone else. A failed removal is retried once
    /// and then reported, never raised.
    pub async fn close(&self) -> Cleanup {
        let first = match remove(&self.path).await {
            Ok(cleanup) => return self.mark_removed(cleanup),
            Err(e) => e,
        };
        warn!(path = %self.path.display(), error = %first, "workspace removal failed, retrying");
        tokio::time::sleep(REMOVE_RETRY_DELAY).await;

        match remove(&self.path).await {
            Ok(cleanup) => self.mark_removed(cleanup),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "workspace left behind");
                Cleanup::Failed(e.to_string())
            }
        }
    }

    fn mark_removed(&self, cleanup: Cleanup) -> Cleanup {
        self.removed.store(true, Ordering::Release);
        if cleanup == Cleanup::Removed {
            info!(path = %self.path.display(), "workspace removed");
        }
        cleanup
    }
}

async fn remove(path: &Path) -> std::io::Result<Cleanup> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(Cleanup::Removed),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Cleanup::AlreadyGone),
        Err(e) => Err(e),
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.removed.load(Ordering::Acquire) {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "workspace removed on drop"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove workspace on drop"),
        }
    }
}
