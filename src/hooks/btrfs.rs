use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Result, WorkerError};
use crate::hooks::{run_tool, JobHook};
use crate::provider::MirrorProvider;

/// Keeps the working directory on a btrfs subvolume and refreshes a
/// writable snapshot of it after every successful run.
#[derive(Debug, Clone)]
pub struct BtrfsSnapshotHook {
    snapshot_path: PathBuf,
}

impl BtrfsSnapshotHook {
    /// `snapshot_dir` holds one snapshot per mirror, named after the mirror.
    pub fn new(snapshot_dir: &Path, mirror_name: &str) -> Self {
        Self {
            snapshot_path: snapshot_dir.join(mirror_name),
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }
}

async fn is_subvolume(path: &Path) -> bool {
    let path = path.display().to_string();
    run_tool("btrfs", &["subvolume", "show", &path]).await.is_ok()
}

#[async_trait]
impl JobHook for BtrfsSnapshotHook {
    fn name(&self) -> &'static str {
        "btrfs-snapshot"
    }

    async fn pre_job(&self, provider: &dyn MirrorProvider) -> Result<()> {
        let working_dir = provider.working_dir();
        let dir = working_dir.display().to_string();
        if !working_dir.exists() {
            tracing::info!(mirror = provider.name(), dir = %dir, "Creating btrfs subvolume");
            run_tool("btrfs", &["subvolume", "create", &dir]).await?;
            return Ok(());
        }
        if !is_subvolume(&working_dir).await {
            return Err(WorkerError::Sync(format!(
                "path {dir} exists but isn't a btrfs subvolume"
            )));
        }
        Ok(())
    }

    async fn post_success(&self, provider: &dyn MirrorProvider) -> Result<()> {
        let snapshot = self.snapshot_path.display().to_string();
        if self.snapshot_path.exists() {
            if !is_subvolume(&self.snapshot_path).await {
                return Err(WorkerError::Sync(format!(
                    "path {snapshot} exists and isn't a btrfs snapshot"
                )));
            }
            run_tool("btrfs", &["subvolume", "delete", &snapshot]).await?;
        }

        let source = provider.working_dir().display().to_string();
        run_tool("btrfs", &["subvolume", "snapshot", &source, &snapshot]).await?;
        tracing::info!(mirror = provider.name(), snapshot = %snapshot, "Created btrfs snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_path_is_per_mirror() {
        let hook = BtrfsSnapshotHook::new(Path::new("/snapshots"), "debian");
        assert_eq!(hook.snapshot_path(), Path::new("/snapshots/debian"));
    }
}
