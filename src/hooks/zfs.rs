use async_trait::async_trait;

use crate::error::Result;
use crate::hooks::{run_tool, JobHook};
use crate::provider::MirrorProvider;

/// Creates a ZFS dataset for a mirror whose working directory is missing.
#[derive(Debug, Clone)]
pub struct ZfsHook {
    zpool: String,
}

impl ZfsHook {
    pub fn new(zpool: impl Into<String>) -> Self {
        Self {
            zpool: zpool.into(),
        }
    }

    pub fn dataset(&self, mirror_name: &str) -> String {
        format!("{}/{}", self.zpool, mirror_name.to_lowercase())
    }
}

#[async_trait]
impl JobHook for ZfsHook {
    fn name(&self) -> &'static str {
        "zfs"
    }

    async fn pre_job(&self, provider: &dyn MirrorProvider) -> Result<()> {
        let working_dir = provider.working_dir();
        if working_dir.exists() {
            return Ok(());
        }

        let dataset = self.dataset(provider.name());
        let mountpoint = format!("mountpoint={}", working_dir.display());
        tracing::info!(mirror = provider.name(), dataset = %dataset, "Creating ZFS dataset");
        run_tool("zfs", &["create", "-p", "-o", &mountpoint, &dataset]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_name_is_lowercased() {
        let hook = ZfsHook::new("tank/mirrors");
        assert_eq!(hook.dataset("AOSP"), "tank/mirrors/aosp");
    }
}
