//! Lifecycle hooks wrapped around every provider run.
//!
//! A provider owns an ordered hook list. Within one run the job calls:
//!
//! 1. `pre_job` on every hook in registration order
//! 2. per attempt: `pre_exec` in registration order, the provider itself,
//!    then `post_exec` in reverse order
//! 3. `post_success` or `post_fail` in reverse order
//!
//! Reverse unwinding keeps the context frames pushed by hooks balanced.
//!
//! # Built-in hooks
//!
//! - [`LogLimiter`]: per-run log files, rotation and the `latest` symlink
//! - [`ExecPostHook`]: shell command after success or failure
//! - [`DockerHook`]: runs the provider inside a container
//! - [`CgroupHook`]: places the provider's processes into a cgroup
//! - [`BtrfsSnapshotHook`]: snapshots the working directory after success
//! - [`ZfsHook`]: creates a dataset for a missing working directory

use async_trait::async_trait;

use crate::error::Result;
use crate::provider::MirrorProvider;

pub mod btrfs;
pub mod cgroup;
pub mod docker;
pub mod exec_post;
pub mod loglimit;
pub mod zfs;

pub use btrfs::BtrfsSnapshotHook;
pub use cgroup::{CgroupBase, CgroupHook};
pub use docker::DockerHook;
pub use exec_post::{ExecOn, ExecPostHook};
pub use loglimit::LogLimiter;
pub use zfs::ZfsHook;

#[async_trait]
pub trait JobHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn pre_job(&self, _provider: &dyn MirrorProvider) -> Result<()> {
        Ok(())
    }

    async fn pre_exec(&self, _provider: &dyn MirrorProvider) -> Result<()> {
        Ok(())
    }

    async fn post_exec(&self, _provider: &dyn MirrorProvider) -> Result<()> {
        Ok(())
    }

    async fn post_success(&self, _provider: &dyn MirrorProvider) -> Result<()> {
        Ok(())
    }

    async fn post_fail(&self, _provider: &dyn MirrorProvider) -> Result<()> {
        Ok(())
    }
}

/// Run a shell-free command to completion, mapping a non-zero exit to an error
/// that carries its stderr.
pub(crate) async fn run_tool(program: &str, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(crate::error::WorkerError::Sync(format!(
            "{} {}: {} {}",
            program,
            args.join(" "),
            output.status,
            stderr.trim()
        )))
    }
}
