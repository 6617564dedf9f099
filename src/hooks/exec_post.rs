use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Result, WorkerError};
use crate::hooks::JobHook;
use crate::provider::MirrorProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOn {
    Success,
    Failure,
}

impl ExecOn {
    fn exit_status(self) -> &'static str {
        match self {
            ExecOn::Success => "success",
            ExecOn::Failure => "failure",
        }
    }
}

/// Runs a shell one-liner after a run succeeds or fails.
#[derive(Debug, Clone)]
pub struct ExecPostHook {
    exec_on: ExecOn,
    command: String,
}

impl ExecPostHook {
    pub fn new(exec_on: ExecOn, command: impl Into<String>) -> Result<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(WorkerError::Config("empty exec-post command".to_string()));
        }
        Ok(Self { exec_on, command })
    }

    async fn fire(&self, provider: &dyn MirrorProvider) -> Result<()> {
        tracing::debug!(mirror = provider.name(), command = %self.command, "Running exec-post hook");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(std::env::temp_dir())
            .env("TUNASYNC_MIRROR_NAME", provider.name())
            .env("TUNASYNC_WORKING_DIR", provider.working_dir())
            .env("TUNASYNC_UPSTREAM_URL", provider.upstream())
            .env("TUNASYNC_LOG_DIR", provider.log_dir())
            .env("TUNASYNC_LOG_FILE", provider.log_file())
            .env("TUNASYNC_JOB_EXIT_STATUS", self.exec_on.exit_status())
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::error!(
            mirror = provider.name(),
            command = %self.command,
            status = %output.status,
            stderr = %stderr.trim(),
            "Exec-post command failed"
        );
        Err(WorkerError::Sync(format!(
            "command `{}` failed: {}",
            self.command, output.status
        )))
    }
}

#[async_trait]
impl JobHook for ExecPostHook {
    fn name(&self) -> &'static str {
        match self.exec_on {
            ExecOn::Success => "exec-on-success",
            ExecOn::Failure => "exec-on-failure",
        }
    }

    async fn post_success(&self, provider: &dyn MirrorProvider) -> Result<()> {
        match self.exec_on {
            ExecOn::Success => self.fire(provider).await,
            ExecOn::Failure => Ok(()),
        }
    }

    async fn post_fail(&self, provider: &dyn MirrorProvider) -> Result<()> {
        match self.exec_on {
            ExecOn::Failure => self.fire(provider).await,
            ExecOn::Success => Ok(()),
        }
    }
}
