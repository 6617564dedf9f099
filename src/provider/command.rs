use async_trait::async_trait;
use regex::Regex;
use tokio::sync::oneshot;

use crate::config::{MirrorConfig, ProviderKind};
use crate::error::{Result, WorkerError};
use crate::provider::{extract_from_log, MirrorProvider, ProviderBase, ProviderConfig};

/// Runs an arbitrary shell-quoted command line.
pub struct CommandProvider {
    base: ProviderBase,
    argv: Vec<String>,
    fail_on_match: Option<Regex>,
    size_pattern: Option<Regex>,
}

fn compile(field: &str, pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| {
            Regex::new(p).map_err(|e| WorkerError::Config(format!("invalid {field} `{p}`: {e}")))
        })
        .transpose()
}

impl CommandProvider {
    pub fn new(config: ProviderConfig, mirror: &MirrorConfig) -> Result<Self> {
        let argv = shlex::split(&mirror.command).ok_or_else(|| {
            WorkerError::Config(format!("{}: unbalanced quotes in command", mirror.name))
        })?;
        if argv.is_empty() {
            return Err(WorkerError::Config(format!(
                "{}: command provider needs a command",
                mirror.name
            )));
        }

        Ok(Self {
            base: ProviderBase::new(config),
            argv,
            fail_on_match: compile("fail_on_match", mirror.fail_on_match.as_deref())?,
            size_pattern: compile("size_pattern", mirror.size_pattern.as_deref())?,
        })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

#[async_trait]
impl MirrorProvider for CommandProvider {
    fn base(&self) -> &ProviderBase {
        &self.base
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Command
    }

    async fn run(&self, started: oneshot::Sender<()>) -> Result<()> {
        self.base.begin_run();
        let cmd = self.base.build_cmd(self.argv.clone(), self.base.run_env());
        self.base.run_cmd(cmd, false, Some(started)).await?;

        let log_file = self.log_file();
        if let Some(re) = &self.fail_on_match {
            let content = tokio::fs::read(&log_file).await.unwrap_or_default();
            let matches = re.find_iter(&String::from_utf8_lossy(&content)).count();
            if matches > 0 {
                tracing::warn!(mirror = self.name(), matches, "Log matched fail_on_match");
                return Err(WorkerError::Sync(format!("Fail-on-match: {matches}")));
            }
        }
        if let Some(re) = &self.size_pattern {
            self.base
                .set_data_size(extract_from_log(&log_file, re).await);
        }
        Ok(())
    }
}
