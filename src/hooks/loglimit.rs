use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::Local;

use crate::error::Result;
use crate::hooks::JobHook;
use crate::provider::context::{Frame, LOG_FILE_KEY};
use crate::provider::MirrorProvider;

/// Logs kept from previous runs; the current run makes it ten.
pub const KEEP_LOGS: usize = 9;
pub const LATEST_LINK: &str = "latest";
pub const FAIL_SUFFIX: &str = ".fail";
const NULL_LOG: &str = "/dev/null";

/// Gives every run its own timestamped log file and keeps `latest` pointing
/// at it. Old logs beyond [`KEEP_LOGS`] are pruned.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLimiter;

impl LogLimiter {
    pub fn new() -> Self {
        Self
    }
}

fn log_file_name(mirror: &str) -> String {
    format!("{}_{}.log", mirror, Local::now().format("%Y-%m-%d_%H_%M"))
}

/// Delete the oldest `{mirror}_*` logs so at most `keep` remain.
fn prune_logs(log_dir: &Path, mirror: &str, keep: usize) -> io::Result<()> {
    let prefix = format!("{mirror}_");
    let mut logs: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&prefix) || !entry.file_type()?.is_file() {
            continue;
        }
        let mtime = entry.metadata()?.modified()?;
        logs.push((mtime, entry.path()));
    }
    logs.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in logs.into_iter().skip(keep) {
        tracing::debug!(file = %path.display(), "Removing old log");
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Point `{log_dir}/latest` at `target` (a name inside `log_dir`) by
/// renaming a fresh symlink over the old one.
fn relink_latest(log_dir: &Path, target: &str) -> io::Result<()> {
    let tmp = log_dir.join(format!(".{}.{}", LATEST_LINK, std::process::id()));
    let _ = fs::remove_file(&tmp);
    std::os::unix::fs::symlink(target, &tmp)?;
    fs::rename(&tmp, log_dir.join(LATEST_LINK))
}

#[async_trait]
impl JobHook for LogLimiter {
    fn name(&self) -> &'static str {
        "loglimit"
    }

    async fn pre_exec(&self, provider: &dyn MirrorProvider) -> Result<()> {
        let log_dir = provider.log_dir();
        let mut frame = Frame::new();

        if provider.log_file() != Path::new(NULL_LOG) {
            fs::create_dir_all(&log_dir)?;
            prune_logs(&log_dir, provider.name(), KEEP_LOGS)?;

            let file_name = log_file_name(provider.name());
            let log_file = log_dir.join(&file_name);
            relink_latest(&log_dir, &file_name)?;
            frame.insert(LOG_FILE_KEY.to_string(), log_file.display().to_string().into());
        }

        // pushed even for /dev/null so the unwind stays balanced
        provider.enter_context(frame);
        Ok(())
    }

    async fn post_success(&self, provider: &dyn MirrorProvider) -> Result<()> {
        provider.exit_context()
    }

    async fn post_fail(&self, provider: &dyn MirrorProvider) -> Result<()> {
        let log_file = provider.log_file();
        if log_file != Path::new(NULL_LOG) {
            let mut failed = log_file.clone().into_os_string();
            failed.push(FAIL_SUFFIX);
            let failed = PathBuf::from(failed);

            match fs::rename(&log_file, &failed) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::File::create(&failed)?;
                }
                Err(e) => return Err(e.into()),
            }
            if let Some(name) = failed.file_name() {
                relink_latest(&provider.log_dir(), &name.to_string_lossy())?;
            }
        }
        provider.exit_context()
    }
}
