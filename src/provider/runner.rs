use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::watch;

use crate::error::{Result, WorkerError};
use crate::hooks::{CgroupHook, DockerHook};

/// Grace period between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Where a child's isolation boundary comes from. Docker and cgroup
/// isolation are mutually exclusive per provider.
#[derive(Clone, Default)]
pub enum Isolation {
    #[default]
    None,
    Cgroup(Arc<CgroupHook>),
    Docker(Arc<DockerHook>),
}

impl Isolation {
    pub fn is_docker(&self) -> bool {
        matches!(self, Isolation::Docker(_))
    }
}

impl std::fmt::Debug for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Isolation::None => write!(f, "None"),
            Isolation::Cgroup(_) => write!(f, "Cgroup"),
            Isolation::Docker(d) => write!(f, "Docker({})", d.image()),
        }
    }
}

/// Destination for the child's stdout and stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Null,
    File { path: PathBuf, append: bool },
}

/// How a running process went away after [`CmdJob::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period after SIGTERM (or `docker stop`)
    Graceful,
    /// Needed SIGKILL (or `docker kill`)
    Killed,
}

type ExitOutcome = std::result::Result<ExitStatus, String>;

/// Inherit `parent` minus every key overridden in `overrides`, then append
/// the overrides.
pub fn compose_env(
    parent: impl IntoIterator<Item = (String, String)>,
    overrides: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    let mut env: Vec<(String, String)> = parent
        .into_iter()
        .filter(|(k, _)| !overrides.contains_key(k) && seen.insert(k.clone()))
        .collect();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// One external command run on behalf of a mirror.
///
/// `wait` and `terminate` may be called concurrently from different tasks;
/// exit is observed through a watch channel fed by a reaper task.
pub struct CmdJob {
    name: String,
    argv: Vec<String>,
    working_dir: PathBuf,
    env: BTreeMap<String, String>,
    sink: Mutex<LogSink>,
    isolation: Isolation,
    volumes: Vec<String>,
    pid: Mutex<Option<i32>>,
    exit_tx: Arc<watch::Sender<Option<ExitOutcome>>>,
}

impl CmdJob {
    pub fn new(
        name: impl Into<String>,
        argv: Vec<String>,
        working_dir: impl Into<PathBuf>,
        env: BTreeMap<String, String>,
    ) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            name: name.into(),
            argv,
            working_dir: working_dir.into(),
            env,
            sink: Mutex::new(LogSink::Null),
            isolation: Isolation::None,
            volumes: Vec::new(),
            pid: Mutex::new(None),
            exit_tx: Arc::new(exit_tx),
        }
    }

    pub fn with_isolation(mut self, isolation: Isolation, volumes: Vec<String>) -> Self {
        self.isolation = isolation;
        self.volumes = volumes;
        self
    }

    pub fn set_log_sink(&self, sink: LogSink) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn pid(&self) -> Option<i32> {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_exited(&self) -> bool {
        self.exit_tx.borrow().is_some()
    }

    fn open_sink(&self) -> Result<(Stdio, Stdio)> {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match sink {
            LogSink::Null => Ok((Stdio::null(), Stdio::null())),
            LogSink::File { path, append } => {
                let file: File = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(append)
                    .truncate(!append)
                    .open(&path)?;
                Ok((Stdio::from(file.try_clone()?), Stdio::from(file)))
            }
        }
    }

    fn command(&self) -> Result<Command> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| WorkerError::Config(format!("{}: empty command", self.name)))?;

        let mut cmd = match &self.isolation {
            Isolation::Docker(docker) => {
                let mut cmd = Command::new("docker");
                cmd.args(docker.run_args(&self.working_dir, &self.volumes, &self.env, &self.argv));
                cmd
            }
            _ => {
                if !self.working_dir.exists() {
                    std::fs::create_dir_all(&self.working_dir)?;
                }
                let mut cmd = Command::new(program);
                cmd.args(args)
                    .current_dir(&self.working_dir)
                    .env_clear()
                    .envs(compose_env(std::env::vars(), &self.env));
                cmd
            }
        };

        let (stdout, stderr) = self.open_sink()?;
        cmd.stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);
        Ok(cmd)
    }

    /// Spawn the process. Returns once the child exists.
    pub fn start(&self) -> Result<()> {
        let mut pid_slot = self.pid.lock().unwrap_or_else(PoisonError::into_inner);
        if pid_slot.is_some() {
            return Err(WorkerError::Internal(format!(
                "{}: command already started",
                self.name
            )));
        }

        tracing::debug!(mirror = %self.name, argv = ?self.argv, isolation = ?self.isolation, "Starting command");
        let mut child = self.command()?.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| WorkerError::Internal("spawned child has no pid".to_string()))?
            as i32;

        if let Isolation::Cgroup(cgroup) = &self.isolation {
            if let Err(e) = cgroup.attach(pid) {
                tracing::error!(mirror = %self.name, pid, error = %e, "Failed to attach process to cgroup");
                let _ = signal_group(pid, Signal::SIGKILL);
                return Err(e);
            }
        }
        *pid_slot = Some(pid);

        let exit_tx = self.exit_tx.clone();
        let container = match &self.isolation {
            Isolation::Docker(docker) => Some(docker.container_name().to_string()),
            _ => None,
        };
        tokio::spawn(async move {
            let outcome = child.wait().await.map_err(|e| e.to_string());
            if let Some(container) = container {
                // --rm covers clean exits; killed clients can leave the container behind
                let _ = Command::new("docker")
                    .args(["rm", "-f", &container])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
            }
            exit_tx.send_replace(Some(outcome));
        });

        Ok(())
    }

    /// Wait for the process to exit. A non-zero exit is an error.
    pub async fn wait(&self) -> Result<()> {
        if self.pid().is_none() {
            return Err(WorkerError::ProcessNotStarted);
        }
        let mut rx = self.exit_tx.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| WorkerError::Internal("reaper task vanished".to_string()))?
            .clone();
        match outcome {
            Some(Ok(status)) if status.success() => Ok(()),
            Some(Ok(status)) => Err(WorkerError::ExitStatus(status)),
            Some(Err(e)) => Err(WorkerError::Internal(e)),
            None => Err(WorkerError::Internal("exit status missing".to_string())),
        }
    }

    async fn wait_exit_for(&self, limit: Duration) -> bool {
        let mut rx = self.exit_tx.subscribe();
        let exited = matches!(
            tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await,
            Ok(Ok(_))
        );
        exited
    }

    async fn wait_exit(&self) {
        let mut rx = self.exit_tx.subscribe();
        let _ = rx.wait_for(Option::is_some).await;
    }

    /// Stop the process: SIGTERM, then SIGKILL after [`TERMINATE_GRACE`].
    pub async fn terminate(&self) -> Result<Termination> {
        let pid = self.pid().ok_or(WorkerError::ProcessNotStarted)?;
        if self.has_exited() {
            return Ok(Termination::Graceful);
        }

        if let Isolation::Docker(docker) = &self.isolation {
            let name = docker.container_name();
            let _ = Command::new("docker")
                .args(["stop", "-t", "2", name])
                .output()
                .await;
            if self.wait_exit_for(TERMINATE_GRACE).await {
                return Ok(Termination::Graceful);
            }
            tracing::warn!(mirror = %self.name, container = name, "docker stop timed out, killing container");
            let _ = Command::new("docker").args(["kill", name]).output().await;
            if !self.wait_exit_for(TERMINATE_GRACE).await {
                // the docker client is ours even if the container is stuck
                signal_group(pid, Signal::SIGKILL)?;
                self.wait_exit().await;
            }
            return Ok(Termination::Killed);
        }

        signal_group(pid, Signal::SIGTERM)?;
        if self.wait_exit_for(TERMINATE_GRACE).await {
            return Ok(Termination::Graceful);
        }

        tracing::warn!(mirror = %self.name, pid, "SIGTERM failed to kill the job in 2s, SIGKILL sent");
        signal_group(pid, Signal::SIGKILL)?;
        if let Isolation::Cgroup(cgroup) = &self.isolation {
            if let Err(e) = cgroup.kill_all().await {
                tracing::error!(mirror = %self.name, error = %e, "Failed to drain cgroup");
            }
        }
        self.wait_exit().await;
        Ok(Termination::Killed)
    }
}

/// Signal a whole process group; a group that already vanished is fine.
fn signal_group(pid: i32, signal: Signal) -> Result<()> {
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
