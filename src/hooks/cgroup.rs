//! cgroup isolation for provider processes.
//!
//! Every job gets its own subgroup below a common base group. On cgroup v1
//! one subgroup is created per controller in use; on v2 a single subgroup
//! lives in the unified hierarchy.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::CgroupConfig;
use crate::error::{Result, WorkerError};
use crate::hooks::JobHook;
use crate::provider::MirrorProvider;

/// Group the worker moves itself into when no base group is configured.
pub const WORKER_GROUP: &str = "__worker";

/// Pause after each SIGKILL sweep of a job group.
const KILL_BACKOFF: [Duration; 4] = [
    Duration::from_millis(10),
    Duration::from_millis(1010),
    Duration::from_millis(2010),
    Duration::from_millis(3010),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

/// Parent of all job subgroups.
#[derive(Debug)]
pub struct CgroupBase {
    version: CgroupVersion,
    root: PathBuf,
    /// Path of the base group relative to the hierarchy root
    group: PathBuf,
    subsystem: String,
}

impl CgroupBase {
    /// Detect the hierarchy and prepare the base group.
    ///
    /// With no configured group the worker's own cgroup becomes the base:
    /// its processes move into a `__worker` child so job groups can be
    /// created as siblings.
    pub fn init(cfg: &CgroupConfig) -> Result<Arc<Self>> {
        let version = if cfg.base_path.join("cgroup.controllers").exists() {
            CgroupVersion::V2
        } else {
            CgroupVersion::V1
        };

        let group = if cfg.group.is_empty() {
            let proc_cgroup = fs::read_to_string("/proc/self/cgroup")?;
            let own = parse_proc_cgroup(&proc_cgroup, version, &cfg.subsystem).ok_or_else(|| {
                WorkerError::Cgroup("cannot find own cgroup in /proc/self/cgroup".to_string())
            })?;
            PathBuf::from(own.trim_start_matches('/'))
        } else {
            PathBuf::from(cfg.group.trim_start_matches('/'))
        };

        let base = Self {
            version,
            root: cfg.base_path.clone(),
            group,
            subsystem: cfg.subsystem.clone(),
        };

        if cfg.group.is_empty() {
            base.move_into_worker_group()?;
        }
        if version == CgroupVersion::V2 {
            base.enable_controllers();
        }

        tracing::info!(version = ?base.version, group = %base.group.display(), "cgroup base ready");
        Ok(Arc::new(base))
    }

    /// Build a base for an existing group without touching the filesystem.
    pub fn with_layout(
        version: CgroupVersion,
        root: impl Into<PathBuf>,
        group: impl Into<PathBuf>,
        subsystem: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            version,
            root: root.into(),
            group: group.into(),
            subsystem: subsystem.into(),
        })
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    fn controller_dir(&self, controller: &str) -> PathBuf {
        match self.version {
            CgroupVersion::V2 => self.root.join(&self.group),
            CgroupVersion::V1 => self.root.join(controller).join(&self.group),
        }
    }

    fn move_into_worker_group(&self) -> Result<()> {
        let controllers: Vec<&str> = match self.version {
            CgroupVersion::V2 => vec![""],
            CgroupVersion::V1 => vec![self.subsystem.as_str(), "memory"],
        };
        for controller in controllers {
            let own = self.controller_dir(controller);
            let worker = own.join(WORKER_GROUP);
            fs::create_dir_all(&worker)?;
            for pid in read_pids(&own.join("cgroup.procs"))? {
                // kernel threads and exited pids refuse to move
                if let Err(e) = fs::write(worker.join("cgroup.procs"), pid.to_string()) {
                    tracing::debug!(pid, error = %e, "Cannot move pid into worker group");
                }
            }
        }
        Ok(())
    }

    fn enable_controllers(&self) {
        let control = self.controller_dir("").join("cgroup.subtree_control");
        for controller in ["+cpu", "+memory"] {
            if let Err(e) = fs::write(&control, controller) {
                tracing::warn!(controller, error = %e, "Cannot enable cgroup controller");
            }
        }
    }
}

/// Find the worker's own cgroup path in `/proc/self/cgroup` contents.
pub fn parse_proc_cgroup(text: &str, version: CgroupVersion, subsystem: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let mut parts = line.splitn(3, ':');
        let id = parts.next()?;
        let controllers = parts.next()?;
        let path = parts.next()?;
        let matched = match version {
            CgroupVersion::V2 => id == "0" && controllers.is_empty(),
            CgroupVersion::V1 => controllers.split(',').any(|c| c == subsystem),
        };
        matched.then(|| path.to_string())
    })
}

fn read_pids(procs: &Path) -> io::Result<Vec<i32>> {
    match fs::read_to_string(procs) {
        Ok(text) => Ok(text
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Per-job cgroup. Created on `pre_exec`, drained and removed on `post_exec`.
#[derive(Debug)]
pub struct CgroupHook {
    base: Arc<CgroupBase>,
    name: String,
    memory_limit: Option<String>,
}

impl CgroupHook {
    pub fn new(base: Arc<CgroupBase>, mirror_name: &str, memory_limit: Option<String>) -> Self {
        Self {
            base,
            name: mirror_name.to_string(),
            memory_limit,
        }
    }

    /// Directories making up this job's group, primary controller first.
    pub fn group_dirs(&self) -> Vec<PathBuf> {
        match self.base.version {
            CgroupVersion::V2 => vec![self.base.controller_dir("").join(&self.name)],
            CgroupVersion::V1 => {
                let mut dirs = vec![self
                    .base
                    .controller_dir(&self.base.subsystem)
                    .join(&self.name)];
                if self.memory_limit.is_some() && self.base.subsystem != "memory" {
                    dirs.push(self.base.controller_dir("memory").join(&self.name));
                }
                dirs
            }
        }
    }

    fn memory_limit_file(&self) -> PathBuf {
        match self.base.version {
            CgroupVersion::V2 => self.group_dirs()[0].join("memory.max"),
            CgroupVersion::V1 => self
                .base
                .controller_dir("memory")
                .join(&self.name)
                .join("memory.limit_in_bytes"),
        }
    }

    /// Place a freshly spawned process into the job group.
    pub fn attach(&self, pid: i32) -> Result<()> {
        for dir in self.group_dirs() {
            fs::write(dir.join("cgroup.procs"), pid.to_string()).map_err(|e| {
                WorkerError::Cgroup(format!("add {} to {}: {}", pid, dir.display(), e))
            })?;
        }
        Ok(())
    }

    pub fn pids(&self) -> Result<Vec<i32>> {
        Ok(read_pids(&self.group_dirs()[0].join("cgroup.procs"))?)
    }

    /// SIGKILL everything left in the group, sweeping until it is empty.
    pub async fn kill_all(&self) -> Result<()> {
        for backoff in KILL_BACKOFF {
            let pids = self.pids()?;
            if pids.is_empty() {
                return Ok(());
            }
            for pid in pids {
                match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => tracing::warn!(mirror = %self.name, pid, error = %e, "Cannot kill task"),
                }
            }
            tokio::time::sleep(backoff).await;
        }
        let left = self.pids()?;
        if left.is_empty() {
            Ok(())
        } else {
            Err(WorkerError::Cgroup(format!(
                "{} tasks still alive in group {}",
                left.len(),
                self.name
            )))
        }
    }
}

#[async_trait]
impl JobHook for CgroupHook {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    async fn pre_exec(&self, _provider: &dyn MirrorProvider) -> Result<()> {
        for dir in self.group_dirs() {
            fs::create_dir_all(&dir)
                .map_err(|e| WorkerError::Cgroup(format!("create {}: {}", dir.display(), e)))?;
        }
        if let Some(limit) = &self.memory_limit {
            let file = self.memory_limit_file();
            fs::write(&file, limit)
                .map_err(|e| WorkerError::Cgroup(format!("set {}: {}", file.display(), e)))?;
        }
        Ok(())
    }

    async fn post_exec(&self, _provider: &dyn MirrorProvider) -> Result<()> {
        if let Err(e) = self.kill_all().await {
            tracing::error!(mirror = %self.name, error = %e, "Error killing tasks");
        }
        for dir in self.group_dirs() {
            match fs::remove_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(WorkerError::Cgroup(format!(
                        "remove {}: {}",
                        dir.display(),
                        e
                    )))
                }
            }
        }
        Ok(())
    }
}
