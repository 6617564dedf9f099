use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkerError};

pub mod diff;

pub use diff::{diff_mirror_config, MirrorConfigDiff, MirrorDiffOp};

/// Placeholder substituted with the mirror name in log directory templates.
pub const NAME_PLACEHOLDER: &str = "{name}";

/// Sync strategy of a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    #[default]
    Command,
    Rsync,
    TwoStageRsync,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Command => write!(f, "command"),
            ProviderKind::Rsync => write!(f, "rsync"),
            ProviderKind::TwoStageRsync => write!(f, "two-stage-rsync"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorRole {
    #[default]
    Master,
    Slave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Worker identity reported to the manager
    pub name: String,
    /// Log directory template, `{name}` is replaced by the mirror name
    pub log_dir: String,
    /// Root under which mirror working directories live
    pub mirror_dir: PathBuf,
    /// Maximum number of simultaneously syncing jobs
    pub concurrent: usize,
    /// Default interval between runs, in minutes
    pub interval: u64,
    /// Default attempts per run
    pub retry: u32,
    /// Default wall-clock cap per attempt, in seconds (0 = none)
    pub timeout: u64,
    pub exec_on_success: Vec<String>,
    pub exec_on_failure: Vec<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            log_dir: "/var/log/tunasync/{name}".to_string(),
            mirror_dir: PathBuf::from("/srv/mirrors"),
            concurrent: 10,
            interval: 120,
            retry: 3,
            timeout: 0,
            exec_on_success: Vec::new(),
            exec_on_failure: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub api_base: String,
    pub api_base_list: Vec<String>,
    pub token: Option<String>,
    /// PEM bundle trusted in addition to the system roots
    pub ca_cert: Option<PathBuf>,
    /// Exit non-zero when registration fails against every API base
    pub fail_if_unreachable: bool,
}

impl ManagerConfig {
    /// All configured API bases, `api_base_list` taking precedence.
    pub fn api_bases(&self) -> Vec<String> {
        if !self.api_base_list.is_empty() {
            return self
                .api_base_list
                .iter()
                .map(|b| b.trim_end_matches('/').to_string())
                .collect();
        }
        if self.api_base.is_empty() {
            Vec::new()
        } else {
            vec![self.api_base.trim_end_matches('/').to_string()]
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name the manager uses to reach this worker
    pub hostname: String,
    pub listen_addr: IpAddr,
    pub listen_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 6000,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    /// URL registered with the manager.
    pub fn url(&self) -> String {
        format!("http://{}:{}/", self.hostname, self.listen_port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    pub enable: bool,
    pub base_path: PathBuf,
    /// Parent group for job subgroups. Empty means a `__worker` group is
    /// carved out of the worker's own cgroup.
    pub group: String,
    /// Controller used on cgroup v1 hierarchies
    pub subsystem: String,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            enable: false,
            base_path: PathBuf::from("/sys/fs/cgroup"),
            group: String::new(),
            subsystem: "cpu".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub enable: bool,
    pub volumes: Vec<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZfsConfig {
    pub enable: bool,
    pub zpool: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BtrfsSnapshotConfig {
    pub enable: bool,
    pub snapshot_path: PathBuf,
}

/// One `[[mirrors]]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub name: String,
    pub provider: ProviderKind,
    pub upstream: String,
    /// Minutes between runs
    pub interval: Option<u64>,
    pub retry: Option<u32>,
    /// Seconds per attempt
    pub timeout: Option<u64>,
    pub mirror_dir: Option<PathBuf>,
    pub mirror_subdir: Option<String>,
    pub log_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub role: MirrorRole,

    pub command: String,
    pub fail_on_match: Option<String>,
    pub size_pattern: Option<String>,

    pub use_ipv6: bool,
    pub use_ipv4: bool,
    pub exclude_file: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub rsync_options: Vec<String>,
    pub rsync_override: Option<Vec<String>>,
    pub stage1_profile: Option<String>,

    pub memory_limit: Option<String>,
    pub docker_image: Option<String>,
    pub docker_volumes: Vec<String>,
    pub docker_options: Vec<String>,
    pub snapshot_path: Option<PathBuf>,

    pub exec_on_success: Option<Vec<String>>,
    pub exec_on_failure: Option<Vec<String>>,
    pub exec_on_success_extra: Vec<String>,
    pub exec_on_failure_extra: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub global: GlobalConfig,
    pub manager: ManagerConfig,
    pub server: ServerConfig,
    pub cgroup: CgroupConfig,
    pub docker: DockerConfig,
    pub zfs: ZfsConfig,
    pub btrfs_snapshot: BtrfsSnapshotConfig,
    pub mirrors: Vec<MirrorConfig>,
}

impl WorkerConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            WorkerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let cfg: WorkerConfig = toml::from_str(&text).map_err(|source| WorkerError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.global.concurrent == 0 {
            return Err(WorkerError::Config(
                "global.concurrent must be at least 1".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for mirror in &self.mirrors {
            if mirror.name.is_empty() {
                return Err(WorkerError::Config("mirror without a name".to_string()));
            }
            if !seen.insert(mirror.name.as_str()) {
                return Err(WorkerError::Config(format!(
                    "duplicate mirror name: {}",
                    mirror.name
                )));
            }
            match self.interval_minutes(mirror).checked_mul(60) {
                Some(0) => {
                    return Err(WorkerError::Config(format!(
                        "mirror {}: interval must be positive",
                        mirror.name
                    )))
                }
                None => {
                    return Err(WorkerError::Config(format!(
                        "mirror {}: interval is too large",
                        mirror.name
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn mirror(&self, name: &str) -> Option<&MirrorConfig> {
        self.mirrors.iter().find(|m| m.name == name)
    }

    pub fn working_dir(&self, mirror: &MirrorConfig) -> PathBuf {
        if let Some(dir) = &mirror.mirror_dir {
            return dir.clone();
        }
        let subdir = mirror.mirror_subdir.as_deref().unwrap_or(&mirror.name);
        self.global.mirror_dir.join(subdir)
    }

    pub fn log_dir(&self, mirror: &MirrorConfig) -> PathBuf {
        let template = mirror.log_dir.as_deref().unwrap_or(&self.global.log_dir);
        PathBuf::from(template.replace(NAME_PLACEHOLDER, &mirror.name))
    }

    fn interval_minutes(&self, mirror: &MirrorConfig) -> u64 {
        mirror.interval.unwrap_or(self.global.interval)
    }

    pub fn interval(&self, mirror: &MirrorConfig) -> Duration {
        Duration::from_secs(self.interval_minutes(mirror).saturating_mul(60))
    }

    pub fn retry(&self, mirror: &MirrorConfig) -> u32 {
        mirror.retry.unwrap_or(self.global.retry).max(1)
    }

    /// `Duration::ZERO` means no cap.
    pub fn timeout(&self, mirror: &MirrorConfig) -> Duration {
        Duration::from_secs(mirror.timeout.unwrap_or(self.global.timeout))
    }

    pub fn exec_on_success(&self, mirror: &MirrorConfig) -> Vec<String> {
        let mut cmds = mirror
            .exec_on_success
            .clone()
            .unwrap_or_else(|| self.global.exec_on_success.clone());
        cmds.extend(mirror.exec_on_success_extra.iter().cloned());
        cmds
    }

    pub fn exec_on_failure(&self, mirror: &MirrorConfig) -> Vec<String> {
        let mut cmds = mirror
            .exec_on_failure
            .clone()
            .unwrap_or_else(|| self.global.exec_on_failure.clone());
        cmds.extend(mirror.exec_on_failure_extra.iter().cloned());
        cmds
    }
}
