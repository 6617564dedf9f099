//! Sync providers: one strategy per sync method, all sharing [`ProviderBase`]
//! for paths, hooks, context and process control.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::oneshot;

use crate::config::{MirrorConfig, MirrorRole, ProviderKind, WorkerConfig};
use crate::error::{Result, WorkerError};
use crate::hooks::{
    BtrfsSnapshotHook, CgroupBase, CgroupHook, DockerHook, ExecOn, ExecPostHook, JobHook,
    LogLimiter, ZfsHook,
};

pub mod command;
pub mod context;
pub mod rsync;
pub mod runner;
pub mod two_stage_rsync;

pub use command::CommandProvider;
pub use context::{Context, ContextValue, Frame};
pub use rsync::RsyncProvider;
pub use runner::{CmdJob, Isolation, LogSink, Termination};
pub use two_stage_rsync::TwoStageRsyncProvider;

use context::{docker_key, LOG_DIR_KEY, LOG_FILE_KEY, VOLUMES_KEY, WORKING_DIR_KEY};

const NULL_LOG: &str = "/dev/null";

/// Settings every provider starts from.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub upstream_url: String,
    pub working_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_file: PathBuf,
    pub interval: Duration,
    pub retry: u32,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
    pub is_master: bool,
}

impl ProviderConfig {
    pub fn from_mirror(mirror: &MirrorConfig, cfg: &WorkerConfig) -> Self {
        let log_dir = cfg.log_dir(mirror);
        Self {
            name: mirror.name.clone(),
            upstream_url: mirror.upstream.clone(),
            working_dir: cfg.working_dir(mirror),
            log_file: log_dir.join("latest.log"),
            log_dir,
            interval: cfg.interval(mirror),
            retry: cfg.retry(mirror),
            timeout: cfg.timeout(mirror),
            env: mirror.env.clone(),
            is_master: mirror.role == MirrorRole::Master,
        }
    }
}

/// State shared by all provider kinds.
pub struct ProviderBase {
    config: ProviderConfig,
    ctx: Mutex<Context>,
    hooks: RwLock<Vec<Arc<dyn JobHook>>>,
    isolation: RwLock<Isolation>,
    running: Mutex<Option<Arc<CmdJob>>>,
    terminated: AtomicBool,
    data_size: Mutex<Option<String>>,
}

impl ProviderBase {
    pub fn new(config: ProviderConfig) -> Self {
        let mut ctx = Context::new();
        ctx.set(WORKING_DIR_KEY, config.working_dir.display().to_string());
        ctx.set(LOG_DIR_KEY, config.log_dir.display().to_string());
        ctx.set(LOG_FILE_KEY, config.log_file.display().to_string());
        Self {
            config,
            ctx: Mutex::new(ctx),
            hooks: RwLock::new(Vec::new()),
            isolation: RwLock::new(Isolation::None),
            running: Mutex::new(None),
            terminated: AtomicBool::new(false),
            data_size: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn ctx(&self) -> std::sync::MutexGuard<'_, Context> {
        self.ctx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Host-side path stored under `key`. The root frame always holds the
    /// path keys, so a miss is a bug.
    fn ctx_path(&self, key: &str) -> PathBuf {
        match self.ctx().get_str(key) {
            Some(path) => PathBuf::from(path),
            None => panic!("context is missing required key {key}"),
        }
    }

    /// Path as the child process sees it: the `:docker` variant when the
    /// run is containerised and a hook provided one.
    pub fn exec_path(&self, key: &str) -> PathBuf {
        if self.isolation().is_docker() {
            if let Some(path) = self.ctx().get_str(&docker_key(key)) {
                return PathBuf::from(path);
            }
        }
        self.ctx_path(key)
    }

    pub fn working_dir(&self) -> PathBuf {
        self.ctx_path(WORKING_DIR_KEY)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.ctx_path(LOG_DIR_KEY)
    }

    pub fn log_file(&self) -> PathBuf {
        self.ctx_path(LOG_FILE_KEY)
    }

    pub fn enter_context(&self, frame: Frame) {
        let mut ctx = self.ctx();
        ctx.enter().extend(frame);
    }

    pub fn exit_context(&self) -> Result<()> {
        self.ctx().exit()
    }

    pub fn context(&self) -> Context {
        self.ctx().clone()
    }

    pub fn add_hook(&self, hook: Arc<dyn JobHook>) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    pub fn hooks(&self) -> Vec<Arc<dyn JobHook>> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_isolation(&self, isolation: Isolation) {
        *self.isolation.write().unwrap_or_else(PoisonError::into_inner) = isolation;
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn data_size(&self) -> Option<String> {
        self.data_size
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_data_size(&self, size: Option<String>) {
        *self.data_size.lock().unwrap_or_else(PoisonError::into_inner) = size;
    }

    /// Environment seeded into every child, per-mirror env last.
    pub fn run_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("TUNASYNC_MIRROR_NAME".to_string(), self.config.name.clone());
        env.insert(
            "TUNASYNC_WORKING_DIR".to_string(),
            self.exec_path(WORKING_DIR_KEY).display().to_string(),
        );
        env.insert(
            "TUNASYNC_UPSTREAM_URL".to_string(),
            self.config.upstream_url.clone(),
        );
        env.insert(
            "TUNASYNC_LOG_DIR".to_string(),
            self.exec_path(LOG_DIR_KEY).display().to_string(),
        );
        env.insert(
            "TUNASYNC_LOG_FILE".to_string(),
            self.exec_path(LOG_FILE_KEY).display().to_string(),
        );
        env.extend(self.config.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Build a command for this run with the current isolation and mounts.
    pub fn build_cmd(&self, argv: Vec<String>, env: BTreeMap<String, String>) -> CmdJob {
        let volumes = self
            .ctx()
            .get(VOLUMES_KEY)
            .and_then(ContextValue::as_list)
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        CmdJob::new(
            self.config.name.clone(),
            argv,
            self.exec_path(WORKING_DIR_KEY),
            env,
        )
        .with_isolation(self.isolation(), volumes)
    }

    fn log_sink(&self, append: bool) -> LogSink {
        let path = self.log_file();
        if path == Path::new(NULL_LOG) {
            LogSink::Null
        } else {
            LogSink::File { path, append }
        }
    }

    /// Clear the termination flag left by a previous run.
    pub fn begin_run(&self) {
        self.terminated.store(false, Ordering::SeqCst);
        self.set_data_size(None);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Start `cmd`, signal `started`, and wait for it to exit.
    pub async fn run_cmd(
        &self,
        cmd: CmdJob,
        append_log: bool,
        started: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        cmd.set_log_sink(self.log_sink(append_log));
        let cmd = Arc::new(cmd);
        {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_terminated() {
                return Err(WorkerError::Killed);
            }
            cmd.start()?;
            *running = Some(cmd.clone());
        }
        if let Some(started) = started {
            let _ = started.send(());
        }

        let result = cmd.wait().await;
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if result.is_err() && self.is_terminated() {
            return Err(WorkerError::Killed);
        }
        result
    }

    /// Stop the running child, if any, and return once it has exited.
    pub async fn terminate(&self) -> Result<()> {
        self.terminated.store(true, Ordering::SeqCst);
        let cmd = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(cmd) = cmd else {
            return Ok(());
        };
        tracing::debug!(mirror = %self.config.name, "Terminating provider");
        match cmd.terminate().await {
            Ok(Termination::Graceful) => Ok(()),
            Ok(Termination::Killed) => {
                tracing::warn!(mirror = %self.config.name, "Provider needed SIGKILL");
                Ok(())
            }
            Err(WorkerError::ProcessNotStarted) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
pub trait MirrorProvider: Send + Sync {
    fn base(&self) -> &ProviderBase;

    fn kind(&self) -> ProviderKind;

    /// Run one sync attempt. `started` fires once the first child exists.
    async fn run(&self, started: oneshot::Sender<()>) -> Result<()>;

    fn data_size(&self) -> Option<String> {
        self.base().data_size()
    }

    fn name(&self) -> &str {
        &self.base().config().name
    }

    fn upstream(&self) -> &str {
        &self.base().config().upstream_url
    }

    fn interval(&self) -> Duration {
        self.base().config().interval
    }

    fn retry(&self) -> u32 {
        self.base().config().retry
    }

    fn timeout(&self) -> Duration {
        self.base().config().timeout
    }

    fn working_dir(&self) -> PathBuf {
        self.base().working_dir()
    }

    fn log_dir(&self) -> PathBuf {
        self.base().log_dir()
    }

    fn log_file(&self) -> PathBuf {
        self.base().log_file()
    }

    fn is_master(&self) -> bool {
        self.base().config().is_master
    }

    fn is_running(&self) -> bool {
        self.base().is_running()
    }

    async fn terminate(&self) -> Result<()> {
        self.base().terminate().await
    }

    fn add_hook(&self, hook: Arc<dyn JobHook>) {
        self.base().add_hook(hook)
    }

    fn hooks(&self) -> Vec<Arc<dyn JobHook>> {
        self.base().hooks()
    }

    fn enter_context(&self, frame: Frame) {
        self.base().enter_context(frame)
    }

    fn exit_context(&self) -> Result<()> {
        self.base().exit_context()
    }

    fn context(&self) -> Context {
        self.base().context()
    }

    fn set_isolation(&self, isolation: Isolation) {
        self.base().set_isolation(isolation)
    }
}

/// Last first-group match of `re` in the log at `path`.
pub(crate) async fn extract_from_log(path: &Path, re: &Regex) -> Option<String> {
    let content = tokio::fs::read(path).await.ok()?;
    let content = String::from_utf8_lossy(&content);
    re.captures_iter(&content)
        .filter_map(|caps| caps.get(1))
        .last()
        .map(|m| m.as_str().to_string())
}

/// Build the provider for `mirror` with its hook chain attached.
pub fn build_provider(
    mirror: &MirrorConfig,
    cfg: &WorkerConfig,
    cgroup_base: Option<&Arc<CgroupBase>>,
) -> Result<Arc<dyn MirrorProvider>> {
    let pc = ProviderConfig::from_mirror(mirror, cfg);
    let provider: Arc<dyn MirrorProvider> = match mirror.provider {
        ProviderKind::Command => Arc::new(CommandProvider::new(pc, mirror)?),
        ProviderKind::Rsync => Arc::new(RsyncProvider::new(pc, mirror)?),
        ProviderKind::TwoStageRsync => Arc::new(TwoStageRsyncProvider::new(pc, mirror)?),
    };

    provider.add_hook(Arc::new(LogLimiter::new()));

    if cfg.zfs.enable {
        provider.add_hook(Arc::new(ZfsHook::new(cfg.zfs.zpool.clone())));
    }

    if cfg.btrfs_snapshot.enable {
        let dir = mirror
            .snapshot_path
            .clone()
            .unwrap_or_else(|| cfg.btrfs_snapshot.snapshot_path.clone());
        provider.add_hook(Arc::new(BtrfsSnapshotHook::new(&dir, &mirror.name)));
    }

    match (&mirror.docker_image, cgroup_base) {
        (Some(image), _) if cfg.docker.enable => {
            let mut volumes = cfg.docker.volumes.clone();
            volumes.extend(mirror.docker_volumes.iter().cloned());
            let mut options = cfg.docker.options.clone();
            options.extend(mirror.docker_options.iter().cloned());
            let hook = Arc::new(DockerHook::new(
                &mirror.name,
                image.clone(),
                volumes,
                options,
                mirror.memory_limit.clone(),
            ));
            provider.add_hook(hook.clone());
            provider.set_isolation(Isolation::Docker(hook));
        }
        (_, Some(base)) if cfg.cgroup.enable => {
            let hook = Arc::new(CgroupHook::new(
                base.clone(),
                &mirror.name,
                mirror.memory_limit.clone(),
            ));
            provider.add_hook(hook.clone());
            provider.set_isolation(Isolation::Cgroup(hook));
        }
        _ => {}
    }

    for command in cfg.exec_on_success(mirror) {
        provider.add_hook(Arc::new(ExecPostHook::new(ExecOn::Success, command)?));
    }
    for command in cfg.exec_on_failure(mirror) {
        provider.add_hook(Arc::new(ExecPostHook::new(ExecOn::Failure, command)?));
    }

    tracing::debug!(
        mirror = %mirror.name,
        kind = %mirror.provider,
        hooks = ?provider.hooks().iter().map(|h| h.name()).collect::<Vec<_>>(),
        "Built provider"
    );
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_config(dir: &Path) -> WorkerConfig {
        let mut cfg = WorkerConfig::default();
        cfg.global.mirror_dir = dir.join("mirrors");
        cfg.global.log_dir = dir.join("log/{name}").display().to_string();
        cfg
    }

    fn mirror(name: &str) -> MirrorConfig {
        MirrorConfig {
            name: name.to_string(),
            provider: ProviderKind::Command,
            upstream: "https://example.org/".to_string(),
            command: "echo hi".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn paths_and_env_follow_context() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = worker_config(dir.path());
        let mut m = mirror("demo");
        m.env.insert("EXTRA".to_string(), "1".to_string());
        let p = build_provider(&m, &cfg, None).unwrap();

        assert_eq!(p.working_dir(), dir.path().join("mirrors/demo"));
        assert_eq!(p.log_dir(), dir.path().join("log/demo"));
        assert_eq!(p.log_file(), dir.path().join("log/demo/latest.log"));

        let mut frame = Frame::new();
        frame.insert(LOG_FILE_KEY.to_string(), "/tmp/other.log".into());
        p.enter_context(frame);
        assert_eq!(p.log_file(), PathBuf::from("/tmp/other.log"));

        let env = p.base().run_env();
        assert_eq!(env["TUNASYNC_MIRROR_NAME"], "demo");
        assert_eq!(env["TUNASYNC_LOG_FILE"], "/tmp/other.log");
        assert_eq!(env["EXTRA"], "1");

        p.exit_context().unwrap();
        assert!(p.exit_context().is_err());
        assert_eq!(p.context().depth(), 1);
    }

    #[test]
    fn hook_order_without_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = worker_config(dir.path());
        cfg.global.exec_on_success = vec!["true".to_string()];
        let mut m = mirror("demo");
        m.exec_on_failure_extra = vec!["false".to_string()];

        let p = build_provider(&m, &cfg, None).unwrap();
        let names: Vec<_> = p.hooks().iter().map(|h| h.name()).collect();
        assert_eq!(names, ["loglimit", "exec-on-success", "exec-on-failure"]);
        assert!(matches!(p.base().isolation(), Isolation::None));
        assert!(p.is_master());
    }

    #[test]
    fn docker_image_selects_docker_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = worker_config(dir.path());
        cfg.docker.enable = true;
        cfg.zfs.enable = true;
        cfg.zfs.zpool = "tank".to_string();
        let mut m = mirror("demo");
        m.docker_image = Some("alpine:3".to_string());
        m.role = MirrorRole::Slave;

        let p = build_provider(&m, &cfg, None).unwrap();
        let names: Vec<_> = p.hooks().iter().map(|h| h.name()).collect();
        assert_eq!(names, ["loglimit", "zfs", "docker"]);
        assert!(p.base().isolation().is_docker());
        assert!(!p.is_master());
    }

    #[tokio::test]
    async fn terminate_when_idle_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = worker_config(dir.path());
        let p = build_provider(&mirror("demo"), &cfg, None).unwrap();
        assert!(!p.is_running());
        p.terminate().await.unwrap();
    }
}
