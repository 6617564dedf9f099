//! Worker supervisor: owns the mirror jobs, routes their status to the
//! manager, and drives the schedule.

pub mod manager;
pub mod server;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::signal::unix::Signal;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{diff_mirror_config, MirrorDiffOp, WorkerConfig};
use crate::error::{Result, WorkerError};
use crate::hooks::cgroup::CgroupBase;
use crate::provider::build_provider;
use crate::scheduler::{JobCtrl, JobMessage, JobRuntime, JobState, Limiter, MirrorJob, ScheduleQueue};
use crate::shutdown::reload_signal;
use crate::status::{MirrorSchedule, MirrorSchedules, MirrorStatus, SyncStatus, WorkerStatus};

pub use manager::ManagerClient;
pub use server::{router, run_server, CmdVerb, Intent, ServerState, WorkerCmd};

const MANAGER_CHANNEL_DEPTH: usize = 32;
const INTENT_CHANNEL_DEPTH: usize = 32;
const SCHEDULE_TICK: Duration = Duration::from_secs(5);
const UNKNOWN_SIZE: &str = "unknown";

/// Receiving ends consumed by [`Worker::run`].
pub struct WorkerChannels {
    pub manager_rx: mpsc::Receiver<JobMessage>,
    pub intent_rx: mpsc::Receiver<Intent>,
}

struct Shared {
    cfg: WorkerConfig,
    jobs: HashMap<String, Arc<MirrorJob>>,
}

/// Handle to the supervisor. Clones share the same jobs and schedule.
#[derive(Clone)]
pub struct Worker {
    name: String,
    shared: Arc<RwLock<Shared>>,
    config_path: Option<PathBuf>,
    schedule: Arc<ScheduleQueue<Arc<MirrorJob>>>,
    runtime: JobRuntime,
    manager: Arc<ManagerClient>,
    cgroup_base: Option<Arc<CgroupBase>>,
    intent_tx: mpsc::Sender<Intent>,
    exit: CancellationToken,
    halted: Arc<AtomicBool>,
    tick: Duration,
}

fn due_after(interval: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

async fn next_hangup(sighup: &mut Option<Signal>) -> Option<()> {
    match sighup {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}

impl Worker {
    /// Build every configured mirror. Any mirror that cannot be built is a
    /// fatal error here, unlike during reload.
    pub fn new(cfg: WorkerConfig, config_path: Option<PathBuf>) -> Result<(Self, WorkerChannels)> {
        cfg.validate()?;
        let cgroup_base = if cfg.cgroup.enable {
            Some(CgroupBase::init(&cfg.cgroup)?)
        } else {
            None
        };

        let mut jobs = HashMap::new();
        for mirror in &cfg.mirrors {
            let provider = build_provider(mirror, &cfg, cgroup_base.as_ref())?;
            jobs.insert(mirror.name.clone(), MirrorJob::new(provider));
        }

        let (manager_tx, manager_rx) = mpsc::channel(MANAGER_CHANNEL_DEPTH);
        let (intent_tx, intent_rx) = mpsc::channel(INTENT_CHANNEL_DEPTH);
        let manager = ManagerClient::new(&cfg.manager, cfg.global.name.clone())?;

        let worker = Self {
            name: cfg.global.name.clone(),
            runtime: JobRuntime {
                manager_tx,
                limiter: Limiter::new(cfg.global.concurrent),
            },
            shared: Arc::new(RwLock::new(Shared { cfg, jobs })),
            config_path,
            schedule: Arc::new(ScheduleQueue::new()),
            manager: Arc::new(manager),
            cgroup_base,
            intent_tx,
            exit: CancellationToken::new(),
            halted: Arc::new(AtomicBool::new(false)),
            tick: SCHEDULE_TICK,
        };
        Ok((
            worker,
            WorkerChannels {
                manager_rx,
                intent_rx,
            },
        ))
    }

    /// Check the schedule every `tick` instead of every five seconds.
    pub fn with_schedule_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Override how often registration is attempted before giving up.
    pub fn with_register_retry(mut self, attempts: u32, delay: Duration) -> Self {
        let manager = (*self.manager).clone().with_register_retry(attempts, delay);
        self.manager = Arc::new(manager);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn config(&self) -> WorkerConfig {
        self.shared.read().await.cfg.clone()
    }

    pub async fn job(&self, name: &str) -> Option<Arc<MirrorJob>> {
        self.shared.read().await.jobs.get(name).cloned()
    }

    /// All jobs, sorted by name.
    pub async fn jobs(&self) -> Vec<Arc<MirrorJob>> {
        let mut jobs: Vec<Arc<MirrorJob>> = self.shared.read().await.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name().cmp(b.name()));
        jobs
    }

    pub fn schedule(&self) -> &ScheduleQueue<Arc<MirrorJob>> {
        &self.schedule
    }

    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.runtime.limiter
    }

    pub fn server_state(&self) -> ServerState {
        ServerState {
            intents: self.intent_tx.clone(),
        }
    }

    /// Replace the mirror list. Resolves once the supervisor applied it.
    pub async fn reload(&self, cfg: WorkerConfig) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.intent_tx
            .send(Intent::Reload {
                config: Box::new(cfg),
                reply,
            })
            .await
            .map_err(|_| WorkerError::Internal("worker is not running".to_string()))?;
        done.await
            .map_err(|_| WorkerError::Internal("worker stopped during reload".to_string()))?
    }

    /// Stop every job and end [`Worker::run`]. Later calls return at once.
    pub async fn halt(&self) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(worker = %self.name, "Stopping all the jobs");

        let mut pending = Vec::new();
        for job in self.jobs().await {
            if job.state() == JobState::Disabled {
                continue;
            }
            let done = job.disabled();
            if job.send(JobCtrl::Halt).await.is_ok() {
                pending.push(done);
            }
        }
        for done in pending {
            done.cancelled().await;
        }

        tracing::info!(worker = %self.name, "All the jobs are stopped");
        self.exit.cancel();
    }

    /// Register, seed the schedule, then serve job status, schedule ticks,
    /// manager commands and reloads until [`Worker::halt`] completes.
    ///
    /// # Errors
    ///
    /// Fails only when registration is refused by every API base and
    /// `manager.fail_if_unreachable` is set.
    pub async fn run(&self, channels: WorkerChannels) -> Result<()> {
        let WorkerChannels {
            mut manager_rx,
            mut intent_rx,
        } = channels;

        self.register().await?;
        self.init_jobs().await;

        let mut sighup = match reload_signal() {
            Ok(signal) => Some(signal),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGHUP, reload by signal disabled");
                None
            }
        };
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sizes: HashMap<String, String> = HashMap::new();
        let mut posted: Vec<(String, DateTime<Utc>)> = Vec::new();

        loop {
            tokio::select! {
                Some(msg) = manager_rx.recv() => self.handle_message(msg, &mut sizes).await,
                _ = tick.tick() => self.run_due().await,
                Some(intent) = intent_rx.recv() => self.handle_intent(intent).await,
                Some(()) = next_hangup(&mut sighup) => self.reload_from_file().await,
                _ = self.exit.cancelled() => {
                    self.flush(&mut manager_rx, &mut sizes).await;
                    for job in self.jobs().await {
                        if job.state() == JobState::Halting {
                            job.set_state(JobState::Disabled);
                        }
                    }
                    tracing::info!(worker = %self.name, "Worker stopped");
                    return Ok(());
                }
            }
            self.post_schedules(&mut posted).await;
        }
    }

    async fn register(&self) -> Result<()> {
        let (url, token, fail_if_unreachable) = {
            let shared = self.shared.read().await;
            (
                shared.cfg.server.url(),
                shared.cfg.manager.token.clone(),
                shared.cfg.manager.fail_if_unreachable,
            )
        };
        let status = WorkerStatus {
            id: self.name.clone(),
            url,
            token,
        };
        match self.manager.register(&status).await {
            Ok(()) => Ok(()),
            Err(e) if fail_if_unreachable => {
                tracing::error!(worker = %self.name, error = %e, "Manager unreachable");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(worker = %self.name, error = %e, "Failed to register worker, continuing");
                Ok(())
            }
        }
    }

    /// Start every job task, resuming from the last state the manager
    /// recorded for it.
    async fn init_jobs(&self) {
        let known = match self.manager.fetch_jobs().await {
            Ok(known) => known,
            Err(e) => {
                tracing::warn!(worker = %self.name, error = %e, "Failed to fetch job status");
                Vec::new()
            }
        };

        for job in self.jobs().await {
            let last = known
                .iter()
                .find(|s| s.name == job.name() && (s.worker.is_empty() || s.worker == self.name));
            match last.map(|s| s.status) {
                Some(SyncStatus::Disabled) => {
                    job.set_state(JobState::Disabled);
                }
                Some(SyncStatus::Paused) => {
                    job.set_state(JobState::Paused);
                    job.spawn(self.runtime.clone());
                }
                _ => {
                    job.set_state(JobState::None);
                    job.spawn(self.runtime.clone());
                    let at = match last {
                        Some(s) => {
                            let interval = chrono::Duration::from_std(job.provider().interval())
                                .unwrap_or_else(|_| chrono::Duration::zero());
                            s.last_ended() + interval
                        }
                        None => Utc::now(),
                    };
                    self.schedule_job(&job, at);
                }
            }
            tracing::debug!(mirror = job.name(), state = %job.state(), "Job initialised");
        }
    }

    fn schedule_job(&self, job: &Arc<MirrorJob>, at: DateTime<Utc>) {
        self.schedule.add_job(at, job.name(), job.clone());
        job.set_next_schedule(self.schedule.next_for(job.name()));
        tracing::debug!(mirror = job.name(), at = %at, "Job scheduled");
    }

    fn unschedule_job(&self, job: &MirrorJob) {
        self.schedule.remove(job.name());
        job.set_next_schedule(None);
    }

    async fn handle_message(&self, msg: JobMessage, sizes: &mut HashMap<String, String>) {
        let Some(job) = self.job(&msg.name).await else {
            tracing::warn!(mirror = %msg.name, "Status from unknown job");
            return;
        };
        let state = job.state();
        if !state.is_active() && state != JobState::Halting {
            tracing::info!(mirror = %msg.name, state = %state, status = %msg.status, "Job is not active, status dropped");
            return;
        }

        self.report(&job, &msg, sizes).await;

        if msg.schedule {
            let at = due_after(job.provider().interval());
            tracing::info!(mirror = %msg.name, at = %at, "Next sync scheduled");
            self.schedule_job(&job, at);
        }
    }

    async fn report(&self, job: &MirrorJob, msg: &JobMessage, sizes: &mut HashMap<String, String>) {
        let provider = job.provider();
        if msg.status == SyncStatus::Success {
            if let Some(size) = provider.data_size() {
                sizes.insert(msg.name.clone(), size);
            }
        }
        let now = Utc::now();
        let finished = matches!(msg.status, SyncStatus::Success | SyncStatus::Failed);
        let status = MirrorStatus {
            name: msg.name.clone(),
            worker: self.name.clone(),
            is_master: provider.is_master(),
            status: msg.status,
            last_update: now,
            last_ended: finished.then_some(now),
            upstream: provider.upstream().to_string(),
            size: sizes
                .get(&msg.name)
                .cloned()
                .unwrap_or_else(|| UNKNOWN_SIZE.to_string()),
            error_msg: msg.msg.clone(),
        };
        if let Err(e) = self.manager.update_status(&status).await {
            tracing::warn!(mirror = %msg.name, status = %msg.status, error = %e, "Failed to update mirror status");
        }
    }

    /// Start every job whose scheduled time has passed.
    async fn run_due(&self) {
        while let Some((name, job)) = self.schedule.pop() {
            job.set_next_schedule(self.schedule.next_for(&name));
            if job.state() == JobState::Disabled {
                continue;
            }
            tracing::debug!(mirror = %name, "Scheduled run is due");
            if let Err(e) = job.send(JobCtrl::Start).await {
                tracing::warn!(mirror = %name, error = %e, "Failed to start scheduled job");
            }
        }
    }

    async fn post_schedules(&self, posted: &mut Vec<(String, DateTime<Utc>)>) {
        let current = self.schedule.schedules();
        if current == *posted {
            return;
        }
        let body = MirrorSchedules {
            schedules: current
                .iter()
                .map(|(name, at)| MirrorSchedule {
                    mirror_name: name.clone(),
                    next_schedule: *at,
                })
                .collect(),
        };
        if let Err(e) = self.manager.update_schedules(&body).await {
            tracing::warn!(worker = %self.name, error = %e, "Failed to post schedules");
        }
        *posted = current;
    }

    /// Forward the final outcomes still buffered after every job stopped.
    async fn flush(&self, manager_rx: &mut mpsc::Receiver<JobMessage>, sizes: &mut HashMap<String, String>) {
        while let Ok(msg) = manager_rx.try_recv() {
            if !matches!(msg.status, SyncStatus::Success | SyncStatus::Failed) {
                continue;
            }
            if let Some(job) = self.job(&msg.name).await {
                self.report(&job, &msg, sizes).await;
            }
        }
    }

    async fn handle_intent(&self, intent: Intent) {
        match intent {
            Intent::Command {
                cmd,
                mirror,
                force,
                reply,
            } => {
                let res = self.handle_command(cmd, &mirror, force).await;
                if let Err(e) = &res {
                    tracing::warn!(mirror = %mirror, cmd = ?cmd, error = %e, "Command failed");
                }
                let _ = reply.send(res);
            }
            Intent::Reload { config, reply } => {
                let _ = reply.send(self.apply_reload(*config).await);
            }
        }
    }

    async fn handle_command(&self, cmd: CmdVerb, mirror: &str, force: bool) -> Result<()> {
        let job = self
            .job(mirror)
            .await
            .ok_or_else(|| WorkerError::JobNotFound(mirror.to_string()))?;

        // any command but ping overrides the pending schedule
        if cmd != CmdVerb::Ping {
            self.unschedule_job(&job);
        }

        if job.state() == JobState::Disabled && matches!(cmd, CmdVerb::Start | CmdVerb::Restart) {
            job.set_state(JobState::None);
            job.spawn(self.runtime.clone());
        }

        match cmd {
            CmdVerb::Start if force => job.send(JobCtrl::ForceStart).await,
            CmdVerb::Start => job.send(JobCtrl::Start).await,
            CmdVerb::Restart => job.send(JobCtrl::Restart).await,
            CmdVerb::Stop | CmdVerb::Ping if job.state() == JobState::Disabled => Ok(()),
            CmdVerb::Stop => job.send(JobCtrl::Stop).await,
            CmdVerb::Ping => job.send(JobCtrl::Ping).await,
            CmdVerb::Disable => {
                self.disable_job(&job).await;
                Ok(())
            }
            CmdVerb::Reload => Err(WorkerError::Internal(
                "reload is not a mirror command".to_string(),
            )),
        }
    }

    /// Stop the job's task and wait for it to exit.
    async fn disable_job(&self, job: &Arc<MirrorJob>) {
        self.unschedule_job(job);
        if job.state() == JobState::Disabled {
            return;
        }
        let done = job.disabled();
        if job.send(JobCtrl::Disable).await.is_ok() {
            done.cancelled().await;
        }
        job.set_state(JobState::Disabled);
        tracing::info!(mirror = job.name(), "Job disabled");
    }

    async fn reload_from_file(&self) {
        let Some(path) = &self.config_path else {
            tracing::warn!("Received SIGHUP but no config file to reload");
            return;
        };
        tracing::info!(path = %path.display(), "Reloading config");
        match WorkerConfig::load(path) {
            Ok(cfg) => {
                if let Err(e) = self.apply_reload(cfg).await {
                    tracing::error!(error = %e, "Failed to apply reloaded config");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to reload config, keeping the old one"),
        }
    }

    /// Apply the mirror list of `new`: deletions, then modifications, then
    /// additions. A mirror whose provider cannot be built is refused and the
    /// others still apply. Settings outside `[[mirrors]]` are not reloaded.
    async fn apply_reload(&self, new: WorkerConfig) -> Result<()> {
        new.validate()?;
        let old = self.config().await;
        let diffs = diff_mirror_config(&old.mirrors, &new.mirrors);
        if diffs.is_empty() {
            tracing::info!("Mirror config unchanged");
            return Ok(());
        }

        let mut cfg = old.clone();
        cfg.mirrors = new.mirrors;

        for diff in diffs.iter().filter(|d| d.op == MirrorDiffOp::Delete) {
            let removed = self.shared.write().await.jobs.remove(&diff.config.name);
            if let Some(job) = removed {
                self.disable_job(&job).await;
                tracing::info!(mirror = %diff.config.name, "Mirror removed");
            }
        }

        for diff in diffs.iter().filter(|d| d.op == MirrorDiffOp::Modify) {
            let name = &diff.config.name;
            let Some(job) = self.job(name).await else {
                continue;
            };
            let provider = match build_provider(&diff.config, &cfg, self.cgroup_base.as_ref()) {
                Ok(provider) => provider,
                Err(e) => {
                    tracing::error!(mirror = %name, error = %e, "Modified mirror refused");
                    if let (Some(slot), Some(previous)) = (
                        cfg.mirrors.iter_mut().find(|m| &m.name == name),
                        old.mirror(name),
                    ) {
                        *slot = previous.clone();
                    }
                    continue;
                }
            };

            let previous = job.state();
            self.disable_job(&job).await;
            if let Err(e) = job.set_provider(provider) {
                tracing::error!(mirror = %name, error = %e, "Failed to switch provider");
                continue;
            }
            match previous {
                JobState::Disabled => {}
                JobState::Paused => {
                    job.set_state(JobState::Paused);
                    job.spawn(self.runtime.clone());
                }
                _ => {
                    job.set_state(JobState::None);
                    job.spawn(self.runtime.clone());
                    self.schedule_job(&job, Utc::now());
                }
            }
            tracing::info!(mirror = %name, previous = %previous, "Mirror reloaded");
        }

        for diff in diffs.iter().filter(|d| d.op == MirrorDiffOp::Add) {
            let name = &diff.config.name;
            let provider = match build_provider(&diff.config, &cfg, self.cgroup_base.as_ref()) {
                Ok(provider) => provider,
                Err(e) => {
                    tracing::error!(mirror = %name, error = %e, "New mirror refused");
                    cfg.mirrors.retain(|m| &m.name != name);
                    continue;
                }
            };
            let job = MirrorJob::new(provider);
            self.shared.write().await.jobs.insert(name.clone(), job.clone());
            job.spawn(self.runtime.clone());
            self.schedule_job(&job, Utc::now());
            tracing::info!(mirror = %name, "Mirror added");
        }

        self.shared.write().await.cfg = cfg;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_after_adds_interval() {
        let before = Utc::now();
        let at = due_after(Duration::from_secs(60));
        assert!(at >= before + chrono::Duration::seconds(60));
        assert!(at <= Utc::now() + chrono::Duration::seconds(60));
        assert_eq!(due_after(Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn unknown_mirror_command_is_not_found() {
        let (worker, _channels) = Worker::new(WorkerConfig::default(), None).unwrap();
        let err = worker
            .handle_command(CmdVerb::Start, "nope", false)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::JobNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn halt_without_jobs_cancels_exit() {
        let (worker, _channels) = Worker::new(WorkerConfig::default(), None).unwrap();
        worker.halt().await;
        assert!(worker.exit.is_cancelled());
        worker.halt().await;
    }
}
