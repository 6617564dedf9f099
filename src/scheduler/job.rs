//! Per-mirror job: a long-lived task serving a control channel and driving
//! provider runs through the hook pipeline.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WorkerError};
use crate::hooks::JobHook;
use crate::provider::MirrorProvider;
use crate::scheduler::limiter::Limiter;
use crate::status::SyncStatus;

const CTRL_CHANNEL_DEPTH: usize = 8;
/// Pause before a restarted run so the killed process can be reaped.
const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    None,
    Ready,
    PreSyncing,
    Syncing,
    Paused,
    Halting,
    Disabled,
}

impl JobState {
    /// Scheduled to run or running.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Ready | JobState::PreSyncing | JobState::Syncing
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::None => write!(f, "none"),
            JobState::Ready => write!(f, "ready"),
            JobState::PreSyncing => write!(f, "pre-syncing"),
            JobState::Syncing => write!(f, "syncing"),
            JobState::Paused => write!(f, "paused"),
            JobState::Halting => write!(f, "halting"),
            JobState::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCtrl {
    Start,
    ForceStart,
    Stop,
    Restart,
    Disable,
    Halt,
    Ping,
}

/// Status update published by a job task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMessage {
    pub name: String,
    pub status: SyncStatus,
    pub msg: String,
    /// Re-arm the next scheduled run
    pub schedule: bool,
}

/// Shared resources every job task needs.
#[derive(Clone)]
pub struct JobRuntime {
    pub manager_tx: mpsc::Sender<JobMessage>,
    pub limiter: Arc<Limiter>,
}

#[derive(Debug, Clone, Copy)]
enum HookPhase {
    PreJob,
    PreExec,
    PostExec,
    PostSuccess,
    PostFail,
}

impl HookPhase {
    fn label(self) -> &'static str {
        match self {
            HookPhase::PreJob => "pre-job",
            HookPhase::PreExec => "pre-exec",
            HookPhase::PostExec => "post-exec",
            HookPhase::PostSuccess => "post-success",
            HookPhase::PostFail => "post-fail",
        }
    }

    async fn call(self, hook: &dyn JobHook, provider: &dyn MirrorProvider) -> Result<()> {
        match self {
            HookPhase::PreJob => hook.pre_job(provider).await,
            HookPhase::PreExec => hook.pre_exec(provider).await,
            HookPhase::PostExec => hook.post_exec(provider).await,
            HookPhase::PostSuccess => hook.post_success(provider).await,
            HookPhase::PostFail => hook.post_fail(provider).await,
        }
    }
}

/// Run `phase` on hooks in order. On failure returns how many hooks had
/// already completed the phase.
async fn run_forward(
    hooks: &[Arc<dyn JobHook>],
    phase: HookPhase,
    provider: &dyn MirrorProvider,
) -> std::result::Result<(), (usize, WorkerError)> {
    for (i, hook) in hooks.iter().enumerate() {
        if let Err(e) = phase.call(hook.as_ref(), provider).await {
            tracing::error!(
                mirror = provider.name(),
                hook = hook.name(),
                phase = phase.label(),
                error = %e,
                "Hook failed"
            );
            return Err((i, WorkerError::hook(phase.label(), e)));
        }
    }
    Ok(())
}

/// Run `phase` on hooks in reverse order. Every hook runs; the first error
/// is returned.
async fn run_unwind(
    hooks: &[Arc<dyn JobHook>],
    phase: HookPhase,
    provider: &dyn MirrorProvider,
) -> Result<()> {
    let mut first_err = None;
    for hook in hooks.iter().rev() {
        if let Err(e) = phase.call(hook.as_ref(), provider).await {
            tracing::error!(
                mirror = provider.name(),
                hook = hook.name(),
                phase = phase.label(),
                error = %e,
                "Hook failed"
            );
            first_err.get_or_insert(WorkerError::hook(phase.label(), e));
        }
    }
    first_err.map_or(Ok(()), Err)
}

fn join_result(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    res.unwrap_or_else(|e| Err(WorkerError::Internal(format!("provider task failed: {e}"))))
}

pub struct MirrorJob {
    name: String,
    provider: RwLock<Arc<dyn MirrorProvider>>,
    state: Mutex<JobState>,
    ctrl_tx: mpsc::Sender<JobCtrl>,
    ctrl_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<JobCtrl>>>,
    disabled: Mutex<CancellationToken>,
    next_schedule: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for MirrorJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorJob")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl MirrorJob {
    pub fn new(provider: Arc<dyn MirrorProvider>) -> Arc<Self> {
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CTRL_CHANNEL_DEPTH);
        // no task yet, so nothing to wait for
        let disabled = CancellationToken::new();
        disabled.cancel();
        Arc::new(Self {
            name: provider.name().to_string(),
            provider: RwLock::new(provider),
            state: Mutex::new(JobState::None),
            ctrl_tx,
            ctrl_rx: Arc::new(tokio::sync::Mutex::new(ctrl_rx)),
            disabled: Mutex::new(disabled),
            next_schedule: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> Arc<dyn MirrorProvider> {
        self.provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap the provider. Only allowed while no task is serving the job.
    pub fn set_provider(&self, provider: Arc<dyn MirrorProvider>) -> Result<()> {
        let state = self.state();
        if state != JobState::None && state != JobState::Disabled {
            return Err(WorkerError::Internal(format!(
                "provider of {} cannot be switched while {}",
                self.name, state
            )));
        }
        *self.provider.write().unwrap_or_else(PoisonError::into_inner) = provider;
        Ok(())
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Move into a run phase, but only while the job is still active.
    fn enter_phase(&self, phase: JobState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_active() {
            *state = phase;
            true
        } else {
            false
        }
    }

    fn leave_phase(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, JobState::PreSyncing | JobState::Syncing) {
            *state = JobState::Ready;
        }
    }

    /// Cancelled once the job task has exited.
    pub fn disabled(&self) -> CancellationToken {
        self.disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn next_schedule(&self) -> Option<DateTime<Utc>> {
        *self.next_schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_next_schedule(&self, at: Option<DateTime<Utc>>) {
        *self.next_schedule.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    /// Queue a control action for the job task.
    pub async fn send(&self, ctrl: JobCtrl) -> Result<()> {
        self.ctrl_tx
            .send(ctrl)
            .await
            .map_err(|_| WorkerError::Internal(format!("control channel of {} closed", self.name)))
    }

    /// Start the task serving this job's control channel.
    pub fn spawn(self: &Arc<Self>, rt: JobRuntime) -> JoinHandle<()> {
        if let Ok(mut rx) = self.ctrl_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
        let disabled = CancellationToken::new();
        *self.disabled.lock().unwrap_or_else(PoisonError::into_inner) = disabled.clone();

        let job = self.clone();
        tokio::spawn(async move {
            let last = job.serve(rt).await;
            job.set_state(last);
            disabled.cancel();
            tracing::debug!(mirror = %job.name, "Job task exited");
        })
    }

    /// Serve control actions until the task should exit. Returns the state
    /// the job is left in: `Halting` after a halt, `Disabled` otherwise.
    async fn serve(self: &Arc<Self>, rt: JobRuntime) -> JobState {
        let mut ctrl_rx = self.ctrl_rx.clone().lock_owned().await;
        let (bypass_tx, bypass_rx) = mpsc::channel::<()>(1);
        let bypass_rx = Arc::new(tokio::sync::Mutex::new(bypass_rx));

        loop {
            if self.state() == JobState::Ready {
                let kill = CancellationToken::new();
                let mut run = tokio::spawn(self.clone().run_once(
                    rt.clone(),
                    kill.clone(),
                    bypass_rx.clone(),
                ));

                let restart = loop {
                    tokio::select! {
                        _ = &mut run => break false,
                        ctrl = ctrl_rx.recv() => match ctrl {
                            Some(JobCtrl::Stop) => {
                                self.set_state(JobState::Paused);
                                kill.cancel();
                                let _ = (&mut run).await;
                                break false;
                            }
                            Some(JobCtrl::Disable) => {
                                self.set_state(JobState::Disabled);
                                kill.cancel();
                                let _ = (&mut run).await;
                                return JobState::Disabled;
                            }
                            Some(JobCtrl::Restart) => {
                                self.set_state(JobState::Ready);
                                kill.cancel();
                                let _ = (&mut run).await;
                                tokio::time::sleep(RESTART_DELAY).await;
                                break true;
                            }
                            Some(JobCtrl::ForceStart) => {
                                let _ = bypass_tx.try_send(());
                            }
                            Some(JobCtrl::Start) | Some(JobCtrl::Ping) => {}
                            Some(JobCtrl::Halt) => {
                                self.set_state(JobState::Halting);
                                kill.cancel();
                                let _ = (&mut run).await;
                                return JobState::Halting;
                            }
                            None => {
                                kill.cancel();
                                let _ = (&mut run).await;
                                return JobState::Disabled;
                            }
                        }
                    }
                };
                if restart {
                    continue;
                }
            }

            match ctrl_rx.recv().await {
                Some(JobCtrl::Stop) => self.set_state(JobState::Paused),
                Some(JobCtrl::Disable) => return JobState::Disabled,
                Some(JobCtrl::Restart) | Some(JobCtrl::Start) => self.set_state(JobState::Ready),
                Some(JobCtrl::ForceStart) => {
                    let _ = bypass_tx.try_send(());
                    self.set_state(JobState::Ready);
                }
                Some(JobCtrl::Halt) => return JobState::Halting,
                Some(JobCtrl::Ping) => {}
                None => return JobState::Disabled,
            }
        }
    }

    async fn publish(
        &self,
        rt: &JobRuntime,
        kill: &CancellationToken,
        status: SyncStatus,
        msg: impl Into<String>,
        schedule: bool,
    ) {
        let message = JobMessage {
            name: self.name.clone(),
            status,
            msg: msg.into(),
            schedule,
        };
        // a killed run must not block on a full channel
        tokio::select! {
            biased;
            res = rt.manager_tx.send(message) => {
                if res.is_err() {
                    tracing::debug!(mirror = %self.name, "Manager channel closed");
                }
            }
            _ = kill.cancelled() => {
                tracing::debug!(mirror = %self.name, status = %status, "Dropped status after kill");
            }
        }
    }

    /// One run: admission, then the hook pipeline with retries.
    async fn run_once(
        self: Arc<Self>,
        rt: JobRuntime,
        kill: CancellationToken,
        bypass: Arc<tokio::sync::Mutex<mpsc::Receiver<()>>>,
    ) {
        let _permit = {
            let mut bypass = bypass.lock().await;
            tokio::select! {
                biased;
                _ = kill.cancelled() => return,
                Some(()) = bypass.recv() => {
                    tracing::info!(mirror = %self.name, "Concurrent limit ignored");
                    None
                }
                permit = rt.limiter.acquire() => match permit {
                    Ok(permit) => Some(permit),
                    Err(e) => {
                        tracing::error!(mirror = %self.name, error = %e, "Cannot acquire sync slot");
                        return;
                    }
                },
            }
        };

        let provider = self.provider();
        if let Err(e) = self.sync(&provider, &rt, &kill).await {
            let schedule = self.state().is_active();
            self.publish(&rt, &kill, SyncStatus::Failed, e.to_string(), schedule)
                .await;
        }
        self.leave_phase();
    }

    /// Hook pipeline around provider attempts. `Err` means a hook failed;
    /// sync failures are published here and end in `Ok`.
    async fn sync(
        &self,
        provider: &Arc<dyn MirrorProvider>,
        rt: &JobRuntime,
        kill: &CancellationToken,
    ) -> Result<()> {
        let p = provider.as_ref();
        self.enter_phase(JobState::PreSyncing);
        self.publish(rt, kill, SyncStatus::PreSyncing, "", false).await;
        tracing::info!(mirror = %self.name, "Start syncing");

        let hooks = provider.hooks();
        run_forward(&hooks, HookPhase::PreJob, p)
            .await
            .map_err(|(_, e)| e)?;

        let max_retry = provider.retry().max(1);
        for attempt in 0..max_retry {
            if attempt > 0 {
                tracing::info!(mirror = %self.name, retry = attempt, "Retry syncing");
            }

            let syncing = rt.limiter.enter_syncing();
            self.enter_phase(JobState::Syncing);
            self.publish(rt, kill, SyncStatus::Syncing, "", false).await;

            if let Err((entered, e)) = run_forward(&hooks, HookPhase::PreExec, p).await {
                drop(syncing);
                let _ = run_unwind(&hooks[..entered], HookPhase::PostExec, p).await;
                let _ = run_unwind(&hooks[..entered], HookPhase::PostFail, p).await;
                return Err(e);
            }

            let (outcome, stop_asap) = self.attempt(provider, kill).await;
            drop(syncing);

            if let Err(e) = run_unwind(&hooks, HookPhase::PostExec, p).await {
                let _ = run_unwind(&hooks, HookPhase::PostFail, p).await;
                return Err(e);
            }

            match outcome {
                Ok(()) => {
                    run_unwind(&hooks, HookPhase::PostSuccess, p).await?;
                    tracing::info!(mirror = %self.name, "Succeeded syncing");
                    let schedule = self.state().is_active();
                    self.publish(rt, kill, SyncStatus::Success, "", schedule)
                        .await;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(mirror = %self.name, error = %e, "Failed syncing");
                    run_unwind(&hooks, HookPhase::PostFail, p).await?;
                    let last = attempt + 1 == max_retry;
                    let schedule = !stop_asap && last && self.state().is_active();
                    self.publish(rt, kill, SyncStatus::Failed, e.to_string(), schedule)
                        .await;
                    if stop_asap {
                        tracing::debug!(mirror = %self.name, "No retry, exit directly");
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Run the provider once, racing it against the timeout and the kill
    /// token. Returns the outcome and whether the run was killed.
    async fn attempt(
        &self,
        provider: &Arc<dyn MirrorProvider>,
        kill: &CancellationToken,
    ) -> (Result<()>, bool) {
        let (started_tx, started_rx) = oneshot::channel();
        let runner = provider.clone();
        let mut sync = tokio::spawn(async move { runner.run(started_tx).await });

        tokio::select! {
            res = &mut sync => {
                let res = join_result(res);
                if let Err(e) = &res {
                    tracing::error!(mirror = %self.name, error = %e, "Provider failed to start");
                }
                if res.is_err() && kill.is_cancelled() {
                    return (Err(WorkerError::Killed), true);
                }
                return (res, false);
            }
            _ = started_rx => {
                tracing::debug!(mirror = %self.name, "Provider started");
            }
        }

        let timeout = provider.timeout();
        let deadline = async {
            if timeout.is_zero() {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(timeout).await
            }
        };

        let (err, stop_asap) = tokio::select! {
            res = &mut sync => {
                let res = join_result(res);
                if res.is_err() && kill.is_cancelled() {
                    return (Err(WorkerError::Killed), true);
                }
                return (res, false);
            }
            _ = deadline => {
                tracing::warn!(mirror = %self.name, timeout = ?timeout, "Provider timeout");
                let msg = format!("timeout after {}", humantime::format_duration(timeout));
                (WorkerError::Sync(msg), false)
            }
            _ = kill.cancelled() => {
                tracing::debug!(mirror = %self.name, "Received kill");
                (WorkerError::Killed, true)
            }
        };

        if let Err(e) = provider.terminate().await {
            tracing::error!(mirror = %self.name, error = %e, "Failed to terminate provider");
        }
        // the next attempt must not overlap this one
        let _ = sync.await;
        (Err(err), stop_asap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(JobState::Ready.is_active());
        assert!(JobState::PreSyncing.is_active());
        assert!(JobState::Syncing.is_active());
        for s in [
            JobState::None,
            JobState::Paused,
            JobState::Halting,
            JobState::Disabled,
        ] {
            assert!(!s.is_active(), "{s} should not be active");
        }
    }

    #[test]
    fn timeout_message_format() {
        let msg = format!(
            "timeout after {}",
            humantime::format_duration(Duration::from_secs(2))
        );
        assert_eq!(msg, "timeout after 2s");
        assert_eq!(WorkerError::Killed.to_string(), "killed by manager");
    }
}
