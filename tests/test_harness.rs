//! Test harness for mirror job and worker integration tests.
//!
//! Provides temp-dir backed configs, spawned jobs wired to a shared status
//! channel, and polling helpers.

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use tunasync_lite::config::{MirrorConfig, ProviderKind, WorkerConfig};
use tunasync_lite::provider::{build_provider, MirrorProvider};
use tunasync_lite::scheduler::{JobCtrl, JobMessage, JobRuntime, Limiter, MirrorJob};
use tunasync_lite::status::SyncStatus;

/// Upper bound on any single wait in these tests
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Command mirror with a short interval and no retries beyond one.
pub fn command_mirror(name: &str, command: &str) -> MirrorConfig {
    MirrorConfig {
        name: name.to_string(),
        provider: ProviderKind::Command,
        upstream: format!("https://upstream.example.org/{name}/"),
        command: command.to_string(),
        interval: Some(1),
        retry: Some(1),
        ..Default::default()
    }
}

/// Worker config rooted in `dir` with no manager configured.
pub fn test_config(dir: &Path, mirrors: Vec<MirrorConfig>) -> WorkerConfig {
    let mut cfg = WorkerConfig::default();
    cfg.global.name = "test_worker".to_string();
    cfg.global.mirror_dir = dir.join("mirrors");
    cfg.global.log_dir = dir.join("log/{name}").display().to_string();
    cfg.global.concurrent = 3;
    cfg.server.listen_port = 0;
    cfg.mirrors = mirrors;
    cfg
}

/// Jobs driven directly, without a supervisor, all publishing into one
/// channel the test reads.
pub struct JobHarness {
    pub dir: TempDir,
    pub runtime: JobRuntime,
    rx: mpsc::Receiver<JobMessage>,
}

impl JobHarness {
    pub fn new(concurrent: usize) -> Self {
        let (manager_tx, rx) = mpsc::channel(256);
        Self {
            dir: tempfile::tempdir().unwrap(),
            runtime: JobRuntime {
                manager_tx,
                limiter: Limiter::new(concurrent),
            },
            rx,
        }
    }

    pub fn config(&self, mirrors: Vec<MirrorConfig>) -> WorkerConfig {
        test_config(self.dir.path(), mirrors)
    }

    pub fn provider(&self, mirror: &MirrorConfig) -> Arc<dyn MirrorProvider> {
        let cfg = self.config(vec![mirror.clone()]);
        build_provider(mirror, &cfg, None).unwrap()
    }

    /// Build and spawn a job for `mirror`. The job idles until started.
    pub fn spawn(&self, mirror: &MirrorConfig) -> Arc<MirrorJob> {
        self.spawn_provider(self.provider(mirror))
    }

    pub fn spawn_provider(&self, provider: Arc<dyn MirrorProvider>) -> Arc<MirrorJob> {
        let job = MirrorJob::new(provider);
        job.spawn(self.runtime.clone());
        job
    }

    pub fn log_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join("log").join(name)
    }

    /// Next published message, failing the test after [`MESSAGE_TIMEOUT`].
    pub async fn next(&mut self) -> JobMessage {
        tokio::time::timeout(MESSAGE_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a job message")
            .expect("status channel closed")
    }

    /// Next message, asserting its status.
    pub async fn expect(&mut self, status: SyncStatus) -> JobMessage {
        let msg = self.next().await;
        assert_eq!(msg.status, status, "unexpected message {msg:?}");
        msg
    }

    /// Skip messages until one with `status` arrives.
    pub async fn skip_until(&mut self, name: &str, status: SyncStatus) -> JobMessage {
        loop {
            let msg = self.next().await;
            if msg.name == name && msg.status == status {
                return msg;
            }
        }
    }

    /// Assert nothing is published for `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) {
        if let Ok(Some(msg)) = tokio::time::timeout(quiet, self.rx.recv()).await {
            panic!("expected no message, got {msg:?}");
        }
    }
}

pub async fn start(job: &MirrorJob) {
    job.send(JobCtrl::Start).await.unwrap();
}

/// Check a status sequence against
/// `(PreSyncing (Syncing Failed)* Syncing (Success | Failed))+`.
pub fn assert_run_shape(statuses: &[SyncStatus]) {
    let mut i = 0;
    while i < statuses.len() {
        assert_eq!(statuses[i], SyncStatus::PreSyncing, "run must open with pre-syncing: {statuses:?}");
        i += 1;
        loop {
            assert_eq!(statuses.get(i), Some(&SyncStatus::Syncing), "attempt must start with syncing: {statuses:?}");
            let outcome = statuses.get(i + 1).copied();
            assert!(
                matches!(outcome, Some(SyncStatus::Success) | Some(SyncStatus::Failed)),
                "attempt must end with success or failed: {statuses:?}"
            );
            i += 2;
            if outcome == Some(SyncStatus::Success) || statuses.get(i) != Some(&SyncStatus::Syncing) {
                break;
            }
        }
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
