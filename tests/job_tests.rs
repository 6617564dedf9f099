mod test_harness;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use test_harness::{assert_eventually, assert_run_shape, command_mirror, start, JobHarness};
use tunasync_lite::error::{Result, WorkerError};
use tunasync_lite::hooks::JobHook;
use tunasync_lite::config::ProviderKind;
use tunasync_lite::provider::{Frame, MirrorProvider, ProviderBase, ProviderConfig};
use tunasync_lite::scheduler::{JobCtrl, JobState, MirrorJob};
use tunasync_lite::status::SyncStatus;

async fn shut_down(job: &MirrorJob) {
    let done = job.disabled();
    job.send(JobCtrl::Disable).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), done.cancelled())
        .await
        .expect("job task did not exit");
}

#[tokio::test]
async fn test_happy_path() {
    let mut h = JobHarness::new(3);
    let job = h.spawn(&command_mirror("demo", "echo hi"));
    start(&job).await;

    let pre = h.expect(SyncStatus::PreSyncing).await;
    assert_eq!(pre.name, "demo");
    assert!(!pre.schedule);
    assert!(!h.expect(SyncStatus::Syncing).await.schedule);
    let done = h.expect(SyncStatus::Success).await;
    assert!(done.schedule);
    assert!(done.msg.is_empty());

    let latest = h.log_dir("demo").join("latest");
    let target = std::fs::read_link(&latest).unwrap();
    assert!(target.to_string_lossy().starts_with("demo_"));
    assert_eq!(std::fs::read_to_string(&latest).unwrap(), "hi\n");
    assert!(h.dir.path().join("mirrors/demo").is_dir());

    let j = job.clone();
    assert_eventually(
        || {
            let j = j.clone();
            async move { j.state() == JobState::Ready }
        },
        Duration::from_secs(5),
        "job should settle back to ready",
    )
    .await;
    shut_down(&job).await;
}

#[tokio::test]
async fn test_retry_on_failure() {
    let mut h = JobHarness::new(3);
    let mut mirror = command_mirror("flaky", "sh -c 'exit 1'");
    mirror.retry = Some(3);
    let job = h.spawn(&mirror);
    start(&job).await;

    let mut statuses = vec![h.expect(SyncStatus::PreSyncing).await.status];
    for attempt in 0..3 {
        statuses.push(h.expect(SyncStatus::Syncing).await.status);
        let failed = h.expect(SyncStatus::Failed).await;
        statuses.push(failed.status);
        assert!(failed.msg.contains("exit status"), "msg: {}", failed.msg);
        assert_eq!(failed.schedule, attempt == 2, "only the last attempt re-arms");
    }
    assert_run_shape(&statuses);

    let log_dir = h.log_dir("flaky");
    let fail_logs: Vec<String> = std::fs::read_dir(&log_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".fail"))
        .collect();
    assert!(!fail_logs.is_empty());
    let latest = std::fs::read_link(log_dir.join("latest")).unwrap();
    assert!(latest.to_string_lossy().ends_with(".fail"));

    h.expect_silence(Duration::from_millis(500)).await;
    shut_down(&job).await;
}

#[tokio::test]
async fn test_kill_during_sync() {
    let mut h = JobHarness::new(3);
    let mut mirror = command_mirror("slow", "sleep 30");
    mirror.retry = Some(3);
    let job = h.spawn(&mirror);
    start(&job).await;

    h.expect(SyncStatus::PreSyncing).await;
    h.expect(SyncStatus::Syncing).await;
    job.send(JobCtrl::Stop).await.unwrap();

    let failed = h.expect(SyncStatus::Failed).await;
    assert_eq!(failed.msg, "killed by manager");
    assert!(!failed.schedule);
    // no retry after a kill
    h.expect_silence(Duration::from_millis(1500)).await;
    assert_eq!(job.state(), JobState::Paused);

    start(&job).await;
    h.expect(SyncStatus::PreSyncing).await;
    h.expect(SyncStatus::Syncing).await;
    shut_down(&job).await;
    assert_eq!(job.state(), JobState::Disabled);
}

#[tokio::test]
async fn test_restart_while_running() {
    let mut h = JobHarness::new(3);
    let job = h.spawn(&command_mirror("restart", "sleep 10"));
    start(&job).await;

    h.expect(SyncStatus::PreSyncing).await;
    h.expect(SyncStatus::Syncing).await;
    job.send(JobCtrl::Restart).await.unwrap();

    let killed = h.expect(SyncStatus::Failed).await;
    assert_eq!(killed.msg, "killed by manager");
    assert!(!killed.schedule);

    h.expect(SyncStatus::PreSyncing).await;
    h.expect(SyncStatus::Syncing).await;
    let done = h.expect(SyncStatus::Success).await;
    assert!(done.schedule);
    shut_down(&job).await;
}

#[tokio::test]
async fn test_timeout() {
    let mut h = JobHarness::new(3);
    let mut mirror = command_mirror("stuck", "sleep 10");
    mirror.timeout = Some(2);
    mirror.retry = Some(3);
    let job = h.spawn(&mirror);
    start(&job).await;

    let mut statuses = vec![h.expect(SyncStatus::PreSyncing).await.status];
    for attempt in 0..3 {
        statuses.push(h.expect(SyncStatus::Syncing).await.status);
        let failed = h.expect(SyncStatus::Failed).await;
        statuses.push(failed.status);
        assert!(failed.msg.starts_with("timeout after"), "msg: {}", failed.msg);
        assert_eq!(failed.schedule, attempt == 2);
    }
    assert_run_shape(&statuses);
    shut_down(&job).await;
}

#[tokio::test]
async fn test_start_while_syncing_is_ignored() {
    let mut h = JobHarness::new(3);
    let job = h.spawn(&command_mirror("busy", "sleep 2"));
    start(&job).await;
    h.expect(SyncStatus::PreSyncing).await;
    h.expect(SyncStatus::Syncing).await;

    start(&job).await;
    h.expect(SyncStatus::Success).await;
    h.expect_silence(Duration::from_millis(500)).await;
    shut_down(&job).await;
}

#[tokio::test]
async fn test_fail_on_match() {
    let mut h = JobHarness::new(3);
    let mut mirror = command_mirror("matcher", "echo ERROR: disk full");
    mirror.fail_on_match = Some("(?m)^ERROR".to_string());
    let job = h.spawn(&mirror);
    start(&job).await;

    h.expect(SyncStatus::PreSyncing).await;
    h.expect(SyncStatus::Syncing).await;
    let failed = h.expect(SyncStatus::Failed).await;
    assert_eq!(failed.msg, "Fail-on-match: 1");
    assert!(failed.schedule);
    shut_down(&job).await;
}

#[tokio::test]
async fn test_size_pattern() {
    let mut h = JobHarness::new(3);
    let mut mirror = command_mirror("sized", "echo size: 42G");
    mirror.size_pattern = Some("size: ([0-9.]+[KMGTP]?)".to_string());
    let job = h.spawn(&mirror);
    start(&job).await;

    h.skip_until("sized", SyncStatus::Success).await;
    assert_eq!(job.provider().data_size().as_deref(), Some("42G"));
    shut_down(&job).await;
}

struct RecordingHook {
    label: &'static str,
    events: Arc<Mutex<Vec<String>>>,
    fail_pre_exec: bool,
}

impl RecordingHook {
    fn new(label: &'static str, events: &Arc<Mutex<Vec<String>>>, fail_pre_exec: bool) -> Arc<Self> {
        Arc::new(Self {
            label,
            events: events.clone(),
            fail_pre_exec,
        })
    }

    fn record(&self, phase: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.label, phase));
    }
}

#[async_trait]
impl JobHook for RecordingHook {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn pre_job(&self, _provider: &dyn MirrorProvider) -> Result<()> {
        self.record("pre_job");
        Ok(())
    }

    async fn pre_exec(&self, provider: &dyn MirrorProvider) -> Result<()> {
        self.record("pre_exec");
        if self.fail_pre_exec {
            return Err(WorkerError::Sync("boom".to_string()));
        }
        let mut frame = Frame::new();
        frame.insert(self.label.to_string(), "entered".into());
        provider.enter_context(frame);
        Ok(())
    }

    async fn post_exec(&self, _provider: &dyn MirrorProvider) -> Result<()> {
        self.record("post_exec");
        Ok(())
    }

    async fn post_success(&self, provider: &dyn MirrorProvider) -> Result<()> {
        self.record("post_success");
        provider.exit_context()
    }

    async fn post_fail(&self, provider: &dyn MirrorProvider) -> Result<()> {
        self.record("post_fail");
        provider.exit_context()
    }
}

#[tokio::test]
async fn test_hooks_unwind_in_reverse_and_balance_context() {
    let mut h = JobHarness::new(3);
    let mut mirror = command_mirror("hooked", "sh -c 'exit 3'");
    mirror.retry = Some(2);
    let provider = h.provider(&mirror);
    let events = Arc::new(Mutex::new(Vec::new()));
    provider.add_hook(RecordingHook::new("a", &events, false));
    provider.add_hook(RecordingHook::new("b", &events, false));
    let job = h.spawn_provider(provider.clone());
    start(&job).await;

    h.expect(SyncStatus::PreSyncing).await;
    for _ in 0..2 {
        h.expect(SyncStatus::Syncing).await;
        h.expect(SyncStatus::Failed).await;
    }

    let attempt = [
        "a:pre_exec",
        "b:pre_exec",
        "b:post_exec",
        "a:post_exec",
        "b:post_fail",
        "a:post_fail",
    ];
    let mut expected = vec!["a:pre_job", "b:pre_job"];
    expected.extend(attempt);
    expected.extend(attempt);
    assert_eq!(*events.lock().unwrap(), expected);
    assert_eq!(provider.context().depth(), 1);
    shut_down(&job).await;
}

#[tokio::test]
async fn test_pre_exec_failure_unwinds_entered_hooks() {
    let mut h = JobHarness::new(3);
    let mut mirror = command_mirror("broken", "echo never");
    mirror.retry = Some(3);
    let provider = h.provider(&mirror);
    let events = Arc::new(Mutex::new(Vec::new()));
    provider.add_hook(RecordingHook::new("a", &events, false));
    provider.add_hook(RecordingHook::new("b", &events, true));
    let job = h.spawn_provider(provider.clone());
    start(&job).await;

    h.expect(SyncStatus::PreSyncing).await;
    h.expect(SyncStatus::Syncing).await;
    let failed = h.expect(SyncStatus::Failed).await;
    assert!(failed.msg.starts_with("error exec hook pre-exec"), "msg: {}", failed.msg);
    assert!(failed.schedule);
    // hook failures are not retried
    h.expect_silence(Duration::from_millis(500)).await;

    assert_eq!(
        *events.lock().unwrap(),
        [
            "a:pre_job",
            "b:pre_job",
            "a:pre_exec",
            "b:pre_exec",
            "a:post_exec",
            "a:post_fail",
        ]
    );
    assert_eq!(provider.context().depth(), 1);
    shut_down(&job).await;
}

/// Provider whose process cannot be signalled: every run sleeps to
/// completion and `terminate` always fails.
struct UnkillableProvider {
    base: ProviderBase,
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl MirrorProvider for UnkillableProvider {
    fn base(&self) -> &ProviderBase {
        &self.base
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Command
    }

    async fn run(&self, started: oneshot::Sender<()>) -> Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _ = started.send(());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        Err(WorkerError::Internal("operation not permitted".to_string()))
    }
}

#[tokio::test]
async fn test_failed_terminate_does_not_overlap_attempts() {
    let mut h = JobHarness::new(3);
    let dir = h.dir.path().join("unkillable");
    let provider = Arc::new(UnkillableProvider {
        base: ProviderBase::new(ProviderConfig {
            name: "unkillable".to_string(),
            upstream_url: "https://upstream.example.org/unkillable/".to_string(),
            working_dir: dir.join("data"),
            log_dir: dir.clone(),
            log_file: dir.join("run.log"),
            interval: Duration::from_secs(60),
            retry: 2,
            timeout: Duration::from_secs(1),
            env: BTreeMap::new(),
            is_master: true,
        }),
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let job = h.spawn_provider(provider.clone());
    start(&job).await;

    h.expect(SyncStatus::PreSyncing).await;
    for _ in 0..2 {
        h.expect(SyncStatus::Syncing).await;
        let failed = h.expect(SyncStatus::Failed).await;
        assert!(failed.msg.starts_with("timeout after"), "msg: {}", failed.msg);
    }
    assert_eq!(provider.peak.load(Ordering::SeqCst), 1);
    assert_eq!(provider.running.load(Ordering::SeqCst), 0);
    shut_down(&job).await;
}
