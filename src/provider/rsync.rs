use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::oneshot;

use crate::config::{MirrorConfig, ProviderKind};
use crate::error::{Result, WorkerError};
use crate::provider::context::WORKING_DIR_KEY;
use crate::provider::{extract_from_log, MirrorProvider, ProviderBase, ProviderConfig};

pub const RSYNC_BASE_OPTIONS: &[&str] = &[
    "-aHvh",
    "--no-o",
    "--no-g",
    "--stats",
    "--exclude",
    ".~tmp~/",
    "--delete",
    "--delete-after",
    "--delay-updates",
    "--safe-links",
    "--timeout=120",
    "--contimeout=120",
];

static RSYNC_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Total file size: ([0-9.]+[KMGTP]?) bytes").expect("static regex")
});

/// Size reported in the `--stats` trailer of an rsync log, if any.
pub(crate) async fn rsync_size(log_file: &std::path::Path) -> Option<String> {
    extract_from_log(log_file, &RSYNC_SIZE_RE).await
}

pub(crate) fn check_upstream(mirror: &MirrorConfig) -> Result<()> {
    if mirror.upstream.ends_with('/') {
        Ok(())
    } else {
        Err(WorkerError::Config(format!(
            "{}: rsync upstream URL should end with /",
            mirror.name
        )))
    }
}

/// Options appended after the base set: address family, exclude file and
/// the mirror's extra options.
pub(crate) fn tail_options(mirror: &MirrorConfig) -> Vec<String> {
    let mut options = Vec::new();
    if mirror.use_ipv6 {
        options.push("-6".to_string());
    } else if mirror.use_ipv4 {
        options.push("-4".to_string());
    }
    if let Some(file) = &mirror.exclude_file {
        options.push("--exclude-from".to_string());
        options.push(file.display().to_string());
    }
    options.extend(mirror.rsync_options.iter().cloned());
    options
}

/// Credentials passed through the environment.
pub(crate) fn rsync_env(mirror: &MirrorConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(user) = &mirror.username {
        env.insert("USER".to_string(), user.clone());
    }
    if let Some(password) = &mirror.password {
        env.insert("RSYNC_PASSWORD".to_string(), password.clone());
    }
    env
}

pub struct RsyncProvider {
    base: ProviderBase,
    options: Vec<String>,
    env: BTreeMap<String, String>,
}

impl RsyncProvider {
    pub fn new(config: ProviderConfig, mirror: &MirrorConfig) -> Result<Self> {
        check_upstream(mirror)?;

        let mut options: Vec<String> = match &mirror.rsync_override {
            Some(overridden) => overridden.clone(),
            None => RSYNC_BASE_OPTIONS.iter().map(|s| s.to_string()).collect(),
        };
        options.extend(tail_options(mirror));

        Ok(Self {
            base: ProviderBase::new(config),
            options,
            env: rsync_env(mirror),
        })
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    fn argv(&self) -> Vec<String> {
        let mut argv = vec!["rsync".to_string()];
        argv.extend(self.options.iter().cloned());
        argv.push(self.upstream().to_string());
        argv.push(self.base.exec_path(WORKING_DIR_KEY).display().to_string());
        argv
    }
}

#[async_trait]
impl MirrorProvider for RsyncProvider {
    fn base(&self) -> &ProviderBase {
        &self.base
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Rsync
    }

    async fn run(&self, started: oneshot::Sender<()>) -> Result<()> {
        self.base.begin_run();
        let mut env = self.base.run_env();
        env.extend(self.env.clone());

        let cmd = self.base.build_cmd(self.argv(), env);
        self.base.run_cmd(cmd, false, Some(started)).await?;
        self.base.set_data_size(rsync_size(&self.log_file()).await);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config(name: &str, upstream: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            upstream_url: upstream.to_string(),
            working_dir: PathBuf::from("/srv/mirrors/debian"),
            log_dir: PathBuf::from("/var/log/tunasync/debian"),
            log_file: PathBuf::from("/var/log/tunasync/debian/latest.log"),
            interval: Duration::from_secs(600),
            retry: 3,
            timeout: Duration::ZERO,
            env: BTreeMap::new(),
            is_master: true,
        }
    }

    fn mirror() -> MirrorConfig {
        MirrorConfig {
            name: "debian".to_string(),
            provider: ProviderKind::Rsync,
            upstream: "rsync://mirror.example.org/debian/".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn upstream_needs_trailing_slash() {
        let mut m = mirror();
        m.upstream = "rsync://mirror.example.org/debian".to_string();
        let err = RsyncProvider::new(config("debian", &m.upstream), &m).err().unwrap();
        assert!(matches!(err, WorkerError::Config(_)));
    }

    #[test]
    fn argv_layout() {
        let mut m = mirror();
        m.use_ipv6 = true;
        m.use_ipv4 = true;
        m.exclude_file = Some(PathBuf::from("/etc/excludes"));
        m.rsync_options = vec!["--bwlimit=100".to_string()];
        m.username = Some("mirror".to_string());
        m.password = Some("secret".to_string());
        let p = RsyncProvider::new(config("debian", &m.upstream), &m).unwrap();

        let argv = p.argv();
        assert_eq!(argv[0], "rsync");
        assert_eq!(&argv[1..=RSYNC_BASE_OPTIONS.len()], RSYNC_BASE_OPTIONS);
        let tail = &argv[RSYNC_BASE_OPTIONS.len() + 1..];
        assert_eq!(
            tail,
            [
                "-6",
                "--exclude-from",
                "/etc/excludes",
                "--bwlimit=100",
                "rsync://mirror.example.org/debian/",
                "/srv/mirrors/debian",
            ]
        );
        assert_eq!(p.env["USER"], "mirror");
        assert_eq!(p.env["RSYNC_PASSWORD"], "secret");
    }

    #[test]
    fn override_replaces_base_options() {
        let mut m = mirror();
        m.rsync_override = Some(vec!["-a".to_string()]);
        m.use_ipv4 = true;
        let p = RsyncProvider::new(config("debian", &m.upstream), &m).unwrap();
        assert_eq!(p.options(), ["-a", "-4"]);
    }

    #[tokio::test]
    async fn size_comes_from_the_last_stats_block() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("rsync.log");
        std::fs::write(
            &log,
            "Number of files: 1\nTotal file size: 1.10G bytes\n\nTotal file size: 1.33T bytes\nTotal transferred file size: 2.3M bytes\n",
        )
        .unwrap();
        assert_eq!(rsync_size(&log).await.as_deref(), Some("1.33T"));

        std::fs::write(&log, "Gesamtgröße: 12 Bytes\n").unwrap();
        assert_eq!(rsync_size(&log).await, None);
        assert_eq!(rsync_size(&dir.path().join("missing.log")).await, None);
    }
}
