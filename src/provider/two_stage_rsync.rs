use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::config::{MirrorConfig, ProviderKind};
use crate::error::{Result, WorkerError};
use crate::provider::context::WORKING_DIR_KEY;
use crate::provider::rsync::{
    check_upstream, rsync_env, rsync_size, tail_options, RSYNC_BASE_OPTIONS,
};
use crate::provider::{MirrorProvider, ProviderBase, ProviderConfig};

const STAGE1_OPTIONS: &[&str] = &[
    "-aHvh",
    "--no-o",
    "--no-g",
    "--stats",
    "--exclude",
    ".~tmp~/",
    "--safe-links",
    "--timeout=120",
    "--contimeout=120",
];

const DEBIAN_PROFILE: &[&str] = &["dists/"];
const DEBIAN_OLDSTYLE_PROFILE: &[&str] = &[
    "Packages*",
    "Sources*",
    "Release*",
    "InRelease",
    "i18n/*",
    "ls-lR*",
    "dep11/*",
];

/// Paths held back until stage 2 for each stage-1 profile.
pub fn stage1_profile(name: &str) -> Option<&'static [&'static str]> {
    match name {
        "debian" => Some(DEBIAN_PROFILE),
        "debian-oldstyle" => Some(DEBIAN_OLDSTYLE_PROFILE),
        _ => None,
    }
}

/// Rsync in two passes: stage 1 fetches payloads without deleting and
/// without the profile's index files, stage 2 is a full rsync that lands
/// the indices and removes stale files.
pub struct TwoStageRsyncProvider {
    base: ProviderBase,
    stage1_options: Vec<String>,
    stage2_options: Vec<String>,
    env: BTreeMap<String, String>,
}

impl TwoStageRsyncProvider {
    pub fn new(config: ProviderConfig, mirror: &MirrorConfig) -> Result<Self> {
        check_upstream(mirror)?;
        let profile_name = mirror.stage1_profile.as_deref().unwrap_or("debian");
        let profile = stage1_profile(profile_name).ok_or_else(|| {
            WorkerError::Config(format!(
                "{}: unknown stage1_profile `{}`",
                mirror.name, profile_name
            ))
        })?;

        let tail = tail_options(mirror);

        let mut stage1_options: Vec<String> =
            STAGE1_OPTIONS.iter().map(|s| s.to_string()).collect();
        for pattern in profile {
            stage1_options.push("--exclude".to_string());
            stage1_options.push(pattern.to_string());
        }
        stage1_options.extend(tail.iter().cloned());

        let mut stage2_options: Vec<String> = match &mirror.rsync_override {
            Some(overridden) => overridden.clone(),
            None => RSYNC_BASE_OPTIONS.iter().map(|s| s.to_string()).collect(),
        };
        stage2_options.extend(tail);

        Ok(Self {
            base: ProviderBase::new(config),
            stage1_options,
            stage2_options,
            env: rsync_env(mirror),
        })
    }

    pub fn options(&self, stage: u8) -> &[String] {
        if stage == 1 {
            &self.stage1_options
        } else {
            &self.stage2_options
        }
    }

    fn argv(&self, stage: u8) -> Vec<String> {
        let mut argv = vec!["rsync".to_string()];
        argv.extend(self.options(stage).iter().cloned());
        argv.push(self.upstream().to_string());
        argv.push(self.base.exec_path(WORKING_DIR_KEY).display().to_string());
        argv
    }
}

#[async_trait]
impl MirrorProvider for TwoStageRsyncProvider {
    fn base(&self) -> &ProviderBase {
        &self.base
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::TwoStageRsync
    }

    async fn run(&self, started: oneshot::Sender<()>) -> Result<()> {
        self.base.begin_run();
        let mut env = self.base.run_env();
        env.extend(self.env.clone());

        let mut started = Some(started);
        for stage in [1u8, 2] {
            if self.base.is_terminated() {
                return Err(WorkerError::Killed);
            }
            tracing::debug!(mirror = self.name(), stage, "Starting rsync stage");
            let cmd = self.base.build_cmd(self.argv(stage), env.clone());
            self.base.run_cmd(cmd, stage > 1, started.take()).await?;
        }

        self.base.set_data_size(rsync_size(&self.log_file()).await);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config(dir: &std::path::Path) -> ProviderConfig {
        ProviderConfig {
            name: "debian".to_string(),
            upstream_url: "rsync://mirror.example.org/debian/".to_string(),
            working_dir: dir.join("data"),
            log_dir: dir.to_path_buf(),
            log_file: dir.join("latest.log"),
            interval: Duration::from_secs(600),
            retry: 3,
            timeout: Duration::ZERO,
            env: BTreeMap::new(),
            is_master: true,
        }
    }

    fn mirror(profile: Option<&str>) -> MirrorConfig {
        MirrorConfig {
            name: "debian".to_string(),
            provider: ProviderKind::TwoStageRsync,
            upstream: "rsync://mirror.example.org/debian/".to_string(),
            stage1_profile: profile.map(str::to_string),
            exclude_file: Some(PathBuf::from("/etc/excludes")),
            ..Default::default()
        }
    }

    #[test]
    fn stage1_skips_deletes_and_profile_paths() {
        let dir = tempfile::tempdir().unwrap();
        let p = TwoStageRsyncProvider::new(config(dir.path()), &mirror(Some("debian-oldstyle")))
            .unwrap();

        let stage1 = p.options(1);
        assert!(!stage1.iter().any(|o| o.starts_with("--delete")));
        for pattern in stage1_profile("debian-oldstyle").unwrap() {
            let at = stage1.iter().position(|o| o == pattern).unwrap();
            assert_eq!(stage1[at - 1], "--exclude");
        }
        assert!(stage1.ends_with(&["--exclude-from".to_string(), "/etc/excludes".to_string()]));

        let stage2 = p.options(2);
        assert!(stage2.contains(&"--delete".to_string()));
        assert!(stage2.contains(&"--delete-after".to_string()));
        assert!(!stage2.contains(&"InRelease".to_string()));
    }

    #[test]
    fn default_profile_is_debian() {
        let dir = tempfile::tempdir().unwrap();
        let p = TwoStageRsyncProvider::new(config(dir.path()), &mirror(None)).unwrap();
        assert!(p.options(1).contains(&"dists/".to_string()));
        let argv = p.argv(2);
        assert_eq!(argv.last().unwrap(), &dir.path().join("data").display().to_string());
    }

    #[test]
    fn unknown_profile_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = TwoStageRsyncProvider::new(config(dir.path()), &mirror(Some("arch")))
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::Config(_)));
    }
}
