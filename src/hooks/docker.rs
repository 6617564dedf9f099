use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use nix::unistd::{getgid, getuid};

use crate::error::Result;
use crate::hooks::JobHook;
use crate::provider::context::{
    docker_key, ContextValue, Frame, LOG_DIR_KEY, LOG_FILE_KEY, VOLUMES_KEY, WORKING_DIR_KEY,
};
use crate::provider::MirrorProvider;

/// Container path the working directory is mounted at.
pub const CONTAINER_DATA_DIR: &str = "/data";
/// Container path the log directory is mounted at.
pub const CONTAINER_LOG_DIR: &str = "/log_latest";

/// Runs a mirror's provider inside `docker run`.
///
/// On `pre_exec` the working and log directories are bind-mounted and the
/// container-side paths are pushed as `:docker` context keys; `post_exec`
/// pops that frame.
#[derive(Debug, Clone)]
pub struct DockerHook {
    container_name: String,
    image: String,
    volumes: Vec<String>,
    options: Vec<String>,
    memory_limit: Option<String>,
}

impl DockerHook {
    pub fn new(
        mirror_name: &str,
        image: impl Into<String>,
        volumes: Vec<String>,
        options: Vec<String>,
        memory_limit: Option<String>,
    ) -> Self {
        Self {
            container_name: format!("tunasync-job-{mirror_name}"),
            image: image.into(),
            volumes,
            options,
            memory_limit,
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Arguments for `docker` that run `argv` in the container.
    pub fn run_args(
        &self,
        workdir: &Path,
        volumes: &[String],
        env: &BTreeMap<String, String>,
        argv: &[String],
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "-a".into(),
            "STDOUT".into(),
            "-a".into(),
            "STDERR".into(),
            "--name".into(),
            self.container_name.clone(),
            "-u".into(),
            format!("{}:{}", getuid(), getgid()),
        ];
        for vol in volumes {
            args.push("-v".into());
            args.push(vol.clone());
        }
        if let Some(limit) = &self.memory_limit {
            args.push(format!("--memory={limit}"));
        }
        for (k, v) in env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.extend(self.options.iter().cloned());
        args.push("-w".into());
        args.push(workdir.display().to_string());
        args.push(self.image.clone());
        args.extend(argv.iter().cloned());
        args
    }
}

#[async_trait]
impl JobHook for DockerHook {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn pre_exec(&self, provider: &dyn MirrorProvider) -> Result<()> {
        let working_dir = provider.working_dir();
        let log_dir = provider.log_dir();
        let log_file = provider.log_file();

        if !working_dir.exists() {
            tracing::debug!(mirror = provider.name(), dir = %working_dir.display(), "Creating working dir");
            tokio::fs::create_dir_all(&working_dir).await?;
        }

        let mut volumes = vec![
            format!("{}:{}", log_dir.display(), CONTAINER_LOG_DIR),
            format!("{}:{}", working_dir.display(), CONTAINER_DATA_DIR),
        ];
        volumes.extend(self.volumes.iter().cloned());

        let container_log = match log_file.file_name() {
            Some(file) => Path::new(CONTAINER_LOG_DIR).join(file).display().to_string(),
            None => CONTAINER_LOG_DIR.to_string(),
        };

        let mut frame = Frame::new();
        frame.insert(VOLUMES_KEY.to_string(), ContextValue::List(volumes));
        frame.insert(docker_key(WORKING_DIR_KEY), CONTAINER_DATA_DIR.into());
        frame.insert(docker_key(LOG_DIR_KEY), CONTAINER_LOG_DIR.into());
        frame.insert(docker_key(LOG_FILE_KEY), container_log.into());
        provider.enter_context(frame);
        Ok(())
    }

    async fn post_exec(&self, provider: &dyn MirrorProvider) -> Result<()> {
        provider.exit_context()
    }
}
