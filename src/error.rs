use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Manager returned {status} for {url}")]
    ManagerStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("{0}")]
    ExitStatus(ExitStatus),

    #[error("process was never started")]
    ProcessNotStarted,

    #[error("failed to signal process: {0}")]
    Signal(#[from] nix::Error),

    #[error("error exec hook {phase}: {message}")]
    Hook { phase: &'static str, message: String },

    #[error("cannot exit the root context")]
    ContextRootExit,

    #[error("cgroup error: {0}")]
    Cgroup(String),

    #[error("killed by manager")]
    Killed,

    #[error("{0}")]
    Sync(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    pub fn hook(phase: &'static str, err: impl std::fmt::Display) -> Self {
        WorkerError::Hook {
            phase,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
