use std::net::SocketAddr;
use std::str::FromStr;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};

/// Commands the manager may send to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdVerb {
    Start,
    Stop,
    Disable,
    Restart,
    Ping,
    Reload,
}

impl FromStr for CmdVerb {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(CmdVerb::Start),
            "stop" => Ok(CmdVerb::Stop),
            "disable" => Ok(CmdVerb::Disable),
            "restart" => Ok(CmdVerb::Restart),
            "ping" => Ok(CmdVerb::Ping),
            "reload" => Ok(CmdVerb::Reload),
            other => Err(WorkerError::Internal(format!("invalid command: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CmdOptions {
    pub force: bool,
}

/// `POST /` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCmd {
    pub cmd: String,
    #[serde(default)]
    pub mirror_id: String,
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub options: CmdOptions,
}

/// Work handed from the HTTP surface to the supervisor loop.
#[derive(Debug)]
pub enum Intent {
    Command {
        cmd: CmdVerb,
        mirror: String,
        force: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Reload {
        config: Box<WorkerConfig>,
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Clone)]
pub struct ServerState {
    pub intents: mpsc::Sender<Intent>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", post(command_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the control surface until `shutdown` fires.
pub async fn run_server(
    addr: SocketAddr,
    state: ServerState,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind control server");
        e
    })?;
    tracing::info!(addr = %addr, "Starting control server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn reply(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(json!({ "msg": msg.into() }))).into_response()
}

async fn command_handler(State(state): State<ServerState>, body: Bytes) -> Response {
    let cmd: WorkerCmd = match serde_json::from_slice(&body) {
        Ok(cmd) => cmd,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed manager command");
            return reply(StatusCode::BAD_REQUEST, "Invalid request");
        }
    };
    let Ok(verb) = cmd.cmd.parse::<CmdVerb>() else {
        return reply(StatusCode::NOT_ACCEPTABLE, "Invalid Command");
    };
    tracing::info!(cmd = %cmd.cmd, mirror = %cmd.mirror_id, force = cmd.options.force, "Received command");

    if cmd.mirror_id.is_empty() {
        return match verb {
            CmdVerb::Reload => match kill(Pid::this(), Signal::SIGHUP) {
                Ok(()) => reply(StatusCode::OK, "OK"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to raise SIGHUP");
                    reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                }
            },
            CmdVerb::Ping => reply(StatusCode::OK, "OK"),
            _ => reply(StatusCode::NOT_ACCEPTABLE, "Invalid Command"),
        };
    }
    if verb == CmdVerb::Reload {
        return reply(StatusCode::NOT_ACCEPTABLE, "Invalid Command");
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    let intent = Intent::Command {
        cmd: verb,
        mirror: cmd.mirror_id.clone(),
        force: cmd.options.force,
        reply: reply_tx,
    };
    if state.intents.send(intent).await.is_err() {
        return reply(StatusCode::SERVICE_UNAVAILABLE, "Worker is shutting down");
    }
    match reply_rx.await {
        Ok(Ok(())) => reply(StatusCode::OK, "OK"),
        Ok(Err(WorkerError::JobNotFound(name))) => {
            reply(StatusCode::NOT_FOUND, format!("Mirror ``{name}'' not found"))
        }
        Ok(Err(e)) => reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(_) => reply(StatusCode::SERVICE_UNAVAILABLE, "Worker is shutting down"),
    }
}
