use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tunasync_lite::config::WorkerConfig;
use tunasync_lite::shutdown::install_shutdown_handler;
use tunasync_lite::worker::{run_server, Worker};

#[derive(Parser, Debug)]
#[command(name = "tunasync-lite")]
#[command(version)]
#[command(about = "Worker runtime for a mirror-synchronization fleet")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the mirror worker
    Worker(WorkerArgs),

    /// Validate a worker config file and list its mirrors
    CheckConfig {
        /// Path to the worker config file
        #[arg(long, short = 'c')]
        config: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Path to the worker config file
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct MirrorSummary {
    name: String,
    provider: String,
    upstream: String,
    interval_minutes: u64,
    working_dir: String,
    log_dir: String,
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let cfg = WorkerConfig::load(&args.config)?;
    let addr = cfg.server.socket_addr();
    tracing::info!(
        worker = %cfg.global.name,
        mirrors = cfg.mirrors.len(),
        concurrent = cfg.global.concurrent,
        "Starting worker"
    );

    let (worker, channels) = Worker::new(cfg, Some(args.config))?;
    let shutdown = install_shutdown_handler()?;

    let halter = worker.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        halter.halt().await;
    });

    let server_stop = CancellationToken::new();
    let mut server = tokio::spawn(run_server(
        addr,
        worker.server_state(),
        server_stop.clone(),
    ));

    tokio::select! {
        res = worker.run(channels) => {
            server_stop.cancel();
            if let Ok(Err(e)) = server.await {
                tracing::error!(error = %e, "Control server failed");
            }
            res?;
        }
        res = &mut server => {
            let err = match res {
                Ok(Ok(())) => "control server exited".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            tracing::error!(error = %err, "Control server stopped, halting worker");
            worker.halt().await;
            return Err(err.into());
        }
    }

    tracing::info!("Worker exited");
    Ok(())
}

fn check_config(path: PathBuf, output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = WorkerConfig::load(&path)?;
    let mirrors: Vec<MirrorSummary> = cfg
        .mirrors
        .iter()
        .map(|m| MirrorSummary {
            name: m.name.clone(),
            provider: m.provider.to_string(),
            upstream: m.upstream.clone(),
            interval_minutes: cfg.interval(m).as_secs() / 60,
            working_dir: cfg.working_dir(m).display().to_string(),
            log_dir: cfg.log_dir(m).display().to_string(),
        })
        .collect();

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&mirrors)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<20} {:<16} {:>9}  {}",
                "NAME", "PROVIDER", "INTERVAL", "UPSTREAM"
            );
            for m in &mirrors {
                println!(
                    "{:<20} {:<16} {:>8}m  {}",
                    m.name, m.provider, m.interval_minutes, m.upstream
                );
            }
            println!("\n{} mirror(s), worker `{}`", mirrors.len(), cfg.global.name);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::CheckConfig { config, output } => check_config(config, output)?,
    }

    Ok(())
}
