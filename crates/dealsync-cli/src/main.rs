use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dealsync_sync::{CheckpointBackend, SyncConfig, SyncError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "dealsync")]
#[command(about = "Mirror CRM deals into PostgreSQL")]
struct Cli {
    /// Used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full sync (the default).
    Sync,
    /// Apply database migrations and exit.
    Migrate,
    /// Serve the push-notification receiver, plus the recurring sync when enabled.
    Serve,
    /// Inspect or reset stored checkpoints.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Debug, Subcommand)]
enum CheckpointAction {
    Show {
        /// Defaults to every configured stream.
        stream: Option<String>,
    },
    Reset {
        stream: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    match run(cli.command.unwrap_or(Commands::Sync), SyncConfig::from_env(), cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "dealsync failed");
            exit_code_for(&err)
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<SyncError>() {
        Some(sync) if sync.is_cancelled() => ExitCode::from(130),
        Some(SyncError::Aborted { .. }) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current step");
            cancel.cancel();
        }
    });
}

async fn run(command: Commands, config: SyncConfig, cancel: CancellationToken) -> Result<()> {
    match command {
        Commands::Sync => {
            let summary = dealsync_sync::run_sync_once(&config, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let pool = dealsync_sync::connect(&config).await?;
            dealsync_sync::run_migrations(&pool).await?;
        }
        Commands::Serve => serve(config, cancel).await?,
        Commands::Checkpoint { action } => checkpoint(&config, action).await?,
    }
    Ok(())
}

async fn serve(config: SyncConfig, cancel: CancellationToken) -> Result<()> {
    config.validate()?;
    let pool = dealsync_sync::connect(&config).await?;
    dealsync_sync::run_migrations(&pool).await?;

    let scheduler =
        dealsync_sync::maybe_build_scheduler(config.clone(), pool.clone(), cancel.clone()).await?;
    let mut scheduler = match scheduler {
        Some(sched) => {
            sched.start().await.context("starting scheduler")?;
            Some(sched)
        }
        None => None,
    };

    let served = dealsync_web::serve(&config, &pool, cancel.clone()).await;
    cancel.cancel();

    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler did not shut down cleanly");
        }
    }
    served
}

async fn checkpoint(config: &SyncConfig, action: CheckpointAction) -> Result<()> {
    let pool = match config.checkpoint_backend {
        CheckpointBackend::Postgres => {
            let pool = dealsync_sync::connect(config).await?;
            dealsync_sync::run_migrations(&pool).await?;
            Some(pool)
        }
        CheckpointBackend::File => None,
    };
    let store = dealsync_sync::checkpoint_store(config, pool.as_ref())?;

    let streams = |stream: Option<String>| match stream {
        Some(stream) => vec![stream],
        None => config.stream_keys(),
    };

    match action {
        CheckpointAction::Show { stream } => {
            for stream in streams(stream) {
                let checkpoint = store.load(&stream).await?;
                let line = serde_json::json!({ "stream": stream, "checkpoint": checkpoint });
                println!("{line}");
            }
        }
        CheckpointAction::Reset { stream } => {
            for stream in streams(stream) {
                if store.clear(&stream).await? {
                    info!(stream = %stream, "checkpoint cleared");
                } else {
                    info!(stream = %stream, "no checkpoint stored");
                }
            }
        }
    }
    Ok(())
}
