#![forbid(unsafe_code)]

//! `thread-relay` binary.
//!
//! Loads configuration and credentials, starts the Slack Socket Mode
//! listener and the idle-session cleanup task, and shuts everything down
//! on SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use thread_relay::agent::command::SessionOptions;
use thread_relay::agent::ProcessLauncher;
use thread_relay::config::GlobalConfig;
use thread_relay::pipeline::Pipeline;
use thread_relay::sessions::directory::spawn_cleanup_task;
use thread_relay::sessions::{AliasStore, SessionDirectory};
use thread_relay::slack::client::SlackService;
use thread_relay::slack::ChatApi;
use thread_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "thread-relay", about = "Slack thread bridge for a coding agent", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("thread-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.load_credentials().await?;
    let config = Arc::new(config);
    info!(
        verbosity = ?config.verbosity,
        rate_limit = config.rate_limit,
        restricted = config.allowed_users.is_some(),
        "configuration loaded"
    );

    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .map_err(|err| AppError::Config(format!("cannot create state dir: {err}")))?;

    let launcher = Arc::new(ProcessLauncher::new(Duration::from_secs(
        config.agent.shutdown_grace_seconds,
    )));
    let directory = Arc::new(SessionDirectory::new(
        launcher,
        config.agent.binary.clone(),
        SessionOptions::from_config(&config.agent, config.verbosity),
    ));
    let aliases = AliasStore::open(config.alias_map_path());

    let slack = Arc::new(SlackService::new(&config.slack).map_err(|err| {
        error!(%err, "slack service start failed");
        err
    })?);
    let bot_id = slack.bot_user_id().await?;
    info!(bot_id = %bot_id, "slack identity resolved");

    let chat: Arc<dyn ChatApi> = Arc::clone(&slack) as Arc<dyn ChatApi>;
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&config),
        chat,
        Arc::clone(&directory),
        aliases,
    ));

    let ct = CancellationToken::new();
    let cleanup_handle = spawn_cleanup_task(
        Arc::clone(&directory),
        config.timing.cleanup_interval(),
        config.timing.session_max_age(),
        ct.clone(),
    );
    let socket_handle = slack.spawn_socket_mode(Arc::clone(&pipeline), ct.clone());
    info!("thread-relay ready");

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();
    pipeline.shutdown().await;

    let _ = tokio::join!(socket_handle, cleanup_handle);
    info!("thread-relay shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
