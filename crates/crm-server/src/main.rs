//! CRM Server - Main entry point

use anyhow::Result;
use clap::{Parser, Subcommand};
use crm_common::logging::{init_logging, LogConfig, LogLevel};
use crm_server::{
    api::{self, AppState},
    app,
    config::Config,
    ingest::OverallStatus,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "crm-server")]
#[command(author, version, about = "CRM ingestion pipeline server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the trigger endpoints (default)
    Serve,

    /// Run the pipeline once, print the JSON summary and exit
    RunOnce,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("crm-server")
        .filter_directives("crm_server=debug,tower_http=debug,sqlx=warn")
        .build();

    // Merge with environment variables (they take precedence)
    let log_config = log_config.merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    let config = Config::load()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::RunOnce => run_once(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting CRM Server");

    let pipeline = Arc::new(app::build_pipeline(&config).await?);
    info!(
        domains = pipeline.domains().len(),
        "Pipeline ready"
    );

    let _schedule_handle = config
        .ingest
        .schedule_interval()
        .map(|every| app::spawn_schedule(Arc::clone(&pipeline), every));

    let app = api::create_router(AppState::new(pipeline), &config.cors);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    info!("Server shut down gracefully");

    Ok(())
}

async fn run_once(config: Config) -> Result<()> {
    let pipeline = app::build_pipeline(&config).await?;
    let summary = pipeline.run().await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.overall_status != OverallStatus::Success {
        anyhow::bail!("Run finished with status {:?}", summary.overall_status);
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // Give ongoing requests time to complete
    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
