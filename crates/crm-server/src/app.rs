//! Pipeline assembly and the in-process schedule

use crate::config::Config;
use crate::ingest::config::{load_domains, ArchiveBackend, WarehouseBackend};
use crate::ingest::{
    HttpFetcher, LocalArchiver, MemoryWarehouse, ObjectStoreArchiver, Pipeline, PostgresLoader,
    TableLoader,
};
use crate::storage::{config::StorageConfig, Storage};
use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Build the pipeline described by the configuration: domains file, fetcher,
/// warehouse backend and optional raw archiver.
pub async fn build_pipeline(config: &Config) -> anyhow::Result<Pipeline> {
    let ingest = &config.ingest;

    let domains = load_domains(&ingest.domains_file).with_context(|| {
        format!(
            "Failed to load domain definitions from {}",
            ingest.domains_file.display()
        )
    })?;
    info!(
        count = domains.len(),
        "Loaded domain definitions from {}",
        ingest.domains_file.display()
    );

    let fetcher = HttpFetcher::new(ingest.retry_policy(), ingest.request_timeout())?;

    let loader: Arc<dyn TableLoader> = match ingest.warehouse {
        WarehouseBackend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .min_connections(config.database.min_connections)
                .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
                .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
                .connect(&config.database.url)
                .await
                .context("Failed to connect to the warehouse database")?;
            info!("Database connection pool established");
            Arc::new(PostgresLoader::new(pool))
        },
        WarehouseBackend::Memory => {
            warn!("Using the in-memory warehouse; loaded tables are lost on exit");
            Arc::new(MemoryWarehouse::new())
        },
    };

    let mut pipeline =
        Pipeline::new(domains, Arc::new(fetcher), loader).with_parallel(ingest.parallel);

    match &ingest.archive {
        ArchiveBackend::Disabled => info!("Raw payload archiving is disabled"),
        ArchiveBackend::Local { dir } => {
            info!("Archiving raw payloads under {}", dir.display());
            pipeline = pipeline.with_archiver(Arc::new(LocalArchiver::new(dir.clone())));
        },
        ArchiveBackend::S3 => {
            let storage = Storage::new(StorageConfig::from_env()?).await?;
            pipeline = pipeline.with_archiver(Arc::new(ObjectStoreArchiver::new(storage)));
        },
    }

    Ok(pipeline)
}

/// Run the pipeline every `every`, starting one interval from now.
///
/// Runs never overlap; ticks missed while a run is in progress are skipped.
pub fn spawn_schedule(pipeline: Arc<Pipeline>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = every.as_secs(), "Ingestion schedule started");

        loop {
            ticker.tick().await;
            match pipeline.run().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    status = ?summary.overall_status,
                    total_records = summary.total_records_processed,
                    "Scheduled run finished"
                ),
                Err(e) => error!("Scheduled run aborted: {}", e),
            }
        }
    })
}
