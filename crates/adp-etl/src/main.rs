//! ADP ETL - ad-impression ingestion pipeline runner

use anyhow::{Context, Result};
use adp_common::logging::{init_logging, LogConfig, LogLevel};
use adp_etl::config::Config;
use adp_etl::pipeline::{Pipeline, RunOutcome};
use adp_etl::storage::S3ObjectStore;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "adp-etl")]
#[command(author, version, about = "Incremental ad-impression ingestion pipeline")]
struct Cli {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Override the production table name
    #[arg(long, env = "ADP_TARGET_TABLE")]
    target_table: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::from_env()
        .unwrap_or_default()
        .with_level(log_level)
        .with_file_prefix("adp-etl");
    init_logging(&log_config)?;

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(table) = cli.target_table {
        config.pipeline.target_table = table;
    }

    let schema_body = std::fs::read_to_string(&config.pipeline.schema_file)
        .with_context(|| format!("Failed to read schema file {}", config.pipeline.schema_file))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(
        S3ObjectStore::new(config.storage.clone())
            .await
            .context("Failed to initialize object store")?,
    );

    let pipeline = Pipeline::new(config.pipeline.clone(), pool, store, schema_body);

    match pipeline.run().await {
        Ok(RunOutcome::NoNewData) => {
            info!("No new data; target table left unchanged");
        },
        Ok(RunOutcome::Completed(stats)) => {
            info!(
                objects_new = stats.objects_new,
                files_normalized = stats.files_normalized,
                files_failed = stats.failed_files.len(),
                records_retained = stats.retained_records,
                duplicates_dropped = stats.dropped_duplicates,
                "Pipeline run completed"
            );
        },
        Err(e) => {
            error!(error = %e, "Pipeline run failed");
            std::process::exit(1);
        },
    }

    Ok(())
}
