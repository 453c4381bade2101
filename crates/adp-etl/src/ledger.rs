//! Ingestion ledger
//!
//! Durable record of which source filenames have already been ingested.
//! A filename in the ledger is never re-downloaded or re-merged; this gives
//! file-level idempotency for incremental runs. Files are recorded only
//! after the swap succeeded, so a name in the ledger implies its data is
//! durably visible in the target table.

use adp_common::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::db::{db_err, validate_ident};

/// Default ledger table name.
pub const DEFAULT_LEDGER_TABLE: &str = "ingested_files";

/// Tracks ingested source files in a Postgres table.
#[derive(Clone)]
pub struct IngestionLedger {
    pool: PgPool,
    table: String,
}

impl IngestionLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }

    /// Use a non-default ledger table (tests, side-by-side pipelines).
    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    pub async fn ensure_table(&self) -> Result<()> {
        let table = validate_ident(&self.table)?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                filename TEXT PRIMARY KEY,
                ingested_at TIMESTAMPTZ NOT NULL
            )",
            table
        );
        sqlx::query(&sql).execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    pub async fn has_been_ingested(&self, filename: &str) -> Result<bool> {
        let table = validate_ident(&self.table)?;
        let sql = format!("SELECT EXISTS (SELECT 1 FROM {} WHERE filename = $1)", table);
        let exists: bool = sqlx::query_scalar(&sql)
            .bind(filename)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(exists)
    }

    /// Record a filename as ingested. Idempotent: recording the same name
    /// twice is logged and ignored, never an error.
    pub async fn mark_ingested(&self, filename: &str, ingested_at: DateTime<Utc>) -> Result<()> {
        let table = validate_ident(&self.table)?;
        let sql = format!(
            "INSERT INTO {} (filename, ingested_at) VALUES ($1, $2)
             ON CONFLICT (filename) DO NOTHING",
            table
        );
        let result = sqlx::query(&sql)
            .bind(filename)
            .bind(ingested_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            debug!(filename, "Filename already present in ledger");
        } else {
            info!(filename, "Recorded file in ingestion ledger");
        }
        Ok(())
    }

    /// Subtract ledger-known filenames from an object listing, preserving
    /// the listing's order.
    pub async fn filter_new(&self, names: &[String]) -> Result<Vec<String>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let table = validate_ident(&self.table)?;
        let sql = format!("SELECT filename FROM {} WHERE filename = ANY($1)", table);
        let known: Vec<String> = sqlx::query_scalar(&sql)
            .bind(names)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let known: std::collections::HashSet<&str> = known.iter().map(String::as_str).collect();
        Ok(names
            .iter()
            .filter(|name| !known.contains(name.as_str()))
            .cloned()
            .collect())
    }
}
