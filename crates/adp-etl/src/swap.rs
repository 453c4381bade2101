//! Table swap coordinator
//!
//! Writes the deduplicated record set into a staging table and replaces the
//! production table with a three-step rename sequence:
//!
//! 1. `target` -> `target_old`
//! 2. `target_staging` -> `target`
//! 3. drop `target_old`
//!
//! The bulk load completes entirely before the renames start, so a load
//! failure leaves the target untouched. A failure inside the rename sequence
//! is fatal and logged as "table swap in doubt"; [`TableSwapper::reconcile`]
//! resolves whatever a crashed run left behind on the next startup.

use adp_common::{AdpError, Result};
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::db;
use crate::record::ImpressionRecord;

/// Coordinates staged bulk loads and atomic table replacement.
#[derive(Clone)]
pub struct TableSwapper {
    pool: PgPool,
    target: String,
    schema_body: String,
    batch_size: usize,
}

impl TableSwapper {
    pub fn new(
        pool: PgPool,
        target: impl Into<String>,
        schema_body: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            pool,
            target: target.into(),
            schema_body: schema_body.into(),
            batch_size,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn staging_table(&self) -> String {
        format!("{}_staging", self.target)
    }

    fn old_table(&self) -> String {
        format!("{}_old", self.target)
    }

    /// Resolve leftovers of an interrupted swap. Run once at startup.
    ///
    /// - `target_old` present, target missing: the crash happened between the
    ///   two renames. The old generation is restored; the run that crashed
    ///   never reached the ledger, so its files are retried.
    /// - `target_old` and target both present: the crash happened before the
    ///   final drop; the rename to target completed, so the old generation is
    ///   dropped.
    /// - A leftover staging table is always dropped.
    pub async fn reconcile(&self) -> Result<()> {
        let old = self.old_table();
        let staging = self.staging_table();

        let old_exists = db::table_exists(&self.pool, &old).await?;
        if old_exists {
            let target_exists = db::table_exists(&self.pool, &self.target).await?;
            if target_exists {
                warn!(
                    table = %self.target,
                    "Found {} alongside target; previous swap died before its final drop",
                    old
                );
                db::drop_table_if_exists(&self.pool, &old).await?;
            } else {
                warn!(
                    table = %self.target,
                    "Target missing but {} present; restoring previous generation",
                    old
                );
                db::rename_table(&self.pool, &old, &self.target).await?;
            }
        }

        if db::table_exists(&self.pool, &staging).await? {
            warn!(table = %staging, "Dropping leftover staging table");
            db::drop_table_if_exists(&self.pool, &staging).await?;
        }

        Ok(())
    }

    /// Replace the target table's contents with `rows`, all-or-nothing.
    pub async fn atomic_replace(&self, rows: &[ImpressionRecord]) -> Result<()> {
        let staging = self.staging_table();
        let old = self.old_table();

        db::create_table_if_not_exists(&self.pool, &self.target, &self.schema_body).await?;
        db::drop_table_if_exists(&self.pool, &staging).await?;
        db::create_table_if_not_exists(&self.pool, &staging, &self.schema_body).await?;

        info!(
            table = %staging,
            rows = rows.len(),
            batch_size = self.batch_size,
            "Loading staging table"
        );
        if let Err(e) = db::bulk_insert(&self.pool, &staging, rows, self.batch_size).await {
            // Target untouched: the rename sequence never started.
            warn!(table = %staging, error = %e, "Staging load failed; target left intact");
            db::drop_table_if_exists(&self.pool, &staging).await.ok();
            return Err(e);
        }

        // Load is complete and durable; from here every failure is a swap
        // failure that needs operator attention.
        self.rename_step(db::rename_table(&self.pool, &self.target, &old).await, "rename target -> old")?;
        self.rename_step(db::rename_table(&self.pool, &staging, &self.target).await, "rename staging -> target")?;
        self.rename_step(db::drop_table_if_exists(&self.pool, &old).await, "drop old generation")?;

        info!(table = %self.target, rows = rows.len(), "Swapped in new table generation");
        Ok(())
    }

    fn rename_step(&self, result: Result<()>, step: &str) -> Result<()> {
        result.map_err(|e| {
            error!(
                table = %self.target,
                step,
                error = %e,
                "Table swap in doubt: rename sequence failed after a successful load"
            );
            AdpError::Swap(format!("{} failed: {}", step, e))
        })
    }
}
