//! Pipeline orchestrator
//!
//! Sequences one batch run: discover new objects, download them with a
//! bounded fan-out, normalize each file in parallel, merge with the table
//! history, swap the deduplicated result in atomically, then record the
//! ingested filenames. Each stage materializes its complete output before
//! the next begins; there is no streaming between stages.
//!
//! Failure discipline: a download or normalization failure is isolated to
//! its file (the file is skipped and, because it never reaches the ledger,
//! retried on a later run). Schema mismatches and swap failures abort the
//! run before or during table mutation respectively.

use adp_common::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::db;
use crate::ledger::IngestionLedger;
use crate::merge;
use crate::normalize;
use crate::record::ImpressionRecord;
use crate::storage::ObjectStore;
use crate::swap::TableSwapper;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovering,
    Downloading,
    Normalizing,
    Merging,
    Swapping,
    RecordingLedger,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovering => "discovering",
            Stage::Downloading => "downloading",
            Stage::Normalizing => "normalizing",
            Stage::Merging => "merging",
            Stage::Swapping => "swapping",
            Stage::RecordingLedger => "recording_ledger",
        }
    }
}

/// A file excluded from the run, with the reason it was skipped.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub name: String,
    pub reason: String,
}

/// Counters for one completed run.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub objects_listed: usize,
    pub objects_new: usize,
    pub objects_downloaded: usize,
    pub files_normalized: usize,
    pub failed_files: Vec<FileFailure>,
    pub new_records: usize,
    pub historical_records: usize,
    pub retained_records: usize,
    pub dropped_duplicates: usize,
}

/// Terminal outcome of a run. Fatal errors surface as `Err` instead.
#[derive(Debug)]
pub enum RunOutcome {
    /// The object listing held nothing new; not an error.
    NoNewData,
    /// The run went through to ledger recording (possibly with some files
    /// skipped, listed in the stats).
    Completed(RunStats),
}

/// One-shot batch pipeline over an object store and a Postgres database.
pub struct Pipeline {
    config: PipelineConfig,
    pool: PgPool,
    store: Arc<dyn ObjectStore>,
    ledger: IngestionLedger,
    swapper: TableSwapper,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        pool: PgPool,
        store: Arc<dyn ObjectStore>,
        schema_body: String,
    ) -> Self {
        let ledger = IngestionLedger::new(pool.clone());
        let swapper = TableSwapper::new(
            pool.clone(),
            config.target_table.clone(),
            schema_body,
            config.batch_size,
        );
        Self {
            config,
            pool,
            store,
            ledger,
            swapper,
        }
    }

    /// Use a non-default ledger table (tests, side-by-side pipelines).
    pub fn with_ledger(mut self, ledger: IngestionLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// Execute one full run.
    pub async fn run(&self) -> Result<RunOutcome> {
        let mut stats = RunStats::default();

        self.ledger.ensure_table().await?;
        self.swapper.reconcile().await?;

        // -- Discovering
        let stage_start = Instant::now();
        let listed = self.store.list().await?;
        let new_names = self.ledger.filter_new(&listed).await?;
        stats.objects_listed = listed.len();
        stats.objects_new = new_names.len();
        info!(
            stage = Stage::Discovering.as_str(),
            listed = stats.objects_listed,
            new = stats.objects_new,
            elapsed_ms = stage_start.elapsed().as_millis() as u64,
            "Computed ingestion delta"
        );

        if new_names.is_empty() {
            info!("No new source objects; nothing to ingest");
            return Ok(RunOutcome::NoNewData);
        }

        // -- Downloading
        let stage_start = Instant::now();
        let downloaded = self.download_all(&new_names, &mut stats).await?;
        stats.objects_downloaded = downloaded.len();
        info!(
            stage = Stage::Downloading.as_str(),
            downloaded = stats.objects_downloaded,
            failed = stats.failed_files.len(),
            elapsed_ms = stage_start.elapsed().as_millis() as u64,
            "Download fan-out complete"
        );

        // -- Normalizing
        let stage_start = Instant::now();
        let (ingested_names, new_records) = self.normalize_all(downloaded, &mut stats).await;
        stats.files_normalized = ingested_names.len();
        stats.new_records = new_records.len();
        info!(
            stage = Stage::Normalizing.as_str(),
            files = stats.files_normalized,
            records = stats.new_records,
            failed = stats.failed_files.len(),
            elapsed_ms = stage_start.elapsed().as_millis() as u64,
            "Normalization complete"
        );

        if ingested_names.is_empty() {
            warn!("Every downloaded file failed; nothing to merge this run");
            return Ok(RunOutcome::Completed(stats));
        }

        // -- Merging
        let stage_start = Instant::now();
        let historical = if db::table_exists(&self.pool, self.swapper.target()).await? {
            db::read_table(&self.pool, self.swapper.target()).await?
        } else {
            Vec::new()
        };
        stats.historical_records = historical.len();

        let outcome = merge::merge(new_records, historical)?;
        stats.retained_records = outcome.records.len();
        stats.dropped_duplicates = outcome.dropped;
        info!(
            stage = Stage::Merging.as_str(),
            retained = stats.retained_records,
            dropped = stats.dropped_duplicates,
            elapsed_ms = stage_start.elapsed().as_millis() as u64,
            "Merge complete"
        );

        // -- Swapping
        let stage_start = Instant::now();
        self.swapper.atomic_replace(&outcome.records).await?;
        info!(
            stage = Stage::Swapping.as_str(),
            elapsed_ms = stage_start.elapsed().as_millis() as u64,
            "Swap complete"
        );

        // -- RecordingLedger: only files whose data is now durably visible.
        let now = Utc::now();
        for name in &ingested_names {
            self.ledger.mark_ingested(name, now).await?;
        }
        info!(
            stage = Stage::RecordingLedger.as_str(),
            files = ingested_names.len(),
            "Run complete"
        );

        Ok(RunOutcome::Completed(stats))
    }

    /// Bounded parallel download. Per-object failures are logged and the
    /// object excluded; a later run retries it since it never reaches the
    /// ledger.
    async fn download_all(
        &self,
        names: &[String],
        stats: &mut RunStats,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        tokio::fs::create_dir_all(&self.config.staging_dir).await?;

        let results: Vec<(String, Result<Vec<u8>>)> = stream::iter(names.to_vec())
            .map(|name| {
                let store = Arc::clone(&self.store);
                async move {
                    let result = store.download(&name).await;
                    (name, result)
                }
            })
            .buffer_unordered(self.config.download_concurrency)
            .collect()
            .await;

        let mut downloaded = Vec::with_capacity(results.len());
        for (name, result) in results {
            match result {
                Ok(bytes) => {
                    self.stage_to_disk(&name, &bytes).await;
                    downloaded.push((name, bytes));
                },
                Err(e) => {
                    warn!(object = %name, error = %e, "Download failed; object skipped this run");
                    stats.failed_files.push(FileFailure {
                        name,
                        reason: e.to_string(),
                    });
                },
            }
        }
        Ok(downloaded)
    }

    /// Keep a copy of each downloaded object on disk for operator
    /// inspection. Failure to write the copy does not fail the object.
    async fn stage_to_disk(&self, name: &str, bytes: &[u8]) {
        let Some(file_name) = Path::new(name).file_name() else {
            return;
        };
        let path = Path::new(&self.config.staging_dir).join(file_name);
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            warn!(object = %name, path = %path.display(), error = %e, "Could not stage object to disk");
        }
    }

    /// Parallel per-file normalization with per-item error isolation.
    async fn normalize_all(
        &self,
        downloaded: Vec<(String, Vec<u8>)>,
        stats: &mut RunStats,
    ) -> (Vec<String>, Vec<ImpressionRecord>) {
        let cap = self.config.max_records_per_file;

        let mut handles = Vec::with_capacity(downloaded.len());
        for (name, bytes) in downloaded {
            let task_name = name.clone();
            let handle = tokio::task::spawn_blocking(move || {
                normalize::normalize(&task_name, &bytes, cap)
            });
            handles.push((name, handle));
        }

        let mut ingested_names = Vec::new();
        let mut records = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(file_records)) => {
                    records.extend(file_records);
                    ingested_names.push(name);
                },
                Ok(Err(e)) => {
                    warn!(file = %name, error = %e, "Normalization failed; file skipped this run");
                    stats.failed_files.push(FileFailure {
                        name,
                        reason: e.to_string(),
                    });
                },
                Err(e) => {
                    warn!(file = %name, error = %e, "Normalization task panicked; file skipped");
                    stats.failed_files.push(FileFailure {
                        name,
                        reason: format!("normalization task failed: {}", e),
                    });
                },
            }
        }

        (ingested_names, records)
    }
}
