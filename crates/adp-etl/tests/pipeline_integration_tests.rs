//! End-to-end pipeline tests against a containerized Postgres
//!
//! Covers the ledger's file-level idempotency, the atomicity of the staged
//! table swap, and the full ingest -> merge -> swap -> ledger flow with an
//! in-memory object store.

use adp_common::{AdpError, Result as AdpResult};
use adp_etl::config::PipelineConfig;
use adp_etl::db;
use adp_etl::ledger::IngestionLedger;
use adp_etl::pipeline::{Pipeline, RunOutcome};
use adp_etl::record::ImpressionRecord;
use adp_etl::storage::ObjectStore;
use adp_etl::swap::TableSwapper;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,adp_etl=debug")),
        )
        .with_test_writer()
        .try_init();
}

async fn test_pool() -> Result<(ContainerAsync<Postgres>, PgPool)> {
    let container = Postgres::default().with_tag("16-alpine").start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let conn_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&conn_string)
        .await?;

    Ok((container, pool))
}

/// In-memory object store; names in `failing` error on download.
#[derive(Default)]
struct MemoryObjectStore {
    objects: HashMap<String, Vec<u8>>,
    failing: HashSet<String>,
}

impl MemoryObjectStore {
    fn with_object(mut self, name: &str, bytes: Vec<u8>) -> Self {
        self.objects.insert(name.to_string(), bytes);
        self
    }

    fn with_failing(mut self, name: &str) -> Self {
        self.objects.insert(name.to_string(), Vec::new());
        self.failing.insert(name.to_string());
        self
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self) -> AdpResult<Vec<String>> {
        let mut names: Vec<String> = self.objects.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn download(&self, name: &str) -> AdpResult<Vec<u8>> {
        if self.failing.contains(name) {
            return Err(AdpError::Storage(format!("injected failure for {}", name)));
        }
        self.objects
            .get(name)
            .cloned()
            .ok_or_else(|| AdpError::Storage(format!("no such object: {}", name)))
    }
}

/// Column definitions matching what the test source files normalize to:
/// the typed columns plus a single `country` extra.
const SCHEMA_BODY: &str = "time TIMESTAMPTZ NOT NULL,
    orderid BIGINT NOT NULL,
    lineitemid BIGINT NOT NULL,
    keypart TEXT NOT NULL,
    mobiledevice BOOLEAN NOT NULL,
    iscompanion BOOLEAN NOT NULL,
    activevieweligibleimpression BOOLEAN NOT NULL,
    mobilecapability BOOLEAN NOT NULL,
    isinterstitial BOOLEAN NOT NULL,
    anonymous BOOLEAN NOT NULL,
    country TEXT";

/// A record shaped to SCHEMA_BODY, with the given key and time offset.
fn schema_record(orderid: i64, lineitemid: i64, keypart: &str, secs: i64) -> ImpressionRecord {
    use chrono::TimeZone;

    let mut extras = std::collections::BTreeMap::new();
    extras.insert("country".to_string(), Some("GB".to_string()));
    ImpressionRecord {
        time: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        orderid,
        lineitemid,
        keypart: keypart.to_string(),
        mobiledevice: false,
        iscompanion: false,
        activevieweligibleimpression: true,
        mobilecapability: false,
        isinterstitial: false,
        anonymous: false,
        extras,
    }
}

const CSV_HEADER: &str = "Time,OrderId,LineItemId,KeyPart,MobileDevice,IsCompanion,\
    ActiveViewEligibleImpression,MobileCapability,IsInterstitial,Anonymous,Country";

fn csv_file(rows: &[&str]) -> Vec<u8> {
    let mut out = String::from(CSV_HEADER);
    for row in rows {
        out.push('\n');
        out.push_str(row);
    }
    out.into_bytes()
}

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

fn pipeline_config(staging_dir: &str) -> PipelineConfig {
    PipelineConfig {
        target_table: "ad_impressions".to_string(),
        schema_file: String::new(),
        staging_dir: staging_dir.to_string(),
        batch_size: 2,
        download_concurrency: 4,
        max_records_per_file: 0,
    }
}

fn build_pipeline(pool: PgPool, store: Arc<dyn ObjectStore>, staging_dir: &str) -> Pipeline {
    Pipeline::new(
        pipeline_config(staging_dir),
        pool,
        store,
        SCHEMA_BODY.to_string(),
    )
}

async fn count_rows(pool: &PgPool, table: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[tokio::test]
#[serial]
async fn test_ledger_idempotency_and_filtering() -> Result<()> {
    init_tracing();
    let (_container, pool) = test_pool().await?;

    let ledger = IngestionLedger::new(pool.clone());
    ledger.ensure_table().await?;

    assert!(!ledger.has_been_ingested("imps1.csv.gz").await?);

    ledger.mark_ingested("imps1.csv.gz", Utc::now()).await?;
    assert!(ledger.has_been_ingested("imps1.csv.gz").await?);

    // Recording the same filename twice is a logged no-op, not an error
    ledger.mark_ingested("imps1.csv.gz", Utc::now()).await?;

    let listing = vec![
        "imps1.csv.gz".to_string(),
        "imps2.csv".to_string(),
        "imps3.json".to_string(),
    ];
    let delta = ledger.filter_new(&listing).await?;
    assert_eq!(delta, vec!["imps2.csv".to_string(), "imps3.json".to_string()]);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_atomic_replace_loads_and_swaps() -> Result<()> {
    init_tracing();
    let (_container, pool) = test_pool().await?;

    let swapper = TableSwapper::new(pool.clone(), "ad_impressions", SCHEMA_BODY, 2);
    swapper.reconcile().await?;

    let rows: Vec<_> = (0..5)
        .map(|i| schema_record(i, i, "k", i))
        .collect();
    swapper.atomic_replace(&rows).await?;

    assert_eq!(count_rows(&pool, "ad_impressions").await?, 5);
    assert!(!db::table_exists(&pool, "ad_impressions_staging").await?);
    assert!(!db::table_exists(&pool, "ad_impressions_old").await?);

    let read_back = db::read_table(&pool, "ad_impressions").await?;
    assert_eq!(read_back.len(), 5);
    assert!(read_back.iter().any(|r| r.orderid == 4));

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_failed_load_leaves_target_intact() -> Result<()> {
    init_tracing();
    let (_container, pool) = test_pool().await?;

    let swapper = TableSwapper::new(pool.clone(), "ad_impressions", SCHEMA_BODY, 2);

    let original = vec![schema_record(1, 1, "a", 0)];
    swapper.atomic_replace(&original).await?;
    assert_eq!(count_rows(&pool, "ad_impressions").await?, 1);

    // A record whose extras reference a column the table does not have makes
    // the staging load fail before any rename begins.
    let mut poisoned = schema_record(2, 2, "b", 10);
    poisoned
        .extras
        .insert("no_such_column".to_string(), Some("x".to_string()));

    let err = swapper.atomic_replace(&[poisoned]).await.unwrap_err();
    assert!(matches!(err, AdpError::Database(_)));

    // Target untouched and still readable; no stray swap tables remain
    assert_eq!(count_rows(&pool, "ad_impressions").await?, 1);
    let rows = db::read_table(&pool, "ad_impressions").await?;
    assert_eq!(rows[0].orderid, 1);
    assert!(!db::table_exists(&pool, "ad_impressions_staging").await?);
    assert!(!db::table_exists(&pool, "ad_impressions_old").await?);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_reconcile_restores_interrupted_swap() -> Result<()> {
    init_tracing();
    let (_container, pool) = test_pool().await?;

    let swapper = TableSwapper::new(pool.clone(), "ad_impressions", SCHEMA_BODY, 100);
    let rows = vec![schema_record(1, 1, "a", 0)];
    swapper.atomic_replace(&rows).await?;

    // Simulate a crash between the two renames: target gone, old left behind
    db::rename_table(&pool, "ad_impressions", "ad_impressions_old").await?;
    assert!(!db::table_exists(&pool, "ad_impressions").await?);

    swapper.reconcile().await?;
    assert!(db::table_exists(&pool, "ad_impressions").await?);
    assert!(!db::table_exists(&pool, "ad_impressions_old").await?);
    assert_eq!(count_rows(&pool, "ad_impressions").await?, 1);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_reconcile_drops_old_when_swap_died_before_final_drop() -> Result<()> {
    init_tracing();
    let (_container, pool) = test_pool().await?;

    let swapper = TableSwapper::new(pool.clone(), "ad_impressions", SCHEMA_BODY, 100);
    swapper.atomic_replace(&[schema_record(1, 1, "a", 0)]).await?;

    // Simulate a crash after the second rename but before the final drop:
    // the previous generation sits in _old, the new one already owns the
    // target name.
    db::rename_table(&pool, "ad_impressions", "ad_impressions_old").await?;
    db::create_table_if_not_exists(&pool, "ad_impressions", SCHEMA_BODY).await?;
    db::bulk_insert(&pool, "ad_impressions", &[schema_record(2, 2, "b", 10)], 100).await?;

    swapper.reconcile().await?;

    // The old generation is gone and the target kept the new rows
    assert!(!db::table_exists(&pool, "ad_impressions_old").await?);
    let rows = db::read_table(&pool, "ad_impressions").await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].orderid, 2);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_end_to_end_overlap_keeps_freshest_record() -> Result<()> {
    init_tracing();
    let (_container, pool) = test_pool().await?;
    let staging = tempfile::tempdir()?;

    // Same (orderid, lineitemid, keypart) in both files, t1 < t2
    let file1 = csv_file(&[
        "2024-03-01 10:00:00,7,11,abc,1,0,1,0,0,1,GB",
        "2024-03-01 10:05:00,8,12,def,0,0,1,0,0,0,DE",
    ]);
    let file2 = csv_file(&[
        "2024-03-01 12:00:00,7,11,abc,1,0,1,0,0,1,FR",
        "2024-03-01 12:05:00,9,13,ghi,0,1,0,1,1,0,ES",
    ]);

    let store = Arc::new(
        MemoryObjectStore::default()
            .with_object("imps1.csv.gz", gzip(&file1))
            .with_object("imps2.csv", file2),
    );

    // A dedicated ledger table, injected so both runs share it
    let ledger = IngestionLedger::with_table(pool.clone(), "ad_impressions_ledger");
    let pipeline = build_pipeline(
        pool.clone(),
        store.clone(),
        staging.path().to_str().unwrap(),
    )
    .with_ledger(ledger.clone());

    let outcome = pipeline.run().await?;
    let RunOutcome::Completed(stats) = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(stats.objects_new, 2);
    assert_eq!(stats.files_normalized, 2);
    assert_eq!(stats.new_records, 4);
    assert_eq!(stats.retained_records, 3);
    assert_eq!(stats.dropped_duplicates, 1);

    // The overlapping key kept the t2 row (country FR)
    let rows = db::read_table(&pool, "ad_impressions").await?;
    assert_eq!(rows.len(), 3);
    let overlap: Vec<_> = rows
        .iter()
        .filter(|r| r.orderid == 7 && r.lineitemid == 11 && r.keypart == "abc")
        .collect();
    assert_eq!(overlap.len(), 1);
    assert_eq!(overlap[0].time.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    assert_eq!(
        overlap[0].extras.get("country"),
        Some(&Some("FR".to_string()))
    );

    // Both files landed in the injected ledger table, not the default one
    assert!(ledger.has_been_ingested("imps1.csv.gz").await?);
    assert!(ledger.has_been_ingested("imps2.csv").await?);
    assert_eq!(count_rows(&pool, "ad_impressions_ledger").await?, 2);
    assert!(!db::table_exists(&pool, "ingested_files").await?);

    // Second run against the same ledger table: NoNewData, nothing changes
    let pipeline = build_pipeline(pool.clone(), store, staging.path().to_str().unwrap())
        .with_ledger(ledger);
    let outcome = pipeline.run().await?;
    assert!(matches!(outcome, RunOutcome::NoNewData));
    assert_eq!(count_rows(&pool, "ad_impressions").await?, 3);
    assert_eq!(count_rows(&pool, "ad_impressions_ledger").await?, 2);

    Ok(())
}

#[tokio::test]
#[serial]
async fn test_per_file_failure_isolation() -> Result<()> {
    init_tracing();
    let (_container, pool) = test_pool().await?;
    let staging = tempfile::tempdir()?;

    let good = csv_file(&["2024-03-01 10:00:00,1,1,a,1,0,1,0,0,1,GB"]);
    let bad = csv_file(&["2024-03-01 10:00:00,2,2,b,invalid,0,1,0,0,1,DE"]);

    let store = Arc::new(
        MemoryObjectStore::default()
            .with_object("good.csv", good)
            .with_object("bad.csv", bad)
            .with_failing("unreachable.csv"),
    );

    let pipeline = build_pipeline(pool.clone(), store, staging.path().to_str().unwrap());
    let outcome = pipeline.run().await?;

    let RunOutcome::Completed(stats) = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(stats.objects_new, 3);
    assert_eq!(stats.files_normalized, 1);
    assert_eq!(stats.failed_files.len(), 2);
    assert_eq!(stats.retained_records, 1);

    // Only the good file reached the table and the ledger; the failed ones
    // stay un-ingested and will be retried by a later run's delta
    let ledger = IngestionLedger::new(pool.clone());
    assert!(ledger.has_been_ingested("good.csv").await?);
    assert!(!ledger.has_been_ingested("bad.csv").await?);
    assert!(!ledger.has_been_ingested("unreachable.csv").await?);

    let listing = vec![
        "good.csv".to_string(),
        "bad.csv".to_string(),
        "unreachable.csv".to_string(),
    ];
    let delta = ledger.filter_new(&listing).await?;
    assert_eq!(
        delta,
        vec!["bad.csv".to_string(), "unreachable.csv".to_string()]
    );

    Ok(())
}
