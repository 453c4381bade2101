//! ADP ETL - incremental ad-impression ingestion pipeline
//!
//! Batch pipeline that discovers new impression files in an object-storage
//! bucket, normalizes them into a fixed record schema, deduplicates them
//! against the full table history (last writer wins on the dedup key), and
//! atomically swaps the deduplicated result into the production table.
//!
//! # Pipeline stages
//!
//! 1. **Discovering** - list bucket objects, subtract ledger-known filenames
//! 2. **Downloading** - bounded parallel fan-out, per-object failure isolation
//! 3. **Normalizing** - parallel per-file parse into [`record::ImpressionRecord`]
//! 4. **Merging** - concat with history, sort by `time` desc, keep first per key
//! 5. **Swapping** - staged bulk load + rename-based atomic table replacement
//! 6. **RecordingLedger** - mark source files ingested only after swap success
//!
//! # Example
//!
//! ```no_run
//! use adp_etl::{config::Config, pipeline::Pipeline, storage::S3ObjectStore};
//! use sqlx::postgres::PgPoolOptions;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = PgPoolOptions::new().connect(&config.database.url).await?;
//!     let store = Arc::new(S3ObjectStore::new(config.storage.clone()).await?);
//!     let schema = std::fs::read_to_string(&config.pipeline.schema_file)?;
//!     let outcome = Pipeline::new(config.pipeline.clone(), pool, store, schema)
//!         .run()
//!         .await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod ledger;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod record;
pub mod storage;
pub mod swap;

pub use adp_common::{AdpError, Result};
