//! Configuration management
//!
//! One explicit configuration struct, built once at startup and passed by
//! value into component constructors. No ambient globals.

use serde::{Deserialize, Serialize};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/adp";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default production table name.
pub const DEFAULT_TARGET_TABLE: &str = "ad_impressions";

/// Default path to the table schema artifact (column definitions).
pub const DEFAULT_SCHEMA_FILE: &str = "table_definition.sql";

/// Default directory downloaded objects are staged into.
pub const DEFAULT_STAGING_DIR: &str = "./downloaded";

/// Default rows per bulk-insert statement.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default number of concurrent object downloads.
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 10;

/// Default per-file record cap (0 = unlimited).
pub const DEFAULT_MAX_RECORDS_PER_FILE: usize = 20_000;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Object-storage configuration (S3-compatible endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

/// Pipeline tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Production table the deduplicated result lands in
    pub target_table: String,
    /// Path to the SQL artifact holding the table column definitions
    pub schema_file: String,
    /// Local directory downloaded objects are written to
    pub staging_dir: String,
    /// Rows per bulk-insert statement during the staged load
    pub batch_size: usize,
    /// Concurrent object downloads
    pub download_concurrency: usize,
    /// Per-file record cap applied during normalization (0 = unlimited)
    pub max_records_per_file: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_table: DEFAULT_TARGET_TABLE.to_string(),
            schema_file: DEFAULT_SCHEMA_FILE.to_string(),
            staging_dir: DEFAULT_STAGING_DIR.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            max_records_per_file: DEFAULT_MAX_RECORDS_PER_FILE,
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: std::env::var("S3_ENDPOINT").ok(),
            region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            bucket: std::env::var("S3_BUCKET").unwrap_or_else(|_| "ad-impressions".to_string()),
            access_key: std::env::var("S3_ACCESS_KEY")
                .or_else(|_| std::env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            secret_key: std::env::var("S3_SECRET_KEY")
                .or_else(|_| std::env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            path_style: std::env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
            },
            storage: StorageConfig::from_env()?,
            pipeline: PipelineConfig {
                target_table: std::env::var("ADP_TARGET_TABLE")
                    .unwrap_or_else(|_| DEFAULT_TARGET_TABLE.to_string()),
                schema_file: std::env::var("ADP_SCHEMA_FILE")
                    .unwrap_or_else(|_| DEFAULT_SCHEMA_FILE.to_string()),
                staging_dir: std::env::var("ADP_STAGING_DIR")
                    .unwrap_or_else(|_| DEFAULT_STAGING_DIR.to_string()),
                batch_size: std::env::var("ADP_BATCH_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_BATCH_SIZE),
                download_concurrency: std::env::var("ADP_DOWNLOAD_CONCURRENCY")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DOWNLOAD_CONCURRENCY),
                max_records_per_file: std::env::var("ADP_MAX_RECORDS_PER_FILE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_MAX_RECORDS_PER_FILE),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.storage.bucket.is_empty() {
            anyhow::bail!("Storage bucket cannot be empty");
        }

        if self.pipeline.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }

        if self.pipeline.download_concurrency == 0 {
            anyhow::bail!("Download concurrency must be greater than 0");
        }

        if self.pipeline.target_table.is_empty() {
            anyhow::bail!("Target table name cannot be empty");
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            },
            storage: StorageConfig {
                endpoint: None,
                region: "us-east-1".to_string(),
                bucket: "ad-impressions".to_string(),
                access_key: "k".to_string(),
                secret_key: "s".to_string(),
                path_style: false,
            },
            pipeline: PipelineConfig::default(),
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_pipeline_defaults() {
        let p = PipelineConfig::default();
        assert_eq!(p.batch_size, 1000);
        assert_eq!(p.download_concurrency, 10);
        assert_eq!(p.max_records_per_file, 20_000);
        assert_eq!(p.target_table, "ad_impressions");
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = base_config();
        config.pipeline.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = base_config();
        config.pipeline.download_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_database_url_rejected() {
        let mut config = base_config();
        config.database.url = String::new();
        assert!(config.validate().is_err());
    }
}
