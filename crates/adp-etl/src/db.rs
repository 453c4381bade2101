//! Relational store plumbing
//!
//! Dynamic (non-macro) sqlx helpers over Postgres. The impression table's
//! column set is supplied externally as a SQL artifact, so queries are built
//! at runtime from the record schema rather than compile-time checked.

use adp_common::{AdpError, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, QueryBuilder, Row, TypeInfo};
use tracing::{debug, info};

use crate::record::{column_names, ImpressionRecord, TYPED_COLUMNS};

/// Postgres caps binds per statement at 65535; stay under it.
const MAX_BINDS_PER_STATEMENT: usize = 65_000;

pub(crate) fn db_err(e: sqlx::Error) -> AdpError {
    AdpError::Database(e.to_string())
}

/// Reject identifiers that cannot be safely interpolated into SQL.
pub fn validate_ident(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        },
        _ => false,
    };
    if valid {
        Ok(name)
    } else {
        Err(AdpError::Database(format!("invalid table name: {}", name)))
    }
}

pub async fn table_exists(pool: &PgPool, table: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = 'public' AND table_name = $1
        )",
    )
    .bind(table)
    .fetch_one(pool)
    .await
    .map_err(db_err)?;
    Ok(exists)
}

/// Create `table` from the externally supplied column-definition body.
pub async fn create_table_if_not_exists(pool: &PgPool, table: &str, schema_body: &str) -> Result<()> {
    let table = validate_ident(table)?;
    let sql = format!("CREATE TABLE IF NOT EXISTS {} ({})", table, schema_body);
    sqlx::query(&sql).execute(pool).await.map_err(db_err)?;
    debug!(table, "Ensured table exists");
    Ok(())
}

pub async fn drop_table_if_exists(pool: &PgPool, table: &str) -> Result<()> {
    let table = validate_ident(table)?;
    let sql = format!("DROP TABLE IF EXISTS {}", table);
    sqlx::query(&sql).execute(pool).await.map_err(db_err)?;
    debug!(table, "Dropped table if it existed");
    Ok(())
}

pub async fn rename_table(pool: &PgPool, from: &str, to: &str) -> Result<()> {
    let from = validate_ident(from)?;
    let to = validate_ident(to)?;
    let sql = format!("ALTER TABLE {} RENAME TO {}", from, to);
    sqlx::query(&sql).execute(pool).await.map_err(db_err)?;
    debug!(from, to, "Renamed table");
    Ok(())
}

/// Read the full table back into records.
///
/// Typed columns decode to their struct fields; every other column decodes
/// to text in `extras`, matching what the normalizer produces.
pub async fn read_table(pool: &PgPool, table: &str) -> Result<Vec<ImpressionRecord>> {
    let table = validate_ident(table)?;
    let sql = format!("SELECT * FROM {}", table);
    let rows = sqlx::query(&sql).fetch_all(pool).await.map_err(db_err)?;

    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        records.push(decode_row(row)?);
    }

    info!(table, records = records.len(), "Read historical table");
    Ok(records)
}

fn decode_row(row: &PgRow) -> Result<ImpressionRecord> {
    let mut record = ImpressionRecord {
        time: DateTime::<Utc>::MIN_UTC,
        orderid: 0,
        lineitemid: 0,
        keypart: String::new(),
        mobiledevice: false,
        iscompanion: false,
        activevieweligibleimpression: false,
        mobilecapability: false,
        isinterstitial: false,
        anonymous: false,
        extras: Default::default(),
    };

    for (i, column) in row.columns().iter().enumerate() {
        match column.name() {
            "time" => record.time = row.try_get(i).map_err(db_err)?,
            "orderid" => record.orderid = row.try_get(i).map_err(db_err)?,
            "lineitemid" => record.lineitemid = row.try_get(i).map_err(db_err)?,
            "keypart" => record.keypart = row.try_get(i).map_err(db_err)?,
            "mobiledevice" => record.mobiledevice = row.try_get(i).map_err(db_err)?,
            "iscompanion" => record.iscompanion = row.try_get(i).map_err(db_err)?,
            "activevieweligibleimpression" => {
                record.activevieweligibleimpression = row.try_get(i).map_err(db_err)?
            },
            "mobilecapability" => record.mobilecapability = row.try_get(i).map_err(db_err)?,
            "isinterstitial" => record.isinterstitial = row.try_get(i).map_err(db_err)?,
            "anonymous" => record.anonymous = row.try_get(i).map_err(db_err)?,
            name => {
                let value = decode_extra(row, i, column.type_info().name())?;
                record.extras.insert(name.to_string(), value);
            },
        }
    }

    Ok(record)
}

fn decode_extra(row: &PgRow, i: usize, type_name: &str) -> Result<Option<String>> {
    let value = match type_name {
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => row.try_get::<Option<String>, _>(i).map_err(db_err)?,
        "INT2" => row
            .try_get::<Option<i16>, _>(i)
            .map_err(db_err)?
            .map(|v| v.to_string()),
        "INT4" => row
            .try_get::<Option<i32>, _>(i)
            .map_err(db_err)?
            .map(|v| v.to_string()),
        "INT8" => row
            .try_get::<Option<i64>, _>(i)
            .map_err(db_err)?
            .map(|v| v.to_string()),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(i)
            .map_err(db_err)?
            .map(|v| v.to_string()),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(i)
            .map_err(db_err)?
            .map(|v| v.to_string()),
        "BOOL" => row
            .try_get::<Option<bool>, _>(i)
            .map_err(db_err)?
            .map(|v| v.to_string()),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(i)
            .map_err(db_err)?
            .map(|v| v.to_rfc3339()),
        other => {
            return Err(AdpError::Database(format!(
                "unsupported column type {} in impression table",
                other
            )))
        },
    };
    Ok(value)
}

/// Bulk-load records in bounded-size multi-row INSERT statements.
///
/// Column list = typed columns + the extras of the record set. The effective
/// chunk size is clamped so a statement never exceeds the Postgres bind
/// limit.
pub async fn bulk_insert(
    pool: &PgPool,
    table: &str,
    records: &[ImpressionRecord],
    batch_size: usize,
) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }

    let table = validate_ident(table)?;
    let columns = column_names(records);
    let chunk_size = batch_size
        .max(1)
        .min(MAX_BINDS_PER_STATEMENT / columns.len().max(1))
        .max(1);

    let insert_prefix = format!("INSERT INTO {} ({}) ", table, columns.join(", "));
    let extras: Vec<&String> = columns.iter().skip(TYPED_COLUMNS.len()).collect();

    let total_chunks = records.len().div_ceil(chunk_size);
    for (chunk_index, chunk) in records.chunks(chunk_size).enumerate() {
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(&insert_prefix);
        builder.push_values(chunk, |mut b, record| {
            b.push_bind(record.time)
                .push_bind(record.orderid)
                .push_bind(record.lineitemid)
                .push_bind(record.keypart.clone())
                .push_bind(record.mobiledevice)
                .push_bind(record.iscompanion)
                .push_bind(record.activevieweligibleimpression)
                .push_bind(record.mobilecapability)
                .push_bind(record.isinterstitial)
                .push_bind(record.anonymous);
            for column in &extras {
                b.push_bind(record.extras.get(*column).cloned().flatten());
            }
        });

        builder.build().execute(pool).await.map_err(db_err)?;
        debug!(
            table,
            chunk = chunk_index + 1,
            chunks = total_chunks,
            rows = chunk.len(),
            "Wrote bulk-insert chunk"
        );
    }

    info!(table, rows = records.len(), "Bulk load complete");
    Ok(())
}
