//! Record normalizer
//!
//! Converts one raw source file (CSV, gzip-compressed CSV, or JSON
//! array-of-records) into a uniform record set with the fixed, lower-cased
//! column schema of [`ImpressionRecord`]. Pure transformation over provided
//! bytes; files can be normalized in parallel with no shared state.
//!
//! A `Schema` or `UnsupportedFormat` error is fatal for the file that raised
//! it only; the orchestrator isolates failures per file.

use adp_common::{AdpError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Read;
use tracing::debug;

use crate::record::{ImpressionRecord, BOOL_COLUMNS, DROP_COLUMNS};

/// Supported source encodings, inferred from the object name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Plain delimited text (`.csv`)
    Csv,
    /// Gzip-compressed delimited text (`.csv.gz`)
    CsvGz,
    /// JSON array of records (`.json`)
    Json,
}

impl SourceFormat {
    /// Infer the format from a file/object name.
    pub fn from_name(name: &str) -> Result<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".csv.gz") {
            Ok(SourceFormat::CsvGz)
        } else if lower.ends_with(".csv") {
            Ok(SourceFormat::Csv)
        } else if lower.ends_with(".json") {
            Ok(SourceFormat::Json)
        } else {
            Err(AdpError::UnsupportedFormat(name.to_string()))
        }
    }
}

/// Normalize one source file into a record set.
///
/// `max_records` caps the number of rows taken from the file (0 = unlimited).
/// Any row that cannot be mapped onto the record schema fails the whole file.
pub fn normalize(name: &str, bytes: &[u8], max_records: usize) -> Result<Vec<ImpressionRecord>> {
    let format = SourceFormat::from_name(name)?;

    let rows = match format {
        SourceFormat::Csv => decode_csv(name, bytes)?,
        SourceFormat::CsvGz => {
            let mut decoder = GzDecoder::new(bytes);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| AdpError::Schema(format!("{}: gzip decode failed: {}", name, e)))?;
            decode_csv(name, &decompressed)?
        },
        SourceFormat::Json => decode_json(name, bytes)?,
    };

    let mut records = Vec::with_capacity(rows.len().min(cap(max_records)));
    for row in rows {
        if max_records > 0 && records.len() >= max_records {
            debug!(file = %name, cap = max_records, "Record cap reached, truncating file");
            break;
        }
        records.push(build_record(name, row)?);
    }

    debug!(file = %name, records = records.len(), "Normalized file");
    Ok(records)
}

fn cap(max_records: usize) -> usize {
    if max_records == 0 {
        usize::MAX
    } else {
        max_records
    }
}

/// One decoded source row: lower-cased column name -> raw value.
type RawRow = BTreeMap<String, Value>;

fn decode_csv(name: &str, bytes: &[u8]) -> Result<Vec<RawRow>> {
    let mut reader = csv::ReaderBuilder::new().from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| AdpError::Schema(format!("{}: unreadable header row: {}", name, e)))?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    let mut seen = HashSet::new();
    for header in &headers {
        if !seen.insert(header.clone()) {
            return Err(AdpError::Schema(format!(
                "{}: duplicate column after lower-casing: {}",
                name, header
            )));
        }
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result
            .map_err(|e| AdpError::Schema(format!("{}: malformed CSV row: {}", name, e)))?;
        let row: RawRow = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), Value::String(v.to_string())))
            .collect();
        rows.push(row);
    }

    Ok(rows)
}

fn decode_json(name: &str, bytes: &[u8]) -> Result<Vec<RawRow>> {
    let objects: Vec<serde_json::Map<String, Value>> = serde_json::from_slice(bytes)
        .map_err(|e| AdpError::Schema(format!("{}: not a JSON array of records: {}", name, e)))?;

    // Rows may carry differing key sets; normalize to the union so the file
    // produces one uniform schema, missing values becoming null.
    let mut all_columns = BTreeSet::new();
    let mut lowered = Vec::with_capacity(objects.len());
    for object in objects {
        let mut row = RawRow::new();
        for (key, value) in object {
            let key = key.trim().to_lowercase();
            if row.insert(key.clone(), value).is_some() {
                return Err(AdpError::Schema(format!(
                    "{}: duplicate column after lower-casing: {}",
                    name, key
                )));
            }
            all_columns.insert(key);
        }
        lowered.push(row);
    }

    for row in &mut lowered {
        for column in &all_columns {
            row.entry(column.clone()).or_insert(Value::Null);
        }
    }

    Ok(lowered)
}

fn build_record(name: &str, mut row: RawRow) -> Result<ImpressionRecord> {
    let time = parse_time(name, take_required(name, &mut row, "time")?)?;
    let orderid = parse_i64(name, "orderid", take_required(name, &mut row, "orderid")?)?;
    let lineitemid = parse_i64(
        name,
        "lineitemid",
        take_required(name, &mut row, "lineitemid")?,
    )?;
    let keypart = match take_required(name, &mut row, "keypart")? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        other => {
            return Err(AdpError::Schema(format!(
                "{}: keypart must be a string, got {}",
                name, other
            )))
        },
    };

    let mut flags = [false; BOOL_COLUMNS.len()];
    for (flag, column) in flags.iter_mut().zip(BOOL_COLUMNS.iter()) {
        *flag = parse_bool(name, column, take_required(name, &mut row, column)?)?;
    }

    let mut extras = BTreeMap::new();
    for (column, value) in row {
        if DROP_COLUMNS.contains(&column.as_str()) {
            continue;
        }
        extras.insert(column, value_to_text(value));
    }

    Ok(ImpressionRecord {
        time,
        orderid,
        lineitemid,
        keypart,
        mobiledevice: flags[0],
        iscompanion: flags[1],
        activevieweligibleimpression: flags[2],
        mobilecapability: flags[3],
        isinterstitial: flags[4],
        anonymous: flags[5],
        extras,
    })
}

fn take_required(name: &str, row: &mut RawRow, column: &str) -> Result<Value> {
    row.remove(column)
        .ok_or_else(|| AdpError::Schema(format!("{}: missing required column: {}", name, column)))
}

fn parse_time(name: &str, value: Value) -> Result<DateTime<Utc>> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M:%S",
    ];

    let text = match value {
        Value::String(s) => s,
        Value::Number(n) => {
            // Numeric timestamps are epoch seconds
            let secs = n.as_i64().ok_or_else(|| {
                AdpError::Schema(format!("{}: non-integer numeric time: {}", name, n))
            })?;
            return Utc
                .timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| AdpError::Schema(format!("{}: time out of range: {}", name, secs)));
        },
        other => {
            return Err(AdpError::Schema(format!(
                "{}: unparsable time value: {}",
                name, other
            )))
        },
    };

    let trimmed = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(AdpError::Schema(format!(
        "{}: unparsable time value: {}",
        name, trimmed
    )))
}

fn parse_i64(name: &str, column: &str, value: Value) -> Result<i64> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| {
            AdpError::Schema(format!("{}: {} is not an integer: {}", name, column, n))
        }),
        Value::String(s) => s.trim().parse().map_err(|_| {
            AdpError::Schema(format!("{}: {} is not an integer: {}", name, column, s))
        }),
        other => Err(AdpError::Schema(format!(
            "{}: {} is not an integer: {}",
            name, column, other
        ))),
    }
}

fn parse_bool(name: &str, column: &str, value: Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(AdpError::Schema(format!(
                "{}: {} is not a boolean: {}",
                name, column, n
            ))),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "t" | "yes" | "y" => Ok(true),
            "0" | "false" | "f" | "no" | "n" => Ok(false),
            other => Err(AdpError::Schema(format!(
                "{}: {} is not a boolean: {}",
                name, column, other
            ))),
        },
        other => Err(AdpError::Schema(format!(
            "{}: {} is not a boolean: {}",
            name, column, other
        ))),
    }
}

fn value_to_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        // Nested structures are kept as compact JSON text
        other => Some(other.to_string()),
    }
}
