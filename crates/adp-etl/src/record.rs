//! Normalized impression record types
//!
//! The pipeline works over a statically declared schema: the columns the
//! dedup and swap logic depends on are typed struct fields, every remaining
//! source column is preserved as text in `extras`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The six flag columns coerced to strict booleans during normalization.
pub const BOOL_COLUMNS: [&str; 6] = [
    "mobiledevice",
    "iscompanion",
    "activevieweligibleimpression",
    "mobilecapability",
    "isinterstitial",
    "anonymous",
];

/// Columns dropped during normalization (absence in the source is fine).
pub const DROP_COLUMNS: [&str; 3] = ["domain", "audiencesegmentids", "publisherprovidedid"];

/// Typed columns, in the order they appear in bulk inserts.
pub const TYPED_COLUMNS: [&str; 10] = [
    "time",
    "orderid",
    "lineitemid",
    "keypart",
    "mobiledevice",
    "iscompanion",
    "activevieweligibleimpression",
    "mobilecapability",
    "isinterstitial",
    "anonymous",
];

/// One normalized ad-impression event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpressionRecord {
    /// Event timestamp, parsed from the source `Time` column
    pub time: DateTime<Utc>,
    pub orderid: i64,
    pub lineitemid: i64,
    pub keypart: String,
    pub mobiledevice: bool,
    pub iscompanion: bool,
    pub activevieweligibleimpression: bool,
    pub mobilecapability: bool,
    pub isinterstitial: bool,
    pub anonymous: bool,
    /// Remaining source columns, lower-cased, preserved as text.
    /// BTreeMap keeps the column order deterministic for inserts.
    pub extras: BTreeMap<String, Option<String>>,
}

/// Composite business key used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub orderid: i64,
    pub lineitemid: i64,
    pub keypart: String,
}

impl ImpressionRecord {
    /// The (orderid, lineitemid, keypart) dedup key of this record.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            orderid: self.orderid,
            lineitemid: self.lineitemid,
            keypart: self.keypart.clone(),
        }
    }

    /// Names of the extra columns carried by this record.
    pub fn extra_columns(&self) -> impl Iterator<Item = &str> {
        self.extras.keys().map(String::as_str)
    }
}

/// Full column list for a record set: typed columns followed by the extras
/// of the first record. All records in a set share one schema; the merge
/// step enforces this before any table mutation.
pub fn column_names(records: &[ImpressionRecord]) -> Vec<String> {
    let mut columns: Vec<String> = TYPED_COLUMNS.iter().map(|c| c.to_string()).collect();
    if let Some(first) = records.first() {
        columns.extend(first.extras.keys().cloned());
    }
    columns
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod test_support {
    use super::*;
    use chrono::TimeZone;

    /// Build a record with the given key and time; extras default to a
    /// single `country` column so schema checks have something to compare.
    pub fn record(orderid: i64, lineitemid: i64, keypart: &str, secs: i64) -> ImpressionRecord {
        let mut extras = BTreeMap::new();
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
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::test_support::record;
    use super::*;

    #[test]
    fn test_dedup_key_equality() {
        let a = record(1, 2, "k", 0);
        let b = record(1, 2, "k", 50);
        let c = record(1, 3, "k", 0);
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_ne!(a.dedup_key(), c.dedup_key());
    }

    #[test]
    fn test_column_names_include_extras() {
        let records = vec![record(1, 2, "k", 0)];
        let columns = column_names(&records);
        assert_eq!(columns.len(), TYPED_COLUMNS.len() + 1);
        assert_eq!(columns[0], "time");
        assert_eq!(columns.last().map(String::as_str), Some("country"));
    }

    #[test]
    fn test_column_names_empty_set() {
        let columns = column_names(&[]);
        assert_eq!(columns.len(), TYPED_COLUMNS.len());
    }
}
