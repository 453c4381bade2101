//! Batch merger / deduplicator
//!
//! Merges newly normalized records with the full historical record set and
//! applies the recency-ranked deduplication rule: sort the concatenation by
//! `time` descending (stable), keep the first row seen for each distinct
//! (orderid, lineitemid, keypart) key. The retained record for any key is
//! therefore the one with the globally maximum `time`.

use adp_common::{AdpError, Result};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};

use crate::record::{DedupKey, ImpressionRecord};

/// Result of a merge: the deduplicated set and how many rows were dropped.
#[derive(Debug)]
pub struct MergeOutcome {
    pub records: Vec<ImpressionRecord>,
    pub dropped: usize,
}

/// Merge new records with historical records and deduplicate.
///
/// Both inputs must share one schema; the typed columns are guaranteed by
/// construction, the extras column sets are verified here. A divergence
/// indicates an upstream bug and halts the run before any table mutation.
///
/// Historical data is assumed to be already deduplicated (every successful
/// run leaves it that way); intra-historical duplicates are still collapsed
/// rather than asserted against.
pub fn merge(
    new_records: Vec<ImpressionRecord>,
    historical: Vec<ImpressionRecord>,
) -> Result<MergeOutcome> {
    let new_count = new_records.len();
    let historical_count = historical.len();

    let mut combined = new_records;
    combined.extend(historical);

    check_schema(&combined)?;

    let total = combined.len();

    // Stable sort keeps the relative order of equal timestamps, which makes
    // ties deterministic for a given input order.
    combined.sort_by(|a, b| b.time.cmp(&a.time));

    let mut seen: HashSet<DedupKey> = HashSet::with_capacity(total);
    combined.retain(|record| seen.insert(record.dedup_key()));

    let dropped = total - combined.len();
    info!(
        new = new_count,
        historical = historical_count,
        retained = combined.len(),
        dropped,
        "Merged and deduplicated record sets"
    );

    Ok(MergeOutcome {
        records: combined,
        dropped,
    })
}

/// Every record must carry the same extras column set.
fn check_schema(records: &[ImpressionRecord]) -> Result<()> {
    let Some(first) = records.first() else {
        return Ok(());
    };

    let expected: BTreeSet<&str> = first.extra_columns().collect();
    for record in &records[1..] {
        let columns: BTreeSet<&str> = record.extra_columns().collect();
        if columns != expected {
            debug!(?expected, actual = ?columns, "Extras column sets diverge");
            return Err(AdpError::SchemaMismatch(format!(
                "expected columns [{}], found [{}]",
                join(&expected),
                join(&columns)
            )));
        }
    }
    Ok(())
}

fn join(columns: &BTreeSet<&str>) -> String {
    columns.iter().copied().collect::<Vec<_>>().join(", ")
}
