//! Combine both metric groups into one snapshot.

use crate::metrics::{RelationalMetrics, RelayMetrics, Snapshot};
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("metric group `{0}` is missing")]
    Missing(&'static str),
}

/// The explicit reference instant when one was given, otherwise now.
pub fn generation_time(reference: Option<DateTime<Utc>>) -> DateTime<Utc> {
    reference.unwrap_or_else(Utc::now)
}

/// Both groups are required; an absent group is never replaced by defaults.
pub fn merge(
    generated: DateTime<Utc>,
    relational: Option<RelationalMetrics>,
    relay: Option<RelayMetrics>,
) -> Result<Snapshot, MergeError> {
    Ok(Snapshot {
        generated,
        relational: relational.ok_or(MergeError::Missing("trustroots"))?,
        relay: relay.ok_or(MergeError::Missing("nostroots"))?,
    })
}
