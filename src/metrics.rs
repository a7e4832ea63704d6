//! Snapshot data model.
//!
//! Field names here are the wire contract with the dashboard and must stay
//! stable: every per-day record serializes flat as `{"date": "...", ...}`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// One value for one day bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyMetric<T> {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub value: T,
}

impl<T> DailyMetric<T> {
    pub fn new(date: NaiveDate, value: T) -> Self {
        Self { date, value }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCount {
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewTally {
    pub positive: u64,
    pub negative: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub upvotes: u64,
    pub downvotes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTime {
    /// Average time to first reply, milliseconds (truncated).
    pub avg_ms: i64,
}

pub type DailyCount = DailyMetric<MessageCount>;
pub type DailyReview = DailyMetric<ReviewTally>;
pub type DailyVote = DailyMetric<VoteTally>;
pub type DailyTime = DailyMetric<ReplyTime>;
pub type DailyNotes = DailyMetric<KindCounts>;

/// Event counts per Nostr kind, serialized as `kind<N>` fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindCounts(BTreeMap<u16, u64>);

impl KindCounts {
    /// All tracked kinds present with a zero count.
    pub fn zeroed(kinds: &[u16]) -> Self {
        Self(kinds.iter().map(|k| (*k, 0)).collect())
    }

    /// Increment `kind` if it is tracked. Returns whether it was.
    pub fn bump(&mut self, kind: u16) -> bool {
        match self.0.get_mut(&kind) {
            Some(count) => {
                *count += 1;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, kind: u16) -> u64 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, u64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }
}

impl Serialize for KindCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (kind, count) in &self.0 {
            map.serialize_entry(&format!("kind{kind}"), count)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for KindCounts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KindVisitor;

        impl<'de> Visitor<'de> for KindVisitor {
            type Value = KindCounts;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of kind<N> counts")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut counts = BTreeMap::new();
                while let Some(key) = access.next_key::<String>()? {
                    let kind = key
                        .strip_prefix("kind")
                        .and_then(|k| k.parse::<u16>().ok())
                        .ok_or_else(|| de::Error::custom(format!("unexpected field `{key}`")))?;
                    counts.insert(kind, access.next_value::<u64>()?);
                }
                Ok(KindCounts(counts))
            }
        }

        deserializer.deserialize_map(KindVisitor)
    }
}

/// Metrics derived from the community document store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationalMetrics {
    pub messages_per_day: Vec<DailyCount>,
    pub reviews_per_day: Vec<DailyReview>,
    pub thread_votes_per_day: Vec<DailyVote>,
    pub time_to_first_reply_per_day: Vec<DailyTime>,
}

/// Metrics derived from Nostr relays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMetrics {
    /// Users whose stored npub decodes.
    pub users_with_npubs: usize,
    /// Distinct authors of in-window events.
    pub active_posters: usize,
    pub notes_by_kind_per_day: Vec<DailyNotes>,
}

/// The single artifact of a collection cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub generated: DateTime<Utc>,
    #[serde(rename = "trustroots")]
    pub relational: RelationalMetrics,
    #[serde(rename = "nostroots")]
    pub relay: RelayMetrics,
}

/// Find the record for `date` in an ascending series.
pub fn find_day<T>(series: &[DailyMetric<T>], date: NaiveDate) -> Option<&T> {
    series
        .binary_search_by(|m| m.date.cmp(&date))
        .ok()
        .map(|i| &series[i].value)
}
