//! Day-bucketed metrics from the community document store.
//!
//! Each metric family is one aggregation pipeline: match the window, group by
//! `$dateToString` day (plus a discriminator field for reviews and votes),
//! sort by day. Discriminator counts are folded back into named fields here,
//! and days with no documents are simply absent from the result.

use crate::metrics::{
    DailyCount, DailyMetric, DailyReview, DailyTime, DailyVote, MessageCount, RelationalMetrics,
    ReplyTime, ReviewTally, VoteTally,
};
use crate::store::{with_timeout, DocumentStore, StoreError};
use crate::window::{DateWindow, DAY_FORMAT};
use chrono::NaiveDate;
use mongodb::bson::{self, doc, Bson, DateTime as BsonDateTime, Document};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MESSAGES: &str = "messages";
const EXPERIENCES: &str = "experiences";
const REFERENCE_THREADS: &str = "referencethreads";
const MESSAGE_STATS: &str = "messagestats";

/// The four store-backed metric families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricFamily {
    Messages,
    Reviews,
    ThreadVotes,
    ReplyTimes,
}

impl fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricFamily::Messages => "messages",
            MetricFamily::Reviews => "reviews",
            MetricFamily::ThreadVotes => "thread votes",
            MetricFamily::ReplyTimes => "reply times",
        };
        f.write_str(name)
    }
}

/// A store failure, labeled with the family whose query failed.
#[derive(Debug, thiserror::Error)]
#[error("failed to collect {family}: {source}")]
pub struct RelationalError {
    pub family: MetricFamily,
    #[source]
    pub source: StoreError,
}

/// Secondary grouping value split into named sub-counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discriminator {
    Positive,
    Negative,
    Unrecognized,
}

impl Discriminator {
    /// `"yes"` / `"no"`; anything else (other strings, null, non-strings) is unrecognized.
    pub fn classify(value: &Bson) -> Self {
        match value.as_str() {
            Some("yes") => Discriminator::Positive,
            Some("no") => Discriminator::Negative,
            _ => Discriminator::Unrecognized,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    #[serde(rename = "_id")]
    date: String,
    count: u64,
}

#[derive(Debug, Deserialize)]
struct SplitRow {
    #[serde(rename = "_id")]
    date: String,
    #[serde(default)]
    buckets: Vec<SplitBucket>,
}

#[derive(Debug, Deserialize)]
struct SplitBucket {
    #[serde(default)]
    key: Bson,
    count: u64,
}

#[derive(Debug, Deserialize)]
struct AverageRow {
    #[serde(rename = "_id")]
    date: String,
    #[serde(rename = "avgMs")]
    avg_ms: Option<f64>,
}

/// Runs the store-backed metric queries.
#[derive(Clone)]
pub struct RelationalAggregator {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl RelationalAggregator {
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Collect all four families concurrently. The first failure wins.
    pub async fn collect(&self, window: &DateWindow) -> Result<RelationalMetrics, RelationalError> {
        let (messages, reviews, votes, replies) = tokio::join!(
            self.messages_per_day(window),
            self.reviews_per_day(window),
            self.thread_votes_per_day(window),
            self.time_to_first_reply_per_day(window),
        );

        let metrics = RelationalMetrics {
            messages_per_day: messages?,
            reviews_per_day: reviews?,
            thread_votes_per_day: votes?,
            time_to_first_reply_per_day: replies?,
        };

        info!(
            messages = metrics.messages_per_day.len(),
            reviews = metrics.reviews_per_day.len(),
            votes = metrics.thread_votes_per_day.len(),
            replies = metrics.time_to_first_reply_per_day.len(),
            "Collected relational metrics (days with data)"
        );
        Ok(metrics)
    }

    pub async fn messages_per_day(
        &self,
        window: &DateWindow,
    ) -> Result<Vec<DailyCount>, RelationalError> {
        let rows: Vec<CountRow> = self
            .run(MetricFamily::Messages, MESSAGES, messages_pipeline(window))
            .await?;

        Ok(sorted(window, rows.into_iter().filter_map(|row| {
            let date = parse_day(&row.date, MetricFamily::Messages)?;
            Some(DailyMetric::new(date, MessageCount { count: row.count }))
        })))
    }

    pub async fn reviews_per_day(
        &self,
        window: &DateWindow,
    ) -> Result<Vec<DailyReview>, RelationalError> {
        let rows: Vec<SplitRow> = self
            .run(MetricFamily::Reviews, EXPERIENCES, reviews_pipeline(window))
            .await?;

        Ok(sorted(window, rows.into_iter().filter_map(|row| {
            let date = parse_day(&row.date, MetricFamily::Reviews)?;
            let (positive, negative) = split_counts(&row.buckets, MetricFamily::Reviews, date);
            Some(DailyMetric::new(date, ReviewTally { positive, negative }))
        })))
    }

    pub async fn thread_votes_per_day(
        &self,
        window: &DateWindow,
    ) -> Result<Vec<DailyVote>, RelationalError> {
        let rows: Vec<SplitRow> = self
            .run(
                MetricFamily::ThreadVotes,
                REFERENCE_THREADS,
                thread_votes_pipeline(window),
            )
            .await?;

        Ok(sorted(window, rows.into_iter().filter_map(|row| {
            let date = parse_day(&row.date, MetricFamily::ThreadVotes)?;
            let (upvotes, downvotes) = split_counts(&row.buckets, MetricFamily::ThreadVotes, date);
            Some(DailyMetric::new(date, VoteTally { upvotes, downvotes }))
        })))
    }

    pub async fn time_to_first_reply_per_day(
        &self,
        window: &DateWindow,
    ) -> Result<Vec<DailyTime>, RelationalError> {
        let rows: Vec<AverageRow> = self
            .run(
                MetricFamily::ReplyTimes,
                MESSAGE_STATS,
                reply_time_pipeline(window),
            )
            .await?;

        Ok(sorted(window, rows.into_iter().filter_map(|row| {
            let date = parse_day(&row.date, MetricFamily::ReplyTimes)?;
            let avg_ms = row.avg_ms? as i64;
            Some(DailyMetric::new(date, ReplyTime { avg_ms }))
        })))
    }

    /// Run `pipeline` on `collection` and decode each row, skipping rows that
    /// don't match the expected shape.
    async fn run<R: DeserializeOwned>(
        &self,
        family: MetricFamily,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> Result<Vec<R>, RelationalError> {
        let docs = with_timeout(self.timeout, self.store.aggregate(collection, pipeline))
            .await
            .map_err(|source| RelationalError { family, source })?;

        Ok(docs
            .into_iter()
            .filter_map(|doc| match bson::from_document::<R>(doc) {
                Ok(row) => Some(row),
                Err(e) => {
                    warn!(%family, "Error decoding result row: {e}");
                    None
                }
            })
            .collect())
    }
}

fn since(window: &DateWindow) -> BsonDateTime {
    BsonDateTime::from_millis(window.since().timestamp_millis())
}

fn until(window: &DateWindow) -> BsonDateTime {
    BsonDateTime::from_millis(window.until().timestamp_millis())
}

/// `[since, until)` on a date field.
fn range(window: &DateWindow) -> Document {
    doc! { "$gte": since(window), "$lt": until(window) }
}

fn day_of(field: &str) -> Document {
    doc! { "$dateToString": { "format": DAY_FORMAT, "date": format!("${field}") } }
}

fn messages_pipeline(window: &DateWindow) -> Vec<Document> {
    vec![
        doc! { "$match": { "created": range(window) } },
        doc! { "$group": { "_id": day_of("created"), "count": { "$sum": 1 } } },
        doc! { "$sort": { "_id": 1 } },
    ]
}

/// Group by (day, `field`), then fold each day's per-value counts into one
/// document with a `buckets: [{key, count}]` array.
fn split_pipeline(window: &DateWindow, field: &str, extra_match: Document) -> Vec<Document> {
    let mut matcher = doc! { "created": range(window) };
    matcher.extend(extra_match);

    vec![
        doc! { "$match": matcher },
        doc! {
            "$group": {
                "_id": { "date": day_of("created"), "key": format!("${field}") },
                "count": { "$sum": 1 },
            }
        },
        doc! {
            "$group": {
                "_id": "$_id.date",
                "buckets": { "$push": { "key": "$_id.key", "count": "$count" } },
            }
        },
        doc! { "$sort": { "_id": 1 } },
    ]
}

fn reviews_pipeline(window: &DateWindow) -> Vec<Document> {
    split_pipeline(
        window,
        "recommend",
        doc! { "recommend": { "$in": ["yes", "no"] } },
    )
}

fn thread_votes_pipeline(window: &DateWindow) -> Vec<Document> {
    split_pipeline(window, "reference", Document::new())
}

fn reply_time_pipeline(window: &DateWindow) -> Vec<Document> {
    vec![
        doc! {
            "$match": {
                "firstMessageCreated": range(window),
                "timeToFirstReply": { "$exists": true, "$ne": Bson::Null },
            }
        },
        doc! {
            "$group": {
                "_id": day_of("firstMessageCreated"),
                "avgMs": { "$avg": "$timeToFirstReply" },
            }
        },
        doc! { "$sort": { "_id": 1 } },
    ]
}

/// Sum counts per discriminator; unrecognized values are dropped.
fn split_counts(buckets: &[SplitBucket], family: MetricFamily, date: NaiveDate) -> (u64, u64) {
    let mut positive = 0;
    let mut negative = 0;
    let mut dropped = 0;

    for bucket in buckets {
        match Discriminator::classify(&bucket.key) {
            Discriminator::Positive => positive += bucket.count,
            Discriminator::Negative => negative += bucket.count,
            Discriminator::Unrecognized => dropped += bucket.count,
        }
    }

    if dropped > 0 {
        debug!(%family, %date, dropped, "Ignored unrecognized discriminator values");
    }
    (positive, negative)
}

fn parse_day(raw: &str, family: MetricFamily) -> Option<NaiveDate> {
    match NaiveDate::parse_from_str(raw, DAY_FORMAT) {
        Ok(date) => Some(date),
        Err(e) => {
            warn!(%family, day = raw, "Skipping row with unparseable day: {e}");
            None
        }
    }
}

/// Ascending by date, without days after the reference date.
fn sorted<T>(window: &DateWindow, rows: impl Iterator<Item = DailyMetric<T>>) -> Vec<DailyMetric<T>> {
    let end = window.end_date();
    let mut rows: Vec<_> = rows
        .filter(|m| {
            let keep = m.date <= end;
            if !keep {
                debug!(date = %m.date, "Dropping row after the reference date");
            }
            keep
        })
        .collect();
    rows.sort_by_key(|m| m.date);
    rows
}
