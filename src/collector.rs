//! Fan-out event collection across relays.
//!
//! Every configured relay is queried concurrently and independently: a relay
//! that refuses the connection, errors, or times out is skipped and recorded in
//! the [`RelayReport`], never failing the others. Once all attempts have
//! settled the events are deduplicated and bucketed by day and kind.

use crate::identity::IdentitySet;
use crate::metrics::{DailyMetric, DailyNotes, KindCounts, RelayMetrics};
use crate::window::{day_of_unix, DateWindow};
use chrono::NaiveDate;
use futures_util::future::join_all;
use nostr_core::{short_hex, EventQuery, RelayConnector};
use nostr_sdk::{Event, Kind, PublicKey, Timestamp};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Event kinds counted per day: profile metadata, text notes, encrypted DMs,
/// app-specific data, long-form content, community posts and replies.
pub const TRACKED_KINDS: [u16; 7] = [0, 1, 4, 397, 30023, 30398, 30399];

/// Why a relay contributed nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Connect(String),
    ConnectTimeout,
    Query(String),
    QueryTimeout,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Connect(e) => write!(f, "connect failed: {e}"),
            SkipReason::ConnectTimeout => f.write_str("connect timed out"),
            SkipReason::Query(e) => write!(f, "query failed: {e}"),
            SkipReason::QueryTimeout => f.write_str("query timed out"),
        }
    }
}

/// What one relay returned.
#[derive(Debug, Clone)]
pub enum Outcome {
    Collected(Vec<Event>),
    Skipped(SkipReason),
}

/// One relay attempt within a cycle.
#[derive(Debug, Clone)]
pub struct RelayAttempt {
    pub url: String,
    pub outcome: Outcome,
}

/// Per-cycle observability for the relay side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub queried: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
    /// Events received across relays, duplicates included.
    pub received: usize,
    /// Events left after deduplication.
    pub unique: usize,
    /// Unique events inside the window with a tracked kind.
    pub accepted: usize,
}

/// Relay metrics plus the side-channel report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCollection {
    pub metrics: RelayMetrics,
    pub report: RelayReport,
}

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("none of the {attempted} configured relays could be queried")]
    NoRelaysReachable {
        attempted: usize,
        skipped: Vec<(String, SkipReason)>,
    },
}

/// Identity used to collapse the same event returned by several relays.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EventIdentity<'a> {
    author: PublicKey,
    kind: Kind,
    created_at: Timestamp,
    content: &'a str,
}

impl<'a> From<&'a Event> for EventIdentity<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            author: event.pubkey,
            kind: event.kind,
            created_at: event.created_at,
            content: event.content.as_str(),
        }
    }
}

/// Queries relays for events authored by the resolved identities.
#[derive(Clone)]
pub struct RelayEventCollector {
    connector: Arc<dyn RelayConnector>,
    relays: Arc<[String]>,
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl RelayEventCollector {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        relays: impl Into<Arc<[String]>>,
        connect_timeout: Duration,
        query_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            relays: relays.into(),
            connect_timeout,
            query_timeout,
        }
    }

    /// Collect and bucket events for `identities` between the window cutoff
    /// and `until`.
    pub async fn collect(
        &self,
        identities: &IdentitySet,
        window: &DateWindow,
        until: Timestamp,
    ) -> Result<RelayCollection, CollectError> {
        if identities.is_empty() {
            info!("No parseable npubs, skipping relay queries");
            return Ok(RelayCollection {
                metrics: bucket_events(window, identities.parseable, &[]),
                report: RelayReport::default(),
            });
        }

        let query = EventQuery {
            authors: identities.keys.clone(),
            kinds: TRACKED_KINDS.iter().map(|k| Kind::from(*k)).collect(),
            since: Timestamp::from_secs(window.since().timestamp().max(0) as u64),
            until,
        };

        info!(
            authors = query.authors.len(),
            relays = self.relays.len(),
            "Querying relays"
        );

        let attempts = join_all(self.relays.iter().map(|url| self.attempt(url, &query))).await;

        let mut report = RelayReport::default();
        let mut events: Vec<Event> = Vec::new();
        for attempt in attempts {
            match attempt.outcome {
                Outcome::Collected(batch) => {
                    report.queried.push(attempt.url);
                    events.extend(batch);
                }
                Outcome::Skipped(reason) => report.skipped.push((attempt.url, reason)),
            }
        }

        if report.queried.is_empty() {
            return Err(CollectError::NoRelaysReachable {
                attempted: self.relays.len(),
                skipped: report.skipped,
            });
        }

        report.received = events.len();
        let unique = dedup(&events);
        report.unique = unique.len();

        let metrics = bucket_events(window, identities.parseable, &unique);
        report.accepted = metrics
            .notes_by_kind_per_day
            .iter()
            .map(|d| d.value.total() as usize)
            .sum();

        info!(
            received = report.received,
            unique = report.unique,
            accepted = report.accepted,
            active_posters = metrics.active_posters,
            skipped = report.skipped.len(),
            "Relay collection finished"
        );
        Ok(RelayCollection { metrics, report })
    }

    async fn attempt(&self, url: &str, query: &EventQuery) -> RelayAttempt {
        let skipped = |reason: SkipReason| {
            warn!(relay = %url, "Skipping relay: {reason}");
            RelayAttempt {
                url: url.to_string(),
                outcome: Outcome::Skipped(reason),
            }
        };

        debug!(relay = %url, "Connecting");
        let session = match tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(url, self.connect_timeout),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return skipped(SkipReason::Connect(format!("{e:#}"))),
            Err(_) => return skipped(SkipReason::ConnectTimeout),
        };

        let result = tokio::time::timeout(
            self.query_timeout,
            session.query(query, self.query_timeout),
        )
        .await;
        session.close().await;

        match result {
            Ok(Ok(events)) => {
                info!(relay = %url, count = events.len(), "Found events");
                RelayAttempt {
                    url: url.to_string(),
                    outcome: Outcome::Collected(events),
                }
            }
            Ok(Err(e)) => skipped(SkipReason::Query(format!("{e:#}"))),
            Err(_) => skipped(SkipReason::QueryTimeout),
        }
    }
}

/// First occurrence of each (author, kind, created_at, content).
fn dedup(events: &[Event]) -> Vec<&Event> {
    let mut seen = HashSet::new();
    events
        .iter()
        .filter(|event| seen.insert(EventIdentity::from(*event)))
        .collect()
}

/// Zero-filled day × kind scaffold, then one increment per in-window event
/// of a tracked kind. Active posters are the distinct authors of those events.
fn bucket_events(window: &DateWindow, users_with_npubs: usize, events: &[&Event]) -> RelayMetrics {
    let scaffold: BTreeMap<NaiveDate, KindCounts> = window
        .days()
        .iter()
        .map(|day| (*day, KindCounts::zeroed(&TRACKED_KINDS)))
        .collect();

    let (buckets, authors) = events.iter().fold(
        (scaffold, HashSet::new()),
        |(mut buckets, mut authors), event| {
            let counted = day_of_unix(event.created_at.as_secs())
                .and_then(|day| buckets.get_mut(&day))
                .is_some_and(|counts| counts.bump(event.kind.as_u16()));
            if counted {
                authors.insert(event.pubkey);
            } else {
                debug!(
                    author = %short_hex(&event.pubkey),
                    kind = event.kind.as_u16(),
                    "Event outside window or untracked kind"
                );
            }
            (buckets, authors)
        },
    );

    RelayMetrics {
        users_with_npubs,
        active_posters: authors.len(),
        notes_by_kind_per_day: buckets
            .into_iter()
            .map(|(day, counts)| DailyMetric::new(day, counts))
            .collect::<Vec<DailyNotes>>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{event, npub, MockConnector, MockRelay};
    use chrono::{TimeZone, Utc};
    use nostr_sdk::Keys;

    const RELAY_A: &str = "wss://a.example";
    const RELAY_B: &str = "wss://b.example";

    // 2025-01-14T12:00:00Z
    const JAN_14_NOON: u64 = 1_736_856_000;
    const DAY: u64 = 86_400;

    fn window() -> DateWindow {
        DateWindow::ending_at(Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap())
    }

    fn until() -> Timestamp {
        Timestamp::from_secs(JAN_14_NOON + 2 * DAY)
    }

    fn identities(keys: &[&Keys]) -> IdentitySet {
        IdentitySet {
            with_key_field: keys.len(),
            parseable: keys.len(),
            keys: keys.iter().map(|k| k.public_key()).collect(),
        }
    }

    fn collector(connector: MockConnector, relays: &[&str]) -> RelayEventCollector {
        RelayEventCollector::new(
            Arc::new(connector),
            relays.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
            Duration::from_secs(2),
            Duration::from_secs(5),
        )
    }

    fn day_counts(metrics: &RelayMetrics, d: u32) -> &KindCounts {
        let date = NaiveDate::from_ymd_opt(2025, 1, d).unwrap();
        &metrics
            .notes_by_kind_per_day
            .iter()
            .find(|n| n.date == date)
            .unwrap()
            .value
    }

    #[tokio::test]
    async fn duplicate_event_across_relays_counts_once() {
        let (keys, _) = npub();
        let note = event(&keys, 1, JAN_14_NOON, "hello");
        let connector = MockConnector::new()
            .relay(RELAY_A, MockRelay::Events(vec![note.clone()]))
            .relay(RELAY_B, MockRelay::Events(vec![note]));

        let result = collector(connector, &[RELAY_A, RELAY_B])
            .collect(&identities(&[&keys]), &window(), until())
            .await
            .unwrap();

        assert_eq!(day_counts(&result.metrics, 14).get(1), 1);
        assert_eq!(result.metrics.active_posters, 1);
        assert_eq!(result.report.received, 2);
        assert_eq!(result.report.unique, 1);
    }

    #[tokio::test]
    async fn separately_signed_copies_are_one_event() {
        let (keys, _) = npub();
        let connector = MockConnector::new()
            .relay(RELAY_A, MockRelay::Events(vec![event(&keys, 1, JAN_14_NOON, "gm")]))
            .relay(RELAY_B, MockRelay::Events(vec![event(&keys, 1, JAN_14_NOON, "gm")]));

        let result = collector(connector, &[RELAY_A, RELAY_B])
            .collect(&identities(&[&keys]), &window(), until())
            .await
            .unwrap();
        assert_eq!(day_counts(&result.metrics, 14).get(1), 1);
    }

    #[tokio::test]
    async fn distinct_content_is_counted_separately() {
        let (keys, _) = npub();
        let connector = MockConnector::new().relay(
            RELAY_A,
            MockRelay::Events(vec![
                event(&keys, 1, JAN_14_NOON, "one"),
                event(&keys, 1, JAN_14_NOON, "two"),
            ]),
        );

        let result = collector(connector, &[RELAY_A])
            .collect(&identities(&[&keys]), &window(), until())
            .await
            .unwrap();
        assert_eq!(day_counts(&result.metrics, 14).get(1), 2);
    }

    #[tokio::test]
    async fn unreachable_relay_keeps_full_schema() {
        let (keys, _) = npub();
        let connector = MockConnector::new()
            .relay(RELAY_A, MockRelay::RefuseConnect)
            .relay(RELAY_B, MockRelay::Events(vec![]));

        let result = collector(connector, &[RELAY_A, RELAY_B])
            .collect(&identities(&[&keys]), &window(), until())
            .await
            .unwrap();

        let days = &result.metrics.notes_by_kind_per_day;
        assert_eq!(days.len(), 7);
        let dates: Vec<_> = days.iter().map(|d| d.date).collect();
        assert_eq!(dates, window().days());
        for day in days {
            assert_eq!(day.value.iter().count(), TRACKED_KINDS.len());
            assert_eq!(day.value.total(), 0);
        }
        assert_eq!(result.report.skipped.len(), 1);
        assert_eq!(result.report.skipped[0].0, RELAY_A);
        assert!(matches!(result.report.skipped[0].1, SkipReason::Connect(_)));
    }

    #[tokio::test]
    async fn failing_query_skips_only_that_relay() {
        let (keys, _) = npub();
        let connector = MockConnector::new()
            .relay(RELAY_A, MockRelay::FailQuery)
            .relay(RELAY_B, MockRelay::Events(vec![event(&keys, 30023, JAN_14_NOON, "essay")]));

        let result = collector(connector, &[RELAY_A, RELAY_B])
            .collect(&identities(&[&keys]), &window(), until())
            .await
            .unwrap();

        assert_eq!(day_counts(&result.metrics, 14).get(30023), 1);
        assert_eq!(result.report.queried, vec![RELAY_B.to_string()]);
        assert!(matches!(result.report.skipped[0].1, SkipReason::Query(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_relays_time_out() {
        let (keys, _) = npub();
        let connector = MockConnector::new()
            .relay(RELAY_A, MockRelay::HangOnConnect)
            .relay(RELAY_B, MockRelay::HangOnQuery)
            .relay("wss://c.example", MockRelay::Events(vec![event(&keys, 1, JAN_14_NOON, "x")]));

        let result = collector(connector, &[RELAY_A, RELAY_B, "wss://c.example"])
            .collect(&identities(&[&keys]), &window(), until())
            .await
            .unwrap();

        let reasons: Vec<_> = result.report.skipped.iter().map(|(_, r)| r.clone()).collect();
        assert!(reasons.contains(&SkipReason::ConnectTimeout));
        assert!(reasons.contains(&SkipReason::QueryTimeout));
        assert_eq!(day_counts(&result.metrics, 14).get(1), 1);
    }

    #[tokio::test]
    async fn all_relays_down_is_an_error() {
        let (keys, _) = npub();
        let connector = MockConnector::new()
            .relay(RELAY_A, MockRelay::RefuseConnect)
            .relay(RELAY_B, MockRelay::FailQuery);

        let err = collector(connector, &[RELAY_A, RELAY_B])
            .collect(&identities(&[&keys]), &window(), until())
            .await
            .unwrap_err();
        let CollectError::NoRelaysReachable { attempted, skipped } = err;
        assert_eq!(attempted, 2);
        assert_eq!(skipped.len(), 2);
    }

    #[tokio::test]
    async fn no_identities_skips_relays() {
        let connector = MockConnector::new().relay(RELAY_A, MockRelay::FailQuery);
        let result = collector(connector.clone(), &[RELAY_A])
            .collect(&IdentitySet { with_key_field: 3, ..Default::default() }, &window(), until())
            .await
            .unwrap();

        assert!(connector.queries().is_empty());
        assert_eq!(result.metrics.users_with_npubs, 0);
        assert_eq!(result.metrics.active_posters, 0);
        assert_eq!(result.metrics.notes_by_kind_per_day.len(), 7);
    }

    #[tokio::test]
    async fn out_of_window_and_untracked_events_are_ignored() {
        let (inside, _) = npub();
        let (outside, _) = npub();
        let (untracked, _) = npub();
        let connector = MockConnector::new().relay(
            RELAY_A,
            MockRelay::Events(vec![
                event(&inside, 0, JAN_14_NOON, "{}"),
                event(&outside, 1, JAN_14_NOON - 10 * DAY, "old"),
                event(&untracked, 7, JAN_14_NOON, "+"),
            ]),
        );

        let result = collector(connector, &[RELAY_A])
            .collect(&identities(&[&inside, &outside, &untracked]), &window(), until())
            .await
            .unwrap();

        assert_eq!(result.metrics.active_posters, 1);
        assert_eq!(result.report.accepted, 1);
        assert_eq!(day_counts(&result.metrics, 14).get(0), 1);
        assert_eq!(result.metrics.users_with_npubs, 3);
    }

    #[tokio::test]
    async fn query_covers_window_and_tracked_kinds() {
        let (keys, _) = npub();
        let connector = MockConnector::new().relay(RELAY_A, MockRelay::Events(vec![]));
        collector(connector.clone(), &[RELAY_A])
            .collect(&identities(&[&keys]), &window(), until())
            .await
            .unwrap();

        let queries = connector.queries();
        assert_eq!(queries.len(), 1);
        let query = &queries[0].1;
        assert_eq!(query.authors, vec![keys.public_key()]);
        assert_eq!(query.kinds.len(), TRACKED_KINDS.len());
        assert_eq!(
            query.since,
            Timestamp::from_secs(window().since().timestamp() as u64)
        );
        assert_eq!(query.until, until());
    }

    #[test]
    fn events_bucket_by_utc_day() {
        let (keys, _) = npub();
        let late = event(&keys, 1, JAN_14_NOON + 12 * 3600 - 1, "23:59:59");
        let early = event(&keys, 1, JAN_14_NOON + 12 * 3600, "00:00:00");
        let metrics = bucket_events(&window(), 1, &[&late, &early]);
        assert_eq!(day_counts(&metrics, 14).get(1), 1);
        assert_eq!(day_counts(&metrics, 15).get(1), 1);
    }
}
