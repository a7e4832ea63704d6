//! Community KPI collection for the Trustroots dashboard.
//!
//! Each cycle aggregates a rolling seven-day window of activity from the
//! community document store and from Nostr relays, merges both into one
//! [`Snapshot`], and atomically replaces the published JSON file. A short
//! digest of the previous day can optionally be posted back to the relays.

pub mod collector;
pub mod config;
pub mod cycle;
pub mod identity;
pub mod merger;
pub mod metrics;
pub mod poster;
pub mod publish;
pub mod relational;
pub mod store;
pub mod window;

#[cfg(test)]
mod testing;

pub use collector::{CollectError, RelayCollection, RelayEventCollector, RelayReport, SkipReason, TRACKED_KINDS};
pub use config::Config;
pub use cycle::{run_scheduled, CycleError, CycleSummary, Pipeline, ScheduleReport};
pub use identity::{IdentityResolver, IdentitySet};
pub use merger::{generation_time, merge, MergeError};
pub use metrics::{RelationalMetrics, RelayMetrics, Snapshot};
pub use poster::{PostError, StatsPoster};
pub use publish::{digest, PublishError, SnapshotPublisher, DEFAULT_DIGEST_LINK};
pub use relational::{RelationalAggregator, RelationalError};
pub use store::{DocumentStore, MongoStore, StoreError};
pub use window::{parse_reference_date, DateWindow};
