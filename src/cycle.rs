//! One collection cycle: collect, merge, publish, and optionally post.

use crate::collector::{CollectError, RelayCollection, RelayEventCollector, SkipReason};
use crate::config::Config;
use crate::identity::IdentityResolver;
use crate::merger::{generation_time, merge, MergeError};
use crate::publish::{PublishError, SnapshotPublisher};
use crate::poster::StatsPoster;
use crate::relational::{RelationalAggregator, RelationalError};
use crate::store::{DocumentStore, StoreError};
use crate::window::DateWindow;
use anyhow::Result;
use chrono::{DateTime, Utc};
use nostr_core::RelayConnector;
use nostr_sdk::Timestamp;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Failure of a cycle, tagged with the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("collection did not finish within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Relational(#[from] RelationalError),
    #[error("failed to resolve user npubs: {0}")]
    Identity(#[source] StoreError),
    #[error(transparent)]
    Relays(#[from] CollectError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl CycleError {
    pub fn stage(&self) -> &'static str {
        match self {
            CycleError::Timeout(_) => "timeout",
            CycleError::Relational(_) => "relational",
            CycleError::Identity(_) => "identity",
            CycleError::Relays(_) => "relays",
            CycleError::Merge(_) => "merge",
            CycleError::Publish(_) => "publish",
        }
    }
}

/// What a successful cycle produced.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub generated: DateTime<Utc>,
    pub path: PathBuf,
    pub bytes: usize,
    pub skipped_relays: Vec<(String, SkipReason)>,
    /// Relays that accepted the digest note, when posting ran and succeeded.
    pub posted_to: Option<Vec<String>>,
}

impl CycleSummary {
    pub fn log(&self) {
        for (relay, reason) in &self.skipped_relays {
            warn!(relay = %relay, "Relay skipped this cycle: {}", reason);
        }
        info!(
            generated = %self.generated,
            bytes = self.bytes,
            posted = self.posted_to.as_ref().map_or(0, Vec::len),
            "Collection completed successfully: {}",
            self.path.display()
        );
    }
}

/// Cycle outcomes seen by [`run_scheduled`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// The wired-up components, immutable across cycles.
pub struct Pipeline {
    relational: RelationalAggregator,
    identities: IdentityResolver,
    collector: RelayEventCollector,
    publisher: SnapshotPublisher,
    poster: Option<StatsPoster>,
    cycle_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        relational: RelationalAggregator,
        identities: IdentityResolver,
        collector: RelayEventCollector,
        publisher: SnapshotPublisher,
        poster: Option<StatsPoster>,
        cycle_timeout: Duration,
    ) -> Self {
        Self {
            relational,
            identities,
            collector,
            publisher,
            poster,
            cycle_timeout,
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        connector: Arc<dyn RelayConnector>,
    ) -> Result<Self> {
        let relays: Arc<[String]> = config.relays.urls.clone().into();

        let poster = match config.poster.nsec.as_deref() {
            None => None,
            Some(nsec) => match StatsPoster::from_nsec(
                connector.clone(),
                relays.clone(),
                nsec,
                config.connect_timeout(),
                config.poster.digest_link.clone(),
            ) {
                Ok(poster) => Some(poster),
                Err(e) => {
                    error!("Invalid stats nsec, posting disabled: {e}");
                    None
                }
            },
        };

        Ok(Self::new(
            RelationalAggregator::new(store.clone(), config.store_timeout()),
            IdentityResolver::new(store, config.store_timeout()),
            RelayEventCollector::new(
                connector,
                relays,
                config.connect_timeout(),
                config.query_timeout(),
            ),
            SnapshotPublisher::new(config.resolve_output_path()?),
            poster,
            config.cycle_timeout(),
        ))
    }

    pub fn can_post(&self) -> bool {
        self.poster.is_some()
    }

    /// Run one cycle for `reference` (now when absent). Nothing is written
    /// unless every collection stage succeeded.
    pub async fn run_cycle(
        &self,
        reference: Option<DateTime<Utc>>,
        post: bool,
    ) -> Result<CycleSummary, CycleError> {
        let generated = generation_time(reference);
        let window = DateWindow::ending_at(generated);
        let until = Timestamp::now();
        info!(
            generated = %generated,
            since = %window.since(),
            "Starting collection cycle"
        );

        let (relational, relays) = tokio::time::timeout(self.cycle_timeout, async {
            tokio::join!(
                self.relational.collect(&window),
                self.collect_relays(&window, until)
            )
        })
        .await
        .map_err(|_| CycleError::Timeout(self.cycle_timeout))?;

        let relational = relational?;
        let RelayCollection { metrics, report } = relays?;

        let snapshot = merge(generated, Some(relational), Some(metrics))?;
        let bytes = self.publisher.write_blocking(snapshot.clone()).await?;

        let posted_to = if !post {
            None
        } else if let Some(poster) = &self.poster {
            match poster.post(&snapshot).await {
                Ok(accepted) => Some(accepted),
                Err(e) => {
                    warn!("Failed to post stats digest: {e}");
                    None
                }
            }
        } else {
            info!("No stats nsec configured, skipping digest post");
            None
        };

        info!(
            path = %self.publisher.path().display(),
            skipped_relays = report.skipped.len(),
            "Cycle complete"
        );
        Ok(CycleSummary {
            generated,
            path: self.publisher.path().to_path_buf(),
            bytes,
            skipped_relays: report.skipped,
            posted_to,
        })
    }

    async fn collect_relays(
        &self,
        window: &DateWindow,
        until: Timestamp,
    ) -> Result<RelayCollection, CycleError> {
        let identities = self
            .identities
            .resolve()
            .await
            .map_err(CycleError::Identity)?;
        Ok(self.collector.collect(&identities, window, until).await?)
    }
}

/// Run a cycle on every tick of `interval` until `shutdown` resolves.
///
/// The first tick fires immediately and `reference` applies to that cycle
/// only. A failed cycle is logged and the next tick tries again. A cycle still
/// running at shutdown is dropped; the previous snapshot stays in place.
pub async fn run_scheduled(
    pipeline: &Pipeline,
    interval: Duration,
    mut reference: Option<DateTime<Utc>>,
    post: bool,
    shutdown: impl Future<Output = ()>,
) -> ScheduleReport {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut report = ScheduleReport::default();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = &mut shutdown => {
                        info!("Abandoning in-flight cycle");
                        break;
                    }
                    outcome = pipeline.run_cycle(reference.take(), post) => match outcome {
                        Ok(summary) => {
                            summary.log();
                            report.succeeded += 1;
                        }
                        Err(e) => {
                            let stage = e.stage();
                            error!(stage, "Scheduled collection failed: {:#}", anyhow::Error::from(e));
                            report.failed += 1;
                        }
                    },
                }
            }
        }
    }

    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        "Scheduler stopped"
    );
    report
}
