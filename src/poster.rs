//! Publish the daily digest as a signed text note.

use crate::metrics::Snapshot;
use crate::publish::digest;
use futures_util::future::join_all;
use nostr_core::{keys_from_nsec, short_hex, KeyError, RelayConnector};
use nostr_sdk::{Event, EventBuilder, EventId, Keys, Kind, Tag, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PostError {
    #[error("failed to sign digest note: {0}")]
    Sign(String),
    #[error("no relay accepted the digest note ({attempted} attempted)")]
    NoRelayAccepted { attempted: usize },
}

/// Signs digests with the stats account and sends them to every relay.
#[derive(Clone)]
pub struct StatsPoster {
    connector: Arc<dyn RelayConnector>,
    relays: Arc<[String]>,
    keys: Keys,
    timeout: Duration,
    link: String,
}

impl StatsPoster {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        relays: impl Into<Arc<[String]>>,
        keys: Keys,
        timeout: Duration,
        link: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            relays: relays.into(),
            keys,
            timeout,
            link: link.into(),
        }
    }

    pub fn from_nsec(
        connector: Arc<dyn RelayConnector>,
        relays: impl Into<Arc<[String]>>,
        nsec: &str,
        timeout: Duration,
        link: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let keys = keys_from_nsec(nsec)?;
        Ok(Self::new(connector, relays, keys, timeout, link))
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Kind-1 note tagged `#stats`, dated at the snapshot generation time.
    pub fn build_event(&self, snapshot: &Snapshot) -> Result<Event, PostError> {
        let created_at = Timestamp::from_secs(snapshot.generated.timestamp().max(0) as u64);
        EventBuilder::new(Kind::TextNote, digest(snapshot, &self.link))
            .tag(Tag::hashtag("stats"))
            .custom_created_at(created_at)
            .sign_with_keys(&self.keys)
            .map_err(|e| PostError::Sign(e.to_string()))
    }

    /// Returns the relays that accepted the note.
    pub async fn post(&self, snapshot: &Snapshot) -> Result<Vec<String>, PostError> {
        let event = self.build_event(snapshot)?;
        info!(
            id = %event.id,
            author = %short_hex(&self.keys.public_key()),
            relays = self.relays.len(),
            "Posting stats digest"
        );

        let results = join_all(self.relays.iter().map(|url| self.send(url, &event))).await;
        let accepted: Vec<String> = self
            .relays
            .iter()
            .zip(results)
            .filter_map(|(url, ok)| ok.then(|| url.clone()))
            .collect();

        if accepted.is_empty() {
            return Err(PostError::NoRelayAccepted {
                attempted: self.relays.len(),
            });
        }
        info!(
            accepted = accepted.len(),
            attempted = self.relays.len(),
            "Posted stats digest"
        );
        Ok(accepted)
    }

    async fn send(&self, url: &str, event: &Event) -> bool {
        let session = match tokio::time::timeout(self.timeout, self.connector.connect(url, self.timeout)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(relay = %url, "Failed to connect for posting: {e:#}");
                return false;
            }
            Err(_) => {
                warn!(relay = %url, "Timed out connecting for posting");
                return false;
            }
        };

        let result: anyhow::Result<EventId> =
            match tokio::time::timeout(self.timeout, session.publish(event)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("publish timed out")),
            };
        session.close().await;

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(relay = %url, "Failed to post: {e:#}");
                false
            }
        }
    }
}
