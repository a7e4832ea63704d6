//! Single-relay sessions over nostr-sdk.
//!
//! The collector talks to every relay on its own so that one slow or broken
//! relay cannot take the others down with it. Each [`RelaySession`] owns one
//! `nostr_sdk::Client` connected to exactly one relay.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use nostr_sdk::prelude::*;
use std::time::Duration;
use tracing::{debug, info};

/// A time-bounded author/kind query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub authors: Vec<PublicKey>,
    pub kinds: Vec<Kind>,
    pub since: Timestamp,
    pub until: Timestamp,
}

impl EventQuery {
    /// Convert into a nostr-sdk filter.
    pub fn to_filter(&self) -> Filter {
        Filter::new()
            .authors(self.authors.iter().copied())
            .kinds(self.kinds.iter().copied())
            .since(self.since)
            .until(self.until)
    }
}

/// Opens sessions to relays.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Connect to `url`, giving up after `timeout`.
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Box<dyn RelaySession>>;
}

/// An open connection to one relay.
#[async_trait]
pub trait RelaySession: Send + Sync {
    /// Run a one-shot query and return every stored event matching it.
    async fn query(&self, query: &EventQuery, timeout: Duration) -> Result<Vec<Event>>;

    /// Publish a signed event, succeeding only if the relay accepted it.
    async fn publish(&self, event: &Event) -> Result<EventId>;

    async fn close(&self);
}

/// [`RelayConnector`] backed by nostr-sdk.
#[derive(Debug, Clone, Default)]
pub struct SdkConnector;

impl SdkConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RelayConnector for SdkConnector {
    async fn connect(&self, url: &str, timeout: Duration) -> Result<Box<dyn RelaySession>> {
        let client = Client::builder().build();
        client
            .add_relay(url)
            .await
            .with_context(|| format!("Failed to add relay: {}", url))?;

        tokio::time::timeout(timeout, client.try_connect_relay(url, timeout))
            .await
            .with_context(|| format!("Timeout connecting to {}", url))?
            .with_context(|| format!("Failed to connect to {}", url))?;

        debug!(relay = %url, "connected");
        Ok(Box::new(SdkSession {
            client,
            url: url.to_string(),
        }))
    }
}

/// A nostr-sdk client bound to one relay.
pub struct SdkSession {
    client: Client,
    url: String,
}

#[async_trait]
impl RelaySession for SdkSession {
    async fn query(&self, query: &EventQuery, timeout: Duration) -> Result<Vec<Event>> {
        let events = tokio::time::timeout(timeout, self.client.fetch_events(query.to_filter(), timeout))
            .await
            .context("Timeout fetching events")?
            .context("Failed to fetch events")?;
        Ok(events.into_iter().collect())
    }

    async fn publish(&self, event: &Event) -> Result<EventId> {
        let output = self
            .client
            .send_event(event)
            .await
            .with_context(|| format!("Failed to send event to {}", self.url))?;

        if output.success.is_empty() {
            let reason = output
                .failed
                .values()
                .next()
                .cloned()
                .unwrap_or_else(|| "no acknowledgement".to_string());
            bail!("Relay {} rejected event: {}", self.url, reason);
        }

        info!(relay = %self.url, id = %output.val, "event accepted");
        Ok(output.val)
    }

    async fn close(&self) {
        self.client.disconnect().await;
    }
}
