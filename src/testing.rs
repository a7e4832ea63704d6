//! In-memory stand-ins for the document store and relays.

use crate::store::{DocumentStore, StoreError};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use nostr_core::{EventQuery, RelayConnector, RelaySession};
use nostr_sdk::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Store returning canned documents per collection.
#[derive(Default)]
pub struct MockStore {
    aggregates: HashMap<String, Result<Vec<Document>, String>>,
    finds: HashMap<String, Result<Vec<Document>, String>>,
    pipelines: Mutex<Vec<(String, Vec<Document>)>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_aggregate(mut self, collection: &str, docs: Vec<Document>) -> Self {
        self.aggregates.insert(collection.to_string(), Ok(docs));
        self
    }

    pub fn failing_aggregate(mut self, collection: &str, message: &str) -> Self {
        self.aggregates
            .insert(collection.to_string(), Err(message.to_string()));
        self
    }

    /// `users` records with the given key fields (`None` = field absent).
    pub fn with_users(self, npubs: &[Option<&str>]) -> Self {
        let docs = npubs
            .iter()
            .map(|npub| match npub {
                Some(value) => doc! { "nostrNpub": *value },
                None => doc! {},
            })
            .collect();
        self.with_user_docs(docs)
    }

    /// Raw `users` records, as the store would return them.
    pub fn with_user_docs(mut self, docs: Vec<Document>) -> Self {
        self.finds.insert("users".to_string(), Ok(docs));
        self
    }

    pub fn failing_find(mut self, collection: &str, message: &str) -> Self {
        self.finds
            .insert(collection.to_string(), Err(message.to_string()));
        self
    }

    /// Pipelines received so far, in call order.
    pub fn pipelines(&self) -> Vec<(String, Vec<Document>)> {
        self.pipelines.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentStore for MockStore {
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> Result<Vec<Document>, StoreError> {
        self.pipelines
            .lock()
            .unwrap()
            .push((collection.to_string(), pipeline));
        match self.aggregates.get(collection) {
            Some(Ok(docs)) => Ok(docs.clone()),
            Some(Err(msg)) => Err(StoreError::Backend(msg.clone())),
            None => Ok(Vec::new()),
        }
    }

    async fn find(
        &self,
        collection: &str,
        _filter: Document,
        _projection: Document,
    ) -> Result<Vec<Document>, StoreError> {
        match self.finds.get(collection) {
            Some(Ok(docs)) => Ok(docs.clone()),
            Some(Err(msg)) => Err(StoreError::Backend(msg.clone())),
            None => Ok(Vec::new()),
        }
    }

    async fn count(&self, collection: &str, _filter: Document) -> Result<u64, StoreError> {
        match self.finds.get(collection) {
            Some(Ok(docs)) => Ok(docs.len() as u64),
            Some(Err(msg)) => Err(StoreError::Backend(msg.clone())),
            None => Ok(0),
        }
    }
}

/// Scripted behaviour of one fake relay.
#[derive(Clone)]
pub enum MockRelay {
    Events(Vec<Event>),
    RefuseConnect,
    FailQuery,
    HangOnConnect,
    HangOnQuery,
    RejectPublish,
}

/// Connector over scripted relays. Unknown URLs refuse connections.
#[derive(Clone, Default)]
pub struct MockConnector {
    relays: HashMap<String, MockRelay>,
    published: Arc<Mutex<Vec<(String, Event)>>>,
    queries: Arc<Mutex<Vec<(String, EventQuery)>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relay(mut self, url: &str, behaviour: MockRelay) -> Self {
        self.relays.insert(url.to_string(), behaviour);
        self
    }

    pub fn published(&self) -> Vec<(String, Event)> {
        self.published.lock().unwrap().clone()
    }

    pub fn queries(&self) -> Vec<(String, EventQuery)> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayConnector for MockConnector {
    async fn connect(&self, url: &str, _timeout: Duration) -> Result<Box<dyn RelaySession>> {
        match self.relays.get(url) {
            None | Some(MockRelay::RefuseConnect) => bail!("connection refused: {url}"),
            Some(MockRelay::HangOnConnect) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Some(behaviour) => Ok(Box::new(MockSession {
                url: url.to_string(),
                behaviour: behaviour.clone(),
                published: self.published.clone(),
                queries: self.queries.clone(),
            })),
        }
    }
}

struct MockSession {
    url: String,
    behaviour: MockRelay,
    published: Arc<Mutex<Vec<(String, Event)>>>,
    queries: Arc<Mutex<Vec<(String, EventQuery)>>>,
}

#[async_trait]
impl RelaySession for MockSession {
    async fn query(&self, query: &EventQuery, _timeout: Duration) -> Result<Vec<Event>> {
        self.queries
            .lock()
            .unwrap()
            .push((self.url.clone(), query.clone()));
        match &self.behaviour {
            MockRelay::Events(events) => Ok(events.clone()),
            MockRelay::RejectPublish => Ok(Vec::new()),
            MockRelay::HangOnQuery => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            _ => Err(anyhow!("query failed on {}", self.url)),
        }
    }

    async fn publish(&self, event: &Event) -> Result<EventId> {
        match self.behaviour {
            MockRelay::RejectPublish => bail!("blocked: {}", self.url),
            _ => {
                self.published
                    .lock()
                    .unwrap()
                    .push((self.url.clone(), event.clone()));
                Ok(event.id)
            }
        }
    }

    async fn close(&self) {}
}

/// A signed event by `keys` at unix time `created_at`.
pub fn event(keys: &Keys, kind: u16, created_at: u64, content: &str) -> Event {
    EventBuilder::new(Kind::from(kind), content)
        .custom_created_at(Timestamp::from_secs(created_at))
        .sign_with_keys(keys)
        .unwrap()
}

/// A valid npub string for freshly generated keys.
pub fn npub() -> (Keys, String) {
    let keys = Keys::generate();
    let npub = keys.public_key().to_bech32().unwrap();
    (keys, npub)
}
