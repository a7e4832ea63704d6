//! Resolve stored user npubs into relay query authors.

use crate::store::{with_timeout, DocumentStore, StoreError};
use mongodb::bson::{doc, Bson, Document};
use nostr_core::{decode_npub, KeyError};
use nostr_sdk::PublicKey;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const USERS: &str = "users";
const NPUB_FIELD: &str = "nostrNpub";

/// Outcome of scanning user records for npubs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentitySet {
    /// Users whose key field is present and non-empty.
    pub with_key_field: usize,
    /// Users whose key decodes.
    pub parseable: usize,
    /// Distinct decoded keys, in first-seen order.
    pub keys: Vec<PublicKey>,
}

/// Raw value of a user's key field.
enum KeyField<'a> {
    Absent,
    Text(&'a str),
    /// Present but not a string.
    Other,
}

impl IdentitySet {
    /// Classify raw key fields; `None` and empty strings count for nothing.
    pub fn from_fields<'a>(fields: impl IntoIterator<Item = Option<&'a str>>) -> Self {
        Self::tally(fields.into_iter().map(|field| match field {
            Some(raw) => KeyField::Text(raw),
            None => KeyField::Absent,
        }))
    }

    /// Classify the key field of each user record. Any present value other
    /// than an empty string counts as set; non-strings never decode.
    pub fn from_documents<'a>(docs: impl IntoIterator<Item = &'a Document>) -> Self {
        Self::tally(docs.into_iter().map(|doc| match doc.get(NPUB_FIELD) {
            None => KeyField::Absent,
            Some(Bson::String(raw)) => KeyField::Text(raw),
            Some(_) => KeyField::Other,
        }))
    }

    fn tally<'a>(fields: impl Iterator<Item = KeyField<'a>>) -> Self {
        let mut set = IdentitySet::default();
        let mut seen = HashSet::new();

        for field in fields {
            let raw = match field {
                KeyField::Absent | KeyField::Text("") => continue,
                KeyField::Other => {
                    set.with_key_field += 1;
                    warn!("Skipping non-string npub field");
                    continue;
                }
                KeyField::Text(raw) => raw,
            };
            set.with_key_field += 1;

            match decode_npub(raw) {
                Ok(pubkey) => {
                    set.parseable += 1;
                    if seen.insert(pubkey) {
                        set.keys.push(pubkey);
                    }
                }
                Err(KeyError::NotNpub) => {
                    debug!("Skipping non-npub key field");
                }
                Err(e) => {
                    warn!(value = raw, "Invalid npub format: {e}");
                }
            }
        }

        set
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Reads user records from the store.
#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    fn filter() -> Document {
        doc! { "nostrNpub": { "$exists": true, "$ne": "" } }
    }

    pub async fn resolve(&self) -> Result<IdentitySet, StoreError> {
        let docs = with_timeout(
            self.timeout,
            self.store
                .find(USERS, Self::filter(), doc! { "nostrNpub": 1 }),
        )
        .await?;

        let set = IdentitySet::from_documents(&docs);
        info!(
            with_key_field = set.with_key_field,
            parseable = set.parseable,
            distinct = set.keys.len(),
            "Resolved user npubs"
        );
        Ok(set)
    }

    /// Users with the key field set, counted by the store.
    pub async fn count_with_key_field(&self) -> Result<u64, StoreError> {
        with_timeout(self.timeout, self.store.count(USERS, Self::filter())).await
    }
}
