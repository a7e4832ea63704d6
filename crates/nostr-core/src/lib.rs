//! Nostr protocol plumbing for the KPI collector.
//!
//! This crate provides per-relay sessions over nostr-sdk behind small traits
//! (so the collector can be exercised against in-memory relays) and the key
//! decoding used to turn stored npubs into query authors.

pub mod keys;
pub mod relay;

// Re-export commonly used types
pub use keys::{decode_npub, keys_from_nsec, short_hex, KeyError, NPUB_PREFIX};
pub use relay::{EventQuery, RelayConnector, RelaySession, SdkConnector, SdkSession};

// Re-export nostr-sdk for convenience
pub use nostr_sdk;
