//! Bech32 key decoding for identities stored on user records.
//!
//! User profiles carry a free-form `npub` field. Only strings that look like
//! an npub and decode under the `npub` human-readable part are usable as relay
//! query authors. Secret keys (nsec) are only decoded for the stats signer.

use nostr_sdk::prelude::*;
use regex::Regex;
use std::sync::LazyLock;

/// Human-readable prefix every encoded public key starts with.
pub const NPUB_PREFIX: &str = "npub1";

static NPUB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^npub1[qpzry9x8gf2tvdw0s3jn54khce6mua7l]{58}$").unwrap());

/// Why a key string could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// The field holds something other than an npub (URL, username, ...).
    #[error("not an npub")]
    NotNpub,
    /// The field looks like an npub but is malformed.
    #[error("invalid npub: {0}")]
    InvalidNpub(String),
    /// The signer secret could not be decoded.
    #[error("invalid nsec: {0}")]
    InvalidNsec(String),
}

/// Decode an `npub1...` string into a public key.
///
/// Surrounding whitespace is ignored. Strings without the npub prefix return
/// [`KeyError::NotNpub`] so callers can skip them quietly; anything carrying the
/// prefix that fails the charset/length check or bech32 decoding returns
/// [`KeyError::InvalidNpub`].
pub fn decode_npub(raw: &str) -> Result<PublicKey, KeyError> {
    let candidate = raw.trim();
    if !candidate.starts_with(NPUB_PREFIX) {
        return Err(KeyError::NotNpub);
    }
    if !NPUB_RE.is_match(candidate) {
        return Err(KeyError::InvalidNpub("unexpected length or charset".to_string()));
    }
    PublicKey::from_bech32(candidate).map_err(|e| KeyError::InvalidNpub(e.to_string()))
}

/// Build signing keys from an `nsec1...` secret.
pub fn keys_from_nsec(nsec: &str) -> Result<Keys, KeyError> {
    let secret_key =
        SecretKey::parse(nsec.trim()).map_err(|e| KeyError::InvalidNsec(e.to_string()))?;
    Ok(Keys::new(secret_key))
}

/// Shorten a hex key for log lines.
pub fn short_hex(pubkey: &PublicKey) -> String {
    let hex = pubkey.to_hex();
    hex[..8.min(hex.len())].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_generated_npub() {
        let keys = Keys::generate();
        let npub = keys.public_key().to_bech32().unwrap();
        assert_eq!(decode_npub(&npub).unwrap(), keys.public_key());
    }

    #[test]
    fn trims_whitespace() {
        let keys = Keys::generate();
        let npub = format!("  {}\n", keys.public_key().to_bech32().unwrap());
        assert_eq!(decode_npub(&npub).unwrap(), keys.public_key());
    }

    #[test]
    fn non_npub_strings_are_not_npubs() {
        assert_eq!(decode_npub("not-a-real-key"), Err(KeyError::NotNpub));
        assert_eq!(decode_npub("https://example.com/me"), Err(KeyError::NotNpub));
        assert_eq!(decode_npub(""), Err(KeyError::NotNpub));
    }

    #[test]
    fn truncated_npub_is_invalid() {
        let keys = Keys::generate();
        let npub = keys.public_key().to_bech32().unwrap();
        let err = decode_npub(&npub[..40]).unwrap_err();
        assert!(matches!(err, KeyError::InvalidNpub(_)));
    }

    #[test]
    fn corrupted_checksum_is_invalid() {
        let keys = Keys::generate();
        let mut npub = keys.public_key().to_bech32().unwrap();
        let last = npub.pop().unwrap();
        npub.push(if last == 'q' { 'p' } else { 'q' });
        assert!(matches!(decode_npub(&npub), Err(KeyError::InvalidNpub(_))));
    }

    #[test]
    fn nsec_round_trip() {
        let keys = Keys::generate();
        let nsec = keys.secret_key().to_bech32().unwrap();
        let parsed = keys_from_nsec(&nsec).unwrap();
        assert_eq!(parsed.public_key(), keys.public_key());
    }

    #[test]
    fn garbage_nsec_rejected() {
        assert!(matches!(keys_from_nsec("nsec1garbage"), Err(KeyError::InvalidNsec(_))));
    }

    #[test]
    fn short_hex_is_eight_chars() {
        let keys = Keys::generate();
        assert_eq!(short_hex(&keys.public_key()).len(), 8);
    }
}
