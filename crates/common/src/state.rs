//! # Overlay State Types
//!
//! Value types shared by the persistence layer and the bootstrap sequencer.
//!
//! - [`StateBlob`]: opaque daemon state, stored and replayed verbatim.
//! - [`JoinCredential`]: one-time secret for the first network join.
//!
//! Neither type interprets its contents. The daemon owns the format of the
//! state file; this crate only moves bytes between the database and disk.

use std::fmt;

// ════════════════════════════════════════════════════════════════════════════
// STATE BLOB
// ════════════════════════════════════════════════════════════════════════════

/// Opaque overlay-network identity and membership state.
///
/// Equality is byte-for-byte. The blob is never parsed.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct StateBlob(Vec<u8>);

impl StateBlob {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// An empty blob is treated as "no state" by bootstrap.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the blob as text, for backends that persist into a text column.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<String> for StateBlob {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&str> for StateBlob {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for StateBlob {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

// State files hold private node keys; Debug only reports the size.
impl fmt::Debug for StateBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBlob").field("len", &self.0.len()).finish()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// JOIN CREDENTIAL
// ════════════════════════════════════════════════════════════════════════════

/// One-time secret used to authenticate the node's first join.
///
/// Only required when no [`StateBlob`] exists yet. Redacted in `Debug`
/// and has no `Display` impl, so it cannot end up in a log line by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinCredential(String);

impl JoinCredential {
    /// Returns `None` for an empty or whitespace-only secret.
    pub fn new(secret: impl Into<String>) -> Option<Self> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            None
        } else {
            Some(Self(secret))
        }
    }

    /// Exposes the secret for passing to the join command.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for JoinCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JoinCredential([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_equality_is_bytewise() {
        assert_eq!(StateBlob::from("S1"), StateBlob::new(b"S1".to_vec()));
        assert_ne!(StateBlob::from("S1"), StateBlob::from("S1 "));
    }

    #[test]
    fn test_blob_as_text_rejects_invalid_utf8() {
        let blob = StateBlob::new(vec![0xff, 0xfe]);
        assert!(blob.as_text().is_none());
        assert_eq!(StateBlob::from("{}").as_text(), Some("{}"));
    }

    #[test]
    fn test_blob_debug_hides_contents() {
        let blob = StateBlob::from("private-node-key");
        let dbg = format!("{:?}", blob);
        assert!(!dbg.contains("private"));
        assert!(dbg.contains("16"));
    }

    #[test]
    fn test_credential_empty_is_none() {
        assert!(JoinCredential::new("").is_none());
        assert!(JoinCredential::new("   ").is_none());
        assert!(JoinCredential::new("tskey-abc").is_some());
    }

    #[test]
    fn test_credential_debug_redacted() {
        let cred = JoinCredential::new("tskey-secret").unwrap();
        assert_eq!(format!("{:?}", cred), "JoinCredential([REDACTED])");
        assert_eq!(cred.expose(), "tskey-secret");
    }
}
