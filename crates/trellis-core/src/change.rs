//! Signed, content-addressed changes.
//!
//! A [`Change`] is the unit of replication: an author, a causal dependency
//! list, an action name, a JSON payload, a hybrid-logical timestamp, and a
//! signature over the canonical encoding of everything else. Its identity
//! is the BLAKE3 hash of its canonical encoding (signature included), so a
//! change can never be altered without changing its ID.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::canonical::to_canonical_json;
use crate::clock::Timestamp;
use crate::error::Result;
use crate::signer::{AuthorId, Signer, verify};

/// Number of trailing ID characters used as a replica origin tag.
const ORIGIN_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identity of an entity (a document, a profile, any replicated object).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content address of a change: `b3:<hex of the BLAKE3 hash>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(String);

impl ChangeId {
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short replica tag derived from this ID: its last eight characters.
    ///
    /// Collisions would need two changes agreeing on a 32-bit hash suffix
    /// inside one entity, which the content address makes negligible.
    #[must_use]
    pub fn origin(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let start = chars.len().saturating_sub(ORIGIN_LEN);
        chars[start..].iter().collect()
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

/// A signed, content-addressed change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Entity this change belongs to.
    pub entity: EntityId,
    /// Author that signed the change.
    pub author: AuthorId,
    /// IDs of the causal predecessors (the entity's heads at creation).
    pub deps: Vec<ChangeId>,
    /// Action name, e.g. `"Create"` or `"Update"`.
    pub action: String,
    /// JSON patch payload interpreted by the merge layer.
    pub payload: Value,
    /// Hybrid-logical timestamp assigned at creation.
    pub ts: Timestamp,
    /// Hex-encoded signature over [`Change::signing_bytes`].
    pub signature: String,
}

impl Change {
    /// Build and sign a change. The signature covers the canonical
    /// encoding of every field except the signature itself.
    pub fn new(
        entity: EntityId,
        deps: Vec<ChangeId>,
        action: impl Into<String>,
        payload: Value,
        ts: Timestamp,
        signer: &dyn Signer,
    ) -> Self {
        let mut change = Self {
            entity,
            author: signer.author(),
            deps,
            action: action.into(),
            payload,
            ts,
            signature: String::new(),
        };
        change.signature = signer.sign(&change.signing_bytes());
        change
    }

    /// Canonical bytes covered by the signature.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        to_canonical_json(&json!({
            "type": "Change",
            "entity": self.entity,
            "author": self.author,
            "deps": self.deps,
            "action": self.action,
            "payload": self.payload,
            "ts": self.ts,
        }))
    }

    /// Content address of the full change, signature included.
    #[must_use]
    pub fn content_id(&self) -> ChangeId {
        let bytes = to_canonical_json(&json!({
            "type": "Change",
            "entity": self.entity,
            "author": self.author,
            "deps": self.deps,
            "action": self.action,
            "payload": self.payload,
            "ts": self.ts,
            "sig": self.signature,
        }));
        ChangeId(format!("b3:{}", blake3::hash(&bytes).to_hex()))
    }

    /// Check the signature against the embedded author.
    ///
    /// # Errors
    ///
    /// [`crate::CrdtError::SignatureInvalid`] when the signature does not
    /// verify.
    pub fn verify(&self) -> Result<()> {
        verify(&self.author, &self.signing_bytes(), &self.signature)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::Keypair;

    fn sample_change(payload: Value) -> Change {
        let kp = Keypair::from_seed([5u8; 32]);
        Change::new(
            EntityId::new("hm://doc/1"),
            vec![ChangeId::new("b3:dep1")],
            "Update",
            payload,
            Timestamp::from_raw(1_000 << 16),
            &kp,
        )
    }

    #[test]
    fn content_id_is_prefixed_blake3_hex() {
        let id = sample_change(json!({"k": 1})).content_id();
        assert!(id.as_str().starts_with("b3:"));
        assert_eq!(id.as_str().len(), 3 + 64);
    }

    #[test]
    fn identical_changes_share_an_id() {
        let a = sample_change(json!({"k": 1}));
        let b = sample_change(json!({"k": 1}));
        assert_eq!(a.content_id(), b.content_id());
    }

    #[test]
    fn payload_changes_the_id() {
        let a = sample_change(json!({"k": 1}));
        let b = sample_change(json!({"k": 2}));
        assert_ne!(a.content_id(), b.content_id());
    }

    #[test]
    fn signature_verifies() {
        sample_change(json!({"k": 1})).verify().expect("valid");
    }

    #[test]
    fn tampering_breaks_verification() {
        let mut ch = sample_change(json!({"k": 1}));
        ch.payload = json!({"k": 2});
        assert!(ch.verify().is_err());
    }

    #[test]
    fn origin_is_last_eight_chars() {
        let id = ChangeId::new("b3:0123456789abcdef");
        assert_eq!(id.origin(), "89abcdef");
        assert_eq!(ChangeId::new("short").origin(), "short");
    }

    #[test]
    fn serde_roundtrip() {
        let ch = sample_change(json!({"k": [1, 2, 3]}));
        let encoded = serde_json::to_string(&ch).expect("serialize");
        let back: Change = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(back, ch);
        assert_eq!(back.content_id(), ch.content_id());
    }
}
