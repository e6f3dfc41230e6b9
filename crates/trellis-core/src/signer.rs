//! Signing contract consumed by the change layer.
//!
//! The core never manages keys itself — it only needs something that can
//! sign canonical bytes and name its author. [`Keypair`] is the bundled
//! Ed25519 implementation; hosts with hardware keys or remote signers can
//! provide their own [`Signer`].

use std::fmt;

use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{CrdtError, Result};

/// Length of an Ed25519 signature in bytes.
const SIGNATURE_LEN: usize = 64;

// ---------------------------------------------------------------------------
// AuthorId
// ---------------------------------------------------------------------------

/// Identity of a change author: `ed:<hex of the verifying key>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorId(String);

impl AuthorId {
    /// Wrap an already-encoded author string.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Derive the author ID from a verifying key.
    #[must_use]
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(format!("ed:{}", hex_encode(key.as_bytes())))
    }

    /// The encoded form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn verifying_key(&self) -> Result<VerifyingKey> {
        let hex = self
            .0
            .strip_prefix("ed:")
            .ok_or_else(|| CrdtError::SignatureInvalid(format!("malformed author id {}", self.0)))?;
        let bytes = hex_decode(hex)
            .ok_or_else(|| CrdtError::SignatureInvalid(format!("malformed author id {}", self.0)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CrdtError::SignatureInvalid(format!("bad key length in {}", self.0)))?;
        VerifyingKey::from_bytes(&arr)
            .map_err(|e| CrdtError::SignatureInvalid(format!("invalid verifying key: {e}")))
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Signer contract
// ---------------------------------------------------------------------------

/// Anything able to sign canonical change bytes on behalf of an author.
pub trait Signer {
    /// The author identity that [`verify`] will check signatures against.
    fn author(&self) -> AuthorId;

    /// Sign a message, returning the hex-encoded signature.
    fn sign(&self, message: &[u8]) -> String;
}

/// Verify a hex-encoded signature against an author's verifying key.
///
/// # Errors
///
/// [`CrdtError::SignatureInvalid`] when the signature, the author
/// encoding, or the verification itself fails. Propagated unchanged by
/// everything above this layer.
pub fn verify(author: &AuthorId, message: &[u8], signature_hex: &str) -> Result<()> {
    let key = author.verifying_key()?;
    let bytes = hex_decode(signature_hex)
        .ok_or_else(|| CrdtError::SignatureInvalid("signature is not valid hex".into()))?;
    let arr: [u8; SIGNATURE_LEN] = bytes
        .try_into()
        .map_err(|_| CrdtError::SignatureInvalid("signature has wrong length".into()))?;
    let sig = ed25519_dalek::Signature::from_bytes(&arr);
    key.verify(message, &sig)
        .map_err(|e| CrdtError::SignatureInvalid(e.to_string()))
}

// ---------------------------------------------------------------------------
// Keypair
// ---------------------------------------------------------------------------

/// An Ed25519 keypair implementing [`Signer`].
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Used by tests and by
    /// hosts that derive device keys from a master secret.
    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }
}

impl Signer for Keypair {
    fn author(&self) -> AuthorId {
        AuthorId::from_verifying_key(&self.signing.verifying_key())
    }

    fn sign(&self, message: &[u8]) -> String {
        hex_encode(&self.signing.sign(message).to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.author())
    }
}

// ---------------------------------------------------------------------------
// Hex helpers
// ---------------------------------------------------------------------------

fn hex_encode(bytes: &[u8]) -> String {
    use fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            u8::try_from((hi << 4) | lo).ok()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
