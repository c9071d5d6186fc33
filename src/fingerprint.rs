//! Operation fingerprints
//!
//! A fingerprint identifies one operation *shape*: the canonical body, its kind,
//! the set of schema coordinates it touched and the reported operation name.
//! It deduplicates operation records and keys every rollup. It is not a
//! security primitive.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use crate::usage::OperationKind;

/// Width of the digest in bytes (128 bits)
const DIGEST_BYTES: usize = 16;

/// 128-bit operation fingerprint, rendered as 32 lowercase hex characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationHash(String);

impl OperationHash {
    /// Compute the fingerprint of an operation shape
    ///
    /// Coordinates are deduplicated and sorted before hashing, so the caller's
    /// ordering never leaks into the digest.
    pub fn compute<S: AsRef<str>>(
        body: &str,
        kind: OperationKind,
        coordinates: &[S],
        name: Option<&str>,
    ) -> Self {
        let sorted: BTreeSet<&str> = coordinates.iter().map(|c| c.as_ref()).collect();

        let mut hasher = Sha256::new();
        write_field(&mut hasher, body.as_bytes());
        write_field(&mut hasher, kind.as_str().as_bytes());
        hasher.update((sorted.len() as u64).to_le_bytes());
        for coordinate in &sorted {
            write_field(&mut hasher, coordinate.as_bytes());
        }
        match name {
            Some(name) => {
                hasher.update([1u8]);
                write_field(&mut hasher, name.as_bytes());
            }
            None => hasher.update([0u8]),
        }

        let digest = hasher.finalize();
        Self(hex::encode(&digest[..DIGEST_BYTES]))
    }

    /// Get the hex string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Length-prefix every field so adjacent fields can't bleed into each other
fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl fmt::Display for OperationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OperationHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OperationHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
