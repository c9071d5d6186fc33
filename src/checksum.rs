//! SDL checksums
//!
//! Publishing identical SDL twice must not create a second version; the
//! registry compares checksums of the whitespace-trimmed document.

use sha2::{Digest, Sha256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SHA256 checksum of an SDL document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    /// Checksum of `sdl`, ignoring leading and trailing whitespace
    pub fn of_sdl(sdl: &str) -> Self {
        let hash = Sha256::digest(sdl.trim().as_bytes());
        Self(hex::encode(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `sdl` hashes to this checksum
    pub fn matches(&self, sdl: &str) -> bool {
        *self == Self::of_sdl(sdl)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
