//! SHA256 content digests
//!
//! Every blob and manifest held by the proxy is addressed by a `sha256:<hex>`
//! digest. [`Digest`] is the validated form; [`DigestVerifier`] checks streamed
//! content against an expected digest without buffering twice.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

pub const SHA256_PREFIX: &str = "sha256:";

/// Docker digest with sha256: prefix for empty layers
pub const EMPTY_LAYER_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// A validated `sha256:<64 hex>` content digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse a full digest string
    pub fn parse(digest: &str) -> Result<Self> {
        match digest.strip_prefix(SHA256_PREFIX) {
            Some(hex_part) if is_valid_sha256_hex(hex_part) => Ok(Self(digest.to_string())),
            _ => Err(ProxyError::InvalidDigest(digest.to_string())),
        }
    }

    /// Build a digest from a bare hex string, as found in storage paths
    pub fn from_hex(hex_part: &str) -> Result<Self> {
        Self::parse(&format!("{}{}", SHA256_PREFIX, hex_part))
    }

    /// Compute the digest of a byte slice
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn algorithm(&self) -> &str {
        "sha256"
    }

    /// Hex part without the algorithm prefix
    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }

    /// Truncated form for log lines
    pub fn short(&self) -> &str {
        &self.0[..SHA256_PREFIX.len() + 12]
    }

    /// Verify data matches this digest
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let computed = Self::from_bytes(data);
        if &computed != self {
            return Err(ProxyError::DigestMismatch {
                expected: self.clone(),
                computed,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = ProxyError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

/// Incremental hasher for content arriving in chunks
#[derive(Default)]
pub struct DigestVerifier {
    hasher: Sha256,
    size: u64,
}

impl DigestVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finalize(self) -> Digest {
        Digest(format!(
            "{}{}",
            SHA256_PREFIX,
            hex::encode(self.hasher.finalize())
        ))
    }
}

/// Validate SHA256 hex string (64 characters, lowercase hex)
pub fn is_valid_sha256_hex(digest: &str) -> bool {
    digest.len() == 64
        && digest
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
