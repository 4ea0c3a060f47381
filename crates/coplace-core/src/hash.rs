//! Stable hashing helpers for operator signatures.

use blake3::Hasher;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn to_hex(&self) -> String {
        // blake3 hex(32b) is 64 hex chars
        let mut s = String::with_capacity(64);
        for b in &self.0 {
            use std::fmt::Write as _;
            let _ = write!(&mut s, "{:02x}", b);
        }
        s
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub fn hash_bytes(bytes: &[u8]) -> Hash256 {
    let mut h = Hasher::new();
    h.update(bytes);
    Hash256(h.finalize().into())
}

pub fn hash_str(s: &str) -> Hash256 {
    hash_bytes(s.as_bytes())
}

/// Canonical signature of an operator subtree.
///
/// `canonical` is the normalized textual form of the subtree and `hash` its
/// blake3 digest. Two signatures are equal only if both agree, so a digest
/// collision alone never produces a match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub hash: Hash256,
    pub canonical: String,
}

impl Signature {
    pub fn from_canonical(canonical: String) -> Self {
        Self {
            hash: hash_str(&canonical),
            canonical,
        }
    }

    /// Combine an operator's own canonical text with its children's signatures.
    /// Children are sorted first so the result does not depend on input order.
    pub fn compose(own: &str, children: &[&Signature]) -> Self {
        let mut parts: Vec<&str> = children.iter().map(|s| s.canonical.as_str()).collect();
        parts.sort_unstable();
        if parts.is_empty() {
            Self::from_canonical(own.to_string())
        } else {
            Self::from_canonical(format!("{own}({})", parts.join(",")))
        }
    }
}
