//! Digest types and the key-to-level mapping.
//!
//! All hashes are SHA-256. Wrapping the raw bytes in distinct newtypes
//! keeps value hashes, page hashes and root hashes from being compared
//! across kinds by accident. Digests serialize as lowercase hex so they
//! survive JSON transports unmodified.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// A raw 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// The all-zero digest, used as the empty-tree sentinel.
    pub const ZERO: Self = Self([0; 32]);

    /// Hashes a byte string.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Wraps raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(self.0))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HexVisitor;

        impl Visitor<'_> for HexVisitor {
            type Value = Digest;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 64-character hex digest")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Digest, E> {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(v, &mut bytes)
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))?;
                Ok(Digest(bytes))
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

macro_rules! digest_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Digest);

        impl $name {
            /// Wraps a raw digest.
            #[must_use]
            pub const fn new(digest: Digest) -> Self {
                Self(digest)
            }

            /// Returns the digest bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 32] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

digest_newtype! {
    /// Hash of a record's serialized value, stored per key in the tree.
    ValueDigest
}

digest_newtype! {
    /// Hash of a page and its entire subtree.
    PageDigest
}

digest_newtype! {
    /// Hash of the root page; summarizes the whole tree.
    RootHash
}

impl ValueDigest {
    /// Hashes serialized value bytes.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(Digest::of(data))
    }
}

impl RootHash {
    /// The root hash of an empty tree.
    pub const EMPTY: Self = Self(Digest::ZERO);
}

impl From<PageDigest> for RootHash {
    fn from(digest: PageDigest) -> Self {
        Self(digest.0)
    }
}

/// Maps a key to its tree level: the number of leading zero 4-bit
/// groups of `SHA-256(key)`.
///
/// Roughly 15/16 of keys land on level 0 (the leaves); each level above
/// holds ~1/16 of the level below. Deterministic, so the tree shape is
/// a pure function of the key set.
#[must_use]
pub fn level_of_key(key: &[u8]) -> u8 {
    let digest = Digest::of(key);
    let mut level = 0u8;
    for byte in digest.as_bytes() {
        if byte >> 4 != 0 {
            break;
        }
        level += 1;
        if byte & 0x0f != 0 {
            break;
        }
        level += 1;
    }
    level
}
