//! Rule keys: content-addressed digests over a rule's identity and inputs.
//!
//! Four flavors exist per rule (default, input-based, manifest, dep-file);
//! all share this digest type. Equality is digest equality.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// A fixed-length digest identifying a rule plus a selected input set.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleKey([u8; 32]);

impl RuleKey {
    /// Reconstruct a key from its hex form (as stored in on-disk metadata).
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let digest: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(digest))
    }

    /// Hex form, as written to metadata and used for cache paths.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuleKey({})", &self.to_hex()[..12])
    }
}

impl Serialize for RuleKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RuleKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| D::Error::custom("invalid rule key digest"))
    }
}

/// Incremental sha256 builder for rule keys.
///
/// Every field is length-prefixed so adjacent fields cannot alias.
pub struct KeyBuilder {
    hasher: Sha256,
}

impl KeyBuilder {
    /// Start a key of the given flavor ("default", "input", "manifest", "depfile").
    #[must_use]
    pub fn new(flavor: &str) -> Self {
        let mut builder = Self {
            hasher: Sha256::new(),
        };
        builder.feed(flavor);
        builder
    }

    /// Mix a string field into the digest.
    pub fn feed(&mut self, value: &str) -> &mut Self {
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    /// Mix a path/hash input pair into the digest.
    pub fn feed_input(&mut self, path: &str, hash: &str) -> &mut Self {
        self.feed(path);
        self.feed(hash);
        self
    }

    /// Finish and produce the key.
    #[must_use]
    pub fn finish(self) -> RuleKey {
        RuleKey(self.hasher.finalize().into())
    }
}

/// A rule key together with the input list it covers.
///
/// Used for the manifest and dep-file flavors, where the selected inputs
/// matter to later stages (manifest entries record them).
#[derive(Clone, Debug)]
pub struct RuleKeyAndInputs {
    /// The computed key.
    pub key: RuleKey,
    /// Project-root-relative inputs the key covers, in digest order.
    pub inputs: Vec<PathBuf>,
}
