//! Manifests map observed input hashes to previously built dep-file keys.
//!
//! A manifest is stored in the cache under a rule's manifest key (which
//! covers everything about the rule except its precise input contents).
//! Each entry pairs the hashes of the inputs a past build actually consumed
//! with the dep-file key that build produced. A later build whose current
//! input hashes match an entry can fetch that build's artifact without
//! running anything.

use anvil_core::RuleKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One past build: the input hashes it consumed and the key it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Project-relative input path -> content hash at build time.
    pub inputs: BTreeMap<String, String>,
    /// The dep-file key the artifact is cached under.
    pub dep_file_key: RuleKey,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// The newest entry whose recorded input hashes all match `current`.
    /// `current` maps every candidate input path to its present hash; an
    /// entry matches when each input it recorded is unchanged.
    #[must_use]
    pub fn find_match(&self, current: &BTreeMap<String, String>) -> Option<&ManifestEntry> {
        self.entries.iter().find(|entry| {
            entry
                .inputs
                .iter()
                .all(|(path, hash)| current.get(path) == Some(hash))
        })
    }

    /// Insert an entry at the front, displacing any older entry with the
    /// same inputs and trimming to `max_entries`. Newest-first order makes
    /// [`find_match`](Self::find_match) prefer recent builds.
    pub fn add_entry(
        &mut self,
        inputs: BTreeMap<String, String>,
        dep_file_key: RuleKey,
        max_entries: usize,
    ) {
        self.entries.retain(|entry| entry.inputs != inputs);
        self.entries.insert(
            0,
            ManifestEntry {
                inputs,
                dep_file_key,
            },
        );
        self.entries.truncate(max_entries.max(1));
    }
}
