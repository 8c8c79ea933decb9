//! Engine configuration.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Size ceilings controlling whether output content hashes are persisted.
///
/// Hashing very large outputs costs more than the hashes are worth, so
/// hashes are only written when the total output size is under a limit.
/// Resolution order: a limit for the rule's type wins, then the global
/// default, then (for rules using input-based keys) the input-key limit.
/// With no limit configured, hashes are always written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputHashSizeLimits {
    /// Per-rule-type ceilings, keyed by `Rule::rule_type`.
    pub per_rule_type: HashMap<String, u64>,
    /// Ceiling applied when the rule type has none.
    pub default_limit: Option<u64>,
    /// Ceiling for rules with input-based keys when neither of the above
    /// is configured.
    pub input_key_limit: Option<u64>,
}

impl OutputHashSizeLimits {
    /// Whether output hashes should be persisted for outputs totaling
    /// `output_size` bytes.
    #[must_use]
    pub fn should_write_output_hashes(
        &self,
        rule_type: &str,
        uses_input_based_keys: bool,
        output_size: u64,
    ) -> bool {
        if let Some(limit) = self.per_rule_type.get(rule_type) {
            return output_size <= *limit;
        }
        if let Some(limit) = self.default_limit {
            return output_size <= limit;
        }
        if uses_input_based_keys {
            if let Some(limit) = self.input_key_limit {
                return output_size <= limit;
            }
        }
        true
    }
}

/// Static configuration for a [`BuildEngine`](crate::BuildEngine).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where per-rule metadata directories live, relative to the project
    /// root so uploaded artifacts can carry their metadata with them.
    pub metadata_dir: PathBuf,
    /// Output-hash size ceilings.
    pub size_limits: OutputHashSizeLimits,
    /// Artifacts larger than this are never uploaded.
    pub artifact_size_limit: Option<u64>,
    /// Whether manifest-based dep-file caching is enabled.
    pub manifest_caching: bool,
    /// Entries kept per manifest before the oldest fall off.
    pub max_manifest_entries: usize,
    /// Total weight capacity of the stage scheduler.
    pub scheduler_capacity: u32,
    /// Weight of a cache-check stage.
    pub cache_check_weight: u32,
    /// Weight of a local-execution stage (rules may override).
    pub execution_weight: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            metadata_dir: PathBuf::from(".anvil/metadata"),
            size_limits: OutputHashSizeLimits::default(),
            artifact_size_limit: None,
            manifest_caching: true,
            max_manifest_entries: 32,
            scheduler_capacity: 64,
            cache_check_weight: 1,
            execution_weight: 8,
        }
    }
}
