//! Stable metadata key names persisted next to a rule's outputs.
//!
//! These names round-trip exactly: they appear verbatim in the on-disk
//! artifact metadata file and in cached-artifact metadata.

/// The default rule key the outputs were built with.
pub const RULE_KEY: &str = "RULE_KEY";
/// The input-based rule key, when the rule supports that flavor.
pub const INPUT_BASED_RULE_KEY: &str = "INPUT_BASED_RULE_KEY";
/// The dep-file rule key recorded after a local build.
pub const DEP_FILE_RULE_KEY: &str = "DEP_FILE_RULE_KEY";
/// The manifest key the rule's manifest is stored under.
pub const MANIFEST_KEY: &str = "MANIFEST_KEY";
/// Total size in bytes of the recorded outputs.
pub const OUTPUT_SIZE: &str = "OUTPUT_SIZE";
/// Combined hash over the recorded outputs; absent above the size ceiling.
pub const OUTPUT_HASH: &str = "OUTPUT_HASH";
/// The build that last touched this metadata.
pub const BUILD_ID: &str = "BUILD_ID";
/// The build that originally produced the outputs.
pub const ORIGIN_BUILD_ID: &str = "ORIGIN_BUILD_ID";
/// The rule's target label.
pub const TARGET: &str = "TARGET";
/// The rule's target configuration.
pub const CONFIGURATION: &str = "CONFIGURATION";
/// JSON list of the precise inputs consumed by the previous local build;
/// used to rebuild the dep-file key.
pub const DEP_FILE: &str = "DEP_FILE";
/// JSON list of output paths recorded by the build.
pub const RECORDED_PATHS: &str = "RECORDED_PATHS";
/// JSON map of recorded output path -> content hash.
pub const RECORDED_PATH_HASHES: &str = "RECORDED_PATH_HASHES";
