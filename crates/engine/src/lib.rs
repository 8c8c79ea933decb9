//! Per-rule build orchestration for anvil.
//!
//! The engine takes one rule at a time through an ordered cascade of ways
//! to obtain its outputs (local key match, cache fetch, input-based and
//! dep-file key matches, manifest lookup, local execution), finalizes the
//! on-disk metadata for whatever path won, and uploads locally built
//! artifacts in the background.

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

mod cascade;
pub mod config;
pub mod engine;
pub mod executor;
pub mod keys;
pub mod pipeline;
pub mod scheduler;
pub mod upload;

pub use config::{EngineConfig, OutputHashSizeLimits};
pub use engine::{BuildEngine, DepResultsProvider};
pub use executor::{BuildStrategy, StrategyOutcome};
pub use keys::RuleKeyService;
pub use pipeline::{PipelineCoordinator, ProcessWorkerSpawner};
pub use scheduler::{StagePermit, StageScheduler};
pub use upload::UploadCoordinator;
