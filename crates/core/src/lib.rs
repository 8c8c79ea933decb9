//! Core types for the anvil build engine.
//!
//! This crate defines the rule model and the vocabulary shared by the
//! cache and engine crates:
//! - [`rule`]: buildable units, their capability surface, steps, pipelines
//! - [`key`]: content-addressed rule keys (four flavors per rule)
//! - [`result`]: build and cache results
//! - [`session`]: per-build state (build id, mode, first-failure latch)
//! - [`metadata`]: stable on-disk metadata key names

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

mod error;
pub mod key;
pub mod metadata;
pub mod result;
pub mod rule;
pub mod session;

pub use error::{Error, Result};
pub use key::{KeyBuilder, RuleKey, RuleKeyAndInputs};
pub use result::{BuildResult, BuildStatus, CacheResult, SuccessType};
pub use rule::{
    CachePolicy, Capabilities, PipelineSpec, PipelineWorker, PipelineWorkerSpawner, Rule, RuleId,
    Step, StepContext,
};
pub use session::{BuildId, BuildMode, BuildSession};
