//! Artifact caching for the anvil build engine.
//!
//! - [`gateway`]: the [`ArtifactCache`] seam and the directory-backed cache
//! - [`fetcher`]: materializing cache hits into the project tree
//! - [`build_info`]: crash-consistent per-rule metadata next to outputs
//! - [`file_hash`]: memoized content hashing
//! - [`manifest`]: input-hash manifests for dep-file cache lookups

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

pub mod build_info;
pub mod fetcher;
pub mod file_hash;
pub mod gateway;
pub mod manifest;

pub use build_info::{BuildInfoRecorder, OnDiskBuildInfo};
pub use fetcher::ArtifactFetcher;
pub use file_hash::FileHashCache;
pub use gateway::{ArtifactCache, CacheArtifact, DirArtifactCache};
pub use manifest::{Manifest, ManifestEntry};
