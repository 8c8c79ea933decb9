//! Fetches artifacts and materializes them into the project tree.
//!
//! A fetch never touches the project tree until the hit is confirmed: the
//! archive unpacks into a staging directory first, the caller's
//! outputs-will-change hook runs (invalidating stale metadata and memoized
//! hashes), and only then do the files overlay the project root. Transport
//! errors degrade to a [`CacheResult::Error`], which callers treat as a
//! miss.

use crate::gateway::ArtifactCache;
use anvil_core::{CacheResult, Error, Result, RuleKey};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

pub struct ArtifactFetcher {
    cache: Arc<dyn ArtifactCache>,
    project_root: PathBuf,
}

impl ArtifactFetcher {
    #[must_use]
    pub fn new(cache: Arc<dyn ArtifactCache>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            cache,
            project_root: project_root.into(),
        }
    }

    /// Try `key`; on a hit, run `on_outputs_will_change` and copy the
    /// artifact's files over the project root.
    ///
    /// Returns `Err` only for failures after the hit is confirmed (the hook,
    /// or materialization itself): at that point the outputs may be in a
    /// mixed state and the rule must fail rather than fall back to building.
    pub async fn fetch_and_materialize(
        &self,
        key: &RuleKey,
        on_outputs_will_change: impl FnOnce() -> Result<()> + Send,
    ) -> Result<CacheResult> {
        let staging = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(key = %key, "Cache fetch staging failed: {e}");
                return Ok(CacheResult::Error {
                    message: e.to_string(),
                });
            }
        };

        let result = match self.cache.fetch(key, staging.path()).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(key = %key, "Cache fetch failed: {e}");
                return Ok(CacheResult::Error {
                    message: e.to_string(),
                });
            }
        };
        if !result.is_success() {
            return Ok(result);
        }

        on_outputs_will_change()?;
        self.overlay(staging.path())?;
        Ok(result)
    }

    fn overlay(&self, staged: &Path) -> Result<()> {
        for entry in WalkDir::new(staged).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_dir() {
                continue;
            }
            let rel = match entry.path().strip_prefix(staged) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let dest = self.project_root.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
            }
            fs::copy(entry.path(), &dest).map_err(|e| Error::io(e, &dest, "copy"))?;
        }
        Ok(())
    }
}
