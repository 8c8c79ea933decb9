//! Asynchronous cache uploads.
//!
//! Uploads never block the build result and never fail it: store errors
//! are logged as warnings. Callers that need the cache fully populated
//! (populate mode, end of build) drain the in-flight set explicitly.

use anvil_cache::{ArtifactCache, CacheArtifact, Manifest};
use anvil_core::{CachePolicy, RuleId, RuleKey, SuccessType};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

pub struct UploadCoordinator {
    cache: Option<Arc<dyn ArtifactCache>>,
    artifact_size_limit: Option<u64>,
    in_flight: Mutex<JoinSet<()>>,
}

impl UploadCoordinator {
    #[must_use]
    pub fn new(cache: Option<Arc<dyn ArtifactCache>>, artifact_size_limit: Option<u64>) -> Self {
        Self {
            cache,
            artifact_size_limit,
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    /// Whether a finished rule's artifact should be uploaded at all.
    #[must_use]
    pub fn should_upload(
        &self,
        success: SuccessType,
        policy: CachePolicy,
        output_size: u64,
    ) -> bool {
        if self.cache.is_none() || policy == CachePolicy::Disabled || !success.should_upload() {
            return false;
        }
        match self.artifact_size_limit {
            Some(limit) => output_size <= limit,
            None => true,
        }
    }

    /// Queue an artifact upload under every key in `keys`.
    pub async fn schedule_artifact(
        &self,
        rule: RuleId,
        keys: Vec<RuleKey>,
        project_root: PathBuf,
        paths: Vec<PathBuf>,
        metadata: BTreeMap<String, String>,
    ) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        self.in_flight.lock().await.spawn(async move {
            let artifact = CacheArtifact {
                project_root: &project_root,
                paths: &paths,
                metadata,
            };
            match cache.store(&keys, artifact).await {
                Ok(()) => {
                    tracing::debug!(rule = %rule, keys = keys.len(), "Uploaded artifact");
                }
                Err(e) => {
                    // Upload trouble must not fail a build that already succeeded.
                    tracing::warn!(rule = %rule, "Artifact upload failed: {e}");
                }
            }
        });
    }

    /// Queue a manifest store.
    pub async fn schedule_manifest(&self, rule: RuleId, key: RuleKey, manifest: Manifest) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        self.in_flight.lock().await.spawn(async move {
            if let Err(e) = cache.store_manifest(&key, &manifest).await {
                tracing::warn!(rule = %rule, "Manifest upload failed: {e}");
            }
        });
    }

    /// Wait for every queued upload to finish.
    pub async fn drain(&self) {
        let mut in_flight = self.in_flight.lock().await;
        while in_flight.join_next().await.is_some() {}
    }
}
