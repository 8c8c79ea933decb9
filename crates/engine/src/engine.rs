//! The build engine facade.

use crate::cascade::RuleBuild;
use crate::config::EngineConfig;
use crate::executor::BuildStrategy;
use crate::keys::RuleKeyService;
use crate::pipeline::PipelineCoordinator;
use crate::scheduler::StageScheduler;
use crate::upload::UploadCoordinator;
use anvil_cache::{ArtifactCache, FileHashCache};
use anvil_core::{
    BuildMode, BuildResult, BuildSession, Error, Result, Rule, RuleId, RuleKey,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Supplies dependency results to a rule's build.
///
/// The engine processes one rule at a time; whoever walks the graph (a
/// graph scheduler, or the tests) implements this to hand over dependency
/// keys and completed results.
#[async_trait]
pub trait DepResultsProvider: Send + Sync {
    /// The default key of a dependency. Available without building it.
    async fn dep_default_key(&self, dep: &RuleId) -> Result<RuleKey>;

    /// Wait until a dependency has finished and return its result.
    async fn wait_for_dep(&self, dep: &RuleId) -> Result<BuildResult>;
}

/// Builds rules through the cache cascade. One engine serves one build
/// invocation; rules share its session, hash cache, scheduler, pipelines,
/// and upload queue.
pub struct BuildEngine {
    session: Arc<BuildSession>,
    config: Arc<EngineConfig>,
    project_root: PathBuf,
    cache: Option<Arc<dyn ArtifactCache>>,
    hashes: Arc<FileHashCache>,
    deps: Arc<dyn DepResultsProvider>,
    strategy: Option<Arc<dyn BuildStrategy>>,
    pipelines: Arc<PipelineCoordinator>,
    scheduler: Arc<StageScheduler>,
    uploads: Arc<UploadCoordinator>,
}

impl BuildEngine {
    #[must_use]
    pub fn new(
        project_root: impl Into<PathBuf>,
        config: EngineConfig,
        mode: BuildMode,
        deps: Arc<dyn DepResultsProvider>,
    ) -> Self {
        let config = Arc::new(config);
        let scheduler = Arc::new(StageScheduler::new(
            config.scheduler_capacity,
            config.cache_check_weight,
            config.execution_weight,
        ));
        let uploads = Arc::new(UploadCoordinator::new(None, config.artifact_size_limit));
        Self {
            session: Arc::new(BuildSession::new(mode)),
            config,
            project_root: project_root.into(),
            cache: None,
            hashes: Arc::new(FileHashCache::new()),
            deps,
            strategy: None,
            pipelines: Arc::new(PipelineCoordinator::new()),
            scheduler,
            uploads,
        }
    }

    /// Attach an artifact cache. Without one the engine builds purely
    /// locally: no fetches, no uploads, no manifest traffic.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn ArtifactCache>) -> Self {
        self.uploads = Arc::new(UploadCoordinator::new(
            Some(Arc::clone(&cache)),
            self.config.artifact_size_limit,
        ));
        self.cache = Some(cache);
        self
    }

    /// Attach a custom execution strategy for the rules it claims.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn BuildStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn session(&self) -> &Arc<BuildSession> {
        &self.session
    }

    #[must_use]
    pub fn file_hashes(&self) -> &Arc<FileHashCache> {
        &self.hashes
    }

    /// Build one rule to completion. Never panics and never returns `Err`:
    /// every outcome, including engine-internal trouble, is a
    /// [`BuildResult`].
    pub async fn build(&self, rule: Arc<dyn Rule>) -> BuildResult {
        let id = rule.id().clone();
        tracing::debug!(rule = %id, "Starting rule");
        if let Err(e) = rule.capabilities().validate(&id) {
            return self.setup_failure(id, e);
        }

        let mut dep_keys = Vec::with_capacity(rule.deps().len());
        for dep in rule.deps() {
            match self.deps.dep_default_key(dep).await {
                Ok(key) => dep_keys.push(key),
                Err(e) => return self.setup_failure(id, e),
            }
        }
        let keys = match RuleKeyService::new(
            Arc::clone(&rule),
            Arc::clone(&self.hashes),
            self.project_root.clone(),
            &dep_keys,
        ) {
            Ok(keys) => keys,
            Err(e) => return self.setup_failure(id, e),
        };

        RuleBuild::new(
            rule,
            Arc::clone(&self.session),
            Arc::clone(&self.config),
            self.project_root.clone(),
            self.cache.clone(),
            Arc::clone(&self.hashes),
            keys,
            Arc::clone(&self.deps),
            self.strategy.clone(),
            Arc::clone(&self.pipelines),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.uploads),
        )
        .build()
        .await
    }

    /// Cancel the whole build; rules that have not started a stage resolve
    /// as cancelled.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.session
            .record_first_failure(Arc::new(Error::interrupted(reason)));
    }

    /// Wait for every queued artifact and manifest upload to land.
    pub async fn wait_for_uploads(&self) {
        self.uploads.drain().await;
    }

    fn setup_failure(&self, rule: RuleId, error: Error) -> BuildResult {
        let cause = self
            .session
            .record_first_failure(Arc::new(Error::rule_failed(&rule, error)));
        tracing::error!(rule = %rule, "Rule setup failed: {cause}");
        BuildResult::failure(rule, cause, Vec::new())
    }
}
