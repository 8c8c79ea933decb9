//! Shared fixtures for engine integration tests.

use anvil_cache::{ArtifactCache, CacheArtifact, Manifest};
use anvil_core::{
    BuildResult, CachePolicy, Capabilities, PipelineSpec, PipelineWorker, PipelineWorkerSpawner,
    Result, Rule, RuleId, RuleKey, Step, StepContext,
};
use anvil_engine::DepResultsProvider;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A step that writes a fixed file under the project root and counts runs.
pub struct WriteFileStep {
    pub rel: PathBuf,
    pub contents: String,
    pub runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Step for WriteFileStep {
    fn name(&self) -> &str {
        "write-output"
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let dest = ctx.project_root.join(&self.rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anvil_core::Error::io(e, parent, "create_dir_all"))?;
        }
        std::fs::write(&dest, &self.contents)
            .map_err(|e| anvil_core::Error::io(e, &dest, "write"))
    }
}

/// A step that only counts its runs.
pub struct CountingStep {
    pub runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Step for CountingStep {
    fn name(&self) -> &str {
        "count"
    }

    async fn run(&self, _ctx: &StepContext) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A step that always fails.
pub struct FailingStep;

#[async_trait]
impl Step for FailingStep {
    fn name(&self) -> &str {
        "explode"
    }

    async fn run(&self, _ctx: &StepContext) -> Result<()> {
        Err(anvil_core::Error::configuration("tool returned 1"))
    }
}

/// Configurable rule fixture.
pub struct TestRule {
    pub id: RuleId,
    pub rule_type: String,
    pub deps: Vec<RuleId>,
    pub outputs: Vec<PathBuf>,
    pub inputs: Vec<PathBuf>,
    pub capabilities: Capabilities,
    pub steps: Vec<Arc<dyn Step>>,
    pub input_based: Option<Vec<PathBuf>>,
    pub consumed: Vec<PathBuf>,
    pub universe: Option<Vec<PathBuf>>,
    pub pipeline: Option<PipelineSpec>,
    pub cache_policy: CachePolicy,
    pub post_steps: Vec<Arc<dyn Step>>,
}

impl TestRule {
    pub fn new(id: &str) -> Self {
        Self {
            id: RuleId::new(id),
            rule_type: "test_rule".to_string(),
            deps: Vec::new(),
            outputs: Vec::new(),
            inputs: Vec::new(),
            capabilities: Capabilities::default(),
            steps: Vec::new(),
            input_based: None,
            consumed: Vec::new(),
            universe: None,
            pipeline: None,
            cache_policy: CachePolicy::Enabled,
            post_steps: Vec::new(),
        }
    }

    pub fn with_post_build(mut self, step: Arc<dyn Step>) -> Self {
        self.capabilities.post_build_steps = true;
        self.post_steps.push(step);
        self
    }

    pub fn with_pipeline(mut self, spec: PipelineSpec) -> Self {
        self.capabilities.pipelining = true;
        self.pipeline = Some(spec);
        self
    }

    pub fn writing(mut self, output: &str, contents: &str, runs: &Arc<AtomicUsize>) -> Self {
        self.outputs.push(PathBuf::from(output));
        self.steps.push(Arc::new(WriteFileStep {
            rel: PathBuf::from(output),
            contents: contents.to_string(),
            runs: Arc::clone(runs),
        }));
        self
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(PathBuf::from).collect();
        self
    }

    pub fn with_input_based(mut self, inputs: &[&str]) -> Self {
        self.capabilities.input_based_keys = true;
        self.input_based = Some(inputs.iter().map(PathBuf::from).collect());
        self
    }

    pub fn with_dep_file(mut self, consumed: &[&str], universe: &[&str]) -> Self {
        self.capabilities.dep_file_keys = true;
        self.consumed = consumed.iter().map(PathBuf::from).collect();
        self.universe = Some(universe.iter().map(PathBuf::from).collect());
        self
    }
}

impl Rule for TestRule {
    fn id(&self) -> &RuleId {
        &self.id
    }
    fn rule_type(&self) -> &str {
        &self.rule_type
    }
    fn deps(&self) -> &[RuleId] {
        &self.deps
    }
    fn output_paths(&self) -> &[PathBuf] {
        &self.outputs
    }
    fn declared_inputs(&self) -> &[PathBuf] {
        &self.inputs
    }
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }
    fn build_steps(&self) -> Vec<Arc<dyn Step>> {
        self.steps.clone()
    }
    fn post_build_steps(&self) -> Vec<Arc<dyn Step>> {
        self.post_steps.clone()
    }
    fn input_based_inputs(&self) -> Option<Vec<PathBuf>> {
        self.input_based.clone()
    }
    fn consumed_inputs_after_building(&self) -> Result<Vec<PathBuf>> {
        Ok(self.consumed.clone())
    }
    fn possible_input_universe(&self) -> Option<Vec<PathBuf>> {
        self.universe.clone()
    }
    fn pipeline(&self) -> Option<&PipelineSpec> {
        self.pipeline.as_ref()
    }
    fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }
}

/// Spawner fixture that counts spawns and the stages its worker runs.
pub struct StubPipeline {
    pub spawned: Arc<AtomicUsize>,
    pub stages: Arc<AtomicUsize>,
}

struct StubWorker {
    stages: Arc<AtomicUsize>,
}

#[async_trait]
impl PipelineWorker for StubWorker {
    async fn run_stage(&self, _rule: &RuleId, _first_stage: bool) -> Result<()> {
        self.stages.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[async_trait]
impl PipelineWorkerSpawner for StubPipeline {
    async fn spawn(&self, _pipeline_id: &str) -> Result<Arc<dyn PipelineWorker>> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StubWorker {
            stages: Arc::clone(&self.stages),
        }))
    }
}

/// Dependency provider backed by a plain map.
#[derive(Default)]
pub struct MapDeps {
    keys: HashMap<RuleId, RuleKey>,
    results: HashMap<RuleId, BuildResult>,
}

impl MapDeps {
    pub fn insert(&mut self, id: RuleId, key: RuleKey, result: BuildResult) {
        self.keys.insert(id.clone(), key);
        self.results.insert(id, result);
    }
}

#[async_trait]
impl DepResultsProvider for MapDeps {
    async fn dep_default_key(&self, dep: &RuleId) -> Result<RuleKey> {
        self.keys
            .get(dep)
            .copied()
            .ok_or_else(|| anvil_core::Error::configuration(format!("unknown dependency {dep}")))
    }

    async fn wait_for_dep(&self, dep: &RuleId) -> Result<BuildResult> {
        self.results
            .get(dep)
            .cloned()
            .ok_or_else(|| anvil_core::Error::configuration(format!("unknown dependency {dep}")))
    }
}

/// Counts every gateway call before delegating to an inner cache.
pub struct CountingCache {
    inner: Arc<dyn ArtifactCache>,
    pub fetches: AtomicUsize,
    pub stores: AtomicUsize,
    pub manifest_fetches: AtomicUsize,
    pub manifest_stores: AtomicUsize,
}

impl CountingCache {
    pub fn new(inner: Arc<dyn ArtifactCache>) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
            stores: AtomicUsize::new(0),
            manifest_fetches: AtomicUsize::new(0),
            manifest_stores: AtomicUsize::new(0),
        }
    }

    pub fn total_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
            + self.stores.load(Ordering::SeqCst)
            + self.manifest_fetches.load(Ordering::SeqCst)
            + self.manifest_stores.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactCache for CountingCache {
    async fn fetch(&self, key: &RuleKey, dest: &Path) -> Result<anvil_core::CacheResult> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(key, dest).await
    }

    async fn store(&self, keys: &[RuleKey], artifact: CacheArtifact<'_>) -> Result<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.inner.store(keys, artifact).await
    }

    async fn fetch_manifest(&self, key: &RuleKey) -> Result<Option<Manifest>> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_manifest(key).await
    }

    async fn store_manifest(&self, key: &RuleKey, manifest: &Manifest) -> Result<()> {
        self.manifest_stores.fetch_add(1, Ordering::SeqCst);
        self.inner.store_manifest(key, manifest).await
    }
}
