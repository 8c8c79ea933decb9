//! The per-rule build cascade.
//!
//! One [`RuleBuild`] drives one rule through an ordered sequence of ways
//! to obtain its outputs, taking the first that succeeds:
//!
//! 1. on-disk metadata matches the default key (nothing to do)
//! 2. artifact cache, by default key
//! 3. (admit to pipeline, wait for dependencies)
//! 4. on-disk metadata matches the input-based key
//! 5. artifact cache, by input-based key
//! 6. recomputed dep-file key matches the recorded one
//! 7. manifest lookup, then artifact cache by the matched dep-file key
//! 8. local execution, or adoption of a stage the pipeline ran ahead
//!
//! Before every speculative stage the build-wide first-failure latch is
//! consulted; once any rule has failed, rules that have not started a
//! stage resolve as cancelled instead. The outputs-can-change latch flips
//! exactly once, before the first action that may mutate the rule's
//! outputs, and on-disk metadata is deleted at the same moment so stale
//! metadata can never describe new outputs.

use crate::config::EngineConfig;
use crate::engine::DepResultsProvider;
use crate::executor::{self, BuildStrategy};
use crate::keys::RuleKeyService;
use crate::pipeline::PipelineCoordinator;
use crate::scheduler::StageScheduler;
use crate::upload::UploadCoordinator;
use anvil_cache::build_info::rule_metadata_dir;
use anvil_cache::{
    ArtifactCache, ArtifactFetcher, BuildInfoRecorder, FileHashCache, OnDiskBuildInfo,
};
use anvil_core::{
    metadata, BuildMode, BuildResult, BuildSession, CacheResult, Error, PipelineSpec, Result, Rule,
    RuleKey, StepContext, SuccessType,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

struct CascadeOutcome {
    success: SuccessType,
    cache_result: CacheResult,
    strategy_result: Option<String>,
}

impl CascadeOutcome {
    fn matched(success: SuccessType) -> Self {
        Self {
            success,
            cache_result: CacheResult::LocalKeyUnchangedHit,
            strategy_result: None,
        }
    }
}

pub(crate) struct RuleBuild {
    rule: Arc<dyn Rule>,
    session: Arc<BuildSession>,
    config: Arc<EngineConfig>,
    project_root: PathBuf,
    cache: Option<Arc<dyn ArtifactCache>>,
    hashes: Arc<FileHashCache>,
    keys: RuleKeyService,
    info: OnDiskBuildInfo,
    recorder: BuildInfoRecorder,
    deps: Arc<dyn DepResultsProvider>,
    strategy: Option<Arc<dyn BuildStrategy>>,
    pipelines: Arc<PipelineCoordinator>,
    scheduler: Arc<StageScheduler>,
    uploads: Arc<UploadCoordinator>,
    outputs_can_change: AtomicBool,
    deps_with_cache_miss: Vec<anvil_core::RuleId>,
    last_cache_result: CacheResult,
    output_size: u64,
}

#[allow(clippy::too_many_arguments)]
impl RuleBuild {
    pub(crate) fn new(
        rule: Arc<dyn Rule>,
        session: Arc<BuildSession>,
        config: Arc<EngineConfig>,
        project_root: PathBuf,
        cache: Option<Arc<dyn ArtifactCache>>,
        hashes: Arc<FileHashCache>,
        keys: RuleKeyService,
        deps: Arc<dyn DepResultsProvider>,
        strategy: Option<Arc<dyn BuildStrategy>>,
        pipelines: Arc<PipelineCoordinator>,
        scheduler: Arc<StageScheduler>,
        uploads: Arc<UploadCoordinator>,
    ) -> Self {
        let info = OnDiskBuildInfo::new(&project_root.join(&config.metadata_dir), rule.id());
        let recorder = BuildInfoRecorder::new(rule.id().clone());
        Self {
            rule,
            session,
            config,
            project_root,
            cache,
            hashes,
            keys,
            info,
            recorder,
            deps,
            strategy,
            pipelines,
            scheduler,
            uploads,
            outputs_can_change: AtomicBool::new(false),
            deps_with_cache_miss: Vec::new(),
            last_cache_result: CacheResult::Miss,
            output_size: 0,
        }
    }

    pub(crate) async fn build(mut self) -> BuildResult {
        let started = Instant::now();
        let result = match self.run_cascade().await {
            Ok(outcome) => match self.finalize(&outcome).await {
                Ok(()) => BuildResult::success(
                    self.rule.id().clone(),
                    outcome.success,
                    outcome.cache_result,
                    std::mem::take(&mut self.deps_with_cache_miss),
                    outcome.strategy_result,
                ),
                Err(e) => self.to_failure(e),
            },
            Err(e) => self.to_failure(e),
        };
        self.pipeline_finish().await;
        tracing::info!(
            rule = %self.rule.id(),
            status = ?result.status(),
            success = ?result.success_type(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rule finished"
        );
        result
    }

    fn to_failure(&mut self, error: Error) -> BuildResult {
        let rule = self.rule.id().clone();
        let wrapped = Error::rule_failed(&rule, error);
        let canceled = matches!(wrapped, Error::Canceled { .. }) || wrapped.is_interruption();
        let cause = Arc::new(wrapped);
        let deps_missed = std::mem::take(&mut self.deps_with_cache_miss);
        if canceled {
            // Cancellation is fallout, not a failure of its own.
            BuildResult::canceled(rule, cause, deps_missed)
        } else {
            let cause = self.session.record_first_failure(cause);
            tracing::error!(rule = %rule, "Rule failed: {cause}");
            BuildResult::failure(rule, cause, deps_missed)
        }
    }

    fn check_keep_going(&self) -> Result<()> {
        if let Some(first) = self.session.first_failure() {
            return Err(Error::canceled(self.rule.id(), first.to_string()));
        }
        Ok(())
    }

    async fn run_cascade(&mut self) -> Result<CascadeOutcome> {
        self.check_keep_going()?;
        let capabilities = *self.rule.capabilities();

        if let Some(previous) = self.info.get_rule_key(metadata::RULE_KEY) {
            if previous == self.keys.default_key() {
                if self.metadata_is_complete() {
                    tracing::debug!(rule = %self.rule.id(), "Default rule key unchanged");
                    return Ok(CascadeOutcome::matched(SuccessType::MatchingRuleKey));
                }
                // A corrupt "no-op" result cannot be trusted.
                tracing::warn!(rule = %self.rule.id(), "Discarding incomplete build metadata");
                self.info.delete_existing_metadata()?;
            }
        }

        if let Some(outcome) = self
            .try_fetch(self.keys.default_key(), SuccessType::FetchedFromCache)
            .await?
        {
            return Ok(outcome);
        }

        if capabilities.pipelining {
            if let Some(spec) = self.rule.pipeline().cloned() {
                self.pipelines.admit(self.rule.id(), &spec).await;
            }
        }

        self.wait_for_deps().await?;
        self.keys.mark_deps_available();
        self.check_keep_going()?;

        if capabilities.input_based_keys {
            let input_key = self.keys.input_based_key().await?;
            self.recorder
                .add_build_metadata(metadata::INPUT_BASED_RULE_KEY, input_key.to_hex());
            if self.info.get_rule_key(metadata::INPUT_BASED_RULE_KEY) == Some(input_key) {
                tracing::debug!(rule = %self.rule.id(), "Input-based rule key unchanged");
                return Ok(CascadeOutcome::matched(
                    SuccessType::MatchingInputBasedRuleKey,
                ));
            }
            if let Some(outcome) = self
                .try_fetch(input_key, SuccessType::FetchedFromCacheInputBased)
                .await?
            {
                return Ok(outcome);
            }
        }

        if capabilities.dep_file_keys {
            if let Some(outcome) = self.check_recorded_dep_file_key() {
                return Ok(outcome);
            }
            if self.config.manifest_caching {
                if let Some(outcome) = self.manifest_lookup().await? {
                    return Ok(outcome);
                }
            }
        }

        if self.session.mode() == BuildMode::PopulateRemoteCache {
            return Err(Error::canceled(
                self.rule.id(),
                "cache miss while populating the remote cache",
            ));
        }

        self.check_keep_going()?;
        self.build_locally().await
    }

    /// A key match only counts when the metadata fully describes the
    /// outputs: the recorded size must parse, and the output hash must be
    /// present whenever the size policy would have written one.
    fn metadata_is_complete(&self) -> bool {
        let Some(size) = self
            .info
            .get_value(metadata::OUTPUT_SIZE)
            .and_then(|raw| raw.parse::<u64>().ok())
        else {
            return false;
        };
        let needs_hash = self.config.size_limits.should_write_output_hashes(
            self.rule.rule_type(),
            self.rule.capabilities().input_based_keys,
            size,
        );
        !needs_hash || self.info.get_value(metadata::OUTPUT_HASH).is_some()
    }

    async fn try_fetch(
        &mut self,
        key: RuleKey,
        success: SuccessType,
    ) -> Result<Option<CascadeOutcome>> {
        let Some(cache) = self.cache.clone() else {
            return Ok(None);
        };
        let _permit = self.scheduler.cache_check().await?;
        let fetcher = ArtifactFetcher::new(cache, self.project_root.clone());
        let result = {
            let this: &Self = self;
            fetcher
                .fetch_and_materialize(&key, || this.on_outputs_will_change())
                .await?
        };
        if result.is_success() {
            self.seed_fetched_hashes();
            Ok(Some(CascadeOutcome {
                success,
                cache_result: result,
                strategy_result: None,
            }))
        } else {
            self.last_cache_result = result;
            Ok(None)
        }
    }

    /// Flip the outputs-can-change latch and destroy anything that still
    /// describes the previous outputs. Runs at most the moment before the
    /// first mutation of the rule's outputs.
    fn on_outputs_will_change(&self) -> Result<()> {
        self.outputs_can_change.store(true, Ordering::Release);
        self.info.delete_existing_metadata()?;
        for path in self.rule.output_paths() {
            self.hashes.invalidate_subtree(&self.project_root.join(path));
        }
        Ok(())
    }

    fn seed_fetched_hashes(&self) {
        if let Some(map) = self.info.get_string_map(metadata::RECORDED_PATH_HASHES) {
            for (rel, hash) in map {
                self.hashes.set(&self.project_root.join(rel), hash);
            }
        }
    }

    async fn wait_for_deps(&mut self) -> Result<()> {
        let deps: Vec<_> = self.rule.deps().to_vec();
        for dep in deps {
            let result = self.deps.wait_for_dep(&dep).await?;
            if result.is_success() {
                let dep_missed = !result
                    .cache_result()
                    .is_some_and(CacheResult::is_success);
                if dep_missed {
                    self.deps_with_cache_miss.push(dep.clone());
                }
                continue;
            }
            match self.session.mode() {
                // Populate mode only mirrors what the cache can serve;
                // a failed dependency just means this subtree is skipped
                // at its own cache check, not here.
                BuildMode::PopulateRemoteCache => {
                    tracing::debug!(rule = %self.rule.id(), dep = %dep, "Ignoring dependency failure in populate mode");
                }
                BuildMode::Build => {
                    return Err(Error::canceled(
                        self.rule.id(),
                        format!("dependency {dep} did not succeed"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Stage 6: a pure-local check. Recompute the dep-file key over the
    /// inputs the previous build recorded; if nothing it consumed changed,
    /// the outputs are current without any cache traffic.
    fn check_recorded_dep_file_key(&self) -> Option<CascadeOutcome> {
        let recorded = self.info.get_rule_key(metadata::DEP_FILE_RULE_KEY)?;
        let dep_file = self.info.get_path_list(metadata::DEP_FILE)?;
        // A consumed input missing from disk fails recomputation, which
        // just means no match.
        let recomputed = self.keys.dep_file_key(&dep_file).ok()?;
        if recomputed.key == recorded {
            tracing::debug!(rule = %self.rule.id(), "Dep-file rule key unchanged");
            Some(CascadeOutcome::matched(SuccessType::MatchingDepFileRuleKey))
        } else {
            None
        }
    }

    async fn manifest_lookup(&mut self) -> Result<Option<CascadeOutcome>> {
        let Some(cache) = self.cache.clone() else {
            return Ok(None);
        };
        let manifest_key = self.keys.manifest_key().await?;
        self.recorder
            .add_build_metadata(metadata::MANIFEST_KEY, manifest_key.key.to_hex());

        let manifest = {
            let _permit = self.scheduler.cache_check().await?;
            match cache.fetch_manifest(&manifest_key.key).await {
                Ok(Some(manifest)) => manifest,
                Ok(None) => return Ok(None),
                Err(e) => {
                    tracing::warn!(rule = %self.rule.id(), "Manifest fetch failed: {e}");
                    return Ok(None);
                }
            }
        };

        let current = self.keys.current_input_hashes(&manifest_key.inputs);
        let Some(entry) = manifest.find_match(&current) else {
            tracing::debug!(rule = %self.rule.id(), entries = manifest.len(), "No manifest entry matched");
            return Ok(None);
        };
        let dep_file_key = entry.dep_file_key;
        tracing::debug!(rule = %self.rule.id(), key = %dep_file_key, "Manifest entry matched");
        self.try_fetch(dep_file_key, SuccessType::FetchedFromCacheManifestBased)
            .await
    }

    async fn build_locally(&mut self) -> Result<CascadeOutcome> {
        let pipelined = self
            .rule
            .capabilities()
            .pipelining
            .then(|| self.rule.pipeline().cloned())
            .flatten();
        let strategy_result = if let Some(spec) = pipelined {
            // The latch flips before parking: once this rule waits for
            // its turn, an earlier member's dispatch may run its stage
            // ahead and the outputs can change at any point. The
            // coordinator takes execution capacity only at the front of
            // the queue, never while parked.
            self.check_keep_going()?;
            self.on_outputs_will_change()?;
            self.pipelines
                .run_stage(
                    self.rule.id(),
                    &spec,
                    &self.scheduler,
                    self.rule.schedule_weight(),
                )
                .await?;
            None
        } else {
            let _permit = self.scheduler.execution(self.rule.schedule_weight()).await?;
            self.check_keep_going()?;
            self.on_outputs_will_change()?;
            let ctx = StepContext {
                project_root: self.project_root.clone(),
                cancel: self.session.cancellation().child_token(),
            };
            executor::execute_rule(
                self.rule.as_ref(),
                self.rule.build_steps(),
                &ctx,
                self.strategy.as_deref(),
            )
            .await?
            .strategy_result
        };

        let outputs: Vec<PathBuf> = self.rule.output_paths().to_vec();
        for path in outputs {
            self.recorder.record_artifact(path);
        }
        Ok(CascadeOutcome {
            success: SuccessType::BuiltLocally,
            cache_result: self.last_cache_result.clone(),
            strategy_result,
        })
    }

    // --- finalization ---

    async fn finalize(&mut self, outcome: &CascadeOutcome) -> Result<()> {
        match self.finalize_inner(outcome).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Metadata must never vouch for outputs finalize could not.
                if let Err(delete_err) = self.info.delete_existing_metadata() {
                    tracing::warn!(
                        rule = %self.rule.id(),
                        "Failed to clear metadata after finalize error: {delete_err}"
                    );
                }
                Err(e)
            }
        }
    }

    async fn finalize_inner(&mut self, outcome: &CascadeOutcome) -> Result<()> {
        let success = outcome.success;
        let changed = self.outputs_can_change.load(Ordering::Acquire);
        if success.outputs_have_changed() != changed {
            return Err(Error::configuration(format!(
                "outputs-can-change latch for {} is {changed} but the success path is {success:?}",
                self.rule.id()
            )));
        }

        // A key match is a no-op: minimal metadata refresh, nothing runs.
        if success == SuccessType::BuiltLocally {
            self.run_post_build_steps().await?;
            self.finalize_built_locally().await?;
        } else if success.is_matching() {
            self.finalize_matching()?;
        } else {
            self.run_post_build_steps().await?;
            self.finalize_fetched()?;
        }

        if self.rule.capabilities().init_from_disk {
            self.rule.initialize_from_disk()?;
        }
        Ok(())
    }

    async fn run_post_build_steps(&self) -> Result<()> {
        if !self.rule.capabilities().post_build_steps {
            return Ok(());
        }
        let ctx = StepContext {
            project_root: self.project_root.clone(),
            cancel: self.session.cancellation().child_token(),
        };
        let steps = self.rule.post_build_steps();
        executor::run_steps(self.rule.id(), &steps, &ctx).await
    }

    const MATCHING_KEYS: &'static [&'static str] = &[
        metadata::RULE_KEY,
        metadata::INPUT_BASED_RULE_KEY,
        metadata::MANIFEST_KEY,
        metadata::BUILD_ID,
    ];

    /// Outputs unchanged: refresh the keys in the existing metadata so the
    /// next build matches on the cheapest stage again.
    fn finalize_matching(&mut self) -> Result<()> {
        self.recorder
            .add_build_metadata(metadata::RULE_KEY, self.keys.default_key().to_hex());
        self.recorder
            .add_build_metadata(metadata::BUILD_ID, self.session.build_id().to_string());
        self.recorder.assert_only_has_keys(Self::MATCHING_KEYS)?;
        self.recorder.write_metadata_to_disk(&self.info, false)
    }

    /// Fetched: the artifact carried its producer's metadata; stamp our
    /// build id and current keys over it without disturbing the rest.
    fn finalize_fetched(&mut self) -> Result<()> {
        self.recorder
            .add_build_metadata(metadata::RULE_KEY, self.keys.default_key().to_hex());
        self.recorder
            .add_build_metadata(metadata::BUILD_ID, self.session.build_id().to_string());
        self.recorder.assert_only_has_keys(Self::MATCHING_KEYS)?;
        self.recorder.write_metadata_to_disk(&self.info, false)?;
        self.output_size = self
            .info
            .get_value(metadata::OUTPUT_SIZE)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        Ok(())
    }

    async fn finalize_built_locally(&mut self) -> Result<()> {
        let capabilities = *self.rule.capabilities();
        self.recorder
            .add_build_metadata(metadata::RULE_KEY, self.keys.default_key().to_hex());
        self.recorder
            .add_build_metadata(metadata::BUILD_ID, self.session.build_id().to_string());
        self.recorder.add_build_metadata(
            metadata::ORIGIN_BUILD_ID,
            self.session.build_id().to_string(),
        );
        self.recorder
            .add_build_metadata(metadata::TARGET, self.rule.id().as_str());
        self.recorder
            .add_build_metadata(metadata::CONFIGURATION, self.rule.configuration());

        let mut dep_file_key = None;
        if capabilities.dep_file_keys {
            dep_file_key = Some(self.record_dep_file().await?);
        }

        // The build may have written under directories whose files were
        // hashed individually; those memos are stale now.
        for path in self.recorder.recorded_paths() {
            self.hashes.invalidate_subtree(&self.project_root.join(path));
        }

        let rule_type = self.rule.rule_type().to_string();
        let limits = self.config.size_limits.clone();
        let uses_input_based = capabilities.input_based_keys;
        self.output_size = {
            let (recorder, hashes, root) = (&mut self.recorder, &self.hashes, &self.project_root);
            recorder.compute_output_info(root, hashes, |size| {
                limits.should_write_output_hashes(&rule_type, uses_input_based, size)
            })?
        };

        let mut allowed = vec![
            metadata::RULE_KEY,
            metadata::BUILD_ID,
            metadata::ORIGIN_BUILD_ID,
            metadata::TARGET,
            metadata::CONFIGURATION,
            metadata::OUTPUT_SIZE,
            metadata::OUTPUT_HASH,
            metadata::RECORDED_PATHS,
            metadata::RECORDED_PATH_HASHES,
        ];
        if uses_input_based {
            allowed.push(metadata::INPUT_BASED_RULE_KEY);
        }
        if capabilities.dep_file_keys {
            allowed.extend([
                metadata::DEP_FILE,
                metadata::DEP_FILE_RULE_KEY,
                metadata::MANIFEST_KEY,
            ]);
        }
        self.recorder.assert_only_has_keys(&allowed)?;
        self.recorder.write_metadata_to_disk(&self.info, true)?;

        self.schedule_upload(dep_file_key).await;
        Ok(())
    }

    /// Record the inputs this build actually consumed and the dep-file key
    /// over them; returns the key for upload and manifest bookkeeping.
    async fn record_dep_file(&mut self) -> Result<RuleKey> {
        let consumed = self.rule.consumed_inputs_after_building()?;
        if let Some(universe) = self.rule.possible_input_universe() {
            for input in &consumed {
                if !universe.contains(input) {
                    return Err(Error::configuration(format!(
                        "rule {} consumed input {} outside its declared input universe",
                        self.rule.id(),
                        input.display()
                    )));
                }
            }
        }
        let dep_file = self.keys.dep_file_key(&consumed)?;
        self.recorder
            .add_path_list_metadata(metadata::DEP_FILE, &dep_file.inputs);
        self.recorder
            .add_build_metadata(metadata::DEP_FILE_RULE_KEY, dep_file.key.to_hex());

        // Publish the (inputs -> dep-file key) pairing for future builds.
        if self.config.manifest_caching && self.rule.cache_policy() == anvil_core::CachePolicy::Enabled
        {
            if let Some(cache) = self.cache.clone() {
                let manifest_key = self.keys.manifest_key().await?;
                self.recorder
                    .add_build_metadata(metadata::MANIFEST_KEY, manifest_key.key.to_hex());
                let mut manifest = match cache.fetch_manifest(&manifest_key.key).await {
                    Ok(existing) => existing.unwrap_or_default(),
                    Err(e) => {
                        tracing::warn!(rule = %self.rule.id(), "Manifest fetch for update failed: {e}");
                        anvil_cache::Manifest::default()
                    }
                };
                let current = self.keys.current_input_hashes(&dep_file.inputs);
                manifest.add_entry(current, dep_file.key, self.config.max_manifest_entries);
                self.uploads
                    .schedule_manifest(self.rule.id().clone(), manifest_key.key, manifest)
                    .await;
            }
        }
        Ok(dep_file.key)
    }

    async fn schedule_upload(&mut self, dep_file_key: Option<RuleKey>) {
        if !self.uploads.should_upload(
            SuccessType::BuiltLocally,
            self.rule.cache_policy(),
            self.output_size,
        ) {
            return;
        }
        let mut keys = vec![self.keys.default_key()];
        if let Some(raw) = self.recorder.get_value(metadata::INPUT_BASED_RULE_KEY) {
            if let Some(key) = RuleKey::from_hex(raw) {
                keys.push(key);
            }
        }
        if let Some(key) = dep_file_key {
            keys.push(key);
        }

        // The artifact carries its metadata directory so a fetch restores
        // both outputs and metadata in one unpack.
        let mut paths: Vec<PathBuf> = self.recorder.recorded_paths().to_vec();
        paths.push(rule_metadata_dir(&self.config.metadata_dir, self.rule.id()));

        self.uploads
            .schedule_artifact(
                self.rule.id().clone(),
                keys,
                self.project_root.clone(),
                paths,
                self.recorder.metadata().clone(),
            )
            .await;
    }

    async fn pipeline_finish(&self) {
        if self.rule.capabilities().pipelining {
            if let Some(spec) = self.rule.pipeline() {
                let spec: PipelineSpec = spec.clone();
                self.pipelines.finish(self.rule.id(), &spec).await;
            }
        }
    }
}
