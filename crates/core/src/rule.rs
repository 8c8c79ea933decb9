//! The rule model: buildable units, their capability surface, and build steps.
//!
//! A rule is an opaque buildable unit with a stable identity, declared
//! dependencies and declared outputs. The engine never duplicates rules;
//! they are shared behind `Arc<dyn Rule>`.
//!
//! Optional behaviors (post-build steps, dep-file keys, pipelining, ...)
//! are modeled as an explicit [`Capabilities`] set resolved once at rule
//! construction, not runtime type tests.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stable identity of a buildable unit (a target label like `//app:lib`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(Arc<str>);

impl RuleId {
    /// Create an id from a target label.
    pub fn new(label: impl AsRef<str>) -> Self {
        Self(Arc::from(label.as_ref()))
    }

    /// The target label.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Optional behaviors a rule opted into at construction time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The rule has post-build steps to run after a local build or fetch.
    pub post_build_steps: bool,
    /// The rule re-initializes internal state from disk after finalize.
    pub init_from_disk: bool,
    /// The rule supports input-based rule keys.
    pub input_based_keys: bool,
    /// The rule supports dep-file rule keys (and manifest caching).
    pub dep_file_keys: bool,
    /// The rule's stages can be pipelined onto a shared worker.
    pub pipelining: bool,
}

/// Whether a rule's outputs may be stored in the artifact cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Outputs are cacheable (the default).
    #[default]
    Enabled,
    /// Outputs must never be uploaded.
    Disabled,
}

/// Execution context handed to each step.
pub struct StepContext {
    /// Root of the project tree steps run against.
    pub project_root: PathBuf,
    /// Cooperative cancellation; checked between steps and forwarded to
    /// long-running work inside a step.
    pub cancel: CancellationToken,
}

/// One unit of work a rule executes to produce its outputs.
///
/// Steps are defined by rule authors; the engine only sequences them.
#[async_trait]
pub trait Step: Send + Sync {
    /// Short name for logs and failure messages.
    fn name(&self) -> &str;

    /// Run the step to completion.
    async fn run(&self, ctx: &StepContext) -> Result<()>;
}

/// How a pipelined rule attaches to its shared worker.
#[derive(Clone)]
pub struct PipelineSpec {
    /// Identity of the worker this rule's stage runs on. Rules sharing an
    /// id share one long-lived worker process.
    pub pipeline_id: Arc<str>,
    /// Spawns the worker when the first stage of the pipeline runs.
    pub spawner: Arc<dyn PipelineWorkerSpawner>,
}

impl fmt::Debug for PipelineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineSpec")
            .field("pipeline_id", &self.pipeline_id)
            .finish_non_exhaustive()
    }
}

/// Starts the long-lived worker process for a pipeline.
#[async_trait]
pub trait PipelineWorkerSpawner: Send + Sync {
    /// Spawn the worker. Called at most once per pipeline id per build.
    async fn spawn(&self, pipeline_id: &str) -> Result<Arc<dyn PipelineWorker>>;
}

/// A live, long-lived worker shared by the rules of one pipeline.
#[async_trait]
pub trait PipelineWorker: Send + Sync {
    /// Submit one rule's stage to the worker and wait for it to finish.
    ///
    /// `first_stage` is true exactly once per worker: for the first stage
    /// the freshly started worker executes.
    async fn run_stage(&self, rule: &RuleId, first_stage: bool) -> Result<()>;

    /// Tear the worker down. Called when the last pipelined rule using it
    /// has finalized.
    async fn shutdown(&self);
}

/// A buildable unit in the dependency graph.
///
/// Accessors guarded by a capability flag (`input_based_inputs`,
/// `consumed_inputs_after_building`, `pipeline`, ...) are only called by
/// the engine when the corresponding [`Capabilities`] flag is set.
pub trait Rule: Send + Sync {
    /// Stable identity.
    fn id(&self) -> &RuleId;

    /// Rule type name, used for per-type output-hash size limits.
    fn rule_type(&self) -> &str;

    /// Identities of the rules this rule depends on.
    fn deps(&self) -> &[RuleId];

    /// Declared output paths, relative to the project root.
    fn output_paths(&self) -> &[PathBuf];

    /// Declared source input files (project-root relative); the default
    /// rule key digests their contents. Dependency outputs are covered by
    /// the dependencies' keys, not listed here.
    fn declared_inputs(&self) -> &[PathBuf];

    /// The capability set resolved at construction.
    fn capabilities(&self) -> &Capabilities;

    /// The steps that produce this rule's outputs.
    fn build_steps(&self) -> Vec<Arc<dyn Step>>;

    /// Steps to run after a local build or fetch, never after a key-match
    /// no-op (only with `post_build_steps`).
    fn post_build_steps(&self) -> Vec<Arc<dyn Step>> {
        Vec::new()
    }

    /// The inputs this rule actually consumes, for the input-based key.
    /// Only meaningful once dependencies have completed.
    fn input_based_inputs(&self) -> Option<Vec<PathBuf>> {
        None
    }

    /// The precise inputs consumed during the build that just ran; feeds
    /// the dep-file key recorded for the next build.
    fn consumed_inputs_after_building(&self) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    /// The universe of inputs the rule could consume; the manifest key
    /// digests their names (not contents) so one manifest covers every
    /// historically-observed consumed subset.
    fn possible_input_universe(&self) -> Option<Vec<PathBuf>> {
        None
    }

    /// Re-initialize internal state from the on-disk outputs; invoked
    /// only after a successful metadata write (`init_from_disk`).
    fn initialize_from_disk(&self) -> Result<()> {
        Ok(())
    }

    /// Pipeline attachment (only with `pipelining`).
    fn pipeline(&self) -> Option<&PipelineSpec> {
        None
    }

    /// Whether this rule's outputs may be uploaded.
    fn cache_policy(&self) -> CachePolicy {
        CachePolicy::Enabled
    }

    /// Scheduler weight override for this rule's execution stage.
    fn schedule_weight(&self) -> Option<u32> {
        None
    }

    /// Target configuration stamped into metadata.
    fn configuration(&self) -> &str {
        "default"
    }
}

impl Capabilities {
    /// Validate internal consistency of a capability set.
    pub fn validate(&self, id: &RuleId) -> Result<()> {
        if self.dep_file_keys && !self.input_based_keys {
            return Err(Error::configuration(format!(
                "rule {id} declares dep-file keys without input-based keys"
            )));
        }
        Ok(())
    }
}
