//! Build and cache results.
//!
//! A [`BuildResult`] is created exactly once per rule per build and is
//! immutable afterwards; later pipeline stages only wrap it with extra
//! bookkeeping, never mutate it.

use crate::key::RuleKey;
use crate::rule::RuleId;
use crate::Error;
use std::sync::Arc;

/// Outcome of one cache check.
#[derive(Debug, Clone)]
pub enum CacheResult {
    /// The cache had no artifact for the key.
    Miss,
    /// The locally stored key matched; no artifact moved.
    LocalKeyUnchangedHit,
    /// An artifact was fetched for the key.
    Hit {
        /// The key the artifact was found under.
        key: RuleKey,
        /// Content hash of the fetched artifact, when the backend records one.
        content_hash: Option<String>,
    },
    /// The cache errored; treated as a miss by the cascade.
    Error {
        /// What the backend reported.
        message: String,
    },
}

impl CacheResult {
    /// True for the hit variants.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::LocalKeyUnchangedHit | Self::Hit { .. })
    }

    /// True when the check was a genuine miss (not an error).
    #[must_use]
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }
}

/// Terminal status of one rule's build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    /// The rule produced (or reused) valid outputs.
    Success,
    /// The rule's own execution or finalization failed.
    Fail,
    /// The rule was cancelled, usually as fallout of another rule's failure.
    Canceled,
}

/// How a successful rule got its outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessType {
    /// On-disk metadata matched the freshly computed default key.
    MatchingRuleKey,
    /// On-disk metadata matched the input-based key.
    MatchingInputBasedRuleKey,
    /// The recomputed dep-file key matched the recorded one.
    MatchingDepFileRuleKey,
    /// The rule's steps ran to completion.
    BuiltLocally,
    /// Artifact fetched by default key.
    FetchedFromCache,
    /// Artifact fetched by input-based key.
    FetchedFromCacheInputBased,
    /// Artifact fetched via a manifest entry's dep-file key.
    FetchedFromCacheManifestBased,
}

impl SuccessType {
    /// Whether this success path invalidated/overwrote the previous outputs.
    /// Finalize asserts the outputs-can-change latch for these.
    #[must_use]
    pub fn outputs_have_changed(self) -> bool {
        matches!(
            self,
            Self::BuiltLocally
                | Self::FetchedFromCache
                | Self::FetchedFromCacheInputBased
                | Self::FetchedFromCacheManifestBased
        )
    }

    /// Whether the resulting artifact is a candidate for upload.
    #[must_use]
    pub fn should_upload(self) -> bool {
        matches!(self, Self::BuiltLocally)
    }

    /// True for the no-op success paths that only normalize metadata.
    #[must_use]
    pub fn is_matching(self) -> bool {
        matches!(
            self,
            Self::MatchingRuleKey | Self::MatchingInputBasedRuleKey | Self::MatchingDepFileRuleKey
        )
    }
}

/// The outcome of processing one rule, immutable after creation.
#[derive(Debug, Clone)]
pub struct BuildResult {
    rule: RuleId,
    status: BuildStatus,
    success_type: Option<SuccessType>,
    cache_result: Option<CacheResult>,
    deps_with_cache_miss: Vec<RuleId>,
    strategy_result: Option<String>,
    failure: Option<Arc<Error>>,
}

impl BuildResult {
    /// A successful result.
    #[must_use]
    pub fn success(
        rule: RuleId,
        success_type: SuccessType,
        cache_result: CacheResult,
        deps_with_cache_miss: Vec<RuleId>,
        strategy_result: Option<String>,
    ) -> Self {
        Self {
            rule,
            status: BuildStatus::Success,
            success_type: Some(success_type),
            cache_result: Some(cache_result),
            deps_with_cache_miss,
            strategy_result,
            failure: None,
        }
    }

    /// A failed result carrying its triggering error.
    #[must_use]
    pub fn failure(rule: RuleId, cause: Arc<Error>, deps_with_cache_miss: Vec<RuleId>) -> Self {
        Self {
            rule,
            status: BuildStatus::Fail,
            success_type: None,
            cache_result: None,
            deps_with_cache_miss,
            strategy_result: None,
            failure: Some(cause),
        }
    }

    /// A cancelled result carrying the error that caused the cancellation.
    #[must_use]
    pub fn canceled(rule: RuleId, cause: Arc<Error>, deps_with_cache_miss: Vec<RuleId>) -> Self {
        Self {
            rule,
            status: BuildStatus::Canceled,
            success_type: None,
            cache_result: None,
            deps_with_cache_miss,
            strategy_result: None,
            failure: Some(cause),
        }
    }

    /// Identity of the rule this result belongs to.
    #[must_use]
    pub fn rule(&self) -> &RuleId {
        &self.rule
    }

    /// Terminal status.
    #[must_use]
    pub fn status(&self) -> BuildStatus {
        self.status
    }

    /// True iff the status is `Success`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Success
    }

    /// The success type, present iff successful.
    #[must_use]
    pub fn success_type(&self) -> Option<SuccessType> {
        self.success_type
    }

    /// The cache result that produced this outcome.
    #[must_use]
    pub fn cache_result(&self) -> Option<&CacheResult> {
        self.cache_result.as_ref()
    }

    /// Dependencies that missed cache during this rule's dependency wait.
    #[must_use]
    pub fn deps_with_cache_miss(&self) -> &[RuleId] {
        &self.deps_with_cache_miss
    }

    /// Strategy-specific result string, when a custom strategy built the rule.
    #[must_use]
    pub fn strategy_result(&self) -> Option<&str> {
        self.strategy_result.as_deref()
    }

    /// The triggering error, present iff failed or cancelled.
    #[must_use]
    pub fn failure_cause(&self) -> Option<&Arc<Error>> {
        self.failure.as_ref()
    }
}
