//! Per-build session state: build identity, build mode, and the global
//! first-failure latch.

use crate::Error;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identity of one build invocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuildId(Uuid);

impl BuildId {
    /// Mint a fresh build id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// How the build as a whole is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    /// Normal build: fetch or execute as needed.
    #[default]
    Build,
    /// Populate the remote cache only; local execution is disabled and
    /// dependency failures do not cancel dependents.
    PopulateRemoteCache,
}

/// Shared state for one build invocation.
///
/// The first-failure latch is set at most once (first writer wins) and is
/// consulted by every cascade stage before doing further speculative work.
/// This is advisory cooperative cancellation: in-flight work completes or
/// is cancelled via its own hook, stages not yet started short-circuit.
pub struct BuildSession {
    build_id: BuildId,
    mode: BuildMode,
    first_failure: OnceLock<Arc<Error>>,
    cancel: CancellationToken,
}

impl BuildSession {
    /// Start a session for one build invocation.
    #[must_use]
    pub fn new(mode: BuildMode) -> Self {
        Self {
            build_id: BuildId::new(),
            mode,
            first_failure: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// This build's identity.
    #[must_use]
    pub fn build_id(&self) -> BuildId {
        self.build_id
    }

    /// The build mode.
    #[must_use]
    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    /// True until the first failure is recorded.
    #[must_use]
    pub fn keep_going(&self) -> bool {
        self.first_failure.get().is_none()
    }

    /// The first recorded failure, if any.
    #[must_use]
    pub fn first_failure(&self) -> Option<&Arc<Error>> {
        self.first_failure.get()
    }

    /// Record a failure; only the first writer wins. Returns the failure
    /// that is latched (the argument, or the earlier one).
    pub fn record_first_failure(&self, failure: Arc<Error>) -> Arc<Error> {
        if self.first_failure.set(Arc::clone(&failure)).is_ok() {
            self.cancel.cancel();
            return failure;
        }
        self.first_failure.get().cloned().unwrap_or(failure)
    }

    /// Cancellation token cancelled when the latch is set; strategies and
    /// steps observe it for cooperative cancellation.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}
