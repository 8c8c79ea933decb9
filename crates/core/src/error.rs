//! Error types shared by the anvil crates

use crate::rule::RuleId;
use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for build engine operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during an engine or cache operation
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(anvil::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create")
        operation: String,
    },

    /// Configuration or invariant violation
    #[error("Build engine configuration error: {message}")]
    #[diagnostic(code(anvil::config))]
    Configuration {
        /// Error message describing the issue
        message: String,
    },

    /// Serialization error (metadata, manifests, cached artifacts)
    #[error("Serialization error: {message}")]
    #[diagnostic(code(anvil::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// A build step of a rule failed
    #[error("Step '{step}' failed for {rule}: {message}")]
    #[diagnostic(code(anvil::step_failed))]
    StepFailed {
        /// The rule whose step failed
        rule: RuleId,
        /// Short name of the failed step
        step: String,
        /// What went wrong
        message: String,
    },

    /// Building a rule failed; wraps the underlying cause with the rule identity
    #[error("Building rule [{rule}] failed")]
    #[diagnostic(code(anvil::rule_failed))]
    RuleFailed {
        /// The rule that failed
        rule: RuleId,
        /// The underlying cause
        #[source]
        source: Box<Error>,
    },

    /// A rule was cancelled before or while building
    #[error("Building rule [{rule}] was cancelled: {message}")]
    #[diagnostic(code(anvil::canceled))]
    Canceled {
        /// The rule that was cancelled
        rule: RuleId,
        /// Why it was cancelled (usually the first failure of the build)
        message: String,
    },

    /// An interruption signal was observed mid-step
    #[error("Interrupted: {message}")]
    #[diagnostic(code(anvil::interrupted))]
    Interrupted {
        /// Where the interruption was observed
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a step failure
    #[must_use]
    pub fn step_failed(
        rule: RuleId,
        step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::StepFailed {
            rule,
            step: step.into(),
            message: message.into(),
        }
    }

    /// Wrap an error with the identity of the rule it failed.
    ///
    /// Already-wrapped errors are returned unchanged so the innermost rule
    /// identity survives propagation through dependents.
    #[must_use]
    pub fn rule_failed(rule: &RuleId, source: Error) -> Self {
        match source {
            wrapped @ (Self::RuleFailed { .. } | Self::Canceled { .. }) => wrapped,
            other => Self::RuleFailed {
                rule: rule.clone(),
                source: Box::new(other),
            },
        }
    }

    /// Create a cancellation error
    #[must_use]
    pub fn canceled(rule: &RuleId, message: impl Into<String>) -> Self {
        Self::Canceled {
            rule: rule.clone(),
            message: message.into(),
        }
    }

    /// Create an interruption error
    #[must_use]
    pub fn interrupted(msg: impl Into<String>) -> Self {
        Self::Interrupted {
            message: msg.into(),
        }
    }

    /// True for interruption errors, which are translated back into
    /// cancellation rather than reported as rule failures.
    #[must_use]
    pub fn is_interruption(&self) -> bool {
        match self {
            Self::Interrupted { .. } => true,
            Self::RuleFailed { source, .. } => source.is_interruption(),
            _ => false,
        }
    }
}

/// Result type for build engine operations
pub type Result<T> = std::result::Result<T, Error>;
