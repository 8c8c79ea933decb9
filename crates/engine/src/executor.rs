//! Local execution of a rule's steps.

use anvil_core::{Error, Result, Rule, Step, StepContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// What a custom strategy produced, beyond the outputs themselves.
#[derive(Debug, Default)]
pub struct StrategyOutcome {
    /// Backend-specific result string surfaced on the build result
    /// (e.g. a remote execution action digest).
    pub strategy_result: Option<String>,
}

/// Alternative execution backend for rules it claims.
///
/// Cancellation flows through `ctx.cancel`; a strategy observing it should
/// return an interruption error rather than partial success.
#[async_trait]
pub trait BuildStrategy: Send + Sync {
    /// Whether this strategy can build `rule`. Rules it declines run their
    /// steps locally.
    fn can_build(&self, rule: &dyn Rule) -> bool;

    /// Produce the rule's outputs under `ctx.project_root`.
    async fn build(&self, rule: &dyn Rule, ctx: &StepContext) -> Result<StrategyOutcome>;
}

/// Run `steps` in order, checking for cancellation between steps.
pub async fn run_steps(
    rule: &anvil_core::RuleId,
    steps: &[Arc<dyn Step>],
    ctx: &StepContext,
) -> Result<()> {
    for step in steps {
        if ctx.cancel.is_cancelled() {
            return Err(Error::interrupted(format!(
                "cancelled before step '{}'",
                step.name()
            )));
        }
        let started = Instant::now();
        tracing::debug!(rule = %rule, step = step.name(), "Running step");
        step.run(ctx).await.map_err(|e| match e {
            failed @ (Error::StepFailed { .. } | Error::Interrupted { .. }) => failed,
            other => Error::step_failed(rule.clone(), step.name(), other.to_string()),
        })?;
        tracing::debug!(
            rule = %rule,
            step = step.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Step finished"
        );
    }
    Ok(())
}

/// Execute a rule locally: through `strategy` when it claims the rule,
/// otherwise by running the rule's own build steps.
pub async fn execute_rule(
    rule: &dyn Rule,
    steps: Vec<Arc<dyn Step>>,
    ctx: &StepContext,
    strategy: Option<&dyn BuildStrategy>,
) -> Result<StrategyOutcome> {
    if let Some(strategy) = strategy {
        if strategy.can_build(rule) {
            tracing::debug!(rule = %rule.id(), "Building via custom strategy");
            return strategy.build(rule, ctx).await;
        }
    }
    run_steps(rule.id(), &steps, ctx).await?;
    Ok(StrategyOutcome::default())
}
