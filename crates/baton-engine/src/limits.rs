//! Cost and token limit enforcement.
//!
//! The enforcer is constructed with the workflow-level limits, the cost
//! tracker, and the run id. It is consulted before each step (against
//! cumulative usage) and after each step (step-level ceilings against the
//! step's own delta, workflow-level ceilings against a fresh cumulative
//! snapshot). Exceedances dispatch by `on_limit`: abort yields a
//! structured error, warn logs, continue is silent.
//!
//! The streaming monitor polls the tracker during a long-running LLM call
//! -- every 10 seconds or every 5,000 tokens of observed growth. It is
//! best-effort: accurate cost is only known at completion, and the
//! monitor's view may lag real usage by up to one poll window.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use baton_types::cost::UsageSnapshot;
use baton_types::error::{CostLimitExceeded, TokenLimitExceeded};
use baton_types::llm::TokenUsage;
use baton_types::workflow::{LimitAction, StepDefinition, WorkflowLimits};

use crate::tracker::{CostTracker, usage_for_run};

/// Wall-clock interval between streaming limit evaluations.
pub const STREAM_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Token growth that triggers an early streaming evaluation.
pub const STREAM_POLL_TOKENS: u64 = 5_000;

/// Tick granularity of the monitor loop.
const MONITOR_TICK: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A cost or token ceiling was exceeded with `on_limit: abort`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LimitError {
    #[error(transparent)]
    Cost(#[from] CostLimitExceeded),

    #[error(transparent)]
    Token(#[from] TokenLimitExceeded),
}

// ---------------------------------------------------------------------------
// LimitEnforcer
// ---------------------------------------------------------------------------

/// Enforces workflow- and step-level cost/token ceilings against the
/// tracker's view of the run.
#[derive(Clone)]
pub struct LimitEnforcer {
    limits: WorkflowLimits,
    tracker: Arc<dyn CostTracker>,
    run_id: Uuid,
}

impl LimitEnforcer {
    pub fn new(limits: WorkflowLimits, tracker: Arc<dyn CostTracker>, run_id: Uuid) -> Self {
        Self {
            limits,
            tracker,
            run_id,
        }
    }

    /// Cumulative usage for the run, summed from all tracker records
    /// matching the run id.
    pub fn current_usage(&self) -> UsageSnapshot {
        usage_for_run(self.tracker.as_ref(), self.run_id)
    }

    /// Check before a step runs: step-level and workflow-level ceilings
    /// against current cumulative usage.
    pub fn check_before_step(&self, step: &StepDefinition) -> Result<(), LimitError> {
        let snapshot = self.current_usage();
        let scope = format!("step {}", step.id);
        self.evaluate(
            &scope,
            step.max_cost,
            step.max_tokens,
            snapshot.total_cost_usd,
            snapshot.usage.total_tokens,
            &snapshot,
        )?;
        self.evaluate_workflow(&snapshot)
    }

    /// Check after a step completed: step-level ceilings against just the
    /// step's reported usage, workflow-level ceilings against a fresh
    /// cumulative snapshot (which includes the step's records).
    pub fn check_after_step(
        &self,
        step: &StepDefinition,
        step_usage: &TokenUsage,
        step_cost_usd: f64,
    ) -> Result<(), LimitError> {
        let snapshot = self.current_usage();
        let scope = format!("step {}", step.id);
        self.evaluate(
            &scope,
            step.max_cost,
            step.max_tokens,
            step_cost_usd,
            step_usage.total_tokens,
            &snapshot,
        )?;
        self.evaluate_workflow(&snapshot)
    }

    /// Evaluate the workflow-level ceilings against a snapshot.
    pub fn evaluate_workflow(&self, snapshot: &UsageSnapshot) -> Result<(), LimitError> {
        self.evaluate(
            "workflow",
            self.limits.max_cost,
            self.limits.max_tokens,
            snapshot.total_cost_usd,
            snapshot.usage.total_tokens,
            snapshot,
        )
    }

    fn evaluate(
        &self,
        scope: &str,
        max_cost: Option<f64>,
        max_tokens: Option<u64>,
        actual_cost: f64,
        actual_tokens: u64,
        snapshot: &UsageSnapshot,
    ) -> Result<(), LimitError> {
        let cost_excess = max_cost.filter(|limit| actual_cost > *limit);
        let token_excess = max_tokens.filter(|limit| actual_tokens > *limit);
        if cost_excess.is_none() && token_excess.is_none() {
            return Ok(());
        }

        let mut reasons = Vec::new();
        if let Some(limit) = cost_excess {
            reasons.push(format!("cost ${actual_cost:.4} exceeds limit ${limit:.4}"));
        }
        if let Some(limit) = token_excess {
            reasons.push(format!("tokens {actual_tokens} exceed limit {limit}"));
        }
        let reason = reasons.join("; ");

        match self.limits.on_limit {
            LimitAction::Continue => Ok(()),
            LimitAction::Warn => {
                tracing::warn!(run_id = %self.run_id, scope, %reason, "limit exceeded");
                Ok(())
            }
            LimitAction::Abort => {
                if cost_excess.is_some() {
                    Err(LimitError::Cost(CostLimitExceeded {
                        scope: scope.to_string(),
                        reason,
                        current_usage: *snapshot,
                        limits: self.limits.clone(),
                    }))
                } else {
                    Err(LimitError::Token(TokenLimitExceeded {
                        scope: scope.to_string(),
                        limit: max_tokens.unwrap_or(0),
                        actual: actual_tokens,
                    }))
                }
            }
        }
    }

    /// Spawn the best-effort streaming monitor for a long-running call.
    ///
    /// The monitor re-evaluates workflow limits every
    /// [`STREAM_POLL_INTERVAL`] or whenever observed tokens grow by
    /// [`STREAM_POLL_TOKENS`], and resolves with the limit error if one
    /// trips. It stops silently when `cancel` fires.
    pub fn spawn_streaming_monitor(
        &self,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Option<LimitError>> {
        let enforcer = self.clone();
        tokio::spawn(async move {
            let mut last_eval = Instant::now();
            let mut last_tokens = enforcer.current_usage().usage.total_tokens;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(MONITOR_TICK) => {}
                }
                let snapshot = enforcer.current_usage();
                let due = last_eval.elapsed() >= STREAM_POLL_INTERVAL
                    || snapshot.usage.total_tokens >= last_tokens + STREAM_POLL_TOKENS;
                if !due {
                    continue;
                }
                last_eval = Instant::now();
                last_tokens = snapshot.usage.total_tokens;
                if let Err(err) = enforcer.evaluate_workflow(&snapshot) {
                    return Some(err);
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
