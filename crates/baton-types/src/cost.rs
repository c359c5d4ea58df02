//! Cost tracking types for Baton runs.
//!
//! A run accumulates append-only `CostRecord`s in a tracker; the limit
//! enforcer folds them into a `UsageSnapshot` to compare against the
//! configured ceilings.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::TokenUsage;

/// One appended usage/cost record, attributed to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub run_id: Uuid,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    /// Monetary cost in USD, when the provider reported or the engine
    /// estimated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Cumulative usage for a run at a point in time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub total_cost_usd: f64,
    pub usage: TokenUsage,
}

impl UsageSnapshot {
    /// Fold a set of records into a snapshot.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CostRecord>) -> Self {
        let mut snapshot = UsageSnapshot::default();
        for record in records {
            snapshot.usage.add(&record.usage);
            if let Some(cost) = record.cost_usd {
                snapshot.total_cost_usd += cost;
            }
        }
        snapshot
    }

    /// Snapshot with an additional usage/cost delta applied.
    pub fn with_delta(&self, usage: &TokenUsage, cost_usd: f64) -> Self {
        let mut next = *self;
        next.usage.add(usage);
        next.total_cost_usd += cost_usd;
        next
    }
}
