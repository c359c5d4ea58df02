//! Cost tracker contract and the in-memory default implementation.
//!
//! The tracker owns the append-only cost records for a process; the limit
//! enforcer folds the records matching a run id into cumulative usage. It
//! is accessed concurrently from parallel tasks and must be safe for
//! concurrent append and read.

use std::sync::Mutex;

use uuid::Uuid;

use baton_types::cost::{CostRecord, UsageSnapshot};

/// Contract for usage/cost record storage.
pub trait CostTracker: Send + Sync {
    /// Append one record.
    fn track(&self, record: CostRecord);

    /// All records appended so far.
    fn records(&self) -> Vec<CostRecord>;
}

/// Cumulative usage for one run, folded from the tracker's records.
pub fn usage_for_run(tracker: &dyn CostTracker, run_id: Uuid) -> UsageSnapshot {
    let records = tracker.records();
    UsageSnapshot::from_records(records.iter().filter(|record| record.run_id == run_id))
}

/// In-memory tracker suitable for tests and in-process runs.
#[derive(Default)]
pub struct InMemoryCostTracker {
    records: Mutex<Vec<CostRecord>>,
}

impl InMemoryCostTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CostTracker for InMemoryCostTracker {
    fn track(&self, record: CostRecord) {
        self.records
            .lock()
            .expect("cost tracker lock poisoned")
            .push(record);
    }

    fn records(&self) -> Vec<CostRecord> {
        self.records
            .lock()
            .expect("cost tracker lock poisoned")
            .clone()
    }
}
