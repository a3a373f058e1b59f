use serde::{Deserialize, Serialize};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStats {
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Unchanged files re-analyzed because their document or xref was out
    /// of date.
    #[serde(default)]
    pub refreshed: usize,
    /// New or changed files that could not be read or analyzed; retried
    /// next run. A changed file keeps its previous entry.
    pub failed: usize,
    /// Committed documents after the pass.
    pub documents: usize,
    pub optimized: bool,
    /// Post-processing still owed (the persisted marker after the pass).
    pub dirty: bool,
    pub cancelled: bool,
    pub time_ms: u64,
}

impl ProjectStats {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.added > 0 || self.removed > 0 || self.refreshed > 0
    }
}
