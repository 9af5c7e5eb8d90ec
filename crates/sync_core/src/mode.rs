use serde::{Deserialize, Serialize};

use crate::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Fetch the whole collection from scratch.
    Full,
    /// Fetch only records modified since the last completed run.
    Incremental,
}

/// What a fault invalidates in the collection's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackScope {
    /// The cache was never a trustworthy baseline; delete all of it.
    WipeAll,
    /// Entries written at or before this instant were already consistent.
    NewerThan(Timestamp),
}

impl RollbackScope {
    /// Scope for a job; an incremental job without a prior `completed` is treated as full.
    pub fn for_job(mode: SyncMode, prior_completed: Option<Timestamp>) -> Self {
        match (mode, prior_completed) {
            (SyncMode::Incremental, Some(since)) => RollbackScope::NewerThan(since),
            _ => RollbackScope::WipeAll,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RollbackScope, SyncMode};
    use crate::Timestamp;

    #[test]
    fn incremental_without_baseline_wipes_everything() {
        assert_eq!(
            RollbackScope::for_job(SyncMode::Incremental, None),
            RollbackScope::WipeAll
        );
        let since = Timestamp::from_millis(42);
        assert_eq!(
            RollbackScope::for_job(SyncMode::Incremental, Some(since)),
            RollbackScope::NewerThan(since)
        );
        assert_eq!(
            RollbackScope::for_job(SyncMode::Full, Some(since)),
            RollbackScope::WipeAll
        );
    }
}
