//! Sync core: pure control logic and data model, free of IO.
mod capacity;
mod checkpoint;
mod fault;
mod governor;
mod mode;
mod outcome;

pub use capacity::{host_parallelism, queue_capacity};
pub use checkpoint::{CheckpointRecord, Timestamp};
pub use fault::{FaultClass, TaskFailure};
pub use governor::{
    Adjustment, Direction, GovernorController, GovernorSettings, InvalidGovernorSettings, PoolState,
};
pub use mode::{RollbackScope, SyncMode};
pub use outcome::{TaskId, TaskOutcome};
