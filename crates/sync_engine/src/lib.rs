//! Sync engine: stores, worker pool, governor loop and the paginated sync driver.
mod cache;
mod checkpoint;
mod client;
mod driver;
mod engine;
mod governor;
mod monitor;
mod persist;
mod pool;
mod rate_limit;
mod retry;
mod sampler;
mod types;

pub use cache::{CacheEntry, CacheError, CacheStore};
pub use checkpoint::{CheckpointError, CheckpointStore, RunStart};
pub use client::{CollectionClient, FetchSettings, ReqwestCollectionClient};
pub use driver::{
    normalize_record, CollectionSpec, PassThrough, RecordMapper, SyncDriver, SyncError, SyncJob,
    SyncReport, SyncSettings,
};
pub use engine::{EngineError, SyncEngine};
pub use governor::PoolGovernor;
pub use monitor::{
    strategy_for, Fault, FaultMonitor, MonitorSummary, RollbackReport, RollbackStrategy, WipeAll,
    WipeNewerThan, WriteFence,
};
pub use persist::{ensure_dir, AtomicFileWriter, PersistError};
pub use pool::{AdaptivePool, ConcurrencyLimit, PoolError, PoolSettings, PoolStats, WorkerContext};
pub use rate_limit::{IntervalRateLimiter, RateLimitSettings, RateLimiter, Unlimited};
pub use retry::{fetch_with_retry, RetryPolicy};
pub use sampler::{FixedLoad, LoadSource, ProcessCpuSampler, SamplerSettings, ScriptedLoad};
pub use types::{Disposition, FailureKind, Page, PageCursor, RemoteError};
