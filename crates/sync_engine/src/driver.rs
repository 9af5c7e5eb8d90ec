//! Checkpointed, cursor-paginated collection sync.
//!
//! Pages are fetched one at a time in cursor order; only the processing of
//! their items is spread over the adaptive pool. The first fault stops both
//! the page loop and the pool, and the job's rollback strategy restores the
//! cache before the fault is returned. `completed` is written only after every
//! task reported success.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sync_core::{
    host_parallelism, queue_capacity, FaultClass, GovernorSettings, InvalidGovernorSettings,
    PoolState, RollbackScope, SyncMode, TaskFailure, Timestamp,
};
use sync_logging::{sync_debug, sync_error, sync_info, sync_warn};

use crate::cache::{CacheEntry, CacheError, CacheStore};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::client::{CollectionClient, FetchSettings};
use crate::governor::PoolGovernor;
use crate::monitor::{strategy_for, Fault, FaultMonitor};
use crate::pool::{AdaptivePool, PoolSettings, PoolStats, WorkerContext};
use crate::rate_limit::{RateLimitSettings, RateLimiter};
use crate::retry::{fetch_with_retry, RetryPolicy};
use crate::sampler::{LoadSource, SamplerSettings};
use crate::types::{Page, PageCursor, RemoteError};

const PARENT_PLACEHOLDER: &str = "{parent}";

/// How to address one remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSpec {
    /// Also the cache and checkpoint directory name.
    pub name: String,
    /// GET endpoint listing the whole collection.
    pub list_path: String,
    /// POST endpoint accepting a modified-since filter. Without one,
    /// incremental runs fall back to full.
    pub search_path: Option<String>,
    pub id_field: String,
    /// Remote property compared against the prior `completed` in incremental runs.
    pub modified_property: String,
    pub page_size: usize,
    /// Records per pool task.
    pub partition_size: usize,
    /// Job size hint used when the first page does not report a total.
    pub expected_items: Option<u64>,
    /// Set for a sub-collection of one parent record; replaces `{parent}` in paths.
    pub parent_id: Option<u64>,
}

impl Default for CollectionSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            list_path: String::new(),
            search_path: None,
            id_field: "id".to_string(),
            modified_property: "updated_at".to_string(),
            page_size: 10,
            partition_size: 1,
            expected_items: None,
            parent_id: None,
        }
    }
}

impl CollectionSpec {
    /// The same sub-collection, scoped to one parent record.
    pub fn for_parent(&self, parent_id: u64) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..self.clone()
        }
    }

    fn resolve(&self, path: &str) -> String {
        match self.parent_id {
            Some(parent) => path.replace(PARENT_PLACEHOLDER, &parent.to_string()),
            None => path.to_string(),
        }
    }

    fn page_size(&self) -> usize {
        self.page_size.max(1)
    }

    fn partition_size(&self) -> usize {
        self.partition_size.max(1)
    }
}

/// Hook applied to every normalized record before it is cached.
pub trait RecordMapper: Send + Sync {
    fn map(&self, id: u64, record: Value) -> Result<Value, TaskFailure>;
}

/// Stores records as received.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl RecordMapper for PassThrough {
    fn map(&self, _id: u64, record: Value) -> Result<Value, TaskFailure> {
        Ok(record)
    }
}

/// Extracts the integer id of a record and writes it back as a JSON number.
pub fn normalize_record(id_field: &str, record: Value) -> Result<(u64, Value), TaskFailure> {
    let Value::Object(mut fields) = record else {
        return Err(TaskFailure::malformed("record is not an object"));
    };
    let id = match fields.get(id_field) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    let Some(id) = id else {
        return Err(TaskFailure::malformed(format!(
            "record has no integer `{id_field}`"
        )));
    };
    fields.insert(id_field.to_string(), Value::from(id));
    Ok((id, Value::Object(fields)))
}

/// One collection's stores plus the requested mode.
pub struct SyncJob {
    pub spec: CollectionSpec,
    pub cache: CacheStore,
    pub checkpoints: CheckpointStore,
    pub mode: SyncMode,
    mapper: Arc<dyn RecordMapper>,
}

impl SyncJob {
    /// Caches under `{cache_root}/{name}[/{parent_id}]`, checkpoints likewise
    /// under `checkpoint_root`.
    pub fn open(
        spec: CollectionSpec,
        cache_root: &Path,
        checkpoint_root: &Path,
        mode: SyncMode,
    ) -> Self {
        let mut cache = CacheStore::new(cache_root, &spec.name);
        let mut checkpoint_dir = checkpoint_root.join(&spec.name);
        if let Some(parent) = spec.parent_id {
            cache = cache.child(parent);
            checkpoint_dir = checkpoint_dir.join(parent.to_string());
        }
        Self {
            spec,
            cache,
            checkpoints: CheckpointStore::new(checkpoint_dir),
            mode,
            mapper: Arc::new(PassThrough),
        }
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn RecordMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    fn effective_mode(&self, requested: SyncMode, prior_completed: Option<Timestamp>) -> SyncMode {
        if requested == SyncMode::Full {
            return SyncMode::Full;
        }
        if prior_completed.is_none() {
            sync_info!("{}: no completed run yet, syncing in full", self.spec.name);
            return SyncMode::Full;
        }
        if self.spec.search_path.is_none() {
            sync_warn!("{}: no search endpoint, syncing in full", self.spec.name);
            return SyncMode::Full;
        }
        SyncMode::Incremental
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub fetch: FetchSettings,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitSettings,
    pub pool: PoolSettings,
    pub governor: GovernorSettings,
    pub sampler: SamplerSettings,
    /// `false` for debug runs that must not move `started`.
    pub record_started: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fetch: FetchSettings::default(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimitSettings::default(),
            pool: PoolSettings::default(),
            governor: GovernorSettings::default(),
            sampler: SamplerSettings::default(),
            record_started: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub collection: String,
    pub mode: SyncMode,
    pub pages: usize,
    pub records: usize,
    pub tasks: u64,
    pub started: Timestamp,
    pub completed: Timestamp,
    pub max_concurrency_seen: usize,
    pub backpressure_waits: u64,
    pub adjustments: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync aborted: {0}")]
    Fatal(Fault),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl SyncError {
    pub fn class(&self) -> FaultClass {
        match self {
            SyncError::Fatal(fault) => fault.class,
            SyncError::Checkpoint(err) => err.fault_class(),
            SyncError::Cache(err) => err.fault_class(),
        }
    }
}

/// Pool and governor of a job, started once the first page is in.
struct RunningPool {
    pool: AdaptivePool,
    governor: PoolGovernor,
    state: PoolState,
}

impl RunningPool {
    async fn finish(self) -> (PoolStats, u64) {
        let stats = self.pool.finish().await;
        let (_, adjustments) = self.governor.stop(self.state).await;
        (stats, adjustments)
    }
}

pub struct SyncDriver {
    client: Arc<dyn CollectionClient>,
    limiter: Arc<dyn RateLimiter>,
    load: Arc<dyn LoadSource>,
    settings: SyncSettings,
}

impl SyncDriver {
    pub fn new(
        client: Arc<dyn CollectionClient>,
        limiter: Arc<dyn RateLimiter>,
        load: Arc<dyn LoadSource>,
        settings: SyncSettings,
    ) -> Result<Self, InvalidGovernorSettings> {
        settings.governor.validate()?;
        Ok(Self {
            client,
            limiter,
            load,
            settings,
        })
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Sync one collection in the job's mode.
    pub async fn run(&self, job: &SyncJob) -> Result<SyncReport, SyncError> {
        self.execute(job, job.mode).await
    }

    /// Bring the cache up to date and return all of it.
    ///
    /// A populated cache with a completed run behind it only needs the delta;
    /// anything else is fetched in full.
    pub async fn load_collection(
        &self,
        job: &SyncJob,
    ) -> Result<Vec<CacheEntry<Value>>, SyncError> {
        let baseline = job.checkpoints.load()?.has_completed_run() && !job.cache.is_empty()?;
        let mode = if baseline {
            SyncMode::Incremental
        } else {
            SyncMode::Full
        };
        self.execute(job, mode).await?;
        Ok(job.cache.read_all()?)
    }

    async fn execute(&self, job: &SyncJob, requested: SyncMode) -> Result<SyncReport, SyncError> {
        let spec = &job.spec;
        let run = job.checkpoints.begin_run(self.settings.record_started)?;
        let mode = job.effective_mode(requested, run.prior_completed);
        let scope = RollbackScope::for_job(mode, run.prior_completed);
        let since = match scope {
            RollbackScope::NewerThan(since) => Some(since),
            RollbackScope::WipeAll => None,
        };
        sync_info!("{}: {} sync started at {}", spec.name, mode_label(mode), run.started);

        job.cache.ensure()?;
        let monitor = Arc::new(FaultMonitor::new(strategy_for(scope)));
        let cancel = monitor.cancel_token();

        let mut cursor = PageCursor::start();
        let mut pages = 0;
        let mut running: Option<RunningPool> = None;

        'pages: while cursor.has_more && !cancel.is_cancelled() {
            let page = match self.fetch_page(spec, since, cursor.after.as_deref()).await {
                Ok(page) => page,
                Err(err) => {
                    monitor.record_failure(TaskFailure::from(err));
                    break;
                }
            };
            pages += 1;
            cursor = cursor.advance(page.next.clone());

            let pool = &running
                .get_or_insert_with(|| self.start_pool(spec, &page, monitor.clone()))
                .pool;
            let mut items = page.results.into_iter();
            loop {
                let chunk: Vec<Value> = items.by_ref().take(spec.partition_size()).collect();
                if chunk.is_empty() {
                    break;
                }
                let cache = job.cache.clone();
                let mapper = job.mapper.clone();
                let id_field = spec.id_field.clone();
                let submitted = pool
                    .submit(move |ctx| {
                        persist_chunk(ctx, &cache, mapper.as_ref(), &id_field, chunk)
                    })
                    .await;
                if submitted.is_err() {
                    break 'pages;
                }
            }
        }

        let (stats, adjustments) = match running {
            Some(running) => running.finish().await,
            None => (PoolStats::default(), 0),
        };

        let summary = match monitor.conclude(&job.cache) {
            Ok(summary) => summary,
            Err(fault) => {
                sync_error!("{}: {} sync failed: {}", spec.name, mode_label(mode), fault);
                return Err(SyncError::Fatal(fault));
            }
        };

        let mut completed = Timestamp::now().max(run.started);
        if let Some(prior) = run.prior_completed {
            if completed <= prior {
                completed = Timestamp::from_millis(prior.as_millis() + 1);
            }
        }
        job.checkpoints.mark_completed(completed)?;

        let report = SyncReport {
            collection: spec.name.clone(),
            mode,
            pages,
            records: summary.records,
            tasks: stats.submitted,
            started: run.started,
            completed,
            max_concurrency_seen: stats.max_concurrency_seen,
            backpressure_waits: stats.backpressure_waits,
            adjustments,
        };
        sync_info!(
            "{}: {} sync done, {} records in {} pages ({} tasks, peak concurrency {}, {} backpressure waits, {} governor adjustments)",
            report.collection,
            mode_label(mode),
            report.records,
            report.pages,
            report.tasks,
            report.max_concurrency_seen,
            report.backpressure_waits,
            report.adjustments
        );
        Ok(report)
    }

    fn start_pool(
        &self,
        spec: &CollectionSpec,
        first: &Page,
        monitor: Arc<FaultMonitor>,
    ) -> RunningPool {
        let host = host_parallelism();
        let ceiling = self.settings.governor.ceiling.unwrap_or(host * 2);
        let core = self.settings.pool.core_size.unwrap_or(host);
        let expected = first
            .total
            .or(spec.expected_items)
            .unwrap_or(spec.page_size() as u64);
        let mut state = PoolState::new(core, ceiling, 0);
        state.queue_capacity = queue_capacity(expected, spec.partition_size(), state.ceiling, host);

        let pool = AdaptivePool::new(
            state.max_size,
            state.queue_capacity,
            self.settings.pool.cancel_grace(),
            monitor,
        );
        let governor =
            PoolGovernor::spawn(self.settings.governor, self.load.clone(), pool.limit(), state);
        sync_info!(
            "{}: pool of {} workers (ceiling {}), backlog {} for ~{} records",
            spec.name,
            state.max_size,
            state.ceiling,
            state.queue_capacity,
            expected
        );
        RunningPool {
            pool,
            governor,
            state,
        }
    }

    async fn fetch_page(
        &self,
        spec: &CollectionSpec,
        since: Option<Timestamp>,
        after: Option<&str>,
    ) -> Result<Page, RemoteError> {
        let client = self.client.as_ref();
        let what = format!("{} page after {}", spec.name, after.unwrap_or("start"));
        let body = match (since, &spec.search_path) {
            (Some(since), Some(search_path)) => {
                let path = spec.resolve(search_path);
                let query = search_body(spec, since, after);
                let (path, query) = (path.as_str(), &query);
                fetch_with_retry(&self.settings.retry, self.limiter.as_ref(), &what, move || {
                    client.post(path, query)
                })
                .await?
            }
            _ => {
                let path = spec.resolve(&spec.list_path);
                let mut params = vec![("limit".to_string(), spec.page_size().to_string())];
                if let Some(after) = after {
                    params.push(("after".to_string(), after.to_string()));
                }
                let (path, params) = (path.as_str(), params.as_slice());
                fetch_with_retry(&self.settings.retry, self.limiter.as_ref(), &what, move || {
                    client.get(path, params)
                })
                .await?
            }
        };
        Page::from_json(body)
    }
}

fn search_body(spec: &CollectionSpec, since: Timestamp, after: Option<&str>) -> Value {
    let mut body = json!({
        "filter": {
            "property": spec.modified_property,
            "gte": since.as_millis(),
        },
        "limit": spec.page_size(),
    });
    if let Some(after) = after {
        body["after"] = Value::from(after);
    }
    body
}

fn persist_chunk(
    ctx: &WorkerContext,
    cache: &CacheStore,
    mapper: &dyn RecordMapper,
    id_field: &str,
    records: Vec<Value>,
) -> Result<usize, TaskFailure> {
    let mut written = 0;
    for record in records {
        if ctx.is_cancelled() {
            sync_debug!("task {} stopped after {} records", ctx.task_id(), written);
            return Err(TaskFailure::interrupted());
        }
        let (id, record) = normalize_record(id_field, record)?;
        let record = mapper.map(id, record)?;
        ctx.persist(|| cache.write(id, &record).map_err(TaskFailure::from))?;
        written += 1;
    }
    Ok(written)
}

fn mode_label(mode: SyncMode) -> &'static str {
    match mode {
        SyncMode::Full => "full",
        SyncMode::Incremental => "incremental",
    }
}
