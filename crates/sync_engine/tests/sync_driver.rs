use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use sync_core::{FaultClass, GovernorSettings, SyncMode, TaskFailure, Timestamp};
use sync_engine::{
    CacheStore, CollectionSpec, FetchSettings, FixedLoad, PoolSettings, RateLimitSettings,
    RecordMapper, ReqwestCollectionClient, RetryPolicy, SyncDriver, SyncError, SyncJob,
    SyncSettings,
};
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LIST_PATH: &str = "/objects/items";
const SEARCH_PATH: &str = "/objects/items/search";

struct FailOn(u64);

impl RecordMapper for FailOn {
    fn map(&self, id: u64, record: Value) -> Result<Value, TaskFailure> {
        if id == self.0 {
            return Err(TaskFailure::generic(format!("cannot map record {id}")));
        }
        Ok(record)
    }
}

struct Fixture {
    server: MockServer,
    temp: TempDir,
}

impl Fixture {
    async fn start() -> Self {
        sync_logging::initialize_for_tests();
        Self {
            server: MockServer::start().await,
            temp: TempDir::new().unwrap(),
        }
    }

    fn driver(&self) -> SyncDriver {
        let settings = SyncSettings {
            retry: RetryPolicy {
                backoff_ms: 10,
                max_attempts: 3,
            },
            rate_limit: RateLimitSettings {
                permits_per_second: 0.0,
            },
            pool: PoolSettings {
                core_size: Some(2),
                cancel_grace_ms: 2_000,
            },
            governor: GovernorSettings {
                tick_ms: 10,
                ..GovernorSettings::default()
            },
            ..SyncSettings::default()
        };
        let client =
            ReqwestCollectionClient::new(&self.server.uri(), FetchSettings::default()).unwrap();
        SyncDriver::new(
            Arc::new(client),
            settings.rate_limit.build(),
            Arc::new(FixedLoad(75.0)),
            settings,
        )
        .unwrap()
    }

    fn job(&self, mode: SyncMode) -> SyncJob {
        let spec = CollectionSpec {
            name: "items".into(),
            list_path: LIST_PATH.into(),
            search_path: Some(SEARCH_PATH.into()),
            page_size: 10,
            partition_size: 1,
            ..CollectionSpec::default()
        };
        SyncJob::open(
            spec,
            &self.temp.path().join("cache"),
            &self.temp.path().join("checkpoints"),
            mode,
        )
    }

    /// 25 records served as pages of 10/10/5.
    async fn mount_full_collection(&self) {
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .and(query_param("limit", "10"))
            .and(query_param_is_missing("after"))
            .respond_with(page(1..=10, Some("10"), Some(25)))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .and(query_param("after", "10"))
            .respond_with(page(11..=20, Some("20"), Some(25)))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .and(query_param("after", "20"))
            .respond_with(page(21..=25, None, Some(25)))
            .mount(&self.server)
            .await;
    }
}

fn page(
    ids: std::ops::RangeInclusive<u64>,
    next: Option<&str>,
    total: Option<u64>,
) -> ResponseTemplate {
    let results: Vec<Value> = ids
        .map(|id| json!({"id": id.to_string(), "name": format!("item {id}")}))
        .collect();
    let mut body = json!({ "results": results });
    if let Some(after) = next {
        body["paging"] = json!({"next": {"after": after}});
    }
    if let Some(total) = total {
        body["total"] = json!(total);
    }
    ResponseTemplate::new(200).set_body_json(body)
}

fn backdate(path: &Path, age: Duration) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_sync_caches_every_record_and_completes() {
    let fx = Fixture::start().await;
    fx.mount_full_collection().await;
    let job = fx.job(SyncMode::Full);

    let report = fx.driver().run(&job).await.unwrap();

    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(report.pages, 3);
    assert_eq!(report.records, 25);
    assert_eq!(report.tasks, 25);
    assert!(report.max_concurrency_seen >= 1);
    assert_eq!(job.cache.ids().unwrap(), (1..=25).collect::<Vec<u64>>());
    let stored: Value = job.cache.read(13).unwrap().unwrap();
    assert_eq!(stored, json!({"id": 13, "name": "item 13"}));

    let record = job.checkpoints.load().unwrap();
    assert_eq!(record.started, Some(report.started));
    assert_eq!(record.completed, Some(report.completed));
    assert!(report.completed >= report.started);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fault_on_second_page_wipes_full_sync_cache() {
    let fx = Fixture::start().await;
    fx.mount_full_collection().await;
    // Third item of the second page.
    let job = fx.job(SyncMode::Full).with_mapper(Arc::new(FailOn(13)));

    let err = fx.driver().run(&job).await.unwrap_err();

    assert_eq!(err.class(), FaultClass::Generic);
    assert_eq!(err.class().exit_code(), 1);
    let SyncError::Fatal(fault) = &err else {
        panic!("expected a fatal fault, got {err:?}");
    };
    assert!(fault.message.contains("record 13"), "{fault}");
    assert!(fault.rollback.is_ok());

    assert!(job.cache.ids().unwrap().is_empty());
    assert!(!job.cache.dir().exists());
    let record = job.checkpoints.load().unwrap();
    assert!(record.started.is_some());
    assert!(record.completed.is_none());
    assert!(!job.checkpoints.dir().join("last_finished").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn incremental_fault_removes_only_entries_newer_than_completed() {
    let fx = Fixture::start().await;
    let job = fx.job(SyncMode::Incremental);

    for id in 1..=5u64 {
        let path = job.cache.write(id, &json!({"id": id})).unwrap();
        backdate(&path, Duration::from_secs(3_600));
    }
    let prior = Timestamp::from_millis(Timestamp::now().as_millis() - 30 * 60 * 1_000);
    job.checkpoints.mark_completed(prior).unwrap();

    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .and(body_partial_json(json!({
            "filter": {"property": "updated_at", "gte": prior.as_millis()},
            "limit": 10
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"id": 3}, {"id": 40}, {"id": 41}, {"id": 42}]
        })))
        .mount(&fx.server)
        .await;
    let job = job.with_mapper(Arc::new(FailOn(42)));

    let err = fx.driver().run(&job).await.unwrap_err();

    assert_eq!(err.class(), FaultClass::Generic);
    // 3 was rewritten by the failed run, so it is suspect too.
    assert_eq!(job.cache.ids().unwrap(), vec![1, 2, 4, 5]);
    assert_eq!(job.checkpoints.load().unwrap().completed, Some(prior));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clean_incremental_run_advances_completed() {
    let fx = Fixture::start().await;
    let job = fx.job(SyncMode::Incremental);
    job.cache.write(1, &json!({"id": 1, "name": "old"})).unwrap();
    let prior = Timestamp::from_millis(Timestamp::now().as_millis() - 60_000);
    job.checkpoints.mark_completed(prior).unwrap();

    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"id": 1, "name": "new"}, {"id": 2, "name": "added"}]
        })))
        .mount(&fx.server)
        .await;

    let report = fx.driver().run(&job).await.unwrap();

    assert_eq!(report.mode, SyncMode::Incremental);
    assert_eq!(report.records, 2);
    assert!(report.completed > prior);
    assert_eq!(job.checkpoints.load().unwrap().completed, Some(report.completed));
    let updated: Value = job.cache.read(1).unwrap().unwrap();
    assert_eq!(updated["name"], "new");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sub_collection_syncs_into_nested_directories() {
    let fx = Fixture::start().await;
    Mock::given(method("GET"))
        .and(path("/companies/9/notes"))
        .and(query_param("limit", "10"))
        .respond_with(page(1..=4, None, Some(4)))
        .expect(1)
        .mount(&fx.server)
        .await;
    let notes = CollectionSpec {
        name: "notes".into(),
        list_path: "/companies/{parent}/notes".into(),
        ..CollectionSpec::default()
    };
    let cache_root = fx.temp.path().join("cache");
    let checkpoint_root = fx.temp.path().join("checkpoints");
    let job = SyncJob::open(notes.for_parent(9), &cache_root, &checkpoint_root, SyncMode::Full);

    let report = fx.driver().run(&job).await.unwrap();

    assert_eq!(report.collection, "notes");
    assert_eq!(report.records, 4);
    assert_eq!(job.cache.dir(), cache_root.join("notes").join("9"));
    assert_eq!(job.cache.ids().unwrap(), vec![1, 2, 3, 4]);
    assert!(CacheStore::new(&cache_root, "notes").ids().unwrap().is_empty());
    assert_eq!(job.checkpoints.dir(), checkpoint_root.join("notes").join("9"));
    assert_eq!(job.checkpoints.load().unwrap().completed, Some(report.completed));
    assert!(!checkpoint_root.join("notes").join("last_finished").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn incremental_without_prior_completed_runs_full() {
    let fx = Fixture::start().await;
    fx.mount_full_collection().await;
    let job = fx.job(SyncMode::Incremental);

    let report = fx.driver().run(&job).await.unwrap();
    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(report.records, 25);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn load_collection_fetches_full_then_only_the_delta() {
    let fx = Fixture::start().await;
    fx.mount_full_collection().await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"id": 26, "name": "item 26"}]
        })))
        .expect(1)
        .mount(&fx.server)
        .await;
    let driver = fx.driver();
    let job = fx.job(SyncMode::Full);

    let first = driver.load_collection(&job).await.unwrap();
    assert_eq!(first.len(), 25);

    let second = driver.load_collection(&job).await.unwrap();
    assert_eq!(second.len(), 26);
    assert_eq!(second.last().map(|entry| entry.id), Some(26));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_overload_is_retried_not_a_fault() {
    let fx = Fixture::start().await;
    Mock::given(method("GET"))
        .and(path(LIST_PATH))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&fx.server)
        .await;
    Mock::given(method("GET"))
        .and(path(LIST_PATH))
        .respond_with(page(1..=3, None, None))
        .mount(&fx.server)
        .await;
    let job = fx.job(SyncMode::Full);

    let report = fx.driver().run(&job).await.unwrap();
    assert_eq!(report.records, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_page_is_fatal_and_wipes_cache() {
    let fx = Fixture::start().await;
    Mock::given(method("GET"))
        .and(path(LIST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .mount(&fx.server)
        .await;
    let job = fx.job(SyncMode::Full);
    job.cache.write(9, &json!({"id": 9})).unwrap();

    let err = fx.driver().run(&job).await.unwrap_err();
    assert_eq!(err.class(), FaultClass::MalformedInput);
    assert_eq!(err.class().exit_code(), 21);
    assert!(job.cache.is_empty().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn debug_run_leaves_started_untouched() {
    let fx = Fixture::start().await;
    fx.mount_full_collection().await;
    let mut driver_settings = SyncSettings::default();
    driver_settings.record_started = false;
    driver_settings.rate_limit.permits_per_second = 0.0;
    let client =
        ReqwestCollectionClient::new(&fx.server.uri(), FetchSettings::default()).unwrap();
    let driver = SyncDriver::new(
        Arc::new(client),
        driver_settings.rate_limit.build(),
        Arc::new(FixedLoad(75.0)),
        driver_settings,
    )
    .unwrap();
    let job = fx.job(SyncMode::Full);

    driver.run(&job).await.unwrap();
    assert!(!job.checkpoints.dir().join("last_executed").exists());
    assert!(fs::read_to_string(job.checkpoints.dir().join("last_finished")).is_ok());
}
