use std::io;
use std::sync::Arc;

use serde_json::Value;
use sync_core::{FaultClass, InvalidGovernorSettings};

use crate::cache::CacheEntry;
use crate::client::{CollectionClient, ReqwestCollectionClient};
use crate::driver::{SyncDriver, SyncError, SyncJob, SyncReport, SyncSettings};
use crate::sampler::{LoadSource, ProcessCpuSampler};
use crate::types::RemoteError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot start async runtime: {0}")]
    Runtime(#[from] io::Error),
    #[error("cannot build collection client: {0}")]
    Client(#[from] RemoteError),
    #[error(transparent)]
    Settings(#[from] InvalidGovernorSettings),
}

impl EngineError {
    pub fn fault_class(&self) -> FaultClass {
        match self {
            EngineError::Runtime(_) | EngineError::Settings(_) => FaultClass::Generic,
            EngineError::Client(err) => err.fault_class(),
        }
    }
}

/// Blocking front end: owns the runtime, the HTTP client and the load sampler.
pub struct SyncEngine {
    runtime: tokio::runtime::Runtime,
    driver: SyncDriver,
}

impl SyncEngine {
    pub fn new(base_url: &str, settings: SyncSettings) -> Result<Self, EngineError> {
        let client = Arc::new(ReqwestCollectionClient::new(base_url, settings.fetch.clone())?);
        let load = Arc::new(ProcessCpuSampler::start(settings.sampler));
        Self::from_parts(client, load, settings)
    }

    /// Build around a caller-supplied client and load source.
    pub fn from_parts(
        client: Arc<dyn CollectionClient>,
        load: Arc<dyn LoadSource>,
        settings: SyncSettings,
    ) -> Result<Self, EngineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("sync-runtime")
            .build()?;
        let limiter = settings.rate_limit.build();
        let driver = SyncDriver::new(client, limiter, load, settings)?;
        Ok(Self { runtime, driver })
    }

    pub fn run(&self, job: &SyncJob) -> Result<SyncReport, SyncError> {
        self.runtime.block_on(self.driver.run(job))
    }

    pub fn load_collection(&self, job: &SyncJob) -> Result<Vec<CacheEntry<Value>>, SyncError> {
        self.runtime.block_on(self.driver.load_collection(job))
    }
}
