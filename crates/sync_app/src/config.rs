//! RON configuration for `collection-sync`.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes. A missing file means "all defaults".

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use sync_core::GovernorSettings;
use sync_engine::{
    CollectionSpec, FetchSettings, PoolSettings, RateLimitSettings, RetryPolicy, SamplerSettings,
    SyncSettings,
};
use sync_logging::sync_info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: String,
    pub cache_root: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub collections: Vec<CollectionSpec>,
    pub fetch: FetchSettings,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitSettings,
    pub pool: PoolSettings,
    pub governor: GovernorSettings,
    pub sampler: SamplerSettings,
    pub record_started: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let settings = SyncSettings::default();
        Self {
            base_url: "http://localhost:8080/".to_string(),
            cache_root: PathBuf::from("cache"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            collections: Vec::new(),
            fetch: settings.fetch,
            retry: settings.retry,
            rate_limit: settings.rate_limit,
            pool: settings.pool,
            governor: settings.governor,
            sampler: settings.sampler,
            record_started: settings.record_started,
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                sync_info!("no config at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("cannot read config {}", path.display()))
            }
        };
        let config: Self = ron::from_str(&content)
            .with_context(|| format!("cannot parse config {}", path.display()))?;
        sync_info!(
            "loaded config from {:?} ({} collections)",
            path,
            config.collections.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_url.trim().is_empty() {
            bail!("base_url is empty");
        }
        let mut names = HashSet::new();
        for spec in &self.collections {
            if spec.name.is_empty() || spec.list_path.is_empty() {
                bail!("every collection needs a name and a list_path");
            }
            let key = (spec.name.as_str(), spec.parent_id);
            if !names.insert(key) {
                bail!("collection {:?} is configured twice", spec.name);
            }
        }
        self.governor.validate()?;
        Ok(())
    }

    /// Collections to sync, in config order. An empty filter selects all.
    pub fn selected<'a>(
        &'a self,
        only: &'a [String],
    ) -> impl Iterator<Item = &'a CollectionSpec> + 'a {
        self.collections
            .iter()
            .filter(move |spec| only.is_empty() || only.contains(&spec.name))
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            fetch: self.fetch.clone(),
            retry: self.retry,
            rate_limit: self.rate_limit,
            pool: self.pool,
            governor: self.governor,
            sampler: self.sampler,
            record_started: self.record_started,
        }
    }
}
