//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. Explicit path (CLI flag or caller-supplied)
//! 2. `~/.huginn/config.toml` (user)
//! 3. Built-in defaults
//!
//! Every field is optional; missing sections and keys take their defaults.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{CacheConfig, CacheStore, JsonSnapshotStore};
use crate::client::{ClientConfig, InferenceClientBuilder};
use crate::detector::LoopDetectorConfig;
use crate::governor::GovernorConfig;
use crate::transport::RetryConfig;
use crate::{HuginnError, Result};

/// Full huginn configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub detector: LoopDetectorConfig,
}

/// Cache sizing plus optional persistence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSection {
    #[serde(flatten)]
    pub limits: CacheConfig,
    /// Where to persist the cache. No persistence when absent.
    #[serde(default)]
    pub persist_path: Option<PathBuf>,
    #[serde(default)]
    pub backend: StoreBackend,
}

/// Persistence format for the embedding cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// One JSON object keyed by content hash.
    #[default]
    Json,
    /// One row per entry in an SQLite table.
    Sqlite,
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// An explicit path must exist. Without one, `~/.huginn/config.toml` is
    /// used if present, otherwise defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| HuginnError::Configuration(format!("Failed to parse config: {e}")))
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            HuginnError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            HuginnError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(HuginnError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        Ok(Self::user_config_path().filter(|p| p.exists()))
    }

    /// `~/.huginn/config.toml`, if a home directory is known.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".huginn").join("config.toml"))
    }

    /// Open the configured cache store, if persistence is enabled.
    pub async fn open_store(&self) -> Result<Option<Arc<dyn CacheStore>>> {
        let Some(path) = &self.cache.persist_path else {
            return Ok(None);
        };
        let store: Arc<dyn CacheStore> = match self.cache.backend {
            StoreBackend::Json => Arc::new(JsonSnapshotStore::new(path)),
            #[cfg(feature = "sqlite")]
            StoreBackend::Sqlite => {
                let path = path.to_str().ok_or_else(|| {
                    HuginnError::Configuration(format!("cache path is not UTF-8: {path:?}"))
                })?;
                Arc::new(crate::cache::SqliteStore::open(path).await?)
            }
            #[cfg(not(feature = "sqlite"))]
            StoreBackend::Sqlite => {
                return Err(HuginnError::Configuration(
                    "sqlite cache backend requires the `sqlite` feature".into(),
                ));
            }
        };
        Ok(Some(store))
    }

    /// A client builder carrying every client-side section.
    ///
    /// The cache store is not attached; see [`Config::open_store`].
    pub fn client_builder(&self) -> InferenceClientBuilder {
        InferenceClientBuilder::new()
            .client_config(self.client.clone())
            .retry(self.retry.clone())
            .cache_config(self.cache.limits.clone())
            .governor_config(self.governor.clone())
    }
}
