//! Pluggable persistence for [`EmbeddingCache`](super::EmbeddingCache).
//!
//! Two interchangeable backends expose the same `{key, vector, timestamp}`
//! shape, so a cache saved by one can be loaded by the other after a
//! conversion pass:
//!
//! - [`JsonSnapshotStore`]: a single JSON object per cache, keyed by content
//!   hash: `{"<sha256>": {"embedding": [...], "timestamp": 1718000000.25}}`.
//! - [`SqliteStore`]: one row per entry in `embedding_cache` (feature
//!   `sqlite`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::CacheEntry;
use crate::{HuginnError, Result};

/// Storage backend for cache snapshots.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Read every persisted entry. Expiry filtering is the cache's job.
    async fn load(&self) -> Result<Vec<CacheEntry>>;

    /// Replace the persisted content with `entries`.
    async fn save(&self, entries: &[CacheEntry]) -> Result<()>;
}

fn to_unix_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

fn from_unix_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((secs * 1_000_000.0) as i64)
}

// ============================================================================
// JSON snapshot
// ============================================================================

#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    embedding: Vec<f32>,
    timestamp: f64,
}

/// Flat JSON file holding the whole cache.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash mid-write leaves the previous snapshot intact.
pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CacheStore for JsonSnapshotStore {
    fn name(&self) -> &str {
        "json"
    }

    async fn load(&self) -> Result<Vec<CacheEntry>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let records: BTreeMap<String, SnapshotRecord> = serde_json::from_slice(&bytes)
            .map_err(|e| HuginnError::Cache(format!("corrupt snapshot {:?}: {e}", self.path)))?;

        let mut entries = Vec::with_capacity(records.len());
        for (key, record) in records {
            match from_unix_secs(record.timestamp) {
                Some(inserted_at) => entries.push(CacheEntry {
                    key,
                    vector: record.embedding,
                    inserted_at,
                }),
                None => warn!(%key, "skipping snapshot entry with invalid timestamp"),
            }
        }
        debug!(path = ?self.path, count = entries.len(), "loaded cache snapshot");
        Ok(entries)
    }

    async fn save(&self, entries: &[CacheEntry]) -> Result<()> {
        let records: BTreeMap<&str, SnapshotRecord> = entries
            .iter()
            .map(|e| {
                (
                    e.key.as_str(),
                    SnapshotRecord {
                        embedding: e.vector.clone(),
                        timestamp: to_unix_secs(e.inserted_at),
                    },
                )
            })
            .collect();
        let bytes = serde_json::to_vec(&records)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = ?self.path, count = entries.len(), "saved cache snapshot");
        Ok(())
    }
}

// ============================================================================
// SQLite
// ============================================================================

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use std::str::FromStr;

    use async_trait::async_trait;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use sqlx::{Row, SqlitePool};
    use tracing::{debug, warn};

    use super::{CacheStore, from_unix_secs, to_unix_secs};
    use crate::cache::CacheEntry;
    use crate::{HuginnError, Result};

    fn storage_err(context: &str, e: impl std::fmt::Display) -> HuginnError {
        HuginnError::Cache(format!("{context}: {e}"))
    }

    /// Embedded relational store: one row per cache entry.
    pub struct SqliteStore {
        pool: SqlitePool,
    }

    impl SqliteStore {
        /// Open (creating if missing) the database at `path`.
        ///
        /// Pass `"sqlite::memory:"` for an ephemeral database.
        pub async fn open(path: &str) -> Result<Self> {
            let options = SqliteConnectOptions::from_str(path)
                .map_err(|e| storage_err("invalid SQLite path", e))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);

            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .map_err(|e| storage_err("failed to open SQLite", e))?;

            Self::from_pool(pool).await
        }

        /// Wrap an existing pool, creating the table if needed.
        pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS embedding_cache (
                    key          TEXT PRIMARY KEY NOT NULL,
                    vector       TEXT NOT NULL,
                    inserted_at  REAL NOT NULL
                )
                "#,
            )
            .execute(&pool)
            .await
            .map_err(|e| storage_err("embedding_cache table", e))?;
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl CacheStore for SqliteStore {
        fn name(&self) -> &str {
            "sqlite"
        }

        async fn load(&self) -> Result<Vec<CacheEntry>> {
            let rows = sqlx::query("SELECT key, vector, inserted_at FROM embedding_cache")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| storage_err("load", e))?;

            let mut entries = Vec::with_capacity(rows.len());
            for row in rows {
                let key: String = row.try_get("key").map_err(|e| storage_err("key", e))?;
                let vector: String = row.try_get("vector").map_err(|e| storage_err("vector", e))?;
                let ts: f64 = row
                    .try_get("inserted_at")
                    .map_err(|e| storage_err("inserted_at", e))?;

                let (Ok(vector), Some(inserted_at)) =
                    (serde_json::from_str::<Vec<f32>>(&vector), from_unix_secs(ts))
                else {
                    warn!(%key, "skipping unreadable cache row");
                    continue;
                };
                entries.push(CacheEntry {
                    key,
                    vector,
                    inserted_at,
                });
            }
            debug!(count = entries.len(), "loaded cache rows");
            Ok(entries)
        }

        async fn save(&self, entries: &[CacheEntry]) -> Result<()> {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| storage_err("begin", e))?;

            sqlx::query("DELETE FROM embedding_cache")
                .execute(&mut *tx)
                .await
                .map_err(|e| storage_err("clear", e))?;

            for entry in entries {
                sqlx::query(
                    "INSERT INTO embedding_cache (key, vector, inserted_at) VALUES (?1, ?2, ?3)",
                )
                .bind(&entry.key)
                .bind(serde_json::to_string(&entry.vector)?)
                .bind(to_unix_secs(entry.inserted_at))
                .execute(&mut *tx)
                .await
                .map_err(|e| storage_err("insert", e))?;
            }

            tx.commit().await.map_err(|e| storage_err("commit", e))?;
            debug!(count = entries.len(), "saved cache rows");
            Ok(())
        }
    }
}
