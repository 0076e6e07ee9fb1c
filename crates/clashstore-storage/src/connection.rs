use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use clashstore_core::{ClashError, ClashResult};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::metrics::{StoreMetrics, StoreMetricsSnapshot};
use crate::schema;

/// Tuning knobs for the store.
///
/// `match_tolerance` and `fallback_box_tolerance` preserve the source
/// system's fixed constants; both are in the host model's length units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub wal_mode: bool,
    pub busy_timeout_ms: u64,
    pub cache_size_pages: i32,
    /// Absolute tolerance for the legacy fuzzy identity match.
    pub match_tolerance: f64,
    /// Half-extent of the point cube indexed for zones without a placed box.
    pub fallback_box_tolerance: f64,
}

impl StorageConfig {
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            db_path: PathBuf::from(":memory:"),
            ..Self::default()
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("clashstore.sqlite3"),
            wal_mode: true,
            busy_timeout_ms: 5_000,
            cache_size_pages: 2_000,
            match_tolerance: 1e-3,
            fallback_box_tolerance: 0.5,
        }
    }
}

/// Owns the embedded-database connection and serializes all writes.
///
/// All mutating operations run through [`Storage::transaction`]; reads may
/// go straight to [`Storage::connection`]. The connection is never shared
/// as a global: callers hold the `Storage` and pass `&Connection` down.
pub struct Storage {
    conn: Connection,
    config: StorageConfig,
    metrics: StoreMetrics,
    session_verified: AtomicBool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.config.db_path)
            .field("wal_mode", &self.config.wal_mode)
            .field("busy_timeout_ms", &self.config.busy_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl Storage {
    pub fn open(config: StorageConfig) -> ClashResult<Self> {
        tracing::debug!(
            target: "clashstore.storage",
            path = %config.db_path.display(),
            wal_mode = config.wal_mode,
            busy_timeout_ms = config.busy_timeout_ms,
            cache_size_pages = config.cache_size_pages,
            "opening storage connection"
        );

        let conn = Connection::open(&config.db_path).map_err(ClashError::storage)?;

        let storage = Self {
            conn,
            config,
            metrics: StoreMetrics::default(),
            session_verified: AtomicBool::new(false),
        };

        storage.metrics.record_open();
        storage.apply_pragmas()?;
        schema::bootstrap(storage.connection())?;
        storage.metrics.record_schema_bootstrap();

        if let Ok(version) = schema::current_version(storage.connection()) {
            tracing::debug!(
                target: "clashstore.storage",
                schema_version = version,
                "storage bootstrap complete"
            );
        }

        Ok(storage)
    }

    pub fn open_in_memory() -> ClashResult<Self> {
        Self::open(StorageConfig::in_memory())
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> StoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The process-wide "already verified this session" guard.
    ///
    /// Races on this flag are benign: at worst verification runs twice.
    #[must_use]
    pub(crate) fn session_verified(&self) -> &AtomicBool {
        &self.session_verified
    }

    /// Run `f` inside one transaction; commit on `Ok`, roll back on `Err`
    /// or panic. A batch already inside its commit runs to completion or
    /// rolls back as a unit; there is no mid-batch cancellation.
    pub fn transaction<F, T>(&self, f: F) -> ClashResult<T>
    where
        F: FnOnce(&Connection) -> ClashResult<T>,
    {
        tracing::trace!(target: "clashstore.storage", "starting storage transaction");

        self.conn
            .execute_batch("BEGIN IMMEDIATE;")
            .map_err(ClashError::storage)?;

        let outcome = catch_unwind(AssertUnwindSafe(|| f(&self.conn)));

        match outcome {
            Ok(Ok(value)) => {
                self.conn.execute_batch("COMMIT;").map_err(|commit_err| {
                    let _ = self.conn.execute_batch("ROLLBACK;");
                    ClashError::storage(commit_err)
                })?;
                self.metrics.record_commit();
                tracing::trace!(target: "clashstore.storage", "storage transaction committed");
                Ok(value)
            }
            Ok(Err(err)) => {
                let _ = self.conn.execute_batch("ROLLBACK;");
                self.metrics.record_rollback();
                tracing::debug!(
                    target: "clashstore.storage",
                    ?err,
                    "storage transaction rolled back due to closure error"
                );
                Err(err)
            }
            Err(payload) => {
                let _ = self.conn.execute_batch("ROLLBACK;");
                self.metrics.record_rollback();
                tracing::error!(
                    target: "clashstore.storage",
                    "storage transaction rolled back after panic"
                );
                resume_unwind(payload);
            }
        }
    }

    fn apply_pragmas(&self) -> ClashResult<()> {
        tracing::trace!(
            target: "clashstore.storage",
            wal_mode = self.config.wal_mode,
            busy_timeout_ms = self.config.busy_timeout_ms,
            cache_size_pages = self.config.cache_size_pages,
            "applying storage pragmas"
        );

        self.conn
            .execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(ClashError::storage)?;

        let journal_mode = if self.config.wal_mode { "WAL" } else { "DELETE" };
        self.conn
            .pragma_update(None, "journal_mode", journal_mode)
            .map_err(ClashError::storage)?;

        self.conn
            .execute_batch(&format!(
                "PRAGMA busy_timeout={};",
                self.config.busy_timeout_ms
            ))
            .map_err(ClashError::storage)?;

        self.conn
            .execute_batch(&format!(
                "PRAGMA cache_size={};",
                self.config.cache_size_pages
            ))
            .map_err(ClashError::storage)?;

        Ok(())
    }
}
