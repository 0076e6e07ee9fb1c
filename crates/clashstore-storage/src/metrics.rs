use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct StoreMetrics {
    opens: AtomicU64,
    schema_bootstraps: AtomicU64,
    tx_commits: AtomicU64,
    tx_rollbacks: AtomicU64,
    batches_synced: AtomicU64,
    zones_inserted: AtomicU64,
    zones_updated: AtomicU64,
    spatial_refreshes: AtomicU64,
    spatial_failures: AtomicU64,
    verifications: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetricsSnapshot {
    pub opens: u64,
    pub schema_bootstraps: u64,
    pub tx_commits: u64,
    pub tx_rollbacks: u64,
    pub batches_synced: u64,
    pub zones_inserted: u64,
    pub zones_updated: u64,
    pub spatial_refreshes: u64,
    pub spatial_failures: u64,
    pub verifications: u64,
}

impl StoreMetrics {
    pub fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_schema_bootstrap(&self) {
        self.schema_bootstraps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.tx_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.tx_rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, inserted: u64, updated: u64) {
        self.batches_synced.fetch_add(1, Ordering::Relaxed);
        self.zones_inserted.fetch_add(inserted, Ordering::Relaxed);
        self.zones_updated.fetch_add(updated, Ordering::Relaxed);
    }

    pub fn record_spatial_refresh(&self, rows: u64) {
        self.spatial_refreshes.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_spatial_failure(&self) {
        self.spatial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_verification(&self) {
        self.verifications.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            opens: self.opens.load(Ordering::Relaxed),
            schema_bootstraps: self.schema_bootstraps.load(Ordering::Relaxed),
            tx_commits: self.tx_commits.load(Ordering::Relaxed),
            tx_rollbacks: self.tx_rollbacks.load(Ordering::Relaxed),
            batches_synced: self.batches_synced.load(Ordering::Relaxed),
            zones_inserted: self.zones_inserted.load(Ordering::Relaxed),
            zones_updated: self.zones_updated.load(Ordering::Relaxed),
            spatial_refreshes: self.spatial_refreshes.load(Ordering::Relaxed),
            spatial_failures: self.spatial_failures.load(Ordering::Relaxed),
            verifications: self.verifications.load(Ordering::Relaxed),
        }
    }
}
