//! Session staleness verification.
//!
//! Resolved zones reference placed objects in the host model by handle.
//! Users can delete those objects outside this system, so at session start
//! every governing handle is checked against an existence oracle and zones
//! whose object is gone revert to unresolved, becoming ready for placement
//! again if they are in the current scope. Oracle lookups fan out across a
//! small thread pool; all storage access stays on the calling thread and
//! the write-back is a single transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use clashstore_core::{ClashError, ClashResult, ElementExistenceOracle};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use crate::connection::Storage;
use crate::zone::unix_timestamp_ms;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationConfig {
    /// Oracle lookup threads. Lookups cross a process boundary in the host
    /// integration, so a handful of threads hides most of the latency.
    pub worker_threads: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self { worker_threads: 4 }
    }
}

/// What one verification pass found and changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub zones_checked: u64,
    pub handles_checked: u64,
    pub handles_missing: u64,
    pub tiers_reset: u64,
    pub zones_ready_again: u64,
    pub oracle_failures: u64,
}

/// Which handle column governs a resolved zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum GoverningTier {
    Combined,
    Cluster,
    Individual,
}

impl GoverningTier {
    const ALL: [Self; 3] = [Self::Combined, Self::Cluster, Self::Individual];

    const fn flag_column(self) -> &'static str {
        match self {
            Self::Combined => "is_combined_resolved",
            Self::Cluster => "is_cluster_resolved",
            Self::Individual => "is_individually_resolved",
        }
    }

    const fn handle_column(self) -> &'static str {
        match self {
            Self::Combined => "combined_object_id",
            Self::Cluster => "cluster_object_id",
            Self::Individual => "individual_object_id",
        }
    }
}

/// Checks every governing handle against the existence oracle and reverts
/// zones whose placed object no longer exists.
pub struct StalenessVerifier<'a> {
    storage: &'a Storage,
    oracle: Arc<dyn ElementExistenceOracle>,
    config: VerificationConfig,
}

impl<'a> StalenessVerifier<'a> {
    pub fn new(storage: &'a Storage, oracle: Arc<dyn ElementExistenceOracle>) -> Self {
        Self::with_config(storage, oracle, VerificationConfig::default())
    }

    pub fn with_config(
        storage: &'a Storage,
        oracle: Arc<dyn ElementExistenceOracle>,
        config: VerificationConfig,
    ) -> Self {
        Self {
            storage,
            oracle,
            config,
        }
    }

    /// Run one verification pass.
    ///
    /// Handles whose oracle lookup fails are left alone: a flaky oracle
    /// must never un-resolve a zone.
    pub fn verify(&self) -> ClashResult<VerificationReport> {
        let mut report = VerificationReport::default();

        let handles_by_tier = self.governing_handles(&mut report)?;
        let unique: Vec<String> = {
            let mut all: Vec<String> = handles_by_tier.values().flatten().cloned().collect();
            all.sort_unstable();
            all.dedup();
            all
        };
        report.handles_checked = unique.len() as u64;

        if unique.is_empty() {
            self.storage.metrics().record_verification();
            tracing::debug!(
                target: "clashstore.storage",
                op = "verify",
                zones_checked = report.zones_checked,
                "no resolved zones to verify"
            );
            return Ok(report);
        }

        let verdicts = self.check_handles(&unique);
        for verdict in verdicts.values() {
            match verdict {
                Some(false) => report.handles_missing += 1,
                Some(true) => {}
                None => report.oracle_failures += 1,
            }
        }

        let now = unix_timestamp_ms()?;
        let (tiers_reset, ready_again) = self.storage.transaction(|conn| {
            let mut tiers_reset = 0_u64;
            for tier in GoverningTier::ALL {
                let Some(handles) = handles_by_tier.get(&tier) else {
                    continue;
                };
                let missing: Vec<&String> = handles
                    .iter()
                    .filter(|handle| verdicts.get(*handle) == Some(&Some(false)))
                    .collect();
                tiers_reset += reset_tier(conn, tier, &missing, now)? as u64;
            }
            let ready_again = restore_ready(conn, now)? as u64;
            Ok((tiers_reset, ready_again))
        })?;
        report.tiers_reset = tiers_reset;
        report.zones_ready_again = ready_again;

        self.storage.metrics().record_verification();
        tracing::info!(
            target: "clashstore.storage",
            op = "verify",
            zones_checked = report.zones_checked,
            handles_checked = report.handles_checked,
            handles_missing = report.handles_missing,
            tiers_reset = report.tiers_reset,
            zones_ready_again = report.zones_ready_again,
            oracle_failures = report.oracle_failures,
            "staleness verification complete"
        );
        Ok(report)
    }

    /// Run `verify` at most once per storage session.
    ///
    /// Returns `Ok(None)` when a pass already ran. On error the guard is
    /// released so a later attempt can retry.
    pub fn verify_once(&self) -> ClashResult<Option<VerificationReport>> {
        if self
            .storage
            .session_verified()
            .swap(true, Ordering::SeqCst)
        {
            return Ok(None);
        }
        match self.verify() {
            Ok(report) => Ok(Some(report)),
            Err(error) => {
                self.storage
                    .session_verified()
                    .store(false, Ordering::SeqCst);
                Err(error)
            }
        }
    }

    fn governing_handles(
        &self,
        report: &mut VerificationReport,
    ) -> ClashResult<BTreeMap<GoverningTier, Vec<String>>> {
        let conn = self.storage.connection();
        let mut by_tier = BTreeMap::new();
        for tier in GoverningTier::ALL {
            let sql = format!(
                "SELECT {handle}, COUNT(*) FROM clash_zones \
                 WHERE {flag} = 1 AND {handle} IS NOT NULL \
                 GROUP BY {handle};",
                flag = tier.flag_column(),
                handle = tier.handle_column(),
            );
            let mut statement = conn
                .prepare(&sql)
                .map_err(ClashError::storage)?;
            let rows = statement
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(ClashError::storage)?;

            let mut handles = Vec::new();
            for row in rows {
                let (handle, zone_count) = row.map_err(ClashError::storage)?;
                report.zones_checked += zone_count as u64;
                handles.push(handle);
            }
            if !handles.is_empty() {
                by_tier.insert(tier, handles);
            }
        }
        Ok(by_tier)
    }

    /// Fan oracle lookups out over worker threads. `None` means the lookup
    /// itself failed.
    fn check_handles(&self, handles: &[String]) -> HashMap<String, Option<bool>> {
        let workers = self.config.worker_threads.max(1);
        let chunk_size = handles.len().div_ceil(workers).max(1);
        let results: Mutex<HashMap<String, Option<bool>>> =
            Mutex::new(HashMap::with_capacity(handles.len()));

        std::thread::scope(|scope| {
            for chunk in handles.chunks(chunk_size) {
                let oracle = Arc::clone(&self.oracle);
                let results = &results;
                scope.spawn(move || {
                    for handle in chunk {
                        let verdict = match oracle.exists(handle) {
                            Ok(exists) => Some(exists),
                            Err(source) => {
                                let error = ClashError::Verification {
                                    handle: handle.clone(),
                                    source: Box::new(source),
                                };
                                tracing::warn!(
                                    target: "clashstore.storage",
                                    op = "verify",
                                    error = %error,
                                    "existence oracle lookup failed; leaving zone resolved"
                                );
                                None
                            }
                        };
                        results
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(handle.clone(), verdict);
                    }
                });
            }
        });

        results.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

fn reset_tier(
    conn: &Connection,
    tier: GoverningTier,
    missing_handles: &[&String],
    now: i64,
) -> ClashResult<usize> {
    if missing_handles.is_empty() {
        return Ok(0);
    }

    let placeholders = vec!["?"; missing_handles.len()].join(",");
    let sql = format!(
        "UPDATE clash_zones SET \
            {flag} = 0, \
            {handle} = NULL, \
            updated_at = ?1 \
         WHERE {flag} = 1 AND {handle} IN ({placeholders});",
        flag = tier.flag_column(),
        handle = tier.handle_column(),
    );
    let params = std::iter::once(now.to_string())
        .chain(missing_handles.iter().map(|handle| (*handle).clone()));
    let changed = conn
        .execute(&sql, params_from_iter(params))
        .map_err(ClashError::storage)?;
    if changed > 0 {
        tracing::debug!(
            target: "clashstore.storage",
            op = "verify",
            tier = tier.flag_column(),
            missing = missing_handles.len(),
            reset = changed,
            "reverted zones with missing placed objects"
        );
    }
    Ok(changed)
}

/// Re-derive readiness for fully reset zones still in the current scope.
fn restore_ready(conn: &Connection, now: i64) -> ClashResult<usize> {
    conn.execute(
        "UPDATE clash_zones SET ready_for_placement = 1, updated_at = ?1 \
         WHERE is_current_in_scope = 1 AND ready_for_placement = 0 \
           AND is_individually_resolved = 0 AND is_cluster_resolved = 0 \
           AND is_combined_resolved = 0;",
        [now],
    )
    .map_err(ClashError::storage)
}
