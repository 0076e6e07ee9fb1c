//! The Individual/Cluster/Combined resolution state machine.
//!
//! Precedence is `CombinedResolved > ClusterResolved > IndividuallyResolved
//! > Unresolved`: when tiers are reported simultaneously the highest wins,
//! and every completed transition leaves at most one tier flag set. The
//! "current-clash" scope protocol lives here too: a detection cycle first
//! clears scope/ready for the whole filter/category, then re-observed
//! zones are marked in scope and `ready_for_placement` is re-derived.

use clashstore_core::{ClashError, ClashResult};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use crate::connection::Storage;
use crate::identity::ZoneIdentity;
use crate::zone::{ensure_non_empty, unix_timestamp_ms, ZoneFlags};

/// One of the three remediation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResolutionTier {
    Individual,
    Cluster,
    Combined,
}

impl ResolutionTier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Cluster => "cluster",
            Self::Combined => "combined",
        }
    }
}

/// The resolution state of a zone, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionState {
    Unresolved,
    IndividuallyResolved,
    ClusterResolved,
    CombinedResolved,
}

impl ResolutionState {
    /// Derive the state from stored flags, highest tier winning.
    #[must_use]
    pub fn from_flags(flags: &ZoneFlags) -> Self {
        if flags.combined_resolved {
            Self::CombinedResolved
        } else if flags.cluster_resolved {
            Self::ClusterResolved
        } else if flags.individually_resolved {
            Self::IndividuallyResolved
        } else {
            Self::Unresolved
        }
    }

    #[must_use]
    pub const fn tier(self) -> Option<ResolutionTier> {
        match self {
            Self::Unresolved => None,
            Self::IndividuallyResolved => Some(ResolutionTier::Individual),
            Self::ClusterResolved => Some(ResolutionTier::Cluster),
            Self::CombinedResolved => Some(ResolutionTier::Combined),
        }
    }
}

fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 2);
    for index in 0..count {
        if index > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}

fn identity_texts(identities: &[ZoneIdentity]) -> Vec<String> {
    identities.iter().map(ToString::to_string).collect()
}

/// `Unresolved -> IndividuallyResolved` for the named zones.
///
/// Rows already resolved at a higher tier are left untouched: the higher
/// tier wins.
pub fn mark_individually_resolved(
    conn: &Connection,
    identities: &[ZoneIdentity],
    handle: &str,
    now: i64,
) -> ClashResult<usize> {
    ensure_non_empty(handle, "individual_object_id")?;
    if identities.is_empty() {
        return Ok(0);
    }

    let texts = identity_texts(identities);
    let sql = format!(
        "UPDATE clash_zones SET \
            is_individually_resolved = 1, \
            individual_object_id = ?1, \
            ready_for_placement = 0, \
            updated_at = ?2 \
         WHERE is_combined_resolved = 0 AND is_cluster_resolved = 0 \
           AND identity_guid IN ({});",
        placeholders(texts.len())
    );
    let params = std::iter::once(handle.to_owned())
        .chain(std::iter::once(now.to_string()))
        .chain(texts);
    conn.execute(&sql, params_from_iter(params))
        .map_err(ClashError::storage)
}

/// `Unresolved | IndividuallyResolved -> ClusterResolved`.
///
/// The cluster tier outranks the individual tier, so a previously
/// individually-resolved zone loses that flag; its individual handle stays
/// in storage (handles overlap in storage, only one governs).
pub fn mark_cluster_resolved(
    conn: &Connection,
    identities: &[ZoneIdentity],
    handle: &str,
    now: i64,
) -> ClashResult<usize> {
    ensure_non_empty(handle, "cluster_object_id")?;
    if identities.is_empty() {
        return Ok(0);
    }

    let texts = identity_texts(identities);
    let sql = format!(
        "UPDATE clash_zones SET \
            is_cluster_resolved = 1, \
            is_individually_resolved = 0, \
            is_clustered = 1, \
            cluster_object_id = ?1, \
            ready_for_placement = 0, \
            updated_at = ?2 \
         WHERE is_combined_resolved = 0 \
           AND identity_guid IN ({});",
        placeholders(texts.len())
    );
    let params = std::iter::once(handle.to_owned())
        .chain(std::iter::once(now.to_string()))
        .chain(texts);
    conn.execute(&sql, params_from_iter(params))
        .map_err(ClashError::storage)
}

const COMBINED_SET_CLAUSE: &str = "is_combined_resolved = 1, \
    is_individually_resolved = 0, \
    is_cluster_resolved = 0, \
    individual_object_id = NULL, \
    cluster_object_id = NULL, \
    combined_object_id = ?1, \
    ready_for_placement = 0, \
    updated_at = ?2";

/// Absorb the named zones into a combined object: the subordinate tier
/// flags and handles clear in the same statement.
pub fn mark_combined_by_identities(
    conn: &Connection,
    identities: &[ZoneIdentity],
    handle: &str,
    now: i64,
) -> ClashResult<usize> {
    ensure_non_empty(handle, "combined_object_id")?;
    if identities.is_empty() {
        return Ok(0);
    }

    let texts = identity_texts(identities);
    let sql = format!(
        "UPDATE clash_zones SET {COMBINED_SET_CLAUSE} WHERE identity_guid IN ({});",
        placeholders(texts.len())
    );
    let params = std::iter::once(handle.to_owned())
        .chain(std::iter::once(now.to_string()))
        .chain(texts);
    conn.execute(&sql, params_from_iter(params))
        .map_err(ClashError::storage)
}

/// Absorb whole cluster groups into a combined object: every member zone
/// of each named group transitions atomically.
pub fn mark_combined_by_cluster_groups(
    conn: &Connection,
    cluster_group_ids: &[String],
    handle: &str,
    now: i64,
) -> ClashResult<usize> {
    ensure_non_empty(handle, "combined_object_id")?;
    if cluster_group_ids.is_empty() {
        return Ok(0);
    }

    let sql = format!(
        "UPDATE clash_zones SET {COMBINED_SET_CLAUSE} WHERE cluster_object_id IN ({});",
        placeholders(cluster_group_ids.len())
    );
    let params = std::iter::once(handle.to_owned())
        .chain(std::iter::once(now.to_string()))
        .chain(cluster_group_ids.iter().cloned());
    conn.execute(&sql, params_from_iter(params))
        .map_err(ClashError::storage)
}

/// First half of the scope protocol: clear `is_current_in_scope` and
/// `ready_for_placement` for every zone of the filter/category. Zones
/// re-observed during the cycle get both re-derived.
pub fn begin_detection_cycle(
    conn: &Connection,
    filter_name: &str,
    category: &str,
    now: i64,
) -> ClashResult<usize> {
    conn.execute(
        "UPDATE clash_zones SET \
            is_current_in_scope = 0, \
            ready_for_placement = 0, \
            updated_at = ?3 \
         WHERE combo_id IN (\
            SELECT c.id FROM file_combos c \
            JOIN filters f ON f.id = c.filter_id \
            WHERE f.name = ?1 AND f.category = ?2\
         );",
        rusqlite::params![filter_name, category, now],
    )
    .map_err(ClashError::storage)
}

/// Second half of the scope protocol for explicitly named zones: mark
/// them observed and re-derive `ready_for_placement`.
pub fn mark_observed(
    conn: &Connection,
    identities: &[ZoneIdentity],
    now: i64,
) -> ClashResult<usize> {
    if identities.is_empty() {
        return Ok(0);
    }

    let texts = identity_texts(identities);
    let sql = format!(
        "UPDATE clash_zones SET \
            is_current_in_scope = 1, \
            ready_for_placement = CASE \
                WHEN is_individually_resolved = 0 AND is_cluster_resolved = 0 \
                     AND is_combined_resolved = 0 THEN 1 \
                ELSE 0 END, \
            updated_at = ?1 \
         WHERE identity_guid IN ({});",
        placeholders(texts.len())
    );
    let params = std::iter::once(now.to_string()).chain(texts);
    conn.execute(&sql, params_from_iter(params))
        .map_err(ClashError::storage)
}

impl Storage {
    /// Record a placement event resolving zones individually.
    pub fn resolve_individually(
        &self,
        identities: &[ZoneIdentity],
        handle: &str,
    ) -> ClashResult<usize> {
        let now = unix_timestamp_ms()?;
        let changed =
            self.transaction(|conn| mark_individually_resolved(conn, identities, handle, now))?;
        tracing::debug!(
            target: "clashstore.storage",
            op = "resolve_individually",
            handle,
            requested = identities.len(),
            changed,
            "individual resolution recorded"
        );
        Ok(changed)
    }

    /// Record a placement event resolving zones as one cluster.
    pub fn resolve_cluster(
        &self,
        identities: &[ZoneIdentity],
        handle: &str,
    ) -> ClashResult<usize> {
        let now = unix_timestamp_ms()?;
        let changed =
            self.transaction(|conn| mark_cluster_resolved(conn, identities, handle, now))?;
        tracing::debug!(
            target: "clashstore.storage",
            op = "resolve_cluster",
            handle,
            requested = identities.len(),
            changed,
            "cluster resolution recorded"
        );
        Ok(changed)
    }

    /// Absorb zones into a combined object, by explicit identities.
    pub fn resolve_combined(
        &self,
        identities: &[ZoneIdentity],
        handle: &str,
    ) -> ClashResult<usize> {
        let now = unix_timestamp_ms()?;
        let changed =
            self.transaction(|conn| mark_combined_by_identities(conn, identities, handle, now))?;
        tracing::debug!(
            target: "clashstore.storage",
            op = "resolve_combined",
            handle,
            requested = identities.len(),
            changed,
            "combined resolution recorded"
        );
        Ok(changed)
    }

    /// Absorb whole cluster groups into a combined object.
    pub fn resolve_combined_groups(
        &self,
        cluster_group_ids: &[String],
        handle: &str,
    ) -> ClashResult<usize> {
        let now = unix_timestamp_ms()?;
        let changed = self.transaction(|conn| {
            mark_combined_by_cluster_groups(conn, cluster_group_ids, handle, now)
        })?;
        tracing::debug!(
            target: "clashstore.storage",
            op = "resolve_combined_groups",
            handle,
            groups = cluster_group_ids.len(),
            changed,
            "combined resolution recorded for cluster groups"
        );
        Ok(changed)
    }

    /// Start a detection cycle for one filter/category scope.
    pub fn begin_detection_cycle(&self, filter_name: &str, category: &str) -> ClashResult<usize> {
        let now = unix_timestamp_ms()?;
        let cleared =
            self.transaction(|conn| begin_detection_cycle(conn, filter_name, category, now))?;
        tracing::debug!(
            target: "clashstore.storage",
            op = "begin_detection_cycle",
            filter = filter_name,
            category,
            cleared,
            "scope and ready flags cleared for new cycle"
        );
        Ok(cleared)
    }
}
