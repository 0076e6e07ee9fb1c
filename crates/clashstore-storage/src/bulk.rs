//! Bulk transactional mutation of clash zones.
//!
//! A detection run hands the store a whole batch of candidates at once.
//! The batch commits or rolls back as a unit: candidates land in a TEMP
//! staging table, set-based updates reconcile them against existing rows
//! in three tiers (identity match, legacy identity back-fill, pair-key
//! collision), survivors insert, and every touched row gets its scope and
//! readiness re-derived. The spatial index refresh runs under a savepoint
//! so an index failure degrades to a warning instead of rolling back the
//! zone writes.
//!
//! `sync_batch_per_row` is the diagnostic path: one transaction per
//! candidate, so a poison row is isolated and reported instead of
//! poisoning the whole batch.

use std::collections::HashMap;

use clashstore_core::{ClashError, ClashResult, ScopeProvider};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::connection::Storage;
use crate::identity::{resolve_match, MatchOutcome, ZoneIdentity};
use crate::spatial;
use crate::zone::{
    ensure_combo, ensure_filter, insert_zone, unix_timestamp_ms, update_zone_from_candidate,
    ZoneCandidate,
};

/// Rows per staging INSERT statement; keeps the bind-variable count low.
const STAGING_CHUNK_ROWS: usize = 20;

const STAGING_COLUMN_COUNT: usize = 46;

const STAGING_COLUMNS: &str = "combo_id, identity_guid, source_element_id, host_element_id, \
    intersection_x, intersection_y, intersection_z, \
    bb_min_x, bb_min_y, bb_min_z, bb_max_x, bb_max_y, bb_max_z, \
    rbb_min_x, rbb_min_y, rbb_min_z, rbb_max_x, rbb_max_y, rbb_max_z, \
    corner0_x, corner0_y, corner0_z, corner1_x, corner1_y, corner1_z, \
    corner2_x, corner2_y, corner2_z, corner3_x, corner3_y, corner3_z, \
    orientation_x, orientation_y, orientation_z, \
    rotation_rad, rotation_deg, rotation_sin, rotation_cos, \
    is_clustered, marked_for_cluster_process, \
    host_thickness, width, height, diameter, \
    source_params_json, host_params_json";

const CREATE_STAGING: &str = "CREATE TEMP TABLE staging_zones (\
    combo_id INTEGER NOT NULL,\
    identity_guid TEXT NOT NULL,\
    source_element_id TEXT NOT NULL,\
    host_element_id TEXT NOT NULL,\
    intersection_x REAL NOT NULL, intersection_y REAL NOT NULL, intersection_z REAL NOT NULL,\
    bb_min_x REAL, bb_min_y REAL, bb_min_z REAL,\
    bb_max_x REAL, bb_max_y REAL, bb_max_z REAL,\
    rbb_min_x REAL, rbb_min_y REAL, rbb_min_z REAL,\
    rbb_max_x REAL, rbb_max_y REAL, rbb_max_z REAL,\
    corner0_x REAL, corner0_y REAL, corner0_z REAL,\
    corner1_x REAL, corner1_y REAL, corner1_z REAL,\
    corner2_x REAL, corner2_y REAL, corner2_z REAL,\
    corner3_x REAL, corner3_y REAL, corner3_z REAL,\
    orientation_x REAL, orientation_y REAL, orientation_z REAL,\
    rotation_rad REAL, rotation_deg REAL, rotation_sin REAL, rotation_cos REAL,\
    is_clustered INTEGER NOT NULL, marked_for_cluster_process INTEGER NOT NULL,\
    host_thickness REAL, width REAL, height REAL, diameter REAL,\
    source_params_json TEXT, host_params_json TEXT\
);";

/// SET fragment overwriting a matched row's geometry and parameter bags
/// from its staged counterpart. Identity and resolution flags are never
/// part of this list.
const GEOMETRY_SET: &str = "intersection_x = s.intersection_x, \
    intersection_y = s.intersection_y, intersection_z = s.intersection_z, \
    bb_min_x = s.bb_min_x, bb_min_y = s.bb_min_y, bb_min_z = s.bb_min_z, \
    bb_max_x = s.bb_max_x, bb_max_y = s.bb_max_y, bb_max_z = s.bb_max_z, \
    rbb_min_x = s.rbb_min_x, rbb_min_y = s.rbb_min_y, rbb_min_z = s.rbb_min_z, \
    rbb_max_x = s.rbb_max_x, rbb_max_y = s.rbb_max_y, rbb_max_z = s.rbb_max_z, \
    corner0_x = s.corner0_x, corner0_y = s.corner0_y, corner0_z = s.corner0_z, \
    corner1_x = s.corner1_x, corner1_y = s.corner1_y, corner1_z = s.corner1_z, \
    corner2_x = s.corner2_x, corner2_y = s.corner2_y, corner2_z = s.corner2_z, \
    corner3_x = s.corner3_x, corner3_y = s.corner3_y, corner3_z = s.corner3_z, \
    orientation_x = s.orientation_x, orientation_y = s.orientation_y, \
    orientation_z = s.orientation_z, \
    rotation_rad = s.rotation_rad, rotation_deg = s.rotation_deg, \
    rotation_sin = s.rotation_sin, rotation_cos = s.rotation_cos, \
    is_clustered = s.is_clustered, \
    marked_for_cluster_process = s.marked_for_cluster_process, \
    host_thickness = s.host_thickness, width = s.width, \
    height = s.height, diameter = s.diameter, \
    source_params_json = s.source_params_json, host_params_json = s.host_params_json";

/// A candidate the batch dropped, with the row position it held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub index: usize,
    pub source_element_id: String,
    pub host_element_id: String,
    pub reason: String,
}

/// What one batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub inserted: u64,
    /// All matched rows refreshed in place, including back-fills and
    /// collisions.
    pub updated: u64,
    pub collisions: u64,
    pub backfilled: u64,
    pub skipped: Vec<SkippedCandidate>,
    /// Non-fatal spatial index problems; the zone writes still committed.
    pub index_warnings: Vec<String>,
}

struct StagedRow<'a> {
    index: usize,
    combo_id: i64,
    identity: ZoneIdentity,
    candidate: &'a ZoneCandidate,
}

#[derive(Default)]
struct TxStats {
    inserted: u64,
    identity_matches: u64,
    backfilled: u64,
    collisions: u64,
    spatial_refreshed: u64,
    skipped: Vec<SkippedCandidate>,
    warnings: Vec<String>,
}

fn opt_real(value: Option<f64>) -> Value {
    value.map_or(Value::Null, Value::Real)
}

fn opt_text(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

fn staging_values(row: &StagedRow<'_>) -> ClashResult<Vec<Value>> {
    let c = row.candidate;
    let mut values = Vec::with_capacity(STAGING_COLUMN_COUNT);
    values.push(Value::Integer(row.combo_id));
    values.push(Value::Text(row.identity.to_string()));
    values.push(Value::Text(c.source_element_id.clone()));
    values.push(Value::Text(c.host_element_id.clone()));
    values.push(Value::Real(c.intersection.x));
    values.push(Value::Real(c.intersection.y));
    values.push(Value::Real(c.intersection.z));
    for aabb in [c.bounding_box.as_ref(), c.rotated_box.as_ref()] {
        values.push(opt_real(aabb.map(|b| b.min.x)));
        values.push(opt_real(aabb.map(|b| b.min.y)));
        values.push(opt_real(aabb.map(|b| b.min.z)));
        values.push(opt_real(aabb.map(|b| b.max.x)));
        values.push(opt_real(aabb.map(|b| b.max.y)));
        values.push(opt_real(aabb.map(|b| b.max.z)));
    }
    for corner_index in 0..4 {
        let corner = c.corners.as_ref().map(|corners| corners[corner_index]);
        values.push(opt_real(corner.map(|p| p.x)));
        values.push(opt_real(corner.map(|p| p.y)));
        values.push(opt_real(corner.map(|p| p.z)));
    }
    values.push(opt_real(c.orientation.map(|p| p.x)));
    values.push(opt_real(c.orientation.map(|p| p.y)));
    values.push(opt_real(c.orientation.map(|p| p.z)));
    let rotation = c.rotation.as_ref();
    values.push(opt_real(rotation.map(|r| r.radians)));
    values.push(opt_real(rotation.map(|r| r.degrees)));
    values.push(opt_real(rotation.map(|r| r.sin)));
    values.push(opt_real(rotation.map(|r| r.cos)));
    values.push(Value::Integer(i64::from(c.clustered)));
    values.push(Value::Integer(i64::from(c.marked_for_cluster_process)));
    values.push(opt_real(c.host_thickness));
    values.push(opt_real(c.width));
    values.push(opt_real(c.height));
    values.push(opt_real(c.diameter));
    values.push(opt_text(Some(c.source_params.to_json()?)));
    values.push(opt_text(Some(c.host_params.to_json()?)));
    debug_assert_eq!(values.len(), STAGING_COLUMN_COUNT);
    Ok(values)
}

fn load_staging(conn: &Connection, rows: &[StagedRow<'_>]) -> ClashResult<()> {
    conn.execute_batch("DROP TABLE IF EXISTS temp.staging_zones;")
        .map_err(ClashError::storage)?;
    conn.execute_batch(CREATE_STAGING)
        .map_err(ClashError::storage)?;

    let tuple = format!("({})", vec!["?"; STAGING_COLUMN_COUNT].join(","));
    for chunk in rows.chunks(STAGING_CHUNK_ROWS) {
        let sql = format!(
            "INSERT INTO staging_zones ({STAGING_COLUMNS}) VALUES {};",
            vec![tuple.as_str(); chunk.len()].join(",")
        );
        let mut values = Vec::with_capacity(chunk.len() * STAGING_COLUMN_COUNT);
        for row in chunk {
            values.extend(staging_values(row)?);
        }
        conn.execute(&sql, params_from_iter(values))
            .map_err(ClashError::storage)?;
    }
    Ok(())
}

/// Tier 1: rows already stored under the candidate identity.
fn update_identity_matches(conn: &Connection, now: i64) -> ClashResult<usize> {
    conn.execute(
        &format!(
            "UPDATE clash_zones AS z SET {GEOMETRY_SET}, updated_at = ?1 \
             FROM staging_zones s WHERE z.identity_guid = s.identity_guid;"
        ),
        params![now],
    )
    .map_err(ClashError::storage)
}

/// Tier 2: legacy rows without an identity, matched on pair key and
/// intersection proximity; the staged identity is back-filled.
fn backfill_legacy_matches(conn: &Connection, now: i64, tolerance: f64) -> ClashResult<usize> {
    conn.execute(
        &format!(
            "UPDATE clash_zones AS z SET identity_guid = s.identity_guid, \
                {GEOMETRY_SET}, updated_at = ?1 \
             FROM staging_zones s \
             WHERE z.identity_guid IS NULL \
               AND z.combo_id = s.combo_id \
               AND z.source_element_id = s.source_element_id \
               AND z.host_element_id = s.host_element_id \
               AND abs(z.intersection_x - s.intersection_x) <= ?2 \
               AND abs(z.intersection_y - s.intersection_y) <= ?2 \
               AND abs(z.intersection_z - s.intersection_z) <= ?2;"
        ),
        params![now, tolerance],
    )
    .map_err(ClashError::storage)
}

/// Tier 3: same pair key under a different (or still absent) identity.
/// The stored identity wins; the insert becomes an update.
fn update_pair_collisions(conn: &Connection, now: i64) -> ClashResult<usize> {
    conn.execute(
        &format!(
            "UPDATE clash_zones AS z SET {GEOMETRY_SET}, updated_at = ?1 \
             FROM staging_zones s \
             WHERE z.combo_id = s.combo_id \
               AND z.source_element_id = s.source_element_id \
               AND z.host_element_id = s.host_element_id \
               AND (z.identity_guid IS NULL OR z.identity_guid <> s.identity_guid);"
        ),
        params![now],
    )
    .map_err(ClashError::storage)
}

/// Insert staged candidates that matched nothing, guarded so neither the
/// identity nor the pair uniqueness constraint can fire.
fn insert_new_rows(conn: &Connection, now: i64) -> ClashResult<usize> {
    conn.execute(
        "INSERT INTO clash_zones (\
            combo_id, identity_guid, source_element_id, host_element_id, \
            intersection_x, intersection_y, intersection_z, \
            bb_min_x, bb_min_y, bb_min_z, bb_max_x, bb_max_y, bb_max_z, \
            rbb_min_x, rbb_min_y, rbb_min_z, rbb_max_x, rbb_max_y, rbb_max_z, \
            corner0_x, corner0_y, corner0_z, corner1_x, corner1_y, corner1_z, \
            corner2_x, corner2_y, corner2_z, corner3_x, corner3_y, corner3_z, \
            orientation_x, orientation_y, orientation_z, \
            rotation_rad, rotation_deg, rotation_sin, rotation_cos, \
            is_clustered, marked_for_cluster_process, \
            is_current_in_scope, ready_for_placement, \
            host_thickness, width, height, diameter, \
            source_params_json, host_params_json, created_at, updated_at\
         ) SELECT \
            s.combo_id, s.identity_guid, s.source_element_id, s.host_element_id, \
            s.intersection_x, s.intersection_y, s.intersection_z, \
            s.bb_min_x, s.bb_min_y, s.bb_min_z, s.bb_max_x, s.bb_max_y, s.bb_max_z, \
            s.rbb_min_x, s.rbb_min_y, s.rbb_min_z, s.rbb_max_x, s.rbb_max_y, s.rbb_max_z, \
            s.corner0_x, s.corner0_y, s.corner0_z, s.corner1_x, s.corner1_y, s.corner1_z, \
            s.corner2_x, s.corner2_y, s.corner2_z, s.corner3_x, s.corner3_y, s.corner3_z, \
            s.orientation_x, s.orientation_y, s.orientation_z, \
            s.rotation_rad, s.rotation_deg, s.rotation_sin, s.rotation_cos, \
            s.is_clustered, s.marked_for_cluster_process, \
            1, 1, \
            s.host_thickness, s.width, s.height, s.diameter, \
            s.source_params_json, s.host_params_json, ?1, ?1 \
         FROM staging_zones s \
         WHERE NOT EXISTS (\
            SELECT 1 FROM clash_zones z WHERE z.identity_guid = s.identity_guid\
         ) AND NOT EXISTS (\
            SELECT 1 FROM clash_zones z2 \
            WHERE z2.combo_id = s.combo_id \
              AND z2.source_element_id = s.source_element_id \
              AND z2.host_element_id = s.host_element_id\
         );",
        params![now],
    )
    .map_err(ClashError::storage)
}

/// Every staged zone was just observed: mark it in scope and re-derive
/// `ready_for_placement` from its resolution flags.
fn mark_batch_in_scope(conn: &Connection, now: i64) -> ClashResult<usize> {
    conn.execute(
        "UPDATE clash_zones AS z SET \
            is_current_in_scope = 1, \
            ready_for_placement = CASE \
                WHEN z.is_individually_resolved = 0 AND z.is_cluster_resolved = 0 \
                     AND z.is_combined_resolved = 0 THEN 1 \
                ELSE 0 END, \
            updated_at = ?1 \
         FROM staging_zones s \
         WHERE z.identity_guid = s.identity_guid \
            OR (z.combo_id = s.combo_id \
                AND z.source_element_id = s.source_element_id \
                AND z.host_element_id = s.host_element_id);",
        params![now],
    )
    .map_err(ClashError::storage)
}

fn staged_zone_id(conn: &Connection, row: &StagedRow<'_>) -> ClashResult<Option<i64>> {
    let by_identity: Option<i64> = conn
        .query_row(
            "SELECT id FROM clash_zones WHERE identity_guid = ?1;",
            params![row.identity.to_string()],
            |r| r.get(0),
        )
        .optional()
        .map_err(ClashError::storage)?;
    if by_identity.is_some() {
        return Ok(by_identity);
    }
    conn.query_row(
        "SELECT id FROM clash_zones \
         WHERE combo_id = ?1 AND source_element_id = ?2 AND host_element_id = ?3;",
        params![
            row.combo_id,
            row.candidate.source_element_id,
            row.candidate.host_element_id
        ],
        |r| r.get(0),
    )
    .optional()
    .map_err(ClashError::storage)
}

fn refresh_batch_spatial(
    conn: &Connection,
    rows: &[StagedRow<'_>],
    fallback_tolerance: f64,
) -> ClashResult<u64> {
    let mut refreshed = 0_u64;
    for row in rows {
        let Some(zone_id) = staged_zone_id(conn, row)? else {
            continue;
        };
        let aabb = spatial::index_box(
            row.candidate.bounding_box.as_ref(),
            Some(&row.candidate.intersection),
            fallback_tolerance,
        );
        if let Some(aabb) = aabb {
            spatial::refresh_entry(conn, zone_id, &aabb)?;
            refreshed += 1;
        }
    }
    Ok(refreshed)
}

impl Storage {
    /// Persist one detection batch in a single transaction.
    ///
    /// Invalid candidates and within-batch duplicates are skipped and
    /// reported in the outcome; any storage failure rolls the whole batch
    /// back and surfaces as a `Transaction` error.
    pub fn sync_batch(
        &self,
        filter_name: &str,
        category: &str,
        scope: &dyn ScopeProvider,
        candidates: &[ZoneCandidate],
    ) -> ClashResult<BatchOutcome> {
        let now = unix_timestamp_ms()?;
        let host_categories = scope.selected_host_categories();
        let tolerance = self.config().match_tolerance;
        let fallback_tolerance = self.config().fallback_box_tolerance;

        let mut outcome = BatchOutcome::default();
        let mut valid: Vec<(usize, &ZoneCandidate, ZoneIdentity)> =
            Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.iter().enumerate() {
            match candidate.validate() {
                Ok(()) => {
                    let identity = ZoneIdentity::derive(
                        &candidate.source_element_id,
                        &candidate.host_element_id,
                        &candidate.intersection,
                    );
                    valid.push((index, candidate, identity));
                }
                Err(error) => outcome.skipped.push(SkippedCandidate {
                    index,
                    source_element_id: candidate.source_element_id.clone(),
                    host_element_id: candidate.host_element_id.clone(),
                    reason: error.to_string(),
                }),
            }
        }

        let stats = self
            .transaction(|conn| {
                let mut stats = TxStats::default();
                let filter_id = ensure_filter(conn, filter_name, category, &host_categories, now)?;

                let mut combo_ids: HashMap<(&str, &str), i64> = HashMap::new();
                for (_, candidate, _) in &valid {
                    let key = (
                        candidate.source_doc_key.as_str(),
                        candidate.host_doc_key.as_str(),
                    );
                    if !combo_ids.contains_key(&key) {
                        let combo_id = ensure_combo(
                            conn,
                            filter_id,
                            category,
                            &host_categories,
                            key.0,
                            key.1,
                            now,
                        )?;
                        combo_ids.insert(key, combo_id);
                    }
                }

                // Within-batch dedup: the last observation of an identity
                // or pair key wins, earlier ones are reported as skipped.
                let mut staged: Vec<Option<StagedRow<'_>>> = Vec::with_capacity(valid.len());
                let mut by_identity: HashMap<ZoneIdentity, usize> = HashMap::new();
                let mut by_pair: HashMap<(i64, &str, &str), usize> = HashMap::new();
                for (index, candidate, identity) in &valid {
                    let combo_id = combo_ids[&(
                        candidate.source_doc_key.as_str(),
                        candidate.host_doc_key.as_str(),
                    )];
                    let pair = (
                        combo_id,
                        candidate.source_element_id.as_str(),
                        candidate.host_element_id.as_str(),
                    );
                    let mut dup_slots: Vec<usize> = Vec::new();
                    if let Some(&slot) = by_identity.get(identity) {
                        dup_slots.push(slot);
                    }
                    if let Some(&slot) = by_pair.get(&pair) {
                        if !dup_slots.contains(&slot) {
                            dup_slots.push(slot);
                        }
                    }
                    for slot in dup_slots {
                        if let Some(old) = staged[slot].take() {
                            by_identity.remove(&old.identity);
                            by_pair.remove(&(
                                old.combo_id,
                                old.candidate.source_element_id.as_str(),
                                old.candidate.host_element_id.as_str(),
                            ));
                            stats.skipped.push(SkippedCandidate {
                                index: old.index,
                                source_element_id: old.candidate.source_element_id.clone(),
                                host_element_id: old.candidate.host_element_id.clone(),
                                reason: "superseded by a later duplicate in the same batch"
                                    .to_owned(),
                            });
                        }
                    }
                    let slot = staged.len();
                    staged.push(Some(StagedRow {
                        index: *index,
                        combo_id,
                        identity: *identity,
                        candidate: *candidate,
                    }));
                    by_identity.insert(*identity, slot);
                    by_pair.insert(pair, slot);
                }
                let rows: Vec<StagedRow<'_>> = staged.into_iter().flatten().collect();

                if !rows.is_empty() {
                    load_staging(conn, &rows)?;

                    stats.identity_matches = update_identity_matches(conn, now)? as u64;
                    stats.backfilled = backfill_legacy_matches(conn, now, tolerance)? as u64;
                    stats.collisions = update_pair_collisions(conn, now)? as u64;
                    stats.inserted = insert_new_rows(conn, now)? as u64;
                    mark_batch_in_scope(conn, now)?;

                    conn.execute_batch("SAVEPOINT spatial_refresh;")
                        .map_err(ClashError::storage)?;
                    match refresh_batch_spatial(conn, &rows, fallback_tolerance) {
                        Ok(refreshed) => {
                            conn.execute_batch("RELEASE spatial_refresh;")
                                .map_err(ClashError::storage)?;
                            stats.spatial_refreshed = refreshed;
                        }
                        Err(error) => {
                            conn.execute_batch(
                                "ROLLBACK TO spatial_refresh; RELEASE spatial_refresh;",
                            )
                            .map_err(ClashError::storage)?;
                            stats.warnings.push(format!(
                                "spatial index refresh skipped for this batch: {error}"
                            ));
                        }
                    }

                    conn.execute_batch("DROP TABLE IF EXISTS temp.staging_zones;")
                        .map_err(ClashError::storage)?;
                }

                Ok(stats)
            })
            .map_err(|source| ClashError::Transaction {
                op: "sync_batch",
                batch_size: candidates.len(),
                source: Box::new(source),
            })?;

        outcome.inserted = stats.inserted;
        outcome.updated = stats.identity_matches + stats.backfilled + stats.collisions;
        outcome.backfilled = stats.backfilled;
        outcome.collisions = stats.collisions;
        outcome.skipped.extend(stats.skipped);
        outcome.index_warnings = stats.warnings;

        self.metrics().record_batch(outcome.inserted, outcome.updated);
        if outcome.index_warnings.is_empty() {
            self.metrics().record_spatial_refresh(stats.spatial_refreshed);
        } else {
            self.metrics().record_spatial_failure();
        }

        tracing::info!(
            target: "clashstore.storage",
            op = "sync_batch",
            filter = filter_name,
            category,
            batch_size = candidates.len(),
            inserted = outcome.inserted,
            updated = outcome.updated,
            collisions = outcome.collisions,
            backfilled = outcome.backfilled,
            skipped = outcome.skipped.len(),
            index_warnings = outcome.index_warnings.len(),
            "detection batch persisted"
        );
        Ok(outcome)
    }

    /// Diagnostic variant of [`Storage::sync_batch`]: one transaction per
    /// candidate, so a failing row is reported in `skipped` while the rest
    /// of the batch still lands.
    pub fn sync_batch_per_row(
        &self,
        filter_name: &str,
        category: &str,
        scope: &dyn ScopeProvider,
        candidates: &[ZoneCandidate],
    ) -> ClashResult<BatchOutcome> {
        let host_categories = scope.selected_host_categories();
        let tolerance = self.config().match_tolerance;
        let fallback_tolerance = self.config().fallback_box_tolerance;

        let mut outcome = BatchOutcome::default();
        for (index, candidate) in candidates.iter().enumerate() {
            if let Err(error) = candidate.validate() {
                outcome.skipped.push(SkippedCandidate {
                    index,
                    source_element_id: candidate.source_element_id.clone(),
                    host_element_id: candidate.host_element_id.clone(),
                    reason: error.to_string(),
                });
                continue;
            }
            let identity = ZoneIdentity::derive(
                &candidate.source_element_id,
                &candidate.host_element_id,
                &candidate.intersection,
            );

            let result = self.transaction(|conn| {
                let now = unix_timestamp_ms()?;
                let filter_id = ensure_filter(conn, filter_name, category, &host_categories, now)?;
                let combo_id = ensure_combo(
                    conn,
                    filter_id,
                    category,
                    &host_categories,
                    &candidate.source_doc_key,
                    &candidate.host_doc_key,
                    now,
                )?;

                let matched = resolve_match(
                    conn,
                    combo_id,
                    &candidate.source_element_id,
                    &candidate.host_element_id,
                    &candidate.intersection,
                    tolerance,
                )?;
                let (zone_id, verdict) = match matched {
                    MatchOutcome::NewRow => {
                        let zone_id = insert_zone(conn, combo_id, &identity, candidate, now)?;
                        (zone_id, matched)
                    }
                    MatchOutcome::MatchByIdentity { zone_id }
                    | MatchOutcome::MatchByGeometryCollision { zone_id, .. } => {
                        update_zone_from_candidate(conn, zone_id, candidate, now)?;
                        (zone_id, matched)
                    }
                };

                conn.execute(
                    "UPDATE clash_zones SET \
                        is_current_in_scope = 1, \
                        ready_for_placement = CASE \
                            WHEN is_individually_resolved = 0 AND is_cluster_resolved = 0 \
                                 AND is_combined_resolved = 0 THEN 1 \
                            ELSE 0 END, \
                        updated_at = ?2 \
                     WHERE id = ?1;",
                    params![zone_id, now],
                )
                .map_err(ClashError::storage)?;

                if let Some(aabb) = spatial::index_box(
                    candidate.bounding_box.as_ref(),
                    Some(&candidate.intersection),
                    fallback_tolerance,
                ) {
                    spatial::refresh_entry(conn, zone_id, &aabb)?;
                }
                Ok(verdict)
            });

            match result {
                Ok(MatchOutcome::NewRow) => outcome.inserted += 1,
                Ok(MatchOutcome::MatchByIdentity { .. }) => outcome.updated += 1,
                Ok(MatchOutcome::MatchByGeometryCollision {
                    identity_backfilled,
                    ..
                }) => {
                    outcome.updated += 1;
                    if identity_backfilled {
                        outcome.backfilled += 1;
                    } else {
                        outcome.collisions += 1;
                    }
                }
                Err(error) => outcome.skipped.push(SkippedCandidate {
                    index,
                    source_element_id: candidate.source_element_id.clone(),
                    host_element_id: candidate.host_element_id.clone(),
                    reason: error.to_string(),
                }),
            }
        }

        self.metrics().record_batch(outcome.inserted, outcome.updated);
        tracing::info!(
            target: "clashstore.storage",
            op = "sync_batch_per_row",
            filter = filter_name,
            category,
            batch_size = candidates.len(),
            inserted = outcome.inserted,
            updated = outcome.updated,
            skipped = outcome.skipped.len(),
            "per-row batch persisted"
        );
        Ok(outcome)
    }
}
