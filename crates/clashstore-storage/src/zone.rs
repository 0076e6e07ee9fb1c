//! Clash-zone, file-combo, and filter records plus their row-level CRUD.
//!
//! Zones are created on first detection, updated on every re-detection or
//! placement event, and never hard-deleted: host-side deletion of the
//! underlying element triggers a flag reset, not a row delete. Filters and
//! combos are created lazily on first write and never deleted.

use std::time::{SystemTime, UNIX_EPOCH};

use clashstore_core::{Aabb, ClashError, ClashResult, ParamBag, Point3, Rotation};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::identity::ZoneIdentity;

/// The seven lifecycle flags of a zone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneFlags {
    pub individually_resolved: bool,
    pub cluster_resolved: bool,
    pub combined_resolved: bool,
    pub clustered: bool,
    pub marked_for_cluster_process: bool,
    pub current_in_scope: bool,
    pub ready_for_placement: bool,
}

impl ZoneFlags {
    /// Whether any resolution tier is set.
    #[must_use]
    pub fn any_tier_resolved(&self) -> bool {
        self.individually_resolved || self.cluster_resolved || self.combined_resolved
    }
}

/// A stored clash zone: one detected intersection between two building
/// elements, plus its resolution lifecycle and placement-derived geometry.
///
/// `id` is the internal storage key used for index joins; it is never
/// exposed as a stable identity. `identity` is the deterministic 128-bit
/// identity; legacy rows may not have one until the dedup resolver
/// back-fills it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClashZone {
    pub id: i64,
    pub identity: Option<ZoneIdentity>,
    pub combo_id: i64,
    pub source_element_id: String,
    pub host_element_id: String,
    pub intersection: Option<Point3>,
    pub bounding_box: Option<Aabb>,
    pub rotated_box: Option<Aabb>,
    pub corners: Option<[Point3; 4]>,
    pub orientation: Option<Point3>,
    pub rotation: Option<Rotation>,
    pub flags: ZoneFlags,
    pub individual_object_id: Option<String>,
    pub cluster_object_id: Option<String>,
    pub combined_object_id: Option<String>,
    pub host_thickness: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub diameter: Option<f64>,
    pub source_params: ParamBag,
    pub host_params: ParamBag,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A newly observed clash zone handed to the bulk mutation engine.
///
/// Geometry is supplied by the host-side calculators; this core only
/// validates and persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneCandidate {
    pub source_element_id: String,
    pub host_element_id: String,
    pub source_doc_key: String,
    pub host_doc_key: String,
    pub intersection: Point3,
    pub bounding_box: Option<Aabb>,
    pub rotated_box: Option<Aabb>,
    pub corners: Option<[Point3; 4]>,
    pub orientation: Option<Point3>,
    pub rotation: Option<Rotation>,
    pub clustered: bool,
    pub marked_for_cluster_process: bool,
    pub host_thickness: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub diameter: Option<f64>,
    pub source_params: ParamBag,
    pub host_params: ParamBag,
}

impl ZoneCandidate {
    #[must_use]
    pub fn new(
        source_element_id: impl Into<String>,
        host_element_id: impl Into<String>,
        source_doc_key: impl Into<String>,
        host_doc_key: impl Into<String>,
        intersection: Point3,
    ) -> Self {
        Self {
            source_element_id: source_element_id.into(),
            host_element_id: host_element_id.into(),
            source_doc_key: source_doc_key.into(),
            host_doc_key: host_doc_key.into(),
            intersection,
            bounding_box: None,
            rotated_box: None,
            corners: None,
            orientation: None,
            rotation: None,
            clustered: false,
            marked_for_cluster_process: false,
            host_thickness: None,
            width: None,
            height: None,
            diameter: None,
            source_params: ParamBag::new(),
            host_params: ParamBag::new(),
        }
    }

    /// Reject candidates that must not reach storage: empty identifiers and
    /// non-finite geometry. Reported per item, never silently dropped.
    pub fn validate(&self) -> ClashResult<()> {
        ensure_non_empty(&self.source_element_id, "source_element_id")?;
        ensure_non_empty(&self.host_element_id, "host_element_id")?;
        ensure_non_empty(&self.source_doc_key, "source_doc_key")?;
        ensure_non_empty(&self.host_doc_key, "host_doc_key")?;
        self.intersection.ensure_finite("intersection")?;
        if let Some(bb) = &self.bounding_box {
            if !bb.is_finite() {
                return Err(ClashError::validation(
                    "bounding_box",
                    "coordinates must be finite",
                ));
            }
        }
        if let Some(rbb) = &self.rotated_box {
            if !rbb.is_finite() {
                return Err(ClashError::validation(
                    "rotated_box",
                    "coordinates must be finite",
                ));
            }
        }
        if let Some(corners) = &self.corners {
            for corner in corners {
                corner.ensure_finite("corners")?;
            }
        }
        if let Some(orientation) = &self.orientation {
            orientation.ensure_finite("orientation")?;
        }
        if let Some(rotation) = &self.rotation {
            if !rotation.is_finite() {
                return Err(ClashError::validation(
                    "rotation",
                    "rotation values must be finite",
                ));
            }
        }
        Ok(())
    }
}

/// A named, category-scoped detection configuration row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRecord {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub selected_host_categories: Vec<String>,
    pub is_new: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// The (filter, category, source-document, host-document) grouping a zone
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCombo {
    pub id: i64,
    pub filter_id: i64,
    pub category: String,
    pub selected_host_categories: Vec<String>,
    pub source_doc_key: String,
    pub host_doc_key: String,
    pub is_new: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Column list shared by every query that materializes a full `ClashZone`.
pub(crate) const ZONE_COLUMNS: &str = "z.id, z.identity_guid, z.combo_id, \
    z.source_element_id, z.host_element_id, \
    z.intersection_x, z.intersection_y, z.intersection_z, \
    z.bb_min_x, z.bb_min_y, z.bb_min_z, z.bb_max_x, z.bb_max_y, z.bb_max_z, \
    z.rbb_min_x, z.rbb_min_y, z.rbb_min_z, z.rbb_max_x, z.rbb_max_y, z.rbb_max_z, \
    z.corner0_x, z.corner0_y, z.corner0_z, z.corner1_x, z.corner1_y, z.corner1_z, \
    z.corner2_x, z.corner2_y, z.corner2_z, z.corner3_x, z.corner3_y, z.corner3_z, \
    z.orientation_x, z.orientation_y, z.orientation_z, \
    z.rotation_rad, z.rotation_deg, z.rotation_sin, z.rotation_cos, \
    z.is_individually_resolved, z.is_cluster_resolved, z.is_combined_resolved, \
    z.is_clustered, z.marked_for_cluster_process, z.is_current_in_scope, z.ready_for_placement, \
    z.individual_object_id, z.cluster_object_id, z.combined_object_id, \
    z.host_thickness, z.width, z.height, z.diameter, \
    z.source_params_json, z.host_params_json, z.created_at, z.updated_at";

fn opt_point(x: Option<f64>, y: Option<f64>, z: Option<f64>) -> Option<Point3> {
    match (x, y, z) {
        (Some(x), Some(y), Some(z)) => Some(Point3::new(x, y, z)),
        _ => None,
    }
}

fn opt_aabb(values: [Option<f64>; 6]) -> Option<Aabb> {
    match values {
        [Some(min_x), Some(min_y), Some(min_z), Some(max_x), Some(max_y), Some(max_z)] => {
            Some(Aabb::new(
                Point3::new(min_x, min_y, min_z),
                Point3::new(max_x, max_y, max_z),
            ))
        }
        _ => None,
    }
}

/// Materialize a `ClashZone` from a row selected with [`ZONE_COLUMNS`].
///
/// The intersection point is reconstructed tolerantly from its scalar
/// columns: a legacy row with missing coordinates yields `None` rather
/// than an error.
pub(crate) fn zone_from_row(row: &Row<'_>) -> rusqlite::Result<ClashZone> {
    let identity_text: Option<String> = row.get(1)?;
    let identity = identity_text.as_deref().and_then(ZoneIdentity::parse);

    let intersection = opt_point(row.get(5)?, row.get(6)?, row.get(7)?);
    let bounding_box = opt_aabb([
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ]);
    let rotated_box = opt_aabb([
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
        row.get(17)?,
        row.get(18)?,
        row.get(19)?,
    ]);

    let mut corner_points = [Point3::default(); 4];
    let mut all_corners = true;
    for (index, corner) in corner_points.iter_mut().enumerate() {
        let base = 20 + index * 3;
        match opt_point(row.get(base)?, row.get(base + 1)?, row.get(base + 2)?) {
            Some(point) => *corner = point,
            None => {
                all_corners = false;
                break;
            }
        }
    }
    let corners = all_corners.then_some(corner_points);

    let orientation = opt_point(row.get(32)?, row.get(33)?, row.get(34)?);

    let rotation = match (
        row.get::<_, Option<f64>>(35)?,
        row.get::<_, Option<f64>>(36)?,
        row.get::<_, Option<f64>>(37)?,
        row.get::<_, Option<f64>>(38)?,
    ) {
        (Some(rad), Some(deg), Some(sin), Some(cos)) => {
            Some(Rotation::from_parts(rad, deg, sin, cos))
        }
        (Some(rad), _, _, _) => Some(Rotation::from_radians(rad)),
        _ => None,
    };

    let flags = ZoneFlags {
        individually_resolved: row.get::<_, i64>(39)? != 0,
        cluster_resolved: row.get::<_, i64>(40)? != 0,
        combined_resolved: row.get::<_, i64>(41)? != 0,
        clustered: row.get::<_, i64>(42)? != 0,
        marked_for_cluster_process: row.get::<_, i64>(43)? != 0,
        current_in_scope: row.get::<_, i64>(44)? != 0,
        ready_for_placement: row.get::<_, i64>(45)? != 0,
    };

    let source_params_json: Option<String> = row.get(53)?;
    let host_params_json: Option<String> = row.get(54)?;

    Ok(ClashZone {
        id: row.get(0)?,
        identity,
        combo_id: row.get(2)?,
        source_element_id: row.get(3)?,
        host_element_id: row.get(4)?,
        intersection,
        bounding_box,
        rotated_box,
        corners,
        orientation,
        rotation,
        flags,
        individual_object_id: row.get(46)?,
        cluster_object_id: row.get(47)?,
        combined_object_id: row.get(48)?,
        host_thickness: row.get(49)?,
        width: row.get(50)?,
        height: row.get(51)?,
        diameter: row.get(52)?,
        source_params: parse_bag(source_params_json.as_deref()),
        host_params: parse_bag(host_params_json.as_deref()),
        created_at: row.get(55)?,
        updated_at: row.get(56)?,
    })
}

fn parse_bag(json: Option<&str>) -> ParamBag {
    json.and_then(|text| ParamBag::from_json(text).ok())
        .unwrap_or_default()
}

/// Find or lazily create a filter row; refreshes the host-category
/// selection and clears `is_new` when the row already existed.
pub fn ensure_filter(
    conn: &Connection,
    name: &str,
    category: &str,
    host_categories: &[String],
    now: i64,
) -> ClashResult<i64> {
    ensure_non_empty(name, "filter_name")?;
    ensure_non_empty(category, "category")?;

    let categories_json = serde_json::to_string(host_categories).map_err(ClashError::storage)?;
    conn.execute(
        "INSERT INTO filters (name, category, selected_host_categories, is_new, created_at, updated_at) \
         VALUES (?1, ?2, ?3, 1, ?4, ?4) \
         ON CONFLICT(name, category) DO UPDATE SET \
            selected_host_categories = excluded.selected_host_categories, \
            is_new = 0, \
            updated_at = excluded.updated_at;",
        params![name, category, categories_json, now],
    )
    .map_err(ClashError::storage)?;

    conn.query_row(
        "SELECT id FROM filters WHERE name = ?1 AND category = ?2;",
        params![name, category],
        |row| row.get(0),
    )
    .map_err(ClashError::storage)
}

/// Find or lazily create the combo row for a (filter, category,
/// source-doc, host-doc) tuple.
pub fn ensure_combo(
    conn: &Connection,
    filter_id: i64,
    category: &str,
    host_categories: &[String],
    source_doc_key: &str,
    host_doc_key: &str,
    now: i64,
) -> ClashResult<i64> {
    ensure_non_empty(source_doc_key, "source_doc_key")?;
    ensure_non_empty(host_doc_key, "host_doc_key")?;

    let categories_json = serde_json::to_string(host_categories).map_err(ClashError::storage)?;
    conn.execute(
        "INSERT INTO file_combos \
            (filter_id, category, selected_host_categories, source_doc_key, host_doc_key, is_new, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6) \
         ON CONFLICT(filter_id, category, source_doc_key, host_doc_key) DO UPDATE SET \
            selected_host_categories = excluded.selected_host_categories, \
            is_new = 0, \
            updated_at = excluded.updated_at;",
        params![filter_id, category, categories_json, source_doc_key, host_doc_key, now],
    )
    .map_err(ClashError::storage)?;

    conn.query_row(
        "SELECT id FROM file_combos \
         WHERE filter_id = ?1 AND category = ?2 AND source_doc_key = ?3 AND host_doc_key = ?4;",
        params![filter_id, category, source_doc_key, host_doc_key],
        |row| row.get(0),
    )
    .map_err(ClashError::storage)
}

pub fn get_filter(conn: &Connection, name: &str, category: &str) -> ClashResult<Option<FilterRecord>> {
    conn.query_row(
        "SELECT id, name, category, selected_host_categories, is_new, created_at, updated_at \
         FROM filters WHERE name = ?1 AND category = ?2;",
        params![name, category],
        |row| {
            let categories_json: Option<String> = row.get(3)?;
            Ok(FilterRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                category: row.get(2)?,
                selected_host_categories: parse_string_list(categories_json.as_deref()),
                is_new: row.get::<_, i64>(4)? != 0,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        },
    )
    .optional()
    .map_err(ClashError::storage)
}

pub fn combo_by_id(conn: &Connection, combo_id: i64) -> ClashResult<Option<FileCombo>> {
    conn.query_row(
        "SELECT id, filter_id, category, selected_host_categories, source_doc_key, host_doc_key, \
                is_new, created_at, updated_at \
         FROM file_combos WHERE id = ?1;",
        params![combo_id],
        |row| {
            let categories_json: Option<String> = row.get(3)?;
            Ok(FileCombo {
                id: row.get(0)?,
                filter_id: row.get(1)?,
                category: row.get(2)?,
                selected_host_categories: parse_string_list(categories_json.as_deref()),
                source_doc_key: row.get(4)?,
                host_doc_key: row.get(5)?,
                is_new: row.get::<_, i64>(6)? != 0,
                created_at: row.get(7)?,
                updated_at: row.get(8)?,
            })
        },
    )
    .optional()
    .map_err(ClashError::storage)
}

fn parse_string_list(json: Option<&str>) -> Vec<String> {
    json.and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or_default()
}

fn aabb_cols(value: Option<&Aabb>) -> [Option<f64>; 6] {
    match value {
        Some(b) => [
            Some(b.min.x),
            Some(b.min.y),
            Some(b.min.z),
            Some(b.max.x),
            Some(b.max.y),
            Some(b.max.z),
        ],
        None => [None; 6],
    }
}

fn point_cols(value: Option<&Point3>) -> [Option<f64>; 3] {
    match value {
        Some(p) => [Some(p.x), Some(p.y), Some(p.z)],
        None => [None; 3],
    }
}

fn corner_cols(value: Option<&[Point3; 4]>) -> [Option<f64>; 12] {
    let mut out = [None; 12];
    if let Some(corners) = value {
        for (index, corner) in corners.iter().enumerate() {
            out[index * 3] = Some(corner.x);
            out[index * 3 + 1] = Some(corner.y);
            out[index * 3 + 2] = Some(corner.z);
        }
    }
    out
}

/// Insert a single zone row; used by the per-row diagnostic path and
/// tests. The bulk engine inserts through its staging table instead.
pub fn insert_zone(
    conn: &Connection,
    combo_id: i64,
    identity: &ZoneIdentity,
    candidate: &ZoneCandidate,
    now: i64,
) -> ClashResult<i64> {
    candidate.validate()?;

    let bb = aabb_cols(candidate.bounding_box.as_ref());
    let rbb = aabb_cols(candidate.rotated_box.as_ref());
    let corners = corner_cols(candidate.corners.as_ref());
    let orientation = point_cols(candidate.orientation.as_ref());
    let rotation = candidate.rotation.as_ref();
    let source_json = candidate.source_params.to_json()?;
    let host_json = candidate.host_params.to_json()?;

    conn.execute(
        "INSERT INTO clash_zones (\
            identity_guid, combo_id, source_element_id, host_element_id, \
            intersection_x, intersection_y, intersection_z, \
            bb_min_x, bb_min_y, bb_min_z, bb_max_x, bb_max_y, bb_max_z, \
            rbb_min_x, rbb_min_y, rbb_min_z, rbb_max_x, rbb_max_y, rbb_max_z, \
            corner0_x, corner0_y, corner0_z, corner1_x, corner1_y, corner1_z, \
            corner2_x, corner2_y, corner2_z, corner3_x, corner3_y, corner3_z, \
            orientation_x, orientation_y, orientation_z, \
            rotation_rad, rotation_deg, rotation_sin, rotation_cos, \
            is_clustered, marked_for_cluster_process, is_current_in_scope, ready_for_placement, \
            host_thickness, width, height, diameter, \
            source_params_json, host_params_json, created_at, updated_at\
         ) VALUES (\
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, \
            ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34, \
            ?35, ?36, ?37, ?38, ?39, ?40, 1, 1, ?41, ?42, ?43, ?44, ?45, ?46, ?47, ?47\
         );",
        params![
            identity.to_string(),
            combo_id,
            candidate.source_element_id,
            candidate.host_element_id,
            candidate.intersection.x,
            candidate.intersection.y,
            candidate.intersection.z,
            bb[0], bb[1], bb[2], bb[3], bb[4], bb[5],
            rbb[0], rbb[1], rbb[2], rbb[3], rbb[4], rbb[5],
            corners[0], corners[1], corners[2], corners[3], corners[4], corners[5],
            corners[6], corners[7], corners[8], corners[9], corners[10], corners[11],
            orientation[0], orientation[1], orientation[2],
            rotation.map(|r| r.radians),
            rotation.map(|r| r.degrees),
            rotation.map(|r| r.sin),
            rotation.map(|r| r.cos),
            candidate.clustered as i64,
            candidate.marked_for_cluster_process as i64,
            candidate.host_thickness,
            candidate.width,
            candidate.height,
            candidate.diameter,
            source_json,
            host_json,
            now,
        ],
    )
    .map_err(|error| {
        // A pair-key violation here means the caller skipped the dedup
        // resolver; surfaced instead of wrapped so it stays diagnosable.
        if error.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
            ClashError::IntegrityConflict {
                entity: "clash_zones",
                key: format!(
                    "combo {combo_id}, source {}, host {}",
                    candidate.source_element_id, candidate.host_element_id
                ),
            }
        } else {
            ClashError::storage(error)
        }
    })?;

    Ok(conn.last_insert_rowid())
}

/// Overwrite a matched row's geometry and parameter bags from a
/// re-detection. Identity and resolution flags are untouched: identity is
/// immutable once assigned, and resolution transitions go through the
/// state machine.
pub fn update_zone_from_candidate(
    conn: &Connection,
    zone_id: i64,
    candidate: &ZoneCandidate,
    now: i64,
) -> ClashResult<usize> {
    candidate.validate()?;

    let bb = aabb_cols(candidate.bounding_box.as_ref());
    let rbb = aabb_cols(candidate.rotated_box.as_ref());
    let corners = corner_cols(candidate.corners.as_ref());
    let orientation = point_cols(candidate.orientation.as_ref());
    let rotation = candidate.rotation.as_ref();
    let source_json = candidate.source_params.to_json()?;
    let host_json = candidate.host_params.to_json()?;

    conn.execute(
        "UPDATE clash_zones SET \
            intersection_x = ?2, intersection_y = ?3, intersection_z = ?4, \
            bb_min_x = ?5, bb_min_y = ?6, bb_min_z = ?7, \
            bb_max_x = ?8, bb_max_y = ?9, bb_max_z = ?10, \
            rbb_min_x = ?11, rbb_min_y = ?12, rbb_min_z = ?13, \
            rbb_max_x = ?14, rbb_max_y = ?15, rbb_max_z = ?16, \
            corner0_x = ?17, corner0_y = ?18, corner0_z = ?19, \
            corner1_x = ?20, corner1_y = ?21, corner1_z = ?22, \
            corner2_x = ?23, corner2_y = ?24, corner2_z = ?25, \
            corner3_x = ?26, corner3_y = ?27, corner3_z = ?28, \
            orientation_x = ?29, orientation_y = ?30, orientation_z = ?31, \
            rotation_rad = ?32, rotation_deg = ?33, rotation_sin = ?34, rotation_cos = ?35, \
            is_clustered = ?36, marked_for_cluster_process = ?37, \
            host_thickness = ?38, width = ?39, height = ?40, diameter = ?41, \
            source_params_json = ?42, host_params_json = ?43, updated_at = ?44 \
         WHERE id = ?1;",
        params![
            zone_id,
            candidate.intersection.x,
            candidate.intersection.y,
            candidate.intersection.z,
            bb[0], bb[1], bb[2], bb[3], bb[4], bb[5],
            rbb[0], rbb[1], rbb[2], rbb[3], rbb[4], rbb[5],
            corners[0], corners[1], corners[2], corners[3], corners[4], corners[5],
            corners[6], corners[7], corners[8], corners[9], corners[10], corners[11],
            orientation[0], orientation[1], orientation[2],
            rotation.map(|r| r.radians),
            rotation.map(|r| r.degrees),
            rotation.map(|r| r.sin),
            rotation.map(|r| r.cos),
            candidate.clustered as i64,
            candidate.marked_for_cluster_process as i64,
            candidate.host_thickness,
            candidate.width,
            candidate.height,
            candidate.diameter,
            source_json,
            host_json,
            now,
        ],
    )
    .map_err(ClashError::storage)
}

pub fn zone_by_id(conn: &Connection, zone_id: i64) -> ClashResult<Option<ClashZone>> {
    conn.query_row(
        &format!("SELECT {ZONE_COLUMNS} FROM clash_zones z WHERE z.id = ?1;"),
        params![zone_id],
        zone_from_row,
    )
    .optional()
    .map_err(ClashError::storage)
}

pub fn zone_by_identity(
    conn: &Connection,
    identity: &ZoneIdentity,
) -> ClashResult<Option<ClashZone>> {
    conn.query_row(
        &format!("SELECT {ZONE_COLUMNS} FROM clash_zones z WHERE z.identity_guid = ?1;"),
        params![identity.to_string()],
        zone_from_row,
    )
    .optional()
    .map_err(ClashError::storage)
}

pub fn count_zones(conn: &Connection) -> ClashResult<i64> {
    conn.query_row("SELECT COUNT(*) FROM clash_zones;", [], |row| row.get(0))
        .map_err(ClashError::storage)
}

pub(crate) fn ensure_non_empty(value: &str, field: &'static str) -> ClashResult<()> {
    if value.trim().is_empty() {
        return Err(ClashError::validation(field, "must not be empty"));
    }
    Ok(())
}

pub(crate) fn unix_timestamp_ms() -> ClashResult<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(ClashError::storage)?;
    i64::try_from(duration.as_millis()).map_err(|error| {
        ClashError::storage(std::io::Error::other(format!(
            "unix timestamp milliseconds overflow i64: {error}"
        )))
    })
}

#[cfg(test)]
mod tests {
    use clashstore_core::{Aabb, ParamBag, Point3, Rotation};

    use crate::connection::Storage;
    use crate::identity::ZoneIdentity;

    use super::{
        combo_by_id, count_zones, ensure_combo, ensure_filter, get_filter, insert_zone,
        update_zone_from_candidate, zone_by_id, zone_by_identity, ZoneCandidate,
    };

    fn open_store() -> Storage {
        Storage::open_in_memory().expect("in-memory storage should open")
    }

    fn full_candidate() -> ZoneCandidate {
        let mut candidate = ZoneCandidate::new(
            "src-10",
            "host-20",
            "doc-a.rvt",
            "doc-b.rvt",
            Point3::new(1.0, 2.0, 3.0),
        );
        candidate.bounding_box = Some(Aabb::new(
            Point3::new(0.0, 1.0, 2.0),
            Point3::new(2.0, 3.0, 4.0),
        ));
        candidate.rotated_box = Some(Aabb::new(
            Point3::new(0.1, 1.1, 2.1),
            Point3::new(1.9, 2.9, 3.9),
        ));
        candidate.corners = Some([
            Point3::new(0.0, 1.0, 2.0),
            Point3::new(2.0, 1.0, 2.0),
            Point3::new(2.0, 3.0, 2.0),
            Point3::new(0.0, 3.0, 2.0),
        ]);
        candidate.orientation = Some(Point3::new(0.0, 0.0, 1.0));
        candidate.rotation = Some(Rotation::from_radians(0.5));
        candidate.host_thickness = Some(0.3);
        candidate.width = Some(0.5);
        candidate.height = Some(0.25);
        candidate.source_params.insert("System Type", "Supply Air");
        candidate.host_params.insert("Fire Rating", "2h");
        candidate
    }

    fn setup_combo(conn: &rusqlite::Connection) -> i64 {
        let filter_id = ensure_filter(conn, "coord-a", "Ducts", &["Walls".to_owned()], 1_000)
            .expect("filter should be created");
        ensure_combo(
            conn,
            filter_id,
            "Ducts",
            &["Walls".to_owned()],
            "doc-a.rvt",
            "doc-b.rvt",
            1_000,
        )
        .expect("combo should be created")
    }

    #[test]
    fn zone_round_trips_all_geometry() {
        let storage = open_store();
        let conn = storage.connection();
        let combo_id = setup_combo(conn);
        let candidate = full_candidate();
        let identity = ZoneIdentity::derive("src-10", "host-20", &candidate.intersection);

        let zone_id = insert_zone(conn, combo_id, &identity, &candidate, 2_000)
            .expect("insert should succeed");

        let zone = zone_by_id(conn, zone_id)
            .expect("fetch should succeed")
            .expect("zone should exist");
        assert_eq!(zone.identity, Some(identity));
        assert_eq!(zone.source_element_id, "src-10");
        assert_eq!(zone.intersection, Some(Point3::new(1.0, 2.0, 3.0)));
        assert_eq!(zone.bounding_box, candidate.bounding_box);
        assert_eq!(zone.rotated_box, candidate.rotated_box);
        assert_eq!(zone.corners, candidate.corners);
        assert_eq!(zone.orientation, candidate.orientation);
        assert_eq!(zone.rotation, candidate.rotation);
        assert_eq!(zone.source_params.get("system type"), Some("Supply Air"));
        assert_eq!(zone.host_params.get("fire rating"), Some("2h"));
        assert!(zone.flags.current_in_scope);
        assert!(zone.flags.ready_for_placement);
        assert!(!zone.flags.any_tier_resolved());
    }

    #[test]
    fn zone_by_identity_finds_inserted_row() {
        let storage = open_store();
        let conn = storage.connection();
        let combo_id = setup_combo(conn);
        let candidate = full_candidate();
        let identity = ZoneIdentity::derive("src-10", "host-20", &candidate.intersection);

        insert_zone(conn, combo_id, &identity, &candidate, 2_000).expect("insert should succeed");

        let zone = zone_by_identity(conn, &identity)
            .expect("lookup should succeed")
            .expect("zone should be found by identity");
        assert_eq!(zone.host_element_id, "host-20");
    }

    #[test]
    fn update_preserves_identity_and_flags() {
        let storage = open_store();
        let conn = storage.connection();
        let combo_id = setup_combo(conn);
        let candidate = full_candidate();
        let identity = ZoneIdentity::derive("src-10", "host-20", &candidate.intersection);
        let zone_id = insert_zone(conn, combo_id, &identity, &candidate, 2_000)
            .expect("insert should succeed");

        let mut updated = candidate;
        updated.intersection = Point3::new(1.5, 2.0, 3.0);
        updated.width = Some(0.75);
        updated.source_params = ParamBag::new();
        updated.source_params.insert("System Type", "Return Air");

        update_zone_from_candidate(conn, zone_id, &updated, 3_000)
            .expect("update should succeed");

        let zone = zone_by_id(conn, zone_id)
            .expect("fetch should succeed")
            .expect("zone should exist");
        assert_eq!(zone.identity, Some(identity), "identity is immutable");
        assert_eq!(zone.intersection, Some(Point3::new(1.5, 2.0, 3.0)));
        assert_eq!(zone.width, Some(0.75));
        assert_eq!(zone.source_params.get("system type"), Some("Return Air"));
        assert_eq!(zone.updated_at, 3_000);
        assert_eq!(zone.created_at, 2_000);
    }

    #[test]
    fn candidate_with_nan_intersection_is_rejected() {
        let candidate = ZoneCandidate::new(
            "src",
            "host",
            "doc-a",
            "doc-b",
            Point3::new(f64::NAN, 0.0, 0.0),
        );
        let err = candidate.validate().expect_err("NaN should be rejected");
        assert!(err.to_string().contains("intersection"));
    }

    #[test]
    fn candidate_with_empty_ids_is_rejected() {
        let candidate = ZoneCandidate::new("", "host", "doc-a", "doc-b", Point3::default());
        let err = candidate.validate().expect_err("empty id should be rejected");
        assert!(err.to_string().contains("source_element_id"));
    }

    #[test]
    fn candidate_with_non_finite_orientation_is_rejected() {
        let mut candidate =
            ZoneCandidate::new("src", "host", "doc-a", "doc-b", Point3::new(1.0, 2.0, 3.0));
        candidate.orientation = Some(Point3::new(0.0, f64::NAN, 1.0));
        let err = candidate
            .validate()
            .expect_err("NaN orientation should be rejected");
        assert!(err.to_string().contains("orientation"));
    }

    #[test]
    fn candidate_with_non_finite_box_is_rejected() {
        let mut candidate =
            ZoneCandidate::new("src", "host", "doc-a", "doc-b", Point3::new(1.0, 2.0, 3.0));
        candidate.bounding_box = Some(Aabb::new(
            Point3::new(f64::INFINITY, 0.0, 0.0),
            Point3::new(1.0, 1.0, 1.0),
        ));
        let err = candidate
            .validate()
            .expect_err("non-finite box should be rejected");
        assert!(err.to_string().contains("bounding_box"));
    }

    #[test]
    fn ensure_filter_is_lazy_and_idempotent() {
        let storage = open_store();
        let conn = storage.connection();

        let first = ensure_filter(conn, "coord-a", "Pipes", &["Walls".to_owned()], 1_000)
            .expect("first ensure should create");
        let second = ensure_filter(conn, "coord-a", "Pipes", &["Floors".to_owned()], 2_000)
            .expect("second ensure should reuse");
        assert_eq!(first, second);

        let filter = get_filter(conn, "coord-a", "Pipes")
            .expect("lookup should succeed")
            .expect("filter should exist");
        assert!(!filter.is_new, "reused filter should clear is_new");
        assert_eq!(filter.selected_host_categories, vec!["Floors".to_owned()]);
    }

    #[test]
    fn same_filter_name_different_category_is_distinct() {
        let storage = open_store();
        let conn = storage.connection();

        let ducts = ensure_filter(conn, "coord-a", "Ducts", &[], 1_000).expect("ducts filter");
        let pipes = ensure_filter(conn, "coord-a", "Pipes", &[], 1_000).expect("pipes filter");
        assert_ne!(ducts, pipes);
    }

    #[test]
    fn ensure_combo_unique_on_four_tuple() {
        let storage = open_store();
        let conn = storage.connection();
        let filter_id = ensure_filter(conn, "coord-a", "Ducts", &[], 1_000).expect("filter");

        let first = ensure_combo(conn, filter_id, "Ducts", &[], "a.rvt", "b.rvt", 1_000)
            .expect("first combo");
        let same = ensure_combo(conn, filter_id, "Ducts", &[], "a.rvt", "b.rvt", 2_000)
            .expect("same tuple should reuse");
        let other = ensure_combo(conn, filter_id, "Ducts", &[], "a.rvt", "c.rvt", 2_000)
            .expect("different host doc should create");
        assert_eq!(first, same);
        assert_ne!(first, other);

        let combo = combo_by_id(conn, first)
            .expect("lookup should succeed")
            .expect("combo should exist");
        assert!(!combo.is_new);
        assert_eq!(combo.source_doc_key, "a.rvt");
    }

    #[test]
    fn pair_uniqueness_is_enforced_by_schema() {
        let storage = open_store();
        let conn = storage.connection();
        let combo_id = setup_combo(conn);
        let candidate = full_candidate();

        let identity_a = ZoneIdentity::derive("src-10", "host-20", &Point3::new(1.0, 2.0, 3.0));
        insert_zone(conn, combo_id, &identity_a, &candidate, 1_000).expect("first insert");

        // Same pair under a different identity violates the collision key.
        let identity_b = ZoneIdentity::derive("src-10", "host-20", &Point3::new(9.0, 9.0, 9.0));
        let err = insert_zone(conn, combo_id, &identity_b, &candidate, 2_000)
            .expect_err("duplicate pair should violate uniqueness");
        assert!(
            matches!(err, clashstore_core::ClashError::IntegrityConflict { .. }),
            "constraint violation surfaces as an integrity conflict: {err}"
        );
        assert!(err.to_string().contains("src-10"));
        assert_eq!(count_zones(conn).expect("count"), 1);
    }
}
