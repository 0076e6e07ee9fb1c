//! The flat spatial index over zone boxes.
//!
//! One row per indexed zone in `zone_spatial_index`, holding the axis
//! aligned box used for overlap queries. The indexed box is the zone's
//! placed bounding box when it is finite and non-degenerate; otherwise a
//! small cube around the intersection point so point-only zones remain
//! queryable. Zones without any usable geometry are simply absent from
//! the index and box queries fall back to scanning them separately.
//! Once a zone is resolved, the host's `GeometryProvider` can re-index it
//! under the placed object's actual box.

use std::collections::BTreeMap;

use clashstore_core::{Aabb, ClashError, ClashResult, GeometryProvider, Point3};
use rusqlite::{params, Connection, OptionalExtension};

use crate::connection::Storage;

/// The box a zone should be indexed under, or `None` when the zone has no
/// usable geometry at all.
#[must_use]
pub fn index_box(
    bounding_box: Option<&Aabb>,
    intersection: Option<&Point3>,
    fallback_tolerance: f64,
) -> Option<Aabb> {
    if let Some(bb) = bounding_box {
        if bb.is_finite() && !bb.is_degenerate() {
            return Some(*bb);
        }
    }
    intersection
        .filter(|point| point.is_finite())
        .map(|point| Aabb::around_point(*point, fallback_tolerance))
}

/// Insert or replace one zone's index entry.
pub fn refresh_entry(conn: &Connection, zone_id: i64, aabb: &Aabb) -> ClashResult<()> {
    conn.execute(
        "INSERT INTO zone_spatial_index (zone_id, min_x, min_y, min_z, max_x, max_y, max_z) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(zone_id) DO UPDATE SET \
            min_x = excluded.min_x, min_y = excluded.min_y, min_z = excluded.min_z, \
            max_x = excluded.max_x, max_y = excluded.max_y, max_z = excluded.max_z;",
        params![
            zone_id, aabb.min.x, aabb.min.y, aabb.min.z, aabb.max.x, aabb.max.y, aabb.max.z
        ],
    )
    .map_err(ClashError::storage)?;
    Ok(())
}

pub fn remove_entry(conn: &Connection, zone_id: i64) -> ClashResult<usize> {
    conn.execute(
        "DELETE FROM zone_spatial_index WHERE zone_id = ?1;",
        params![zone_id],
    )
    .map_err(ClashError::storage)
}

pub fn entry(conn: &Connection, zone_id: i64) -> ClashResult<Option<Aabb>> {
    conn.query_row(
        "SELECT min_x, min_y, min_z, max_x, max_y, max_z \
         FROM zone_spatial_index WHERE zone_id = ?1;",
        params![zone_id],
        |row| {
            Ok(Aabb::new(
                Point3::new(row.get(0)?, row.get(1)?, row.get(2)?),
                Point3::new(row.get(3)?, row.get(4)?, row.get(5)?),
            ))
        },
    )
    .optional()
    .map_err(ClashError::storage)
}

/// Zone ids whose indexed box intersects `query`, touching counts.
pub fn zone_ids_in_box(conn: &Connection, query: &Aabb) -> ClashResult<Vec<i64>> {
    let mut statement = conn
        .prepare(
            "SELECT zone_id FROM zone_spatial_index \
             WHERE min_x <= ?4 AND max_x >= ?1 \
               AND min_y <= ?5 AND max_y >= ?2 \
               AND min_z <= ?6 AND max_z >= ?3 \
             ORDER BY zone_id;",
        )
        .map_err(ClashError::storage)?;
    let rows = statement
        .query_map(
            params![
                query.min.x,
                query.min.y,
                query.min.z,
                query.max.x,
                query.max.y,
                query.max.z
            ],
            |row| row.get(0),
        )
        .map_err(ClashError::storage)?;
    rows.collect::<Result<Vec<i64>, _>>()
        .map_err(ClashError::storage)
}

pub fn count_entries(conn: &Connection) -> ClashResult<i64> {
    conn.query_row("SELECT COUNT(*) FROM zone_spatial_index;", [], |row| {
        row.get(0)
    })
    .map_err(ClashError::storage)
}

/// Drop and re-derive every index entry from the zone table.
pub fn rebuild(conn: &Connection, fallback_tolerance: f64) -> ClashResult<usize> {
    conn.execute("DELETE FROM zone_spatial_index;", [])
        .map_err(ClashError::storage)?;

    let mut statement = conn
        .prepare(
            "SELECT id, bb_min_x, bb_min_y, bb_min_z, bb_max_x, bb_max_y, bb_max_z, \
                    intersection_x, intersection_y, intersection_z \
             FROM clash_zones;",
        )
        .map_err(ClashError::storage)?;
    let rows = statement
        .query_map([], |row| {
            let id: i64 = row.get(0)?;
            let bb = match (
                row.get::<_, Option<f64>>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, Option<f64>>(5)?,
                row.get::<_, Option<f64>>(6)?,
            ) {
                (Some(ax), Some(ay), Some(az), Some(bx), Some(by), Some(bz)) => Some(Aabb::new(
                    Point3::new(ax, ay, az),
                    Point3::new(bx, by, bz),
                )),
                _ => None,
            };
            let point = match (
                row.get::<_, Option<f64>>(7)?,
                row.get::<_, Option<f64>>(8)?,
                row.get::<_, Option<f64>>(9)?,
            ) {
                (Some(x), Some(y), Some(z)) => Some(Point3::new(x, y, z)),
                _ => None,
            };
            Ok((id, bb, point))
        })
        .map_err(ClashError::storage)?;

    let mut indexed = 0_usize;
    for row in rows {
        let (zone_id, bb, point) = row.map_err(ClashError::storage)?;
        if let Some(aabb) = index_box(bb.as_ref(), point.as_ref(), fallback_tolerance) {
            refresh_entry(conn, zone_id, &aabb)?;
            indexed += 1;
        }
    }
    Ok(indexed)
}

/// Re-index resolved zones under their placed object's box.
///
/// Once a sleeve is placed, the host's box for it supersedes the
/// detection-time geometry. A handle whose lookup fails, or whose box is
/// missing, non-finite, or degenerate, keeps its existing entries.
pub fn refresh_placed(conn: &Connection, geometry: &dyn GeometryProvider) -> ClashResult<usize> {
    let mut statement = conn
        .prepare(
            "SELECT id, \
                    CASE \
                        WHEN is_combined_resolved = 1 THEN combined_object_id \
                        WHEN is_cluster_resolved = 1 THEN cluster_object_id \
                        WHEN is_individually_resolved = 1 THEN individual_object_id \
                    END \
             FROM clash_zones \
             WHERE is_combined_resolved = 1 OR is_cluster_resolved = 1 \
                OR is_individually_resolved = 1;",
        )
        .map_err(ClashError::storage)?;
    let rows = statement
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
        })
        .map_err(ClashError::storage)?;

    let mut by_handle: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for row in rows {
        let (zone_id, handle) = row.map_err(ClashError::storage)?;
        if let Some(handle) = handle {
            by_handle.entry(handle).or_default().push(zone_id);
        }
    }

    let mut refreshed = 0_usize;
    for (handle, zone_ids) in by_handle {
        let placed = match geometry.placed_bounding_box(&handle) {
            Ok(found) => found,
            Err(error) => {
                tracing::warn!(
                    target: "clashstore.storage",
                    op = "refresh_placed",
                    handle = %handle,
                    ?error,
                    "placed-box lookup failed; keeping existing index entries"
                );
                continue;
            }
        };
        let Some(aabb) = placed.filter(|bb| bb.is_finite() && !bb.is_degenerate()) else {
            continue;
        };
        for zone_id in zone_ids {
            refresh_entry(conn, zone_id, &aabb)?;
            refreshed += 1;
        }
    }
    Ok(refreshed)
}

impl Storage {
    /// Re-index every resolved zone under its placed object's box in one
    /// transaction.
    pub fn refresh_placed_geometry(&self, geometry: &dyn GeometryProvider) -> ClashResult<usize> {
        let refreshed = self.transaction(|conn| refresh_placed(conn, geometry))?;
        self.metrics().record_spatial_refresh(refreshed as u64);
        tracing::debug!(
            target: "clashstore.storage",
            op = "refresh_placed_geometry",
            refreshed,
            "placed-object boxes re-indexed"
        );
        Ok(refreshed)
    }

    /// Rebuild the whole spatial index in one transaction.
    pub fn rebuild_spatial_index(&self) -> ClashResult<usize> {
        let fallback = self.config().fallback_box_tolerance;
        let indexed = self.transaction(|conn| rebuild(conn, fallback))?;
        self.metrics().record_spatial_refresh(indexed as u64);
        tracing::debug!(
            target: "clashstore.storage",
            op = "rebuild_spatial_index",
            indexed,
            "spatial index rebuilt"
        );
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use clashstore_core::{Aabb, ClashError, ClashResult, GeometryProvider, Point3};

    use crate::connection::Storage;
    use crate::identity::ZoneIdentity;
    use crate::zone::{ensure_combo, ensure_filter, insert_zone, ZoneCandidate};

    use super::{
        count_entries, entry, index_box, refresh_entry, remove_entry, zone_ids_in_box,
    };

    fn aabb(min: (f64, f64, f64), max: (f64, f64, f64)) -> Aabb {
        Aabb::new(
            Point3::new(min.0, min.1, min.2),
            Point3::new(max.0, max.1, max.2),
        )
    }

    #[test]
    fn index_box_prefers_valid_bounding_box() {
        let bb = aabb((0.0, 0.0, 0.0), (1.0, 1.0, 1.0));
        let point = Point3::new(0.5, 0.5, 0.5);
        assert_eq!(index_box(Some(&bb), Some(&point), 0.5), Some(bb));
    }

    #[test]
    fn index_box_falls_back_to_point_cube_for_degenerate_box() {
        let flat = aabb((0.0, 0.0, 0.0), (1.0, 1.0, 0.0));
        let point = Point3::new(2.0, 3.0, 4.0);
        let fallback = index_box(Some(&flat), Some(&point), 0.5).expect("fallback box");
        assert_eq!(fallback, Aabb::around_point(point, 0.5));
    }

    #[test]
    fn index_box_is_none_without_usable_geometry() {
        assert_eq!(index_box(None, None, 0.5), None);
        let nan_point = Point3::new(f64::NAN, 0.0, 0.0);
        assert_eq!(index_box(None, Some(&nan_point), 0.5), None);
    }

    fn seeded_zone(storage: &Storage, source: &str, point: Point3) -> i64 {
        let conn = storage.connection();
        let filter_id = ensure_filter(conn, "coord", "Ducts", &[], 1_000).expect("filter");
        let combo_id =
            ensure_combo(conn, filter_id, "Ducts", &[], "a.rvt", "b.rvt", 1_000).expect("combo");
        let candidate = ZoneCandidate::new(source, "host-1", "a.rvt", "b.rvt", point);
        let identity = ZoneIdentity::derive(source, "host-1", &point);
        insert_zone(conn, combo_id, &identity, &candidate, 1_000).expect("insert")
    }

    #[test]
    fn refresh_entry_upserts() {
        let storage = Storage::open_in_memory().expect("storage");
        let conn = storage.connection();
        let zone_id = seeded_zone(&storage, "src-1", Point3::new(1.0, 1.0, 1.0));

        let first = aabb((0.0, 0.0, 0.0), (1.0, 1.0, 1.0));
        refresh_entry(conn, zone_id, &first).expect("first refresh");
        assert_eq!(entry(conn, zone_id).expect("entry"), Some(first));

        let second = aabb((5.0, 5.0, 5.0), (6.0, 6.0, 6.0));
        refresh_entry(conn, zone_id, &second).expect("second refresh");
        assert_eq!(entry(conn, zone_id).expect("entry"), Some(second));
        assert_eq!(count_entries(conn).expect("count"), 1);
    }

    #[test]
    fn box_query_returns_overlapping_zones_only() {
        let storage = Storage::open_in_memory().expect("storage");
        let conn = storage.connection();

        let near = seeded_zone(&storage, "src-near", Point3::new(1.0, 1.0, 1.0));
        let far = seeded_zone(&storage, "src-far", Point3::new(100.0, 0.0, 0.0));
        refresh_entry(conn, near, &aabb((0.0, 0.0, 0.0), (2.0, 2.0, 2.0))).expect("near entry");
        refresh_entry(conn, far, &aabb((99.0, -1.0, -1.0), (101.0, 1.0, 1.0))).expect("far entry");

        let hits = zone_ids_in_box(conn, &aabb((1.0, 1.0, 1.0), (3.0, 3.0, 3.0)))
            .expect("query should succeed");
        assert_eq!(hits, vec![near]);

        let touching = zone_ids_in_box(conn, &aabb((2.0, 2.0, 2.0), (3.0, 3.0, 3.0)))
            .expect("query should succeed");
        assert_eq!(touching, vec![near], "face contact counts as overlap");
    }

    #[test]
    fn rebuild_reindexes_every_zone_with_geometry() {
        let storage = Storage::open_in_memory().expect("storage");

        seeded_zone(&storage, "src-1", Point3::new(1.0, 1.0, 1.0));
        seeded_zone(&storage, "src-2", Point3::new(2.0, 2.0, 2.0));
        assert_eq!(count_entries(storage.connection()).expect("count"), 0);

        let indexed = storage.rebuild_spatial_index().expect("rebuild");
        assert_eq!(indexed, 2);
        assert_eq!(count_entries(storage.connection()).expect("count"), 2);
        assert_eq!(storage.metrics_snapshot().spatial_refreshes, 2);
    }

    struct PlacedBoxes(HashMap<String, Aabb>);

    impl GeometryProvider for PlacedBoxes {
        fn placed_bounding_box(&self, handle: &str) -> ClashResult<Option<Aabb>> {
            Ok(self.0.get(handle).copied())
        }
    }

    struct BrokenProvider;

    impl GeometryProvider for BrokenProvider {
        fn placed_bounding_box(&self, _handle: &str) -> ClashResult<Option<Aabb>> {
            Err(ClashError::validation("geometry", "host offline"))
        }
    }

    #[test]
    fn placed_box_supersedes_detection_geometry() {
        let storage = Storage::open_in_memory().expect("storage");
        let point = Point3::new(1.0, 1.0, 1.0);
        let resolved = seeded_zone(&storage, "src-1", point);
        let unresolved = seeded_zone(&storage, "src-2", Point3::new(5.0, 5.0, 5.0));
        storage.rebuild_spatial_index().expect("rebuild");

        let identity = ZoneIdentity::derive("src-1", "host-1", &point);
        storage
            .resolve_individually(&[identity], "sleeve-1")
            .expect("resolve");

        let placed = aabb((10.0, 10.0, 10.0), (12.0, 12.0, 12.0));
        let provider = PlacedBoxes(HashMap::from([("sleeve-1".to_owned(), placed)]));
        let refreshed = storage
            .refresh_placed_geometry(&provider)
            .expect("placed refresh");
        assert_eq!(refreshed, 1);

        let conn = storage.connection();
        assert_eq!(entry(conn, resolved).expect("entry"), Some(placed));
        let fallback = Aabb::around_point(Point3::new(5.0, 5.0, 5.0), 0.5);
        assert_eq!(
            entry(conn, unresolved).expect("entry"),
            Some(fallback),
            "unresolved zones keep their detection geometry"
        );
    }

    #[test]
    fn provider_failure_keeps_existing_entries() {
        let storage = Storage::open_in_memory().expect("storage");
        let point = Point3::new(1.0, 1.0, 1.0);
        let zone_id = seeded_zone(&storage, "src-1", point);
        storage.rebuild_spatial_index().expect("rebuild");
        let before = entry(storage.connection(), zone_id).expect("entry");

        let identity = ZoneIdentity::derive("src-1", "host-1", &point);
        storage
            .resolve_individually(&[identity], "sleeve-1")
            .expect("resolve");

        let refreshed = storage
            .refresh_placed_geometry(&BrokenProvider)
            .expect("failed lookups never fail the refresh");
        assert_eq!(refreshed, 0);
        assert_eq!(entry(storage.connection(), zone_id).expect("entry"), before);
    }

    #[test]
    fn remove_entry_deletes_one_row() {
        let storage = Storage::open_in_memory().expect("storage");
        let conn = storage.connection();
        let zone_id = seeded_zone(&storage, "src-1", Point3::new(1.0, 1.0, 1.0));
        refresh_entry(conn, zone_id, &aabb((0.0, 0.0, 0.0), (1.0, 1.0, 1.0))).expect("entry");

        assert_eq!(remove_entry(conn, zone_id).expect("remove"), 1);
        assert_eq!(entry(conn, zone_id).expect("entry"), None);
    }

    #[test]
    fn deleting_zone_cascades_into_index() {
        let storage = Storage::open_in_memory().expect("storage");
        let conn = storage.connection();
        let zone_id = seeded_zone(&storage, "src-1", Point3::new(1.0, 1.0, 1.0));
        refresh_entry(conn, zone_id, &aabb((0.0, 0.0, 0.0), (1.0, 1.0, 1.0))).expect("entry");

        conn.execute("DELETE FROM clash_zones WHERE id = ?1;", [zone_id])
            .expect("zone delete");
        assert_eq!(count_entries(conn).expect("count"), 0);
    }
}
