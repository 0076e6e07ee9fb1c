//! Read-side queries over zones.
//!
//! All reads go straight to the connection; none of these mutate except
//! where documented (parameter transfer refreshes nothing, it only fills
//! the returned values).

use clashstore_core::{Aabb, ClashError, ClashResult};
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use crate::connection::Storage;
use crate::identity::ZoneIdentity;
use crate::snapshot::{
    snapshot_by_cluster_handle, snapshot_by_identity, snapshot_by_individual_handle,
};
use crate::spatial;
use crate::zone::{zone_from_row, ClashZone, ZONE_COLUMNS};

/// How a box query treats zones missing from the spatial index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxQueryMode {
    /// Only zones with an index entry; fastest, may miss never-indexed
    /// zones.
    IndexedOnly,
    /// Additionally scan un-indexed zones and test their geometry
    /// directly.
    IncludeUnindexed,
}

pub fn zones_for_filter(
    conn: &Connection,
    filter_name: &str,
    category: &str,
) -> ClashResult<Vec<ClashZone>> {
    let sql = format!(
        "SELECT {ZONE_COLUMNS} FROM clash_zones z \
         JOIN file_combos c ON c.id = z.combo_id \
         JOIN filters f ON f.id = c.filter_id \
         WHERE f.name = ?1 AND f.category = ?2 \
         ORDER BY z.id;"
    );
    let mut statement = conn.prepare(&sql).map_err(ClashError::storage)?;
    let rows = statement
        .query_map(params![filter_name, category], zone_from_row)
        .map_err(ClashError::storage)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(ClashError::storage)
}

pub fn zones_for_category(conn: &Connection, category: &str) -> ClashResult<Vec<ClashZone>> {
    let sql = format!(
        "SELECT {ZONE_COLUMNS} FROM clash_zones z \
         JOIN file_combos c ON c.id = z.combo_id \
         WHERE c.category = ?1 \
         ORDER BY z.id;"
    );
    let mut statement = conn.prepare(&sql).map_err(ClashError::storage)?;
    let rows = statement
        .query_map(params![category], zone_from_row)
        .map_err(ClashError::storage)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(ClashError::storage)
}

/// Zones for the given identities, in storage order. Unknown identities
/// are silently absent from the result.
pub fn zones_by_identities(
    conn: &Connection,
    identities: &[ZoneIdentity],
) -> ClashResult<Vec<ClashZone>> {
    if identities.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; identities.len()].join(",");
    let sql = format!(
        "SELECT {ZONE_COLUMNS} FROM clash_zones z \
         WHERE z.identity_guid IN ({placeholders}) ORDER BY z.id;"
    );
    let mut statement = conn.prepare(&sql).map_err(ClashError::storage)?;
    let texts: Vec<String> = identities.iter().map(ToString::to_string).collect();
    let rows = statement
        .query_map(params_from_iter(texts), zone_from_row)
        .map_err(ClashError::storage)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(ClashError::storage)
}

/// Zones whose effective box intersects `query`.
pub fn zones_in_box(
    conn: &Connection,
    query: &Aabb,
    mode: BoxQueryMode,
    fallback_tolerance: f64,
) -> ClashResult<Vec<ClashZone>> {
    let sql = format!(
        "SELECT {ZONE_COLUMNS} FROM clash_zones z \
         JOIN zone_spatial_index si ON si.zone_id = z.id \
         WHERE si.min_x <= ?4 AND si.max_x >= ?1 \
           AND si.min_y <= ?5 AND si.max_y >= ?2 \
           AND si.min_z <= ?6 AND si.max_z >= ?3 \
         ORDER BY z.id;"
    );
    let mut statement = conn.prepare(&sql).map_err(ClashError::storage)?;
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
            zone_from_row,
        )
        .map_err(ClashError::storage)?;
    let mut zones = rows
        .collect::<Result<Vec<_>, _>>()
        .map_err(ClashError::storage)?;

    if mode == BoxQueryMode::IncludeUnindexed {
        // Zones the index never saw get their geometry tested directly.
        let sql = format!(
            "SELECT {ZONE_COLUMNS} FROM clash_zones z \
             LEFT JOIN zone_spatial_index si ON si.zone_id = z.id \
             WHERE si.zone_id IS NULL ORDER BY z.id;"
        );
        let mut statement = conn.prepare(&sql).map_err(ClashError::storage)?;
        let rows = statement
            .query_map([], zone_from_row)
            .map_err(ClashError::storage)?;
        for row in rows {
            let zone = row.map_err(ClashError::storage)?;
            let effective = spatial::index_box(
                zone.bounding_box.as_ref(),
                zone.intersection.as_ref(),
                fallback_tolerance,
            );
            if effective.is_some_and(|aabb| aabb.intersects(query)) {
                zones.push(zone);
            }
        }
        zones.sort_by_key(|zone| zone.id);
    }
    Ok(zones)
}

impl Storage {
    pub fn zones_for_filter(
        &self,
        filter_name: &str,
        category: &str,
    ) -> ClashResult<Vec<ClashZone>> {
        zones_for_filter(self.connection(), filter_name, category)
    }

    pub fn zones_for_category(&self, category: &str) -> ClashResult<Vec<ClashZone>> {
        zones_for_category(self.connection(), category)
    }

    pub fn zones_by_identities(
        &self,
        identities: &[ZoneIdentity],
    ) -> ClashResult<Vec<ClashZone>> {
        zones_by_identities(self.connection(), identities)
    }

    pub fn zones_in_box(&self, query: &Aabb, mode: BoxQueryMode) -> ClashResult<Vec<ClashZone>> {
        zones_in_box(
            self.connection(),
            query,
            mode,
            self.config().fallback_box_tolerance,
        )
    }

    /// Zones of a filter with their empty parameter bags filled from the
    /// matching sleeve snapshot, for pushing parameters back onto placed
    /// objects. Snapshot lookup priority: zone identity, then individual
    /// handle, then cluster handle. Zones stay untouched in storage.
    pub fn zones_for_parameter_transfer(
        &self,
        filter_name: &str,
        category: &str,
    ) -> ClashResult<Vec<ClashZone>> {
        let conn = self.connection();
        let mut zones = zones_for_filter(conn, filter_name, category)?;
        for zone in &mut zones {
            if !zone.source_params.is_empty() && !zone.host_params.is_empty() {
                continue;
            }
            let snapshot = match zone.identity {
                Some(identity) => snapshot_by_identity(conn, &identity)?,
                None => None,
            };
            let snapshot = match snapshot {
                Some(found) => Some(found),
                None => match &zone.individual_object_id {
                    Some(handle) => snapshot_by_individual_handle(conn, handle)?,
                    None => None,
                },
            };
            let snapshot = match snapshot {
                Some(found) => Some(found),
                None => match &zone.cluster_object_id {
                    Some(handle) => snapshot_by_cluster_handle(conn, handle)?,
                    None => None,
                },
            };
            if let Some(snapshot) = snapshot {
                zone.source_params.merge_absent(&snapshot.source_params);
                zone.host_params.merge_absent(&snapshot.host_params);
            }
        }
        Ok(zones)
    }
}
