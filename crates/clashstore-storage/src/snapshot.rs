//! Derived sleeve snapshots.
//!
//! A snapshot is the read model consumed by annotation and parameter
//! transfer: one row per placed object (individual sleeve or cluster
//! sleeve) aggregating the element ids, document keys, and parameter bags
//! of every zone the object covers. Snapshots are re-derived from the
//! zone table on demand and upserted, so they are always reproducible.
//!
//! Merge rules: ordinary keys union their distinct values across zones;
//! size-like keys concatenate every value in zone order, repeats included,
//! so a cluster sleeve through three ducts reads one size per constituent:
//! "200x100, 150x100, 200x100".

use clashstore_core::{ClashError, ClashResult, ParamBag};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::connection::Storage;
use crate::identity::ZoneIdentity;
use crate::zone::{ensure_non_empty, unix_timestamp_ms, zone_from_row, ClashZone, ZONE_COLUMNS};

/// Keys treated as size-like during aggregation, compared
/// case-insensitively against the whole key.
pub const SIZE_KEY_ALIASES: &[&str] = &["size", "dimensions", "width x height", "diameter", "dn"];

/// Whether a parameter key carries a size-like value.
#[must_use]
pub fn is_size_key(key: &str) -> bool {
    SIZE_KEY_ALIASES
        .iter()
        .any(|alias| key.eq_ignore_ascii_case(alias))
}

/// Which kind of placed object a snapshot describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotSource {
    Individual,
    Cluster,
}

impl SnapshotSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Cluster => "cluster",
        }
    }

    #[must_use]
    pub fn from_str(text: &str) -> Option<Self> {
        match text {
            "individual" => Some(Self::Individual),
            "cluster" => Some(Self::Cluster),
            _ => None,
        }
    }
}

/// One aggregated sleeve record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleeveSnapshot {
    pub id: i64,
    pub identity: Option<ZoneIdentity>,
    pub individual_object_id: Option<String>,
    pub cluster_object_id: Option<String>,
    pub source: SnapshotSource,
    pub filter_id: Option<i64>,
    pub combo_id: Option<i64>,
    pub source_element_ids: Vec<String>,
    pub host_element_ids: Vec<String>,
    pub source_params: ParamBag,
    pub host_params: ParamBag,
    pub source_doc_keys: Vec<String>,
    pub host_doc_keys: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

const SNAPSHOT_COLUMNS: &str = "id, identity_guid, individual_object_id, cluster_object_id, \
    source_type, filter_id, combo_id, \
    source_element_ids_json, host_element_ids_json, \
    source_params_json, host_params_json, \
    source_doc_keys_json, host_doc_keys_json, created_at, updated_at";

fn parse_list(json: Option<&str>) -> Vec<String> {
    json.and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or_default()
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<SleeveSnapshot> {
    let identity_text: Option<String> = row.get(1)?;
    let source_text: String = row.get(4)?;
    let source_ids: Option<String> = row.get(7)?;
    let host_ids: Option<String> = row.get(8)?;
    let source_params: Option<String> = row.get(9)?;
    let host_params: Option<String> = row.get(10)?;
    let source_docs: Option<String> = row.get(11)?;
    let host_docs: Option<String> = row.get(12)?;
    Ok(SleeveSnapshot {
        id: row.get(0)?,
        identity: identity_text.as_deref().and_then(ZoneIdentity::parse),
        individual_object_id: row.get(2)?,
        cluster_object_id: row.get(3)?,
        source: SnapshotSource::from_str(&source_text).unwrap_or(SnapshotSource::Individual),
        filter_id: row.get(5)?,
        combo_id: row.get(6)?,
        source_element_ids: parse_list(source_ids.as_deref()),
        host_element_ids: parse_list(host_ids.as_deref()),
        source_params: source_params
            .as_deref()
            .and_then(|text| ParamBag::from_json(text).ok())
            .unwrap_or_default(),
        host_params: host_params
            .as_deref()
            .and_then(|text| ParamBag::from_json(text).ok())
            .unwrap_or_default(),
        source_doc_keys: parse_list(source_docs.as_deref()),
        host_doc_keys: parse_list(host_docs.as_deref()),
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

/// Merge the bags of the covered zones: size-like keys keep one value per
/// zone in zone order (repeats included), ordinary keys collect their
/// distinct values. Ordinary values are sorted so the merged mapping does
/// not depend on the order the zones were visited in.
fn merge_bags<'a>(bags: impl Iterator<Item = &'a ParamBag>) -> ParamBag {
    // First-seen key spelling and its collected values.
    let mut entries: Vec<(String, Vec<String>)> = Vec::new();
    for bag in bags {
        for (key, value) in bag.iter() {
            let slot = entries
                .iter()
                .position(|(existing, _)| existing.eq_ignore_ascii_case(key));
            let index = match slot {
                Some(index) => index,
                None => {
                    entries.push((key.to_owned(), Vec::new()));
                    entries.len() - 1
                }
            };
            let values = &mut entries[index].1;
            if is_size_key(key) {
                values.push(value.to_owned());
            } else if !values.iter().any(|v| v == value) {
                values.push(value.to_owned());
            }
        }
    }
    let mut merged = ParamBag::new();
    for (key, mut values) in entries {
        if !is_size_key(&key) {
            values.sort_unstable();
        }
        merged.insert(key, values.join(", "));
    }
    merged
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|existing| existing == value) {
        list.push(value.to_owned());
    }
}

struct Aggregate {
    identity: Option<ZoneIdentity>,
    filter_id: Option<i64>,
    combo_id: Option<i64>,
    source_element_ids: Vec<String>,
    host_element_ids: Vec<String>,
    source_params: ParamBag,
    host_params: ParamBag,
    source_doc_keys: Vec<String>,
    host_doc_keys: Vec<String>,
}

fn zones_for_handle(
    conn: &Connection,
    handle_column: &str,
    handle: &str,
) -> ClashResult<Vec<ClashZone>> {
    let sql = format!(
        "SELECT {ZONE_COLUMNS} FROM clash_zones z \
         WHERE z.{handle_column} = ?1 ORDER BY z.id;"
    );
    let mut statement = conn.prepare(&sql).map_err(ClashError::storage)?;
    let rows = statement
        .query_map(params![handle], zone_from_row)
        .map_err(ClashError::storage)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(ClashError::storage)
}

fn aggregate_zones(conn: &Connection, zones: &[ClashZone]) -> ClashResult<Aggregate> {
    let mut agg = Aggregate {
        // A snapshot covering exactly one zone inherits its identity and
        // can be found by it later; multi-zone snapshots only have their
        // handle.
        identity: match zones {
            [only] => only.identity,
            _ => None,
        },
        filter_id: None,
        combo_id: match zones {
            [only] => Some(only.combo_id),
            _ => None,
        },
        source_element_ids: Vec::new(),
        host_element_ids: Vec::new(),
        source_params: merge_bags(zones.iter().map(|zone| &zone.source_params)),
        host_params: merge_bags(zones.iter().map(|zone| &zone.host_params)),
        source_doc_keys: Vec::new(),
        host_doc_keys: Vec::new(),
    };

    for zone in zones {
        push_unique(&mut agg.source_element_ids, &zone.source_element_id);
        push_unique(&mut agg.host_element_ids, &zone.host_element_id);

        let combo: Option<(i64, String, String)> = conn
            .query_row(
                "SELECT filter_id, source_doc_key, host_doc_key \
                 FROM file_combos WHERE id = ?1;",
                params![zone.combo_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(ClashError::storage)?;
        if let Some((filter_id, source_doc, host_doc)) = combo {
            agg.filter_id.get_or_insert(filter_id);
            push_unique(&mut agg.source_doc_keys, &source_doc);
            push_unique(&mut agg.host_doc_keys, &host_doc);
        }
    }
    Ok(agg)
}

/// Re-derive and upsert the snapshot for one placed object.
///
/// Lookup priority for the existing row: single-zone identity first, then
/// the individual handle, then the cluster handle. First match wins.
fn upsert_snapshot(
    conn: &Connection,
    source: SnapshotSource,
    handle: &str,
    now: i64,
) -> ClashResult<Option<SleeveSnapshot>> {
    let handle_column = match source {
        SnapshotSource::Individual => "individual_object_id",
        SnapshotSource::Cluster => "cluster_object_id",
    };
    let zones = zones_for_handle(conn, handle_column, handle)?;
    if zones.is_empty() {
        return Ok(None);
    }
    let agg = aggregate_zones(conn, &zones)?;

    let existing_id: Option<i64> = {
        let mut found: Option<i64> = match agg.identity {
            Some(identity) => conn
                .query_row(
                    "SELECT id FROM sleeve_snapshots WHERE identity_guid = ?1;",
                    params![identity.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(ClashError::storage)?,
            None => None,
        };
        for column in ["individual_object_id", "cluster_object_id"] {
            if found.is_some() {
                break;
            }
            found = conn
                .query_row(
                    &format!("SELECT id FROM sleeve_snapshots WHERE {column} = ?1;"),
                    params![handle],
                    |row| row.get(0),
                )
                .optional()
                .map_err(ClashError::storage)?;
        }
        found
    };

    let identity_text = agg.identity.map(|identity| identity.to_string());
    let (individual_handle, cluster_handle) = match source {
        SnapshotSource::Individual => (Some(handle), None),
        SnapshotSource::Cluster => (None, Some(handle)),
    };
    let source_ids_json = serde_json::to_string(&agg.source_element_ids).map_err(ClashError::storage)?;
    let host_ids_json = serde_json::to_string(&agg.host_element_ids).map_err(ClashError::storage)?;
    let source_docs_json = serde_json::to_string(&agg.source_doc_keys).map_err(ClashError::storage)?;
    let host_docs_json = serde_json::to_string(&agg.host_doc_keys).map_err(ClashError::storage)?;
    let source_params_json = agg.source_params.to_json()?;
    let host_params_json = agg.host_params.to_json()?;

    let snapshot_id = match existing_id {
        Some(id) => {
            conn.execute(
                "UPDATE sleeve_snapshots SET \
                    identity_guid = ?2, individual_object_id = ?3, cluster_object_id = ?4, \
                    source_type = ?5, filter_id = ?6, combo_id = ?7, \
                    source_element_ids_json = ?8, host_element_ids_json = ?9, \
                    source_params_json = ?10, host_params_json = ?11, \
                    source_doc_keys_json = ?12, host_doc_keys_json = ?13, \
                    updated_at = ?14 \
                 WHERE id = ?1;",
                params![
                    id,
                    identity_text,
                    individual_handle,
                    cluster_handle,
                    source.as_str(),
                    agg.filter_id,
                    agg.combo_id,
                    source_ids_json,
                    host_ids_json,
                    source_params_json,
                    host_params_json,
                    source_docs_json,
                    host_docs_json,
                    now,
                ],
            )
            .map_err(ClashError::storage)?;
            id
        }
        None => {
            conn.execute(
                "INSERT INTO sleeve_snapshots (\
                    identity_guid, individual_object_id, cluster_object_id, \
                    source_type, filter_id, combo_id, \
                    source_element_ids_json, host_element_ids_json, \
                    source_params_json, host_params_json, \
                    source_doc_keys_json, host_doc_keys_json, created_at, updated_at\
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13);",
                params![
                    identity_text,
                    individual_handle,
                    cluster_handle,
                    source.as_str(),
                    agg.filter_id,
                    agg.combo_id,
                    source_ids_json,
                    host_ids_json,
                    source_params_json,
                    host_params_json,
                    source_docs_json,
                    host_docs_json,
                    now,
                ],
            )
            .map_err(ClashError::storage)?;
            conn.last_insert_rowid()
        }
    };

    snapshot_by_id(conn, snapshot_id)
}

pub fn snapshot_by_id(conn: &Connection, id: i64) -> ClashResult<Option<SleeveSnapshot>> {
    conn.query_row(
        &format!("SELECT {SNAPSHOT_COLUMNS} FROM sleeve_snapshots WHERE id = ?1;"),
        params![id],
        snapshot_from_row,
    )
    .optional()
    .map_err(ClashError::storage)
}

pub fn snapshot_by_identity(
    conn: &Connection,
    identity: &ZoneIdentity,
) -> ClashResult<Option<SleeveSnapshot>> {
    conn.query_row(
        &format!("SELECT {SNAPSHOT_COLUMNS} FROM sleeve_snapshots WHERE identity_guid = ?1;"),
        params![identity.to_string()],
        snapshot_from_row,
    )
    .optional()
    .map_err(ClashError::storage)
}

pub fn snapshot_by_individual_handle(
    conn: &Connection,
    handle: &str,
) -> ClashResult<Option<SleeveSnapshot>> {
    conn.query_row(
        &format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM sleeve_snapshots WHERE individual_object_id = ?1;"
        ),
        params![handle],
        snapshot_from_row,
    )
    .optional()
    .map_err(ClashError::storage)
}

pub fn snapshot_by_cluster_handle(
    conn: &Connection,
    handle: &str,
) -> ClashResult<Option<SleeveSnapshot>> {
    conn.query_row(
        &format!("SELECT {SNAPSHOT_COLUMNS} FROM sleeve_snapshots WHERE cluster_object_id = ?1;"),
        params![handle],
        snapshot_from_row,
    )
    .optional()
    .map_err(ClashError::storage)
}

impl Storage {
    /// Re-derive the snapshot for an individually placed sleeve.
    ///
    /// `Ok(None)` when no zone carries the handle.
    pub fn snapshot_individual(&self, handle: &str) -> ClashResult<Option<SleeveSnapshot>> {
        ensure_non_empty(handle, "individual_object_id")?;
        let now = unix_timestamp_ms()?;
        let snapshot = self
            .transaction(|conn| upsert_snapshot(conn, SnapshotSource::Individual, handle, now))?;
        tracing::debug!(
            target: "clashstore.storage",
            op = "snapshot_individual",
            handle,
            found = snapshot.is_some(),
            "individual sleeve snapshot refreshed"
        );
        Ok(snapshot)
    }

    /// Re-derive the snapshot for a cluster sleeve.
    pub fn snapshot_cluster(&self, handle: &str) -> ClashResult<Option<SleeveSnapshot>> {
        ensure_non_empty(handle, "cluster_object_id")?;
        let now = unix_timestamp_ms()?;
        let snapshot =
            self.transaction(|conn| upsert_snapshot(conn, SnapshotSource::Cluster, handle, now))?;
        tracing::debug!(
            target: "clashstore.storage",
            op = "snapshot_cluster",
            handle,
            found = snapshot.is_some(),
            "cluster sleeve snapshot refreshed"
        );
        Ok(snapshot)
    }
}
