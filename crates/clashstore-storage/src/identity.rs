//! Deterministic zone identity and the insert/update/merge decision.
//!
//! Identity is a 128-bit value derived from (source-element key,
//! host-element key, intersection point rounded to a fixed precision), so
//! re-detections of the same clash hash to the same identity despite
//! floating-point jitter. The resolver decides, for each candidate,
//! whether it is a new row, an identity match, or a collision with a row
//! stored under a different (or absent) identity.

use std::fmt;

use clashstore_core::{ClashError, ClashResult, Point3};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Rounding precision applied to intersection coordinates before hashing.
///
/// Deliberately coarser than the fuzzy-match tolerance so identity-stable
/// re-detections never need the fallback path.
pub const IDENTITY_PRECISION: f64 = 1e-4;

/// The deterministic 128-bit identity of a clash zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneIdentity(Uuid);

impl ZoneIdentity {
    /// Derive the identity from the zone's stable inputs.
    ///
    /// The canonical form hashes the element keys and the rounded
    /// coordinates with SHA-256 and takes the first 16 bytes.
    #[must_use]
    pub fn derive(source_element_id: &str, host_element_id: &str, intersection: &Point3) -> Self {
        let rounded = intersection.rounded(IDENTITY_PRECISION);
        // Negative zero would format differently from zero.
        let normalize = |v: f64| if v == 0.0 { 0.0 } else { v };
        let canonical = format!(
            "{source_element_id}|{host_element_id}|{:.4}|{:.4}|{:.4}",
            normalize(rounded.x),
            normalize(rounded.y),
            normalize(rounded.z)
        );
        let digest = Sha256::digest(canonical.as_bytes());
        let mut bytes = [0_u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse a stored hyphenated identity; `None` for malformed text.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text).ok().map(Self)
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ZoneIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// The resolver's verdict for one candidate zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOutcome {
    /// No existing row matches; insert.
    NewRow,
    /// An existing row carries the same identity; update it.
    MatchByIdentity {
        /// Storage key of the matched row.
        zone_id: i64,
    },
    /// An existing row holds the same (combo, source, host) uniqueness key
    /// under a different or absent identity; the insert converts into an
    /// update so the constraint never fires.
    MatchByGeometryCollision {
        /// Storage key of the matched row.
        zone_id: i64,
        /// Whether the resolver back-filled the candidate identity onto a
        /// legacy row that had none.
        identity_backfilled: bool,
    },
}

/// Decide insert vs. update vs. merge-by-collision for one candidate.
///
/// Matching order: (a) exact identity match; (b) legacy fallback on
/// (combo, source key, host key, intersection within `tolerance`) for rows
/// whose identity was never assigned — on fallback match the identity is
/// back-filled so future lookups are O(1); (c) pair-key collision against
/// a row stored under a different identity, in which case the stored
/// identity wins because identity is immutable once assigned.
pub fn resolve_match(
    conn: &Connection,
    combo_id: i64,
    source_element_id: &str,
    host_element_id: &str,
    intersection: &Point3,
    tolerance: f64,
) -> ClashResult<MatchOutcome> {
    intersection.ensure_finite("intersection")?;

    let identity = ZoneIdentity::derive(source_element_id, host_element_id, intersection);

    let by_identity: Option<i64> = conn
        .query_row(
            "SELECT id FROM clash_zones WHERE identity_guid = ?1;",
            params![identity.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(ClashError::storage)?;
    if let Some(zone_id) = by_identity {
        return Ok(MatchOutcome::MatchByIdentity { zone_id });
    }

    // Legacy rows predate identity assignment; match them geometrically
    // and back-fill so the next lookup takes the identity path.
    let legacy: Option<(i64, Option<f64>, Option<f64>, Option<f64>)> = conn
        .query_row(
            "SELECT id, intersection_x, intersection_y, intersection_z \
             FROM clash_zones \
             WHERE combo_id = ?1 AND source_element_id = ?2 AND host_element_id = ?3 \
               AND identity_guid IS NULL;",
            params![combo_id, source_element_id, host_element_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .map_err(ClashError::storage)?;
    if let Some((zone_id, x, y, z)) = legacy {
        let stored = match (x, y, z) {
            (Some(x), Some(y), Some(z)) => Some(Point3::new(x, y, z)),
            _ => None,
        };
        let within_tolerance = stored
            .map(|point| point.approx_eq(intersection, tolerance))
            .unwrap_or(false);
        if within_tolerance {
            conn.execute(
                "UPDATE clash_zones SET identity_guid = ?2 WHERE id = ?1;",
                params![zone_id, identity.to_string()],
            )
            .map_err(ClashError::storage)?;
            tracing::debug!(
                target: "clashstore.storage",
                op = "resolve_match",
                zone_id,
                identity = %identity,
                "back-filled identity onto legacy row"
            );
            return Ok(MatchOutcome::MatchByGeometryCollision {
                zone_id,
                identity_backfilled: true,
            });
        }
    }

    // Any remaining row with the same pair key is a collision: the stored
    // identity (possibly still unassigned) wins, and the insert becomes an
    // update so the uniqueness constraint never fires.
    let collision: Option<i64> = conn
        .query_row(
            "SELECT id FROM clash_zones \
             WHERE combo_id = ?1 AND source_element_id = ?2 AND host_element_id = ?3;",
            params![combo_id, source_element_id, host_element_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(ClashError::storage)?;
    if let Some(zone_id) = collision {
        tracing::debug!(
            target: "clashstore.storage",
            op = "resolve_match",
            zone_id,
            "pair-key collision converted to update"
        );
        return Ok(MatchOutcome::MatchByGeometryCollision {
            zone_id,
            identity_backfilled: false,
        });
    }

    Ok(MatchOutcome::NewRow)
}

#[cfg(test)]
mod tests {
    use clashstore_core::Point3;
    use rusqlite::params;

    use crate::connection::Storage;
    use crate::zone::{ensure_combo, ensure_filter, insert_zone, zone_by_id, ZoneCandidate};

    use super::{resolve_match, MatchOutcome, ZoneIdentity};

    fn setup_combo(conn: &rusqlite::Connection) -> i64 {
        let filter_id =
            ensure_filter(conn, "f", "Ducts", &[], 1_000).expect("filter should be created");
        ensure_combo(conn, filter_id, "Ducts", &[], "a.rvt", "b.rvt", 1_000)
            .expect("combo should be created")
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = ZoneIdentity::derive("10", "20", &Point3::new(1.0, 2.0, 3.0));
        let b = ZoneIdentity::derive("10", "20", &Point3::new(1.0, 2.0, 3.0));
        assert_eq!(a, b);
    }

    #[test]
    fn derivation_absorbs_sub_precision_jitter() {
        let a = ZoneIdentity::derive("10", "20", &Point3::new(1.0, 2.0, 3.0));
        let b = ZoneIdentity::derive("10", "20", &Point3::new(1.000_000_1, 2.0, 3.0));
        assert_eq!(a, b, "jitter below the rounding precision must not change identity");
    }

    #[test]
    fn derivation_distinguishes_inputs() {
        let base = ZoneIdentity::derive("10", "20", &Point3::new(1.0, 2.0, 3.0));
        assert_ne!(base, ZoneIdentity::derive("11", "20", &Point3::new(1.0, 2.0, 3.0)));
        assert_ne!(base, ZoneIdentity::derive("10", "21", &Point3::new(1.0, 2.0, 3.0)));
        assert_ne!(base, ZoneIdentity::derive("10", "20", &Point3::new(1.5, 2.0, 3.0)));
    }

    #[test]
    fn display_parse_round_trip() {
        let identity = ZoneIdentity::derive("10", "20", &Point3::new(1.0, 2.0, 3.0));
        let text = identity.to_string();
        assert_eq!(ZoneIdentity::parse(&text), Some(identity));
        assert_eq!(ZoneIdentity::parse("not-a-uuid"), None);
    }

    #[test]
    fn unknown_candidate_is_new_row() {
        let storage = Storage::open_in_memory().expect("storage");
        let conn = storage.connection();
        let combo_id = setup_combo(conn);

        let outcome = resolve_match(conn, combo_id, "10", "20", &Point3::new(1.0, 2.0, 3.0), 1e-3)
            .expect("resolve should succeed");
        assert_eq!(outcome, MatchOutcome::NewRow);
    }

    #[test]
    fn exact_identity_match_is_found() {
        let storage = Storage::open_in_memory().expect("storage");
        let conn = storage.connection();
        let combo_id = setup_combo(conn);

        let point = Point3::new(1.0, 2.0, 3.0);
        let candidate = ZoneCandidate::new("10", "20", "a.rvt", "b.rvt", point);
        let identity = ZoneIdentity::derive("10", "20", &point);
        let zone_id =
            insert_zone(conn, combo_id, &identity, &candidate, 1_000).expect("insert");

        let outcome =
            resolve_match(conn, combo_id, "10", "20", &point, 1e-3).expect("resolve");
        assert_eq!(outcome, MatchOutcome::MatchByIdentity { zone_id });
    }

    #[test]
    fn legacy_row_matched_within_tolerance_gets_identity_backfilled() {
        let storage = Storage::open_in_memory().expect("storage");
        let conn = storage.connection();
        let combo_id = setup_combo(conn);

        // A legacy row: inserted directly without an identity.
        conn.execute(
            "INSERT INTO clash_zones \
                (combo_id, source_element_id, host_element_id, \
                 intersection_x, intersection_y, intersection_z, created_at, updated_at) \
             VALUES (?1, '10', '20', 1.0, 2.0, 3.0, 500, 500);",
            params![combo_id],
        )
        .expect("legacy insert should succeed");
        let zone_id = conn.last_insert_rowid();

        let probe = Point3::new(1.0004, 2.0, 3.0);
        let outcome = resolve_match(conn, combo_id, "10", "20", &probe, 1e-3).expect("resolve");
        assert_eq!(
            outcome,
            MatchOutcome::MatchByGeometryCollision {
                zone_id,
                identity_backfilled: true,
            }
        );

        let zone = zone_by_id(conn, zone_id)
            .expect("fetch should succeed")
            .expect("zone should exist");
        assert_eq!(
            zone.identity,
            Some(ZoneIdentity::derive("10", "20", &probe)),
            "matched legacy row should carry the back-filled identity"
        );

        // The next resolve takes the O(1) identity path.
        let second = resolve_match(conn, combo_id, "10", "20", &probe, 1e-3).expect("resolve");
        assert_eq!(second, MatchOutcome::MatchByIdentity { zone_id });
    }

    #[test]
    fn legacy_row_outside_tolerance_is_pair_collision() {
        let storage = Storage::open_in_memory().expect("storage");
        let conn = storage.connection();
        let combo_id = setup_combo(conn);

        let point = Point3::new(1.0, 2.0, 3.0);
        let candidate = ZoneCandidate::new("10", "20", "a.rvt", "b.rvt", point);
        let identity = ZoneIdentity::derive("10", "20", &point);
        let zone_id = insert_zone(conn, combo_id, &identity, &candidate, 1_000).expect("insert");

        // The pair moved well beyond tolerance: different identity, same
        // uniqueness key, so the insert must convert into an update.
        let moved = Point3::new(5.0, 2.0, 3.0);
        let outcome = resolve_match(conn, combo_id, "10", "20", &moved, 1e-3).expect("resolve");
        assert_eq!(
            outcome,
            MatchOutcome::MatchByGeometryCollision {
                zone_id,
                identity_backfilled: false,
            }
        );

        let zone = zone_by_id(conn, zone_id)
            .expect("fetch should succeed")
            .expect("zone should exist");
        assert_eq!(zone.identity, Some(identity), "stored identity is immutable");
    }

    #[test]
    fn non_finite_probe_is_rejected_before_any_lookup() {
        let storage = Storage::open_in_memory().expect("storage");
        let conn = storage.connection();
        let combo_id = setup_combo(conn);

        let err = resolve_match(
            conn,
            combo_id,
            "10",
            "20",
            &Point3::new(f64::NAN, 0.0, 0.0),
            1e-3,
        )
        .expect_err("NaN probe should be rejected");
        assert!(err.to_string().contains("intersection"));
    }
}
