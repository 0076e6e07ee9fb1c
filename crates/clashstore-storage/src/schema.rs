use clashstore_core::{ClashError, ClashResult};
use rusqlite::{Connection, OptionalExtension};

pub const SCHEMA_VERSION: i64 = 2;

struct Migration {
    version: i64,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        statements: &[
            "CREATE TABLE IF NOT EXISTS filters (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                name TEXT NOT NULL,\
                category TEXT NOT NULL,\
                selected_host_categories TEXT,\
                is_new INTEGER NOT NULL DEFAULT 1,\
                created_at INTEGER NOT NULL,\
                updated_at INTEGER NOT NULL,\
                UNIQUE(name, category)\
            );",
            "CREATE TABLE IF NOT EXISTS file_combos (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                filter_id INTEGER NOT NULL REFERENCES filters(id),\
                category TEXT NOT NULL,\
                selected_host_categories TEXT,\
                source_doc_key TEXT NOT NULL,\
                host_doc_key TEXT NOT NULL,\
                is_new INTEGER NOT NULL DEFAULT 1,\
                created_at INTEGER NOT NULL,\
                updated_at INTEGER NOT NULL,\
                UNIQUE(filter_id, category, source_doc_key, host_doc_key)\
            );",
            "CREATE TABLE IF NOT EXISTS clash_zones (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                identity_guid TEXT UNIQUE,\
                combo_id INTEGER NOT NULL REFERENCES file_combos(id),\
                source_element_id TEXT NOT NULL,\
                host_element_id TEXT NOT NULL,\
                intersection_x REAL, intersection_y REAL, intersection_z REAL,\
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
                is_individually_resolved INTEGER NOT NULL DEFAULT 0,\
                is_cluster_resolved INTEGER NOT NULL DEFAULT 0,\
                is_combined_resolved INTEGER NOT NULL DEFAULT 0,\
                is_clustered INTEGER NOT NULL DEFAULT 0,\
                marked_for_cluster_process INTEGER NOT NULL DEFAULT 0,\
                is_current_in_scope INTEGER NOT NULL DEFAULT 0,\
                ready_for_placement INTEGER NOT NULL DEFAULT 0,\
                individual_object_id TEXT,\
                cluster_object_id TEXT,\
                combined_object_id TEXT,\
                host_thickness REAL, width REAL, height REAL, diameter REAL,\
                source_params_json TEXT,\
                host_params_json TEXT,\
                created_at INTEGER NOT NULL,\
                updated_at INTEGER NOT NULL,\
                UNIQUE(combo_id, source_element_id, host_element_id)\
            );",
            "CREATE INDEX IF NOT EXISTS idx_zones_combo ON clash_zones(combo_id);",
            "CREATE INDEX IF NOT EXISTS idx_zones_individual_handle \
                ON clash_zones(individual_object_id) WHERE individual_object_id IS NOT NULL;",
            "CREATE INDEX IF NOT EXISTS idx_zones_cluster_handle \
                ON clash_zones(cluster_object_id) WHERE cluster_object_id IS NOT NULL;",
            "CREATE INDEX IF NOT EXISTS idx_zones_resolved \
                ON clash_zones(is_individually_resolved, is_cluster_resolved, is_combined_resolved);",
            "CREATE TABLE IF NOT EXISTS sleeve_snapshots (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                identity_guid TEXT,\
                individual_object_id TEXT,\
                cluster_object_id TEXT,\
                source_type TEXT NOT NULL,\
                filter_id INTEGER,\
                combo_id INTEGER,\
                source_element_ids_json TEXT,\
                host_element_ids_json TEXT,\
                source_params_json TEXT,\
                host_params_json TEXT,\
                source_doc_keys_json TEXT,\
                host_doc_keys_json TEXT,\
                created_at INTEGER NOT NULL,\
                updated_at INTEGER NOT NULL\
            );",
            "CREATE INDEX IF NOT EXISTS idx_snapshots_identity \
                ON sleeve_snapshots(identity_guid) WHERE identity_guid IS NOT NULL;",
            "CREATE INDEX IF NOT EXISTS idx_snapshots_individual \
                ON sleeve_snapshots(individual_object_id) WHERE individual_object_id IS NOT NULL;",
            "CREATE INDEX IF NOT EXISTS idx_snapshots_cluster \
                ON sleeve_snapshots(cluster_object_id) WHERE cluster_object_id IS NOT NULL;",
        ],
    },
    Migration {
        version: 2,
        statements: &[
            "CREATE TABLE IF NOT EXISTS zone_spatial_index (\
                zone_id INTEGER PRIMARY KEY REFERENCES clash_zones(id) ON DELETE CASCADE,\
                min_x REAL NOT NULL, min_y REAL NOT NULL, min_z REAL NOT NULL,\
                max_x REAL NOT NULL, max_y REAL NOT NULL, max_z REAL NOT NULL\
            );",
            "CREATE INDEX IF NOT EXISTS idx_spatial_min_x ON zone_spatial_index(min_x);",
            "CREATE INDEX IF NOT EXISTS idx_spatial_max_x ON zone_spatial_index(max_x);",
        ],
    },
];

pub fn bootstrap(conn: &Connection) -> ClashResult<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);")
        .map_err(ClashError::storage)?;

    let mut version = current_version_optional(conn)?.unwrap_or(0);
    if version > SCHEMA_VERSION {
        return Err(ClashError::SchemaTooNew {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }

    for migration in MIGRATIONS {
        if migration.version <= version {
            continue;
        }

        tracing::debug!(
            target: "clashstore.storage",
            from_version = version,
            to_version = migration.version,
            "applying storage schema migration"
        );

        for statement in migration.statements {
            conn.execute_batch(statement).map_err(ClashError::storage)?;
        }

        conn.execute(
            "INSERT OR IGNORE INTO schema_version(version) VALUES (?1);",
            [migration.version],
        )
        .map_err(ClashError::storage)?;
        version = migration.version;
    }

    tracing::debug!(
        target: "clashstore.storage",
        schema_version = version,
        "storage schema bootstrap complete"
    );

    Ok(())
}

pub fn current_version(conn: &Connection) -> ClashResult<i64> {
    current_version_optional(conn)?.ok_or_else(|| {
        ClashError::storage(std::io::Error::other("schema_version table has no rows"))
    })
}

fn current_version_optional(conn: &Connection) -> ClashResult<Option<i64>> {
    conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1;",
        [],
        |row| row.get(0),
    )
    .optional()
    .map_err(ClashError::storage)
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::{bootstrap, current_version, current_version_optional, MIGRATIONS, SCHEMA_VERSION};

    fn table_exists(conn: &Connection, table_name: &str) -> bool {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1;",
                [table_name],
                |row| row.get(0),
            )
            .expect("sqlite_master query should succeed");
        count > 0
    }

    #[test]
    fn bootstrap_sets_latest_version_for_fresh_database() {
        let conn = Connection::open_in_memory().expect("in-memory connection");

        bootstrap(&conn).expect("bootstrap should succeed");
        assert_eq!(
            current_version(&conn).expect("schema version should exist"),
            SCHEMA_VERSION
        );
        for table in [
            "filters",
            "file_combos",
            "clash_zones",
            "sleeve_snapshots",
            "zone_spatial_index",
        ] {
            assert!(table_exists(&conn, table), "{table} should exist");
        }
    }

    #[test]
    fn bootstrap_upgrades_v1_database_to_latest() {
        let conn = Connection::open_in_memory().expect("in-memory connection");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);",
        )
        .expect("schema_version should be creatable");
        for statement in MIGRATIONS[0].statements {
            conn.execute_batch(statement)
                .expect("v1 schema statement should execute");
        }
        conn.execute_batch("INSERT INTO schema_version(version) VALUES (1);")
            .expect("v1 marker row should insert");

        assert_eq!(
            current_version_optional(&conn).expect("version should read"),
            Some(1)
        );
        assert!(
            !table_exists(&conn, "zone_spatial_index"),
            "v2 table should not exist before bootstrap upgrade"
        );

        bootstrap(&conn).expect("bootstrap should upgrade schema");
        assert_eq!(
            current_version(&conn).expect("schema version should exist"),
            SCHEMA_VERSION
        );
        assert!(
            table_exists(&conn, "zone_spatial_index"),
            "v2 migration should create spatial index table"
        );
    }

    #[test]
    fn bootstrap_rejects_newer_schema() {
        let conn = Connection::open_in_memory().expect("in-memory connection");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);",
        )
        .expect("schema_version should be creatable");
        conn.execute(
            "INSERT INTO schema_version(version) VALUES (?1);",
            [SCHEMA_VERSION + 1],
        )
        .expect("future marker row should insert");

        let err = bootstrap(&conn).expect_err("future schema should be rejected");
        assert!(err.to_string().contains("newer"));
    }

    #[test]
    fn bootstrap_is_idempotent_at_latest_version() {
        let conn = Connection::open_in_memory().expect("in-memory connection");

        bootstrap(&conn).expect("first bootstrap should succeed");
        bootstrap(&conn).expect("second bootstrap should succeed");
        bootstrap(&conn).expect("third bootstrap should succeed");

        assert_eq!(
            current_version(&conn).expect("schema version should exist"),
            SCHEMA_VERSION
        );
    }
}
