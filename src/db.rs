use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;

pub const SCHEMA_VERSION: &str = "1";

pub fn create_tables(conn: &mut Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    let pois_columns: BTreeSet<&'static str> = ["world", "x", "y", "z", "kind", "seq"].into_iter().collect();
    let connections_columns: BTreeSet<&'static str> = [
        "world", "seq", "from_x", "from_y", "from_z", "to_x", "to_y", "to_z", "status", "manual",
    ]
    .into_iter()
    .collect();
    let road_data_columns: BTreeSet<&'static str> = [
        "world", "seq", "from_x", "from_y", "from_z", "to_x", "to_y", "to_z", "width", "road_type", "materials",
        "segments",
    ]
    .into_iter()
    .collect();

    // Legacy layouts are dropped and recreated; nothing in them is worth migrating.
    for (table, cols) in [
        ("pois", &pois_columns),
        ("connections", &connections_columns),
        ("road_data", &road_data_columns),
    ] {
        if table_exists(conn, table)? && !table_has_columns(conn, table, cols)? {
            log::warn!("[db] table {} has a legacy layout; recreating", table);
            conn.execute(&format!("DROP TABLE {}", table), [])?;
        }
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS pois (
            world TEXT NOT NULL,
            x     INTEGER NOT NULL,
            y     INTEGER NOT NULL,
            z     INTEGER NOT NULL,
            kind  TEXT NOT NULL,
            seq   INTEGER NOT NULL,
            PRIMARY KEY (world, x, y, z)
        );

        CREATE TABLE IF NOT EXISTS connections (
            world  TEXT NOT NULL,
            seq    INTEGER NOT NULL,
            from_x INTEGER NOT NULL,
            from_y INTEGER NOT NULL,
            from_z INTEGER NOT NULL,
            to_x   INTEGER NOT NULL,
            to_y   INTEGER NOT NULL,
            to_z   INTEGER NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('PLANNED','GENERATING','COMPLETED','FAILED')),
            manual INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (world, seq)
        );

        CREATE TABLE IF NOT EXISTS road_data (
            world     TEXT NOT NULL,
            seq       INTEGER NOT NULL,
            from_x    INTEGER NOT NULL,
            from_y    INTEGER NOT NULL,
            from_z    INTEGER NOT NULL,
            to_x      INTEGER NOT NULL,
            to_y      INTEGER NOT NULL,
            to_z      INTEGER NOT NULL,
            width     INTEGER NOT NULL,
            road_type INTEGER NOT NULL,
            materials TEXT NOT NULL,
            segments  TEXT NOT NULL,
            PRIMARY KEY (world, seq)
        );

        CREATE TABLE IF NOT EXISTS meta (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_connections_status ON connections(world, status);
        "#,
    )?;

    conn.execute(
        "INSERT INTO meta(key, value) VALUES ('schema_version', ?1) ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        params![SCHEMA_VERSION],
    )?;

    Ok(())
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(exists.is_some())
}

fn table_has_columns(conn: &Connection, table: &str, required: &BTreeSet<&str>) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    let mut present = BTreeSet::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        present.insert(name);
    }
    Ok(required.iter().all(|c| present.contains(*c)))
}
