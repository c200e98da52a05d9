//! Index schema.
//!
//! One table, one row per key. `inline IS NULL` marks content delegated to
//! the file store; `len` always records the original content size, so
//! metadata lookups never need to touch the filesystem.

use rusqlite::Connection;
use tracing::info;

use crate::Result;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

const ENTRIES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    key      BLOB PRIMARY KEY,
    len      INTEGER NOT NULL,
    mtime_ms INTEGER NOT NULL,
    inline   BLOB
) WITHOUT ROWID;
"#;

/// Initialize the index schema, migrating from older versions if needed.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("creating new index schema v{}", SCHEMA_VERSION);
        conn.execute_batch(ENTRIES_SCHEMA)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!(
            "migrating index schema from v{} to v{}",
            current_version, SCHEMA_VERSION
        );
        migrate_schema(conn, current_version)?;
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    // Only a missing row means "uninitialized"; any other failure is a
    // damaged index and must not be papered over with a fresh version row.
    match conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
        row.get(0)
    }) {
        Ok(version) => Ok(version),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn migrate_schema(conn: &Connection, _from_version: i32) -> Result<()> {
    // Migration steps go here as the schema evolves.
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_unreadable_version_row_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        // A version row that cannot be decoded is damage, not a fresh
        // database: init must fail rather than recreate the row.
        conn.execute_batch(
            "CREATE TABLE schema_version (version INTEGER NOT NULL);
             INSERT INTO schema_version (version) VALUES ('not a number');",
        )
        .unwrap();
        assert!(init_schema(&conn).is_err());
    }
}
