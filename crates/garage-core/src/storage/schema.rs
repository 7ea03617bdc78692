//! SQLite schema for the local store
//!
//! One table per entity container plus the `outbox` table. Every table
//! is keyed by `id` and indexed by `owner_id`, `updated_at` and
//! `created_at`. Timestamps are epoch milliseconds.

use rusqlite::{Connection, Result};

use crate::models::Container;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Name of the durable mutation queue table
pub const OUTBOX_TABLE: &str = "outbox";

/// Initialize the database schema
///
/// Safe to run repeatedly; every statement is `IF NOT EXISTS`.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let mut ddl = String::from(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    );

    for container in Container::ALL {
        ddl.push_str(&container_ddl(container.table_name()));
    }

    ddl.push_str(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {t} (
            id TEXT PRIMARY KEY,
            action TEXT NOT NULL,
            container TEXT NOT NULL,
            record_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            enqueued_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{t}_owner_id ON {t}(owner_id);
        CREATE INDEX IF NOT EXISTS idx_{t}_updated_at ON {t}(updated_at);
        CREATE INDEX IF NOT EXISTS idx_{t}_created_at ON {t}(created_at);
        CREATE INDEX IF NOT EXISTS idx_{t}_status ON {t}(status);
        CREATE INDEX IF NOT EXISTS idx_{t}_enqueued_at ON {t}(enqueued_at);
        CREATE INDEX IF NOT EXISTS idx_{t}_target ON {t}(container, record_id);
        "#,
        t = OUTBOX_TABLE
    ));

    conn.execute_batch(&ddl)?;

    // Set schema version
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

fn container_ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {t} (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{t}_owner_id ON {t}(owner_id);
        CREATE INDEX IF NOT EXISTS idx_{t}_updated_at ON {t}(updated_at);
        CREATE INDEX IF NOT EXISTS idx_{t}_created_at ON {t}(created_at);
        "#,
        t = table
    )
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(conn: &Connection, kind: &str) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type = ? ORDER BY name")
            .unwrap()
            .query_map([kind], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_init_schema_creates_every_container() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables = names(&conn, "table");
        for container in Container::ALL {
            assert!(
                tables.contains(&container.table_name().to_string()),
                "missing table {}",
                container
            );
        }
        assert!(tables.contains(&OUTBOX_TABLE.to_string()));
    }

    #[test]
    fn test_schema_version() {
        let conn = Connection::open_in_memory().unwrap();

        assert!(needs_init(&conn));

        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        assert!(!needs_init(&conn));
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_indexes_exist() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let indexes = names(&conn, "index");
        assert!(indexes.contains(&"idx_customers_owner_id".to_string()));
        assert!(indexes.contains(&"idx_customers_updated_at".to_string()));
        assert!(indexes.contains(&"idx_ledger_entries_owner_id".to_string()));
        assert!(indexes.contains(&"idx_outbox_owner_id".to_string()));
        assert!(indexes.contains(&"idx_outbox_updated_at".to_string()));
        assert!(indexes.contains(&"idx_outbox_status".to_string()));
        assert!(indexes.contains(&"idx_outbox_enqueued_at".to_string()));
    }
}
