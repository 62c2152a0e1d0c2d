use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;

/// Stored in `PRAGMA user_version`, outside the key-value table.
pub const SCHEMA_VERSION: i64 = 1;

/// Create the `kv_state` table on a fresh file and stamp the schema version.
/// Files written by a newer build are refused.
pub fn initialize(conn: &Connection) -> Result<()> {
    let found = user_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(anyhow!(
            "database schema version {found} is newer than supported version {SCHEMA_VERSION}"
        ));
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS kv_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_kv_state_updated_at ON kv_state(updated_at);
        "#,
    )
    .context("create kv_state table")?;

    if found < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .context("stamp schema version")?;
    }
    Ok(())
}

pub fn user_version(conn: &Connection) -> Result<i64> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .context("read schema version")
}
