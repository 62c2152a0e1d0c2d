use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::accounts::KeyValueStore;

pub mod schema;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    pub key: String,
    pub value: Option<String>,
    pub updated_at: Option<String>,
}

impl StateEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get("key")?,
            value: row.get("value")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// SQLite-backed key-value state. The connection sits behind a mutex so the
/// handle can be shared across tasks.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        schema::initialize(&conn)
            .map_err(|e| DbError::Config(format!("schema setup failed: {e:#}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".mailcore").join("mailcore.db"))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn
            .lock()
            .map_err(|_| DbError::Config("database connection lock poisoned".to_string()))
    }

    pub fn get_state(&self, key: &str) -> Result<Option<StateEntry>, DbError> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                "SELECT key, value, updated_at FROM kv_state WHERE key = ? LIMIT 1",
                [key],
                StateEntry::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn()?.execute(
            r#"
            INSERT INTO kv_state (key, value, updated_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_state(&self, key: &str) -> Result<usize, DbError> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM kv_state WHERE key = ?", [key])?;
        Ok(deleted)
    }
}

#[async_trait]
impl KeyValueStore for Database {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let entry = self
            .get_state(key)
            .with_context(|| format!("read kv_state key '{key}'"))?;
        Ok(entry.and_then(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.set_state(key, value)
            .with_context(|| format!("write kv_state key '{key}'"))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::{schema, Database};
    use crate::accounts::KeyValueStore;

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("mailcore-db-test-{}.db", Uuid::new_v4()))
    }

    #[test]
    fn state_upsert_and_delete() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        assert!(db.get_state("cursor").expect("get").is_none());
        db.set_state("cursor", "abc123").expect("set");
        db.set_state("cursor", "def456").expect("overwrite");

        let entry = db.get_state("cursor").expect("get").expect("entry exists");
        assert_eq!(entry.key, "cursor");
        assert_eq!(entry.value.as_deref(), Some("def456"));
        assert!(entry.updated_at.is_some());

        assert_eq!(db.delete_state("cursor").expect("delete"), 1);
        assert!(db.get_state("cursor").expect("get").is_none());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn reopen_keeps_state_and_schema_version() {
        let path = temp_db_path();
        {
            let db = Database::open(&path).expect("open db");
            db.set_state("accounts", "[]").expect("set");
            db.set_state("schema_version", "99").expect("set look-alike key");
            db.set_state("user_version", "99").expect("set look-alike key");
        }

        let db = Database::open(&path).expect("reopen db");
        let version = schema::user_version(&db.conn().expect("conn")).expect("version");
        assert_eq!(version, schema::SCHEMA_VERSION);
        assert_eq!(
            db.get_state("accounts")
                .expect("get")
                .and_then(|e| e.value)
                .as_deref(),
            Some("[]")
        );

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn database_is_a_key_value_store() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");

        KeyValueStore::set(&db, "selected_account", "{}")
            .await
            .expect("set through trait");
        assert_eq!(
            KeyValueStore::get(&db, "selected_account")
                .await
                .expect("get through trait")
                .as_deref(),
            Some("{}")
        );

        let _ = std::fs::remove_file(path);
    }
}
