//! SQLite scratch store that isolated fixtures are restored into

use crate::types::{EntityCategory, EntityRecord};
use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for a scratch store
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened scratch database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Restored fixture entities, one row per record
            CREATE TABLE IF NOT EXISTS entities (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                category TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                is_test_data INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (category, id)
            );
            CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(category, name);

            -- Key-value store for restore bookkeeping
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Scratch schema initialized");
        Ok(())
    }

    // ========================================================================
    // Entities
    // ========================================================================

    /// Insert a batch of records in one transaction
    pub fn insert_records(&self, category: EntityCategory, records: &[EntityRecord]) -> Result<()> {
        let mut conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO entities (category, id, name, is_test_data, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for record in records {
                stmt.execute(params![
                    category.as_str(),
                    record.id,
                    record.name,
                    record.is_test_data,
                    serde_json::to_string(record)?,
                    now,
                ])?;
            }
        }

        tx.commit()?;
        debug!("Inserted {} {} record(s)", records.len(), category);
        Ok(())
    }

    /// Records of a category in insertion order
    pub fn list(&self, category: EntityCategory) -> Result<Vec<EntityRecord>> {
        let conn = self.conn.lock();

        let mut stmt =
            conn.prepare("SELECT payload FROM entities WHERE category = ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![category.as_str()], |row| row.get::<_, String>(0))?;

        let mut results = Vec::new();
        for payload in rows {
            results.push(serde_json::from_str(&payload?)?);
        }

        Ok(results)
    }

    /// Get a record by exact name
    pub fn get_by_name(&self, category: EntityCategory, name: &str) -> Result<Option<EntityRecord>> {
        let conn = self.conn.lock();

        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM entities WHERE category = ?1 AND name = ?2 ORDER BY seq LIMIT 1",
                params![category.as_str(), name],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Check if a record with this id exists
    pub fn exists(&self, category: EntityCategory, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE category = ?1 AND id = ?2",
            params![category.as_str(), id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Number of records in a category
    pub fn count(&self, category: EntityCategory) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE category = ?1",
            params![category.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Run a query returning a single integer (verification SQL)
    pub fn scalar(&self, sql: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let value = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(value)
    }

    /// Remove every restored record
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("DELETE FROM entities; DELETE FROM kv_store;")?;
        Ok(())
    }

    // ========================================================================
    // Key-value store
    // ========================================================================

    /// Set a key-value pair
    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now],
        )?;

        Ok(())
    }

    /// Get a value by key
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();

        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }
}
