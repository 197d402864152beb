//! SQLite-backed [`DocumentStore`].
//!
//! Features are stored as JSON documents next to two indexed columns: the
//! `@type` discriminator and `sent` in epoch milliseconds. Zones have no
//! `sent` and sort last in descending order.

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params, params_from_iter};
use watchedsky_core::Feature;

use super::schema;
use super::{DocumentStore, FeatureFilter, FindOptions, SortOrder};
use crate::{Error, Result};

/// Configuration for the SQLite store.
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/watchedsky.db"),
        }
    }
}

/// Feature store on a single SQLite connection.
pub struct SqliteStore {
    /// SQLite connection (protected by mutex for thread safety).
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store with the given configuration.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.db_path)
            .map_err(|e| Error::Database(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Database(format!("Failed to set PRAGMA: {}", e)))?;

        schema::init_schema(&conn)
            .map_err(|e| Error::Database(format!("Failed to init schema: {}", e)))?;

        tracing::info!(path = %config.db_path.display(), "Feature store opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("Failed to open in-memory SQLite: {}", e)))?;

        schema::init_schema(&conn)
            .map_err(|e| Error::Database(format!("Failed to init schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of stored features.
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM features", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

/// Indexed columns for a feature: (type, sent_ms, doc).
fn columns(feature: &Feature) -> Result<(Option<String>, Option<i64>, String)> {
    let feature_type = feature.type_name().map(str::to_string);
    let sent_ms = feature.sent().ok().map(|t| t.timestamp_millis());
    let doc = serde_json::to_string(feature)?;
    Ok((feature_type, sent_ms, doc))
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn find(&self, filter: &FeatureFilter, options: FindOptions) -> Result<Vec<Feature>> {
        let mut clauses = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(feature_type) = filter.feature_type {
            clauses.push("feature_type = ?".to_string());
            args.push(SqlValue::Text(feature_type.as_str().to_string()));
        }
        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; ids.len()].join(", ");
            clauses.push(format!("id IN ({placeholders})"));
            args.extend(ids.iter().cloned().map(SqlValue::Text));
        }

        let mut sql = String::from("SELECT doc FROM features");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        match options.sort {
            SortOrder::Unordered => {}
            SortOrder::SentAscending => sql.push_str(" ORDER BY sent_ms ASC, id ASC"),
            SortOrder::SentDescending => sql.push_str(" ORDER BY sent_ms DESC, id DESC"),
        }
        // SQLite only accepts OFFSET after a LIMIT; -1 means unbounded.
        sql.push_str(" LIMIT ? OFFSET ?");
        args.push(SqlValue::Integer(
            options.limit.map(|l| l as i64).unwrap_or(-1),
        ));
        args.push(SqlValue::Integer(options.skip as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let docs = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        docs.iter()
            .map(|doc| serde_json::from_str(doc).map_err(Error::from))
            .collect()
    }

    async fn insert_many(&self, features: &[Feature]) -> Result<()> {
        if features.is_empty() {
            return Ok(());
        }

        let rows = features.iter().map(columns).collect::<Result<Vec<_>>>()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO features (id, feature_type, sent_ms, doc) VALUES (?, ?, ?, ?)",
            )?;
            for (feature, (feature_type, sent_ms, doc)) in features.iter().zip(&rows) {
                stmt.execute(params![feature.id, feature_type, sent_ms, doc])
                    .map_err(|e| {
                        Error::Database(format!("Failed to insert feature '{}': {}", feature.id, e))
                    })?;
            }
        }
        tx.commit()?;

        tracing::debug!(count = features.len(), "Inserted feature batch");
        Ok(())
    }

    async fn upsert(&self, feature: &Feature) -> Result<()> {
        let (feature_type, sent_ms, doc) = columns(feature)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO features (id, feature_type, sent_ms, doc) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                feature_type = excluded.feature_type,
                sent_ms = excluded.sent_ms,
                doc = excluded.doc",
            params![feature.id, feature_type, sent_ms, doc],
        )
        .map_err(|e| Error::Database(format!("Failed to upsert feature '{}': {}", feature.id, e)))?;

        Ok(())
    }
}
