//! Key/value persistence for tasks and events
//!
//! Both the manager and the workers keep their state behind the same small
//! `Store` contract: a volatile in-memory map for throwaway deployments and an
//! embedded SQLite database for durable ones. Stores are keyed by the string
//! form of the task/event id; values are JSON-encoded.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::OrchestratorError;

/// Uniform store contract shared by the task and event databases.
///
/// Single-key writes are atomic with respect to concurrent readers in the
/// same process; no cross-key transactions are offered.
pub trait Store<T>: Send {
    /// Insert or overwrite the value under `key`.
    fn put(&mut self, key: &str, value: &T) -> Result<()>;
    /// Fetch the value under `key`; absent keys are a not-found error.
    fn get(&self, key: &str) -> Result<T>;
    /// Decode every stored value.
    fn list(&self) -> Result<Vec<T>>;
    /// Number of stored values.
    fn count(&self) -> Result<usize>;
}

/// Volatile store: a plain map held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore<T> {
    db: HashMap<String, T>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self { db: HashMap::new() }
    }
}

impl<T: Clone + Send> Store<T> for MemoryStore<T> {
    fn put(&mut self, key: &str, value: &T) -> Result<()> {
        self.db.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<T> {
        self.db
            .get(key)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(key.to_string()).into())
    }

    fn list(&self) -> Result<Vec<T>> {
        Ok(self.db.values().cloned().collect())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.db.len())
    }
}

/// Durable store: one single-file SQLite database per store kind.
///
/// The store kind ("tasks" or "events") names the table, mirroring a bucket
/// in a key/value database. Opening is idempotent: an existing table is
/// reused. Values are stored as JSON text.
pub struct SqliteStore<T> {
    db_path: PathBuf,
    bucket: String,
    connection: Connection,
    _marker: PhantomData<T>,
}

impl<T> SqliteStore<T> {
    /// Open (or create) the database file and ensure the bucket table exists.
    ///
    /// The file is restricted to owner read/write. Failure here is fatal
    /// initialization: callers are expected to terminate the process.
    pub fn open<P: AsRef<Path>>(db_path: P, bucket: &str) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory: {}", parent.display())
                })?;
            }
        }

        let connection = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // Reduce lock errors when several loops share the file.
        connection
            .busy_timeout(std::time::Duration::from_secs(30))
            .context("Failed to set busy timeout")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&db_path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict mode on {}", db_path.display()))?;
        }

        // Bucket names come from a fixed set ("tasks", "events"); they are
        // table identifiers, not bindable parameters.
        connection
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
                    bucket
                ),
                [],
            )
            .with_context(|| format!("Failed to create bucket table {}", bucket))?;

        Ok(Self {
            db_path,
            bucket: bucket.to_string(),
            connection,
            _marker: PhantomData,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl<T: Serialize + DeserializeOwned + Send> Store<T> for SqliteStore<T> {
    fn put(&mut self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value).context("Failed to encode store value")?;
        self.connection
            .execute(
                &format!(
                    "INSERT INTO {} (key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    self.bucket
                ),
                params![key, encoded],
            )
            .with_context(|| format!("Failed to save item {}", key))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<T> {
        let encoded: String = self
            .connection
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", self.bucket),
                params![key],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    anyhow::Error::from(OrchestratorError::NotFound(key.to_string()))
                }
                other => anyhow::Error::from(other),
            })?;
        serde_json::from_str(&encoded)
            .with_context(|| format!("Failed to decode store value for {}", key))
    }

    fn list(&self) -> Result<Vec<T>> {
        let mut stmt = self
            .connection
            .prepare(&format!("SELECT value FROM {}", self.bucket))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut values = Vec::new();
        for row in rows {
            let encoded = row?;
            values.push(
                serde_json::from_str(&encoded).context("Failed to decode store value")?,
            );
        }
        Ok(values)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self.connection.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.bucket),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
