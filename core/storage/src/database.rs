//! SQLite-backed durable store shared by the entity mirror, queue and cache.

use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task;
use tracing::{debug, info, warn};

use offsync_common::{Error, Result, TableName};

use crate::clock::{Clock, SystemClock};
use crate::schema::{self, CORE_SCHEMA, SCHEMA_VERSION};

/// Map a SQLite failure into the common storage error.
pub(crate) fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

/// Handle to the embedded store.
///
/// Cloning is cheap; every clone shares one connection. Statements run on the
/// blocking pool so async callers are never stalled on disk I/O.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Option<Connection>>>,
    path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path)
            .field("clock", &self.clock)
            .finish()
    }
}

impl LocalStore {
    /// Create or open a store backed by a database file.
    ///
    /// # Postconditions
    /// - Parent directories exist
    /// - Core tables and indexes exist
    ///
    /// # Errors
    /// - Directory creation failure (`Io`)
    /// - Database open or schema failure (`Storage`)
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let open_path = path.clone();
        let conn = task::spawn_blocking(move || Connection::open(open_path))
            .await
            .map_err(|e| Error::Storage(format!("Store open task failed: {}", e)))?
            .map_err(storage_err)?;

        let store = Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: Some(path),
            clock,
        };
        store.initialize().await?;

        info!("Local store opened at {:?}", store.path);
        Ok(store)
    }

    /// Create an in-memory store (for testing and sessions without a disk).
    pub async fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        let store = Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: None,
            clock,
        };
        store.initialize().await?;
        Ok(store)
    }

    /// In-memory store on the wall clock.
    pub async fn in_memory_default() -> Result<Self> {
        Self::in_memory(Arc::new(SystemClock)).await
    }

    /// Apply the schema.
    ///
    /// Safe to call any number of times; existing tables and rows are untouched.
    pub async fn initialize(&self) -> Result<()> {
        self.call(|conn| {
            // WAL keeps committed rows across crashes without blocking readers.
            let mode: String =
                conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            debug!("Journal mode: {}", mode);

            conn.execute_batch(CORE_SCHEMA)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
            Ok(())
        })
        .await
    }

    /// Create the mirror table for `table` if it does not exist yet.
    pub async fn ensure_entity_table(&self, table: &TableName) -> Result<()> {
        let ddl = schema::entity_table_ddl(table);
        self.call(move |conn| conn.execute_batch(&ddl)).await
    }

    /// Whether the mirror table for `table` exists.
    pub async fn has_entity_table(&self, table: &TableName) -> Result<bool> {
        let name = schema::entity_table(table);
        self.call(move |conn| table_exists(conn, &name)).await
    }

    /// Path of the backing database file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Clock used for every timestamp written by this store.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        self.conn.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }

    /// Release the connection.
    ///
    /// Every clone of this handle observes the close; later calls fail with
    /// `NotInitialized`. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Storage("Store lock poisoned".to_string()))?;
            match guard.take() {
                Some(conn) => conn.close().map_err(|(_, e)| storage_err(e)),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| Error::Storage(format!("Store close task failed: {}", e)))??;

        info!("Local store closed");
        Ok(())
    }

    /// Run a statement closure against the shared connection on the blocking pool.
    pub(crate) async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::Storage("Store lock poisoned".to_string()))?;
            let conn = guard
                .as_ref()
                .ok_or_else(|| Error::NotInitialized("Local store is closed".to_string()))?;
            f(conn).map_err(|e| {
                warn!("Store statement failed: {}", e);
                storage_err(e)
            })
        })
        .await
        .map_err(|e| Error::Storage(format!("Store task failed: {}", e)))?
    }
}

/// Check `sqlite_master` for a table.
pub(crate) fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}
