//! SQLite storage pool with scoped connection handles.
//!
//! A request acquires a [`StorageHandle`] at its start and the connection goes
//! back to the pool when the handle drops, whichever way the request ends.

use carebot_core::config::{StorageConfig, expand_path};
use carebot_core::error::{CarebotError, Result};
use rusqlite::{Connection, ErrorCode};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded pool of SQLite connections to one database file.
pub struct Storage {
    path: PathBuf,
    busy_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    pool_size: usize,
}

impl Storage {
    /// Open (or create) the database and run schema setup.
    pub fn open(path: &Path, pool_size: usize, busy_timeout: Duration) -> Result<Arc<Self>> {
        if pool_size == 0 {
            return Err(CarebotError::Config("storage pool_size must be > 0".into()));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = open_connection(path, busy_timeout)?;
        if let Err(e) = conn.execute_batch("PRAGMA journal_mode=WAL;") {
            tracing::warn!("Could not enable WAL on {}, using the default journal: {e}", path.display());
        }
        crate::chat::ensure_schema(&conn)?;

        tracing::debug!("Storage opened at {} (pool size {pool_size})", path.display());

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            busy_timeout,
            idle: Mutex::new(vec![conn]),
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
        }))
    }

    pub fn from_config(config: &StorageConfig) -> Result<Arc<Self>> {
        Self::open(
            &expand_path(&config.path),
            config.pool_size,
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of handles that can be acquired right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Acquire a connection, waiting while the pool is exhausted.
    pub async fn acquire(self: &Arc<Self>) -> Result<StorageHandle> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CarebotError::Unavailable("storage pool closed".into()))?;

        let reused = self
            .idle
            .lock()
            .map_err(|e| CarebotError::Storage(format!("Lock: {e}")))?
            .pop();
        let conn = match reused {
            Some(conn) => conn,
            None => open_connection(&self.path, self.busy_timeout)?,
        };

        Ok(StorageHandle {
            conn: Some(conn),
            storage: Arc::clone(self),
            _permit: permit,
        })
    }

    fn release(&self, conn: Connection) {
        match self.idle.lock() {
            Ok(mut idle) => idle.push(conn),
            Err(e) => tracing::warn!("Dropping storage connection, pool lock poisoned: {e}"),
        }
    }
}

/// A pooled connection, returned to the pool on drop.
pub struct StorageHandle {
    conn: Option<Connection>,
    storage: Arc<Storage>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for StorageHandle {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `Drop` takes the connection out.
        self.conn.as_ref().expect("storage handle used after release")
    }
}

impl DerefMut for StorageHandle {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("storage handle used after release")
    }
}

impl Drop for StorageHandle {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.storage.release(conn);
        }
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path).map_err(|e| {
        CarebotError::Unavailable(format!("cannot open {}: {e}", path.display()))
    })?;
    conn.busy_timeout(busy_timeout).map_err(sqlite_error)?;
    Ok(conn)
}

/// Classify a SQLite error: contention and I/O failures are unavailability,
/// everything else is a storage error.
pub fn sqlite_error(e: rusqlite::Error) -> CarebotError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure => CarebotError::Unavailable(e.to_string()),
            _ => CarebotError::Storage(e.to_string()),
        },
        _ => CarebotError::Storage(e.to_string()),
    }
}

/// Whether the error is a uniqueness/primary-key violation.
pub fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}
