//! Database connection management with pragma configuration.
//!
//! This module handles opening the authoritative SQLite store, applying
//! required pragmas for performance and concurrency (WAL mode), and running
//! migrations.

use super::migrations;
use super::writer_lock::WriterClaim;
use crate::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio_rusqlite::Connection;

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA temp_store=MEMORY;
     PRAGMA foreign_keys=ON;";

/// Authoritative store handle.
///
/// Wraps a tokio-rusqlite Connection that runs database operations
/// on a background thread. Clones share the connection. The writer slot is
/// claimed through a lock file beside the database, so separate handles on the
/// same path contend for it too.
/// Read methods are public; every write goes through
/// [`MutationPipeline`](crate::pipeline::MutationPipeline).
#[derive(Clone, Debug)]
pub struct CacheDb {
    pub(crate) conn: Connection,
    path: Option<PathBuf>,
    memory_writer: Arc<AtomicBool>,
}

impl CacheDb {
    /// Open a database at the specified path.
    ///
    /// Creates the file if it doesn't exist, applies performance pragmas,
    /// and runs any pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn, Some(path)).await
    }

    /// Open an in-memory database for testing.
    ///
    /// Creates a temporary in-memory SQLite database with the same
    /// pragma configuration as file-based databases.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::Database(e.into()))?;
        Self::init(conn, None).await
    }

    async fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, Error> {
        conn.call(|conn| {
            conn.execute_batch(PRAGMAS)?;
            Ok(())
        })
        .await
        .map_err(Error::Database)?;

        migrations::run(&conn).await?;

        Ok(Self { conn, path, memory_writer: Arc::new(AtomicBool::new(false)) })
    }

    /// Claim the single writer slot for this store. The slot is held until
    /// the returned claim is dropped.
    pub(crate) fn claim_writer(&self) -> Result<WriterClaim, Error> {
        match &self.path {
            Some(path) => WriterClaim::acquire_file(path),
            None => WriterClaim::acquire_memory(&self.memory_writer),
        }
    }
}
