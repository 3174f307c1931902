//! Cross-handle claim on a store's single writer slot.
//!
//! A file-backed store is claimed by creating `<db_path>.writer.lock` with
//! `create_new`, so two handles (or two processes) opening the same path
//! cannot both hold the mutation pipeline. The file carries the holder's pid
//! and start time and is removed when the claim is dropped. A lock left by a
//! crashed process must be removed by the operator after checking the pid.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Who holds the writer slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterLockMeta {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Path of the lock file guarding the store at `db_path`.
pub fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".writer.lock");
    PathBuf::from(name)
}

/// Held writer slot. Dropping it frees the slot.
#[derive(Debug)]
pub enum WriterClaim {
    /// Lock file beside an on-disk store.
    File { path: PathBuf },
    /// Flag shared by clones of an in-memory store, which no other handle can open.
    Memory(Arc<AtomicBool>),
}

impl WriterClaim {
    pub(crate) fn acquire_file(db_path: &Path) -> Result<Self, Error> {
        let path = lock_path(db_path);
        if let Ok(meta) = fs::symlink_metadata(&path)
            && meta.file_type().is_symlink()
        {
            return Err(Error::InvalidInput(format!("writer lock {} is a symlink", path.display())));
        }

        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match read_meta(&path) {
                    Ok(holder) => tracing::warn!(
                        path = %path.display(),
                        pid = holder.pid,
                        started_at = %holder.started_at,
                        "writer lock held"
                    ),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "writer lock held by unknown holder"),
                }
                return Err(Error::WriterTaken);
            }
            Err(e) => return Err(Error::WriterLock(e)),
        };

        let meta = WriterLockMeta { pid: std::process::id(), started_at: Utc::now() };
        let written = serde_json::to_vec(&meta)
            .map_err(io::Error::other)
            .and_then(|bytes| file.write_all(&bytes))
            .and_then(|()| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&path);
            return Err(Error::WriterLock(e));
        }

        Ok(Self::File { path })
    }

    pub(crate) fn acquire_memory(flag: &Arc<AtomicBool>) -> Result<Self, Error> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::WriterTaken)?;
        Ok(Self::Memory(flag.clone()))
    }
}

impl Drop for WriterClaim {
    fn drop(&mut self) {
        match self {
            Self::File { path } => {
                if let Err(e) = fs::remove_file(&*path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove writer lock");
                }
            }
            Self::Memory(flag) => flag.store(false, Ordering::Release),
        }
    }
}

/// Read the holder recorded in a lock file.
pub fn read_meta(path: &Path) -> io::Result<WriterLockMeta> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(io::Error::other)
}
