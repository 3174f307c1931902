//! Entry reads and the compare-and-swap write path.
//!
//! Reads are public. Writes are crate-private and only reachable through the
//! mutation pipeline, so no serving-path handle can change an entry.

use super::connection::CacheDb;
use super::hash::content_hash;
use super::{audit, from_db_time, pending, to_db_time};
use crate::Error;
use crate::model::{Approval, AuditAction, CacheEntry, CanonicalKey, EntryStatus};
use chrono::{DateTime, Utc};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, Connection, Row, TransactionBehavior};

const ENTRY_COLUMNS: &str = "e.key, e.version, e.value, e.approved_by, e.approved_at, e.status, e.content_hash, \
     e.invalidated_at, e.purge_after";

/// An entry row before timestamps and status are decoded.
struct EntryRow {
    key: String,
    version: i64,
    value: String,
    approved_by: String,
    approved_at: String,
    status: String,
    content_hash: String,
    invalidated_at: Option<String>,
    purge_after: Option<String>,
}

impl EntryRow {
    /// Read the `ENTRY_COLUMNS` block starting at column `at`.
    fn read(row: &Row<'_>, at: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(at)?,
            version: row.get(at + 1)?,
            value: row.get(at + 2)?,
            approved_by: row.get(at + 3)?,
            approved_at: row.get(at + 4)?,
            status: row.get(at + 5)?,
            content_hash: row.get(at + 6)?,
            invalidated_at: row.get(at + 7)?,
            purge_after: row.get(at + 8)?,
        })
    }

    fn decode(self) -> Result<CacheEntry, Error> {
        let status = EntryStatus::from_db_str(&self.status)
            .ok_or_else(|| Error::Corrupt(format!("unknown status {:?}", self.status)))?;
        Ok(CacheEntry {
            key: CanonicalKey::new(self.key),
            value: self.value,
            version: self.version as u64,
            approved_by: self.approved_by,
            approved_at: from_db_time(&self.approved_at)?,
            status,
            content_hash: self.content_hash,
            invalidated_at: self.invalidated_at.as_deref().map(from_db_time).transpose()?,
            purge_after: self.purge_after.as_deref().map(from_db_time).transpose()?,
        })
    }
}

/// One item of the replication feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub seq: i64,
    pub key: CanonicalKey,
    pub version: u64,
    /// `None` when the row was physically removed after its grace period.
    pub entry: Option<CacheEntry>,
}

/// Current store contents and the feed position they reflect.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub entries: Vec<CacheEntry>,
    /// Keys whose rows were purged, with their version high-water mark.
    pub purged: Vec<(CanonicalKey, u64)>,
    pub head_seq: i64,
}

/// Everything a commit needs, gathered by the pipeline.
#[derive(Debug, Clone)]
pub(crate) struct CommitRequest {
    pub key: CanonicalKey,
    pub value: String,
    pub expected_version: u64,
    pub approval: Approval,
    pub now: DateTime<Utc>,
    /// Review-queue row consumed by this commit, in the same transaction.
    pub consume_pending: Option<i64>,
}

fn read_current_version(conn: &Connection, key: &str) -> Result<u64, Error> {
    let version: Option<i64> = match conn.query_row("SELECT version FROM current WHERE key = ?1", params![key], |row| {
        row.get(0)
    }) {
        Ok(v) => Some(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => None,
        Err(e) => return Err(e.into()),
    };
    Ok(version.unwrap_or(0) as u64)
}

/// Advance `key:current` from `expected` to `expected + 1`, or report the version that won.
fn compare_and_swap(conn: &Connection, key: &str, expected: u64) -> Result<u64, Error> {
    let (expected_db, next_db) = i64::try_from(expected)
        .ok()
        .and_then(|e| e.checked_add(1).map(|next| (e, next)))
        .ok_or_else(|| Error::InvalidInput(format!("version {expected} is out of range")))?;
    let changed = if expected == 0 {
        conn.execute(
            "INSERT INTO current (key, version) VALUES (?1, ?2) ON CONFLICT(key) DO NOTHING",
            params![key, next_db],
        )?
    } else {
        conn.execute(
            "UPDATE current SET version = ?2 WHERE key = ?1 AND version = ?3",
            params![key, next_db, expected_db],
        )?
    };

    if changed == 0 {
        let actual = read_current_version(conn, key)?;
        return Err(Error::ConcurrentModification { key: key.to_string(), expected, actual });
    }
    Ok(next_db as u64)
}

fn insert_entry(conn: &Connection, entry: &CacheEntry) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO entries (
            key, version, value, approved_by, approved_at, status, content_hash, invalidated_at, purge_after
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.key.as_str(),
            entry.version as i64,
            &entry.value,
            &entry.approved_by,
            to_db_time(entry.approved_at),
            entry.status.as_db_str(),
            &entry.content_hash,
            entry.invalidated_at.map(to_db_time),
            entry.purge_after.map(to_db_time),
        ],
    )?;
    Ok(())
}

fn select_entry(conn: &Connection, key: &str, version: u64) -> Result<Option<CacheEntry>, Error> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries e WHERE e.key = ?1 AND e.version = ?2");
    match conn.query_row(&sql, params![key, version as i64], |row| EntryRow::read(row, 0)) {
        Ok(row) => row.decode().map(Some),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl CacheDb {
    /// Get the current entry for a key, whatever its status.
    ///
    /// Returns None if the key was never committed or has been purged.
    pub async fn get_current(&self, key: &CanonicalKey) -> Result<Option<CacheEntry>, Error> {
        let key = key.as_str().to_string();
        self.conn
            .call(move |conn| -> Result<Option<CacheEntry>, Error> {
                let version = read_current_version(conn, &key)?;
                if version == 0 {
                    return Ok(None);
                }
                select_entry(conn, &key, version)
            })
            .await
            .map_err(Error::from)
    }

    /// Get one historical `key:version` row.
    pub async fn get_version(&self, key: &CanonicalKey, version: u64) -> Result<Option<CacheEntry>, Error> {
        let key = key.as_str().to_string();
        self.conn
            .call(move |conn| -> Result<Option<CacheEntry>, Error> { select_entry(conn, &key, version) })
            .await
            .map_err(Error::from)
    }

    /// Version of the `key:current` pointer, 0 if the key was never committed.
    pub async fn current_version(&self, key: &CanonicalKey) -> Result<u64, Error> {
        let key = key.as_str().to_string();
        self.conn
            .call(move |conn| -> Result<u64, Error> { read_current_version(conn, &key) })
            .await
            .map_err(Error::from)
    }

    /// Highest audit sequence number written so far.
    pub async fn head_seq(&self) -> Result<i64, Error> {
        self.conn
            .call(|conn| -> Result<i64, Error> {
                let seq = conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM audit_log", [], |row| row.get(0))?;
                Ok(seq)
            })
            .await
            .map_err(Error::from)
    }

    /// Every current entry, read in one transaction together with the feed head.
    pub async fn snapshot(&self) -> Result<Snapshot, Error> {
        self.conn
            .call(|conn| -> Result<Snapshot, Error> {
                let tx = conn.transaction()?;
                let head_seq: i64 = tx.query_row("SELECT COALESCE(MAX(seq), 0) FROM audit_log", [], |row| row.get(0))?;
                let rows = {
                    let sql = format!(
                        "SELECT {ENTRY_COLUMNS} FROM current c
                         JOIN entries e ON e.key = c.key AND e.version = c.version
                         ORDER BY e.key"
                    );
                    let mut stmt = tx.prepare(&sql)?;
                    stmt.query_map([], |row| EntryRow::read(row, 0))?
                        .collect::<Result<Vec<_>, _>>()?
                };
                let purged = {
                    let mut stmt = tx.prepare(
                        "SELECT c.key, c.version FROM current c
                         LEFT JOIN entries e ON e.key = c.key AND e.version = c.version
                         WHERE e.key IS NULL
                         ORDER BY c.key",
                    )?;
                    stmt.query_map([], |row| {
                        Ok((CanonicalKey::new(row.get::<_, String>(0)?), row.get::<_, i64>(1)? as u64))
                    })?
                    .collect::<Result<Vec<_>, _>>()?
                };
                tx.commit()?;

                let entries = rows.into_iter().map(EntryRow::decode).collect::<Result<Vec<_>, _>>()?;
                Ok(Snapshot { entries, purged, head_seq })
            })
            .await
            .map_err(Error::from)
    }

    /// Feed items with `seq > after_seq`, oldest first.
    pub async fn changes_since(&self, after_seq: i64, limit: u32) -> Result<Vec<ChangeEvent>, Error> {
        self.conn
            .call(move |conn| -> Result<Vec<ChangeEvent>, Error> {
                let sql = format!(
                    "SELECT a.seq, a.key, a.version, {ENTRY_COLUMNS}
                     FROM audit_log a
                     LEFT JOIN entries e ON e.key = a.key AND e.version = a.version
                     WHERE a.seq > ?1
                     ORDER BY a.seq ASC
                     LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![after_seq, limit as i64], |row| {
                        let seq: i64 = row.get(0)?;
                        let key: String = row.get(1)?;
                        let version: i64 = row.get(2)?;
                        let present: Option<String> = row.get(3)?;
                        let entry = match present {
                            Some(_) => Some(EntryRow::read(row, 3)?),
                            None => None,
                        };
                        Ok((seq, key, version, entry))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                rows.into_iter()
                    .map(|(seq, key, version, entry)| {
                        Ok(ChangeEvent {
                            seq,
                            key: CanonicalKey::new(key),
                            version: version as u64,
                            entry: entry.map(EntryRow::decode).transpose()?,
                        })
                    })
                    .collect()
            })
            .await
            .map_err(Error::from)
    }

    /// Write a new version if `expected_version` still matches `key:current`.
    ///
    /// The pointer swap, the entry row, the audit record and the optional
    /// review-queue removal commit or roll back together.
    pub(crate) async fn commit_entry(&self, req: CommitRequest) -> Result<CacheEntry, Error> {
        let policy_json = req
            .approval
            .policy_score()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::InvalidInput(format!("unserializable policy score: {e}")))?;

        self.conn
            .call(move |conn| -> Result<CacheEntry, Error> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let key = req.key.as_str();

                let version = compare_and_swap(&tx, key, req.expected_version)?;
                let entry = CacheEntry {
                    key: req.key.clone(),
                    content_hash: content_hash(key, &req.value),
                    value: req.value,
                    version,
                    approved_by: req.approval.approver().to_string(),
                    approved_at: req.now,
                    status: EntryStatus::Active,
                    invalidated_at: None,
                    purge_after: None,
                };
                insert_entry(&tx, &entry)?;
                audit::append(&tx, &entry, AuditAction::Commit, policy_json.as_deref(), req.now)?;

                if let Some(id) = req.consume_pending {
                    pending::delete(&tx, id)?;
                }

                tx.commit()?;
                Ok(entry)
            })
            .await
            .map_err(Error::from)
    }

    /// Soft-invalidate the current entry by writing an `INVALID` successor version.
    pub(crate) async fn invalidate_entry(
        &self, key: &CanonicalKey, expected_version: u64, approver: &str, now: DateTime<Utc>, grace: chrono::Duration,
    ) -> Result<CacheEntry, Error> {
        let key = key.clone();
        let approver = approver.to_string();
        self.conn
            .call(move |conn| -> Result<CacheEntry, Error> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let version = compare_and_swap(&tx, key.as_str(), expected_version)?;
                let previous = select_entry(&tx, key.as_str(), expected_version)?
                    .ok_or_else(|| Error::NotFound(format!("{key} has no entry at version {expected_version}")))?;
                if !previous.is_servable() {
                    return Err(Error::InvalidInput(format!("{key} is already invalid")));
                }

                let entry = CacheEntry {
                    version,
                    approved_by: approver,
                    approved_at: now,
                    status: EntryStatus::Invalid,
                    invalidated_at: Some(now),
                    purge_after: Some(now + grace),
                    ..previous
                };
                insert_entry(&tx, &entry)?;
                audit::append(&tx, &entry, AuditAction::Invalidate, None, now)?;

                tx.commit()?;
                Ok(entry)
            })
            .await
            .map_err(Error::from)
    }

    /// Physically remove keys whose current entry is invalid and past its grace period.
    ///
    /// The `key:current` pointer stays behind as a version high-water mark.
    /// Returns the number of purged keys.
    pub(crate) async fn purge_invalidated(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let now = to_db_time(now);
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let keys = {
                    let mut stmt = tx.prepare(
                        "SELECT c.key FROM current c
                         JOIN entries e ON e.key = c.key AND e.version = c.version
                         WHERE e.status = 'INVALID' AND e.purge_after <= ?1",
                    )?;
                    stmt.query_map(params![now], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?
                };

                for key in &keys {
                    tx.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
                }

                tx.commit()?;
                Ok(keys.len() as u64)
            })
            .await
            .map_err(Error::from)
    }
}
