//! Append-only audit trail.
//!
//! Rows are appended inside the transaction that writes the entry they
//! describe. The table has no update or delete path here, and SQLite
//! triggers abort any attempt made elsewhere.

use super::connection::CacheDb;
use super::{from_db_time, to_db_time};
use crate::Error;
use crate::model::{AuditAction, AuditRecord, CacheEntry, CanonicalKey, PolicyScore};
use chrono::{DateTime, Utc};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, Connection, Row};

const AUDIT_COLUMNS: &str = "seq, key, version, action, content_hash, approver, policy_score_json, recorded_at";

/// Append one record and return its sequence number.
pub(crate) fn append(
    conn: &Connection, entry: &CacheEntry, action: AuditAction, policy_json: Option<&str>, at: DateTime<Utc>,
) -> Result<i64, Error> {
    conn.execute(
        "INSERT INTO audit_log (key, version, action, content_hash, approver, policy_score_json, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.key.as_str(),
            entry.version as i64,
            action.as_db_str(),
            &entry.content_hash,
            &entry.approved_by,
            policy_json,
            to_db_time(at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

type AuditRow = (i64, String, i64, String, String, String, Option<String>, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<AuditRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode(row: AuditRow) -> Result<AuditRecord, Error> {
    let (seq, key, version, action, content_hash, approver, policy_json, recorded_at) = row;
    let action =
        AuditAction::from_db_str(&action).ok_or_else(|| Error::Corrupt(format!("unknown audit action {action:?}")))?;
    let policy_score = policy_json
        .map(|json| serde_json::from_str::<PolicyScore>(&json))
        .transpose()
        .map_err(|e| Error::Corrupt(format!("bad policy score at seq {seq}: {e}")))?;

    Ok(AuditRecord {
        seq,
        key: CanonicalKey::new(key),
        version: version as u64,
        action,
        content_hash,
        approver,
        policy_score,
        recorded_at: from_db_time(&recorded_at)?,
    })
}

impl CacheDb {
    /// Audit records with `seq > after_seq`, oldest first.
    pub async fn audit_log(&self, after_seq: i64, limit: u32) -> Result<Vec<AuditRecord>, Error> {
        self.conn
            .call(move |conn| -> Result<Vec<AuditRecord>, Error> {
                let sql = format!("SELECT {AUDIT_COLUMNS} FROM audit_log WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![after_seq, limit as i64], read_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(decode).collect()
            })
            .await
            .map_err(Error::from)
    }

    /// Every audit record for one key, oldest first.
    pub async fn audit_for_key(&self, key: &CanonicalKey) -> Result<Vec<AuditRecord>, Error> {
        let key = key.as_str().to_string();
        self.conn
            .call(move |conn| -> Result<Vec<AuditRecord>, Error> {
                let sql = format!("SELECT {AUDIT_COLUMNS} FROM audit_log WHERE key = ?1 ORDER BY seq ASC");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![key], read_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(decode).collect()
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Approval, EntryStatus};
    use crate::store::entries::CommitRequest;
    use crate::store::hash::content_hash;

    #[tokio::test]
    async fn test_commit_writes_one_record() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let score = PolicyScore { sensitive_data: 0.0, genericness: 0.9, actionability: 0.8, safety: 1.0 };
        db.commit_entry(CommitRequest {
            key: "cancel_order".into(),
            value: "Open Orders and choose Cancel.".into(),
            expected_version: 0,
            approval: Approval::Auto { score },
            now: Utc::now(),
            consume_pending: None,
        })
        .await
        .unwrap();

        let records = db.audit_log(0, 100).await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.seq, 1);
        assert_eq!(record.version, 1);
        assert_eq!(record.action, AuditAction::Commit);
        assert_eq!(record.approver, "AUTO");
        assert_eq!(record.policy_score, Some(score));
        assert_eq!(record.content_hash, content_hash("cancel_order", "Open Orders and choose Cancel."));
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_record() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let stale = CommitRequest {
            key: "k".into(),
            value: "v".into(),
            expected_version: 4,
            approval: Approval::human("alice"),
            now: Utc::now(),
            consume_pending: None,
        };
        assert!(db.commit_entry(stale).await.is_err());
        assert!(db.audit_log(0, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_for_key_includes_invalidation() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let entry = db
            .commit_entry(CommitRequest {
                key: "k".into(),
                value: "v".into(),
                expected_version: 0,
                approval: Approval::human("alice"),
                now: Utc::now(),
                consume_pending: None,
            })
            .await
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Active);
        db.invalidate_entry(&"k".into(), 1, "bob", Utc::now(), chrono::Duration::seconds(5))
            .await
            .unwrap();

        let records = db.audit_for_key(&"k".into()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].action, AuditAction::Invalidate);
        assert_eq!(records[1].approver, "bob");
        assert!(records[1].policy_score.is_none());
    }
}
