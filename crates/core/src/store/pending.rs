//! Review queue for candidates that need human adjudication.

use super::connection::CacheDb;
use super::{from_db_time, to_db_time};
use crate::Error;
use crate::model::{CanonicalKey, PendingCandidate, PolicyScore, QueuedCandidate};
use chrono::{DateTime, Utc};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, Connection, Row};

const PENDING_COLUMNS: &str =
    "id, key, draft_value, policy_score_json, requires_human, failure_reason, observed_version, submitted_at";

type PendingRow = (i64, String, String, String, bool, Option<String>, i64, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<PendingRow> {
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

fn decode(row: PendingRow) -> Result<QueuedCandidate, Error> {
    let (id, key, draft_value, policy_json, requires_human, failure_reason, observed_version, submitted_at) = row;
    let policy_score: PolicyScore = serde_json::from_str(&policy_json)
        .map_err(|e| Error::Corrupt(format!("bad policy score for candidate {id}: {e}")))?;

    Ok(QueuedCandidate {
        id,
        candidate: PendingCandidate {
            key: CanonicalKey::new(key),
            draft_value,
            policy_score,
            requires_human,
            failure_reason,
        },
        observed_version: observed_version as u64,
        submitted_at: from_db_time(&submitted_at)?,
    })
}

/// Remove a queued candidate inside a caller's transaction.
pub(crate) fn delete(conn: &Connection, id: i64) -> Result<(), Error> {
    let removed = conn.execute("DELETE FROM pending_candidates WHERE id = ?1", params![id])?;
    if removed == 0 {
        return Err(Error::NotFound(format!("pending candidate {id}")));
    }
    Ok(())
}

impl CacheDb {
    /// Park a candidate for review. Returns the queue id.
    pub(crate) async fn enqueue_candidate(
        &self, candidate: &PendingCandidate, observed_version: u64, now: DateTime<Utc>,
    ) -> Result<i64, Error> {
        let candidate = candidate.clone();
        let policy_json = serde_json::to_string(&candidate.policy_score)
            .map_err(|e| Error::InvalidInput(format!("unserializable policy score: {e}")))?;
        let submitted_at = to_db_time(now);

        self.conn
            .call(move |conn| -> Result<i64, Error> {
                conn.execute(
                    "INSERT INTO pending_candidates (
                        key, draft_value, policy_score_json, requires_human, failure_reason,
                        observed_version, submitted_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        candidate.key.as_str(),
                        &candidate.draft_value,
                        policy_json,
                        candidate.requires_human,
                        &candidate.failure_reason,
                        observed_version as i64,
                        submitted_at,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(Error::from)
    }

    /// Drop a candidate without committing it.
    pub(crate) async fn discard_candidate(&self, id: i64) -> Result<(), Error> {
        self.conn
            .call(move |conn| -> Result<(), Error> { delete(conn, id) })
            .await
            .map_err(Error::from)
    }

    /// Get one queued candidate by id.
    pub async fn get_pending(&self, id: i64) -> Result<Option<QueuedCandidate>, Error> {
        self.conn
            .call(move |conn| -> Result<Option<QueuedCandidate>, Error> {
                let sql = format!("SELECT {PENDING_COLUMNS} FROM pending_candidates WHERE id = ?1");
                match conn.query_row(&sql, params![id], read_row) {
                    Ok(row) => decode(row).map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Queued candidates, oldest first.
    pub async fn list_pending(&self, limit: u32) -> Result<Vec<QueuedCandidate>, Error> {
        self.conn
            .call(move |conn| -> Result<Vec<QueuedCandidate>, Error> {
                let sql = format!("SELECT {PENDING_COLUMNS} FROM pending_candidates ORDER BY id ASC LIMIT ?1");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![limit as i64], read_row)?
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

    fn candidate(key: &str) -> PendingCandidate {
        PendingCandidate {
            key: key.into(),
            draft_value: "Open Orders and choose Cancel.".into(),
            policy_score: PolicyScore { sensitive_data: 0.4, genericness: 0.9, actionability: 0.9, safety: 1.0 },
            requires_human: false,
            failure_reason: Some("sensitive_data above threshold".into()),
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_list() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let first = db.enqueue_candidate(&candidate("a"), 0, Utc::now()).await.unwrap();
        let second = db.enqueue_candidate(&candidate("b"), 3, Utc::now()).await.unwrap();
        assert!(second > first);

        let queued = db.list_pending(10).await.unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].candidate, candidate("a"));
        assert_eq!(queued[1].observed_version, 3);

        let one = db.get_pending(second).await.unwrap().unwrap();
        assert_eq!(one.candidate.key.as_str(), "b");
    }

    #[tokio::test]
    async fn test_discard() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let id = db.enqueue_candidate(&candidate("a"), 0, Utc::now()).await.unwrap();
        db.discard_candidate(id).await.unwrap();
        assert!(db.get_pending(id).await.unwrap().is_none());
        assert!(matches!(db.discard_candidate(id).await, Err(Error::NotFound(_))));
    }
}
