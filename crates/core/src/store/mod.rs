//! SQLite-backed authoritative store for canonical answers.
//!
//! This module provides the single source of truth that replicas copy from,
//! using SQLite with async access via tokio-rusqlite. It supports:
//!
//! - `key:version` rows plus a `key:current` pointer
//! - Compare-and-swap version advancement inside one transaction
//! - An append-only audit log that doubles as the replication feed
//! - A review queue for candidates awaiting human adjudication
//! - Automatic schema migrations and WAL mode

pub mod audit;
pub mod connection;
pub mod entries;
pub mod hash;
pub mod migrations;
pub mod pending;
pub mod writer_lock;

pub use crate::Error;

pub use connection::CacheDb;
pub use entries::ChangeEvent;
pub use writer_lock::WriterClaim;

use chrono::{DateTime, SecondsFormat, Utc};

/// Timestamps are stored as fixed-width RFC 3339 so that text comparison matches time order.
pub(crate) fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(s: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_time_roundtrip_preserves_order() {
        use chrono::SubsecRound;

        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(1);
        assert!(to_db_time(earlier) < to_db_time(later));
        assert_eq!(from_db_time(&to_db_time(earlier)).unwrap(), earlier.trunc_subsecs(6));
    }

    #[test]
    fn test_bad_time_is_corrupt() {
        assert!(matches!(from_db_time("yesterday"), Err(Error::Corrupt(_))));
    }
}
