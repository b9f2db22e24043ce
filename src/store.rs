use crate::outcome::{ProbeOutcome, ProbeResult};
use rusqlite::{Connection, params};
use std::path::Path;
use thiserror::Error;

/// Sentinel rtt values used only in the on-disk schema, kept for
/// compatibility with pre-existing `ping_log` databases.
pub const RTT_TIMEOUT: i64 = -1;
pub const RTT_RESOLVE_ERROR: i64 = -2;

/// Timeout assumed for legacy rows that predate the `timeout_val` column.
pub const DEFAULT_TIMEOUT_MS: i64 = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Durable form of a probe outcome. `timestamp` is the canonical storage
/// timestamp and equals the outcome's `end_time`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedRecord {
    pub timestamp: i64,
    pub target: String,
    pub rtt: i64,
    pub ttl: i64,
    pub sequence: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub timeout_budget_ms: i64,
}

impl PersistedRecord {
    pub fn from_outcome(outcome: &ProbeOutcome) -> Self {
        let (rtt, ttl) = match outcome.result {
            ProbeResult::Success { rtt_ms, ttl } => (i64::from(rtt_ms), i64::from(ttl)),
            ProbeResult::Timeout => (RTT_TIMEOUT, 0),
            ProbeResult::ResolveError => (RTT_RESOLVE_ERROR, 0),
        };
        Self {
            timestamp: outcome.end_time,
            target: outcome.target.clone(),
            rtt,
            ttl,
            sequence: i64::from(outcome.sequence),
            start_time: outcome.start_time,
            end_time: outcome.end_time,
            timeout_budget_ms: i64::from(outcome.timeout_budget_ms),
        }
    }

    /// Decode the stored rtt back into the tagged variant.
    pub fn result(&self) -> ProbeResult {
        if self.rtt >= 0 {
            ProbeResult::Success {
                rtt_ms: self.rtt as u32,
                ttl: self.ttl.clamp(0, 255) as u8,
            }
        } else if self.rtt == RTT_RESOLVE_ERROR {
            ProbeResult::ResolveError
        } else {
            ProbeResult::Timeout
        }
    }
}

/// Transactional sink the persistence writer drains into. Implemented by the
/// SQLite store and by scripted fakes in tests.
pub trait RecordSink: Send {
    fn begin(&self) -> Result<(), StoreError>;
    fn commit(&self) -> Result<(), StoreError>;
    fn rollback(&self) -> Result<(), StoreError>;
    fn insert_record(&self, record: &PersistedRecord) -> Result<(), StoreError>;
}

/// Append-only probe log backed by SQLite. Owned by exactly one thread; the
/// persistence writer moves it into its own thread at startup.
pub struct SqliteStore {
    conn: Connection,
}

/// Canonical timestamp in epoch milliseconds. Databases written by older
/// builds stored `timestamp` as DATETIME text, which integer bounds would
/// never match under SQLite's type ordering; text rows are normalized on
/// read (sub-second precision is lost for them).
const TS_MS: &str = "CASE WHEN typeof(timestamp) = 'text'
    THEN CAST(strftime('%s', timestamp) AS INTEGER) * 1000
    ELSE CAST(timestamp AS INTEGER) END";

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // WAL keeps readers (historical queries) unblocked by the writer.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS ping_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER,
                target TEXT,
                rtt INTEGER,
                ttl INTEGER,
                seq INTEGER)",
            [],
        )?;

        // Additive schema evolution; pre-existing rows keep NULLs here.
        for sql in [
            "ALTER TABLE ping_log ADD COLUMN start_time INTEGER",
            "ALTER TABLE ping_log ADD COLUMN return_time INTEGER",
            "ALTER TABLE ping_log ADD COLUMN timeout_val INTEGER",
        ] {
            if let Err(err) = conn.execute(sql, []) {
                if !is_duplicate_column(&err) {
                    return Err(err.into());
                }
            }
        }

        Ok(Self { conn })
    }

    /// Records for `target` whose canonical timestamp falls within
    /// `[start_ms, end_ms]`, ascending. Legacy rows without the newer columns
    /// fall back to the stored timestamp and the default timeout.
    pub fn query_range(
        &self,
        target: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        let sql = format!(
            "SELECT {TS_MS} AS ts_ms, target, rtt, ttl, seq, start_time, return_time, timeout_val
             FROM ping_log
             WHERE target = ?1 AND {TS_MS} BETWEEN ?2 AND ?3
             ORDER BY ts_ms ASC"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![target, start_ms, end_ms], |row| {
            let timestamp: i64 = row.get(0)?;
            let start_time: Option<i64> = row.get(5)?;
            let end_time: Option<i64> = row.get(6)?;
            let timeout_val: Option<i64> = row.get(7)?;
            Ok(PersistedRecord {
                timestamp,
                target: row.get(1)?,
                rtt: row.get::<_, Option<i64>>(2)?.unwrap_or(RTT_TIMEOUT),
                ttl: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                sequence: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                start_time: start_time.filter(|v| *v > 0).unwrap_or(timestamp),
                end_time: end_time.filter(|v| *v > 0).unwrap_or(timestamp),
                timeout_budget_ms: timeout_val.filter(|v| *v > 0).unwrap_or(DEFAULT_TIMEOUT_MS),
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn record_count(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM ping_log", [], |row| row.get(0))?)
    }
}

impl RecordSink for SqliteStore {
    fn begin(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn insert_record(&self, record: &PersistedRecord) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO ping_log
                (timestamp, target, rtt, ttl, seq, start_time, return_time, timeout_val)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        stmt.execute(params![
            record.timestamp,
            record.target,
            record.rtt,
            record.ttl,
            record.sequence,
            record.start_time,
            record.end_time,
            record.timeout_budget_ms,
        ])?;
        Ok(())
    }
}

fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    err.to_string().contains("duplicate column name")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(target: &str, sequence: u32, result: ProbeResult, end_time: i64) -> ProbeOutcome {
        ProbeOutcome {
            target: target.to_string(),
            sequence,
            result,
            start_time: end_time - 5,
            end_time,
            timeout_budget_ms: 1000,
        }
    }

    #[test]
    fn insert_then_query_roundtrips_every_field() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = PersistedRecord::from_outcome(&outcome(
            "a",
            3,
            ProbeResult::Success { rtt_ms: 17, ttl: 54 },
            10_000,
        ));
        store.insert_record(&record).unwrap();

        let got = store.query_range("a", 0, 20_000).unwrap();
        assert_eq!(got, vec![record]);
    }

    #[test]
    fn sentinels_encode_and_decode() {
        let timeout = PersistedRecord::from_outcome(&outcome("a", 1, ProbeResult::Timeout, 100));
        assert_eq!(timeout.rtt, RTT_TIMEOUT);
        assert_eq!(timeout.result(), ProbeResult::Timeout);

        let resolve =
            PersistedRecord::from_outcome(&outcome("a", 2, ProbeResult::ResolveError, 100));
        assert_eq!(resolve.rtt, RTT_RESOLVE_ERROR);
        assert_eq!(resolve.result(), ProbeResult::ResolveError);

        let success = PersistedRecord::from_outcome(&outcome(
            "a",
            3,
            ProbeResult::Success { rtt_ms: 0, ttl: 64 },
            100,
        ));
        assert_eq!(success.result(), ProbeResult::Success { rtt_ms: 0, ttl: 64 });
    }

    #[test]
    fn query_filters_by_target_and_range_and_sorts_ascending() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (target, seq, ts) in [("a", 2, 200), ("a", 1, 100), ("b", 1, 150), ("a", 3, 900)] {
            let record = PersistedRecord::from_outcome(&outcome(
                target,
                seq,
                ProbeResult::Success { rtt_ms: 5, ttl: 64 },
                ts,
            ));
            store.insert_record(&record).unwrap();
        }

        let got = store.query_range("a", 100, 500).unwrap();
        let timestamps: Vec<i64> = got.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![100, 200]);
        assert!(got.iter().all(|r| r.target == "a"));
    }

    #[test]
    fn legacy_rows_fall_back_to_timestamp_and_default_timeout() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO ping_log (timestamp, target, rtt, ttl, seq) VALUES (500, 'a', -1, 0, 7)",
                [],
            )
            .unwrap();

        let got = store.query_range("a", 0, 1000).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].start_time, 500);
        assert_eq!(got[0].end_time, 500);
        assert_eq!(got[0].timeout_budget_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(got[0].result(), ProbeResult::Timeout);
    }

    #[test]
    fn legacy_text_timestamps_normalize_to_epoch_millis() {
        let store = SqliteStore::open_in_memory().unwrap();
        // Rows as older builds wrote them: timestamp bound as DATETIME text.
        store
            .conn
            .execute(
                "INSERT INTO ping_log (timestamp, target, rtt, ttl, seq)
                 VALUES ('2024-01-01T00:00:10.000', 'a', 25, 64, 1)",
                [],
            )
            .unwrap();
        store
            .insert_record(&PersistedRecord::from_outcome(&outcome(
                "a",
                2,
                ProbeResult::Success { rtt_ms: 9, ttl: 64 },
                1_704_067_220_000,
            )))
            .unwrap();

        let got = store.query_range("a", 0, i64::MAX).unwrap();
        let timestamps: Vec<i64> = got.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![1_704_067_210_000, 1_704_067_220_000]);
        assert_eq!(got[0].result(), ProbeResult::Success { rtt_ms: 25, ttl: 64 });
        assert_eq!(got[0].start_time, 1_704_067_210_000);
        assert_eq!(got[0].timeout_budget_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn migration_is_idempotent_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pinglog.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .insert_record(&PersistedRecord::from_outcome(&outcome(
                    "a",
                    1,
                    ProbeResult::Timeout,
                    100,
                )))
                .unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.record_count().unwrap(), 1);
    }

    #[test]
    fn rollback_discards_the_open_batch() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.begin().unwrap();
        store
            .insert_record(&PersistedRecord::from_outcome(&outcome(
                "a",
                1,
                ProbeResult::Timeout,
                100,
            )))
            .unwrap();
        store.rollback().unwrap();
        assert_eq!(store.record_count().unwrap(), 0);

        store.begin().unwrap();
        store
            .insert_record(&PersistedRecord::from_outcome(&outcome(
                "a",
                2,
                ProbeResult::Timeout,
                200,
            )))
            .unwrap();
        store.commit().unwrap();
        assert_eq!(store.record_count().unwrap(), 1);
    }
}
