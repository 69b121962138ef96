//! SQLite-backed store for endpoint results and performance entries.
//!
//! Records are keyed by `(app, endpoint, URL, check time)`. The check time
//! key is an RFC 3339 string in UTC with explicit offset, so ascending
//! lexicographic order equals ascending time order and date windows can be
//! served with plain range comparisons. The full record is stored as JSON;
//! the `valid` and `body_changed` flags are duplicated into columns to
//! serve the filtered last-N queries.

use chrono::{DateTime, NaiveTime, SecondsFormat, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::StoreError;
use crate::models::{EndpointResult, PerformanceEntry, PerformanceRecord};

pub type SqlitePool = r2d2::Pool<SqliteConnectionManager>;

/// Capacity of the result log channel drained by the writer worker.
pub const RESULT_CHANNEL_CAPACITY: usize = 100;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS endpoint_results (
    app_key      TEXT NOT NULL,
    endpoint_key TEXT NOT NULL,
    url          TEXT NOT NULL,
    check_time   TEXT NOT NULL,
    valid        INTEGER NOT NULL,
    body_changed INTEGER NOT NULL,
    record       TEXT NOT NULL,
    PRIMARY KEY (app_key, endpoint_key, url, check_time)
);
CREATE TABLE IF NOT EXISTS performance_log (
    app_key      TEXT NOT NULL,
    endpoint_key TEXT NOT NULL,
    url          TEXT NOT NULL,
    check_time   TEXT NOT NULL,
    record       TEXT NOT NULL,
    PRIMARY KEY (app_key, endpoint_key, url, check_time)
);
";

/// Encodes a check time as its storage key.
pub fn time_key(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, false)
}

fn parse_time_key(key: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(key)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Start and end keys of the half-open UTC day window containing `date`.
fn day_window(date: &DateTime<Utc>) -> (String, String) {
    let start = date
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc();
    let end = start + chrono::Duration::hours(24);
    (time_key(&start), time_key(&end))
}

#[derive(Clone)]
pub struct ResultStore {
    pool: SqlitePool,
}

impl ResultStore {
    /// Opens (creating if necessary) the database file and its schema.
    pub fn open(path: &Path) -> Result<ResultStore, StoreError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000; PRAGMA synchronous=NORMAL;",
            )
        });
        let pool = r2d2::Pool::builder()
            .build(manager)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
        Ok(ResultStore { pool })
    }

    /// Stores `er` under its four-part key, replacing any record with the
    /// same key. The in-memory body is not written here.
    pub async fn write_endpoint_result(&self, er: &EndpointResult) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let record = serde_json::to_string(er)?;
        conn.execute(
            "INSERT OR REPLACE INTO endpoint_results
                 (app_key, endpoint_key, url, check_time, valid, body_changed, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                er.app_key,
                er.endpoint_key,
                er.url,
                time_key(&er.check_time),
                er.valid() as i64,
                er.body_changed as i64,
                record
            ],
        )?;
        Ok(())
    }

    /// Stores `pe` under the same key and time as `er`.
    pub async fn write_performance_record(
        &self,
        er: &EndpointResult,
        pe: &PerformanceEntry,
    ) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let record = serde_json::to_string(pe)?;
        debug!(
            url = %er.url,
            time = %time_key(&er.check_time),
            "logging performance entry"
        );
        conn.execute(
            "INSERT OR REPLACE INTO performance_log
                 (app_key, endpoint_key, url, check_time, record)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                er.app_key,
                er.endpoint_key,
                er.url,
                time_key(&er.check_time),
                record
            ],
        )?;
        Ok(())
    }

    /// Exact-time lookup. `StoreError::NotFound` when no such key exists.
    pub async fn get_endpoint_result(
        &self,
        app: &str,
        endpoint: &str,
        url: &str,
        time: &DateTime<Utc>,
    ) -> Result<EndpointResult, StoreError> {
        let conn = self.pool.get()?;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM endpoint_results
                 WHERE app_key = ?1 AND endpoint_key = ?2 AND url = ?3 AND check_time = ?4",
                params![app, endpoint, url, time_key(time)],
                |row| row.get(0),
            )
            .optional()?;
        match record {
            Some(r) => Ok(serde_json::from_str(&r)?),
            None => Err(StoreError::NotFound),
        }
    }

    /// All results whose time lies in `[date, date+24h)`, ascending by time.
    pub async fn get_endpoint_results_for_date(
        &self,
        app: &str,
        endpoint: &str,
        url: &str,
        date: &DateTime<Utc>,
    ) -> Result<Vec<EndpointResult>, StoreError> {
        let (min, max) = day_window(date);
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT record FROM endpoint_results
             WHERE app_key = ?1 AND endpoint_key = ?2 AND url = ?3
               AND check_time >= ?4 AND check_time < ?5
             ORDER BY check_time ASC",
        )?;
        let rows = stmt.query_map(params![app, endpoint, url, min, max], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(decode_results(rows))
    }

    /// Up to `n` most recent results, descending by time.
    pub async fn get_last_n_results(
        &self,
        app: &str,
        endpoint: &str,
        url: &str,
        n: u32,
    ) -> Result<Vec<EndpointResult>, StoreError> {
        self.last_n(app, endpoint, url, n, "1=1").await
    }

    /// Up to `n` most recent results whose body changed, descending by time.
    pub async fn get_last_n_diff_results(
        &self,
        app: &str,
        endpoint: &str,
        url: &str,
        n: u32,
    ) -> Result<Vec<EndpointResult>, StoreError> {
        self.last_n(app, endpoint, url, n, "body_changed = 1").await
    }

    /// Up to `n` most recent invalid results, descending by time.
    pub async fn get_last_n_invalid_results(
        &self,
        app: &str,
        endpoint: &str,
        url: &str,
        n: u32,
    ) -> Result<Vec<EndpointResult>, StoreError> {
        self.last_n(app, endpoint, url, n, "valid = 0").await
    }

    async fn last_n(
        &self,
        app: &str,
        endpoint: &str,
        url: &str,
        n: u32,
        filter: &str,
    ) -> Result<Vec<EndpointResult>, StoreError> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT record FROM endpoint_results
             WHERE app_key = ?1 AND endpoint_key = ?2 AND url = ?3 AND {filter}
             ORDER BY check_time DESC LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![app, endpoint, url, n], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(decode_results(rows))
    }

    /// The most recent result for the triple, if any. Used to seed endpoint
    /// schedules across restarts.
    pub async fn get_last_result(
        &self,
        app: &str,
        endpoint: &str,
        url: &str,
    ) -> Result<Option<EndpointResult>, StoreError> {
        Ok(self.get_last_n_results(app, endpoint, url, 1).await?.pop())
    }

    /// The latest result strictly earlier than `time`, if any.
    pub async fn get_endpoint_result_prev(
        &self,
        app: &str,
        endpoint: &str,
        url: &str,
        time: &DateTime<Utc>,
    ) -> Result<Option<EndpointResult>, StoreError> {
        let conn = self.pool.get()?;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM endpoint_results
                 WHERE app_key = ?1 AND endpoint_key = ?2 AND url = ?3 AND check_time < ?4
                 ORDER BY check_time DESC LIMIT 1",
                params![app, endpoint, url, time_key(time)],
                |row| row.get(0),
            )
            .optional()?;
        match record {
            Some(r) => Ok(Some(serde_json::from_str(&r)?)),
            None => Ok(None),
        }
    }

    /// Performance entries whose time lies in `[date, date+24h)`, ascending.
    pub async fn get_performance_records_for_date(
        &self,
        app: &str,
        endpoint: &str,
        url: &str,
        date: &DateTime<Utc>,
    ) -> Result<Vec<PerformanceRecord>, StoreError> {
        let (min, max) = day_window(date);
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT check_time, record FROM performance_log
             WHERE app_key = ?1 AND endpoint_key = ?2 AND url = ?3
               AND check_time >= ?4 AND check_time < ?5
             ORDER BY check_time ASC",
        )?;
        let rows = stmt.query_map(params![app, endpoint, url, min, max], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (key, value) = row?;
            let Some(check_time) = parse_time_key(&key) else {
                warn!(key, "skipping performance record with bad time key");
                continue;
            };
            match serde_json::from_str::<PerformanceEntry>(&value) {
                Ok(entry) => records.push(PerformanceRecord { check_time, entry }),
                Err(e) => warn!(key, error = %e, "skipping corrupt performance record"),
            }
        }
        Ok(records)
    }

    /// Performs both writes for one fetch event: performance first, then
    /// the result record. Failures are logged and not retried.
    pub async fn record(&self, er: &EndpointResult) {
        let entry = PerformanceEntry {
            duration: er.duration_ms,
            size: er.size,
        };
        if let Err(e) = self.write_performance_record(er, &entry).await {
            error!(app = %er.app_key, endpoint = %er.endpoint_key, url = %er.url,
                   error = %e, "error writing performance record");
        }
        if let Err(e) = self.write_endpoint_result(er).await {
            error!(app = %er.app_key, endpoint = %er.endpoint_key, url = %er.url,
                   error = %e, "error writing endpoint result");
        }
    }
}

fn decode_results(
    rows: impl Iterator<Item = Result<String, rusqlite::Error>>,
) -> Vec<EndpointResult> {
    let mut results = Vec::new();
    for row in rows {
        match row {
            Ok(record) => match serde_json::from_str::<EndpointResult>(&record) {
                Ok(er) => results.push(er),
                Err(e) => warn!(error = %e, "skipping corrupt endpoint result record"),
            },
            Err(e) => warn!(error = %e, "error reading endpoint result row"),
        }
    }
    results
}

/// Starts the result writer worker. The returned sender is the Result Log
/// channel; the worker drains it in order, one consumer, and flushes what
/// is still buffered when the helper scope is cancelled.
pub fn start_result_writer(
    token: CancellationToken,
    store: ResultStore,
) -> (mpsc::Sender<EndpointResult>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<EndpointResult>(RESULT_CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        debug!("started result writer");
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(er) => store.record(&er).await,
                        None => break,
                    }
                }
                _ = token.cancelled() => {
                    while let Ok(er) = rx.try_recv() {
                        store.record(&er).await;
                    }
                    break;
                }
            }
        }
        debug!("shutting down result writer");
    });
    (tx, handle)
}
