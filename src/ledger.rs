//! Transaction ledger - SQLite-backed record of every push attempt
//!
//! One configured collection maps to one table. Each row keeps the full
//! record as a JSON document plus a few indexed columns used for lookups,
//! ordering and retention. Rows are iterated in insertion order through an
//! autoincrement sequence; "most recent first" is a reverse scan of it.
//!
//! A file-backed ledger writes through one connection and reads through a
//! pool of read-only connections, so queries never wait behind a push being
//! recorded. WAL journaling lets both sides proceed at once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode transaction record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to create ledger directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid collection name '{0}'")]
    InvalidCollection(String),

    #[error("transaction {0} not found")]
    NotFound(String),

    #[error("transaction {id} is already {status} and cannot be modified")]
    Immutable {
        id: String,
        status: TransactionStatus,
    },
}

/// Lifecycle state of a push attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Running,
    Success,
    Failed,
    /// Target already at the commit; nothing pushed
    Skipped,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Running => "running",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "running" => Some(TransactionStatus::Running),
            "success" => Some(TransactionStatus::Success),
            "failed" => Some(TransactionStatus::Failed),
            "skipped" => Some(TransactionStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Success | TransactionStatus::Failed | TransactionStatus::Skipped
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One push attempt of one branch to one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Assigned by [`Ledger::append`]
    pub id: String,
    pub job_name: String,
    pub repo_name: String,
    pub branch: String,
    pub source: String,
    pub target: String,
    pub status: TransactionStatus,
    /// Empty until resolved
    pub commit_hash: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TransactionRecord {
    /// A new attempt in `running` state, started now
    pub fn begin(
        job_name: impl Into<String>,
        repo_name: impl Into<String>,
        branch: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        commit_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            job_name: job_name.into(),
            repo_name: repo_name.into(),
            branch: branch.into(),
            source: source.into(),
            target: target.into(),
            status: TransactionStatus::Running,
            commit_hash: commit_hash.into(),
            start_time: Utc::now(),
            end_time: None,
            error: None,
        }
    }

    /// Move to a terminal status, stamping the end time
    pub fn finish(&mut self, status: TransactionStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.end_time = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// Aggregate counts over the whole collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Pending or running records
    pub in_flight: u64,
    /// Mean duration over successful attempts
    pub average_success_duration: Option<Duration>,
}

#[derive(Debug)]
pub struct Ledger {
    writer: Mutex<Connection>,
    /// Idle read-only connections; `None` for in-memory ledgers
    readers: Option<ReaderPool>,
    table: String,
}

#[derive(Debug)]
struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            idle: Mutex::new(Vec::new()),
        }
    }

    fn checkout(&self) -> Result<Connection, LedgerError> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn checkin(&self, conn: Connection) {
        self.idle.lock().push(conn);
    }
}

impl Ledger {
    /// Open or create the ledger file with the given collection
    pub fn open(path: &Path, collection: &str) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;

        let ledger = Self::with_connection(conn, Some(ReaderPool::new(path)), collection)?;
        info!("Ledger opened at {} ({})", path.display(), collection);
        Ok(ledger)
    }

    /// Open an in-memory ledger (for testing)
    pub fn open_in_memory(collection: &str) -> Result<Self, LedgerError> {
        Self::with_connection(Connection::open_in_memory()?, None, collection)
    }

    fn with_connection(
        conn: Connection,
        readers: Option<ReaderPool>,
        collection: &str,
    ) -> Result<Self, LedgerError> {
        if !is_identifier(collection) {
            return Err(LedgerError::InvalidCollection(collection.to_string()));
        }

        let ledger = Self {
            writer: Mutex::new(conn),
            readers,
            table: collection.to_string(),
        };
        ledger.initialize()?;
        Ok(ledger)
    }

    fn initialize(&self) -> Result<(), LedgerError> {
        let t = &self.table;
        self.writer.lock().execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{t}" (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE NOT NULL,
                job_name TEXT NOT NULL,
                repo_name TEXT NOT NULL,
                target TEXT NOT NULL,
                status TEXT NOT NULL,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS "idx_{t}_job" ON "{t}"(job_name, seq);
            CREATE INDEX IF NOT EXISTS "idx_{t}_end" ON "{t}"(end_ts);
            "#
        ))?;

        debug!("Ledger collection {} initialized", t);
        Ok(())
    }

    /// Run a query on a read connection
    fn read<T>(
        &self,
        query: impl FnOnce(&Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let Some(pool) = &self.readers else {
            return query(&*self.writer.lock());
        };

        let conn = pool.checkout()?;
        let result = query(&conn);
        pool.checkin(conn);
        result
    }

    /// Store a new record, assigning its identity
    ///
    /// The record's id is only set once the row is stored.
    pub fn append(&self, record: &mut TransactionRecord) -> Result<String, LedgerError> {
        let mut stored = record.clone();
        stored.id = generate_id();
        let data = serde_json::to_string(&stored)?;

        self.writer.lock().execute(
            &format!(
                r#"INSERT INTO "{}" (id, job_name, repo_name, target, status, start_ts, end_ts, data)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
                self.table
            ),
            params![
                stored.id,
                record.job_name,
                record.repo_name,
                record.target,
                record.status.as_str(),
                record.start_time.timestamp_micros(),
                record.end_time.map(|t| t.timestamp_micros()),
                data,
            ],
        )?;

        record.id = stored.id;
        debug!(
            "Appended transaction {} ({} {} -> {})",
            record.id, record.status, record.branch, record.target
        );
        Ok(record.id.clone())
    }

    /// Replace a stored record that has not yet reached a terminal status
    pub fn update(&self, record: &TransactionRecord) -> Result<(), LedgerError> {
        let data = serde_json::to_string(record)?;
        let conn = self.writer.lock();

        let stored: Option<String> = conn
            .query_row(
                &format!(r#"SELECT status FROM "{}" WHERE id = ?1"#, self.table),
                params![record.id],
                |row| row.get(0),
            )
            .optional()?;

        let stored = stored.ok_or_else(|| LedgerError::NotFound(record.id.clone()))?;
        if let Some(status) = TransactionStatus::parse(&stored).filter(|s| s.is_terminal()) {
            return Err(LedgerError::Immutable {
                id: record.id.clone(),
                status,
            });
        }

        conn.execute(
            &format!(
                r#"UPDATE "{}" SET status = ?2, end_ts = ?3, data = ?4 WHERE id = ?1"#,
                self.table
            ),
            params![
                record.id,
                record.status.as_str(),
                record.end_time.map(|t| t.timestamp_micros()),
                data,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<TransactionRecord>, LedgerError> {
        let data: Option<String> = self.read(|conn| {
            conn.query_row(
                &format!(r#"SELECT data FROM "{}" WHERE id = ?1"#, self.table),
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(LedgerError::from)
        })?;

        data.map(|d| serde_json::from_str(&d).map_err(LedgerError::from))
            .transpose()
    }

    /// Up to `limit` records of one job, most recent first
    pub fn list_by_job(
        &self,
        job_name: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        self.query_records(
            &format!(
                r#"SELECT data FROM "{}" WHERE job_name = ?1 ORDER BY seq DESC LIMIT ?2"#,
                self.table
            ),
            params![job_name, limit as i64],
        )
    }

    /// Up to `limit` records across all jobs, most recent first
    pub fn list_recent(&self, limit: usize) -> Result<Vec<TransactionRecord>, LedgerError> {
        self.query_records(
            &format!(
                r#"SELECT data FROM "{}" ORDER BY seq DESC LIMIT ?1"#,
                self.table
            ),
            params![limit as i64],
        )
    }

    /// Most recent successful push of one repository to one target
    pub fn last_success(
        &self,
        job_name: &str,
        repo_name: &str,
        target: &str,
    ) -> Result<Option<TransactionRecord>, LedgerError> {
        let mut records = self.query_records(
            &format!(
                r#"SELECT data FROM "{}"
                   WHERE job_name = ?1 AND repo_name = ?2 AND target = ?3 AND status = 'success'
                   ORDER BY seq DESC LIMIT 1"#,
                self.table
            ),
            params![job_name, repo_name, target],
        )?;
        Ok(records.pop())
    }

    /// Delete terminal records whose end time is before `cutoff`
    pub fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, LedgerError> {
        let deleted = self.writer.lock().execute(
            &format!(
                r#"DELETE FROM "{}"
                   WHERE end_ts IS NOT NULL AND end_ts < ?1
                   AND status IN ('success', 'failed', 'skipped')"#,
                self.table
            ),
            params![cutoff.timestamp_micros()],
        )?;

        if deleted > 0 {
            info!("Deleted {} transactions older than {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    pub fn aggregate_stats(&self) -> Result<LedgerStats, LedgerError> {
        self.read(|conn| self.stats_on(conn))
    }

    fn stats_on(&self, conn: &Connection) -> Result<LedgerStats, LedgerError> {
        let mut stats = LedgerStats::default();

        let mut stmt = conn.prepare(&format!(
            r#"SELECT status, COUNT(*) FROM "{}" GROUP BY status"#,
            self.table
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (status, count) = row?;
            let count = count.max(0) as u64;
            stats.total += count;
            match TransactionStatus::parse(&status) {
                Some(TransactionStatus::Success) => stats.succeeded += count,
                Some(TransactionStatus::Failed) => stats.failed += count,
                Some(TransactionStatus::Skipped) => stats.skipped += count,
                Some(TransactionStatus::Pending) | Some(TransactionStatus::Running) => {
                    stats.in_flight += count
                }
                None => {}
            }
        }

        let average_micros: Option<f64> = conn.query_row(
            &format!(
                r#"SELECT AVG(end_ts - start_ts) FROM "{}"
                   WHERE status = 'success' AND end_ts IS NOT NULL"#,
                self.table
            ),
            [],
            |row| row.get(0),
        )?;
        stats.average_success_duration =
            average_micros.map(|micros| Duration::from_micros(micros.max(0.0) as u64));

        Ok(stats)
    }

    fn query_records<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        let rows = self.read(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params, |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(LedgerError::from))
            .collect()
    }
}

/// Nanosecond timestamp plus a random suffix; sorts roughly by creation
fn generate_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{:020}-{}", nanos, suffix)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
