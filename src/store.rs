//! SQLite-backed corpus store: items, extraction attempts, consensus.
//!
//! Every record is written on its own as soon as it exists, so an
//! interrupted run loses at most the call in flight. Attempts are keyed by
//! `(item_id, dimension, round)`, which is what makes resumption exact.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::dimension::Dimension;
use crate::extraction::{AttemptStatus, ExtractionAttempt, ExtractionPayload};
use crate::problem::Problem;
use crate::vote::{ConsensusResult, ItemConsensus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e.to_string())
    }
}

/// A problem together with its processing position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub seq: u64,
    pub problem: Problem,
}

#[async_trait]
pub trait CorpusStore: Send + Sync {
    /// Add problems not yet known, appending them to the processing order.
    /// Returns how many were new.
    async fn register_items(&self, problems: &[Problem]) -> Result<usize, StoreError>;

    /// All items in processing order.
    async fn items(&self) -> Result<Vec<StoredItem>, StoreError>;

    async fn has_attempt(&self, item_id: &str, dimension: Dimension, round: u32) -> Result<bool, StoreError>;

    /// Insert or replace one attempt.
    async fn put_attempt(&self, attempt: &ExtractionAttempt) -> Result<(), StoreError>;

    /// Attempts for one (item, dimension), ordered by round.
    async fn attempts_for(&self, item_id: &str, dimension: Dimension) -> Result<Vec<ExtractionAttempt>, StoreError>;

    async fn put_consensus(&self, result: &ConsensusResult) -> Result<(), StoreError>;

    async fn consensus_for(&self, item_id: &str, dimension: Dimension) -> Result<Option<ConsensusResult>, StoreError>;

    /// Consensus of every item that has any, in processing order.
    async fn consensus_corpus(&self) -> Result<Vec<ItemConsensus>, StoreError>;

    /// Total number of items registered.
    async fn item_count(&self) -> Result<usize, StoreError>;
}

#[derive(Clone)]
pub struct SqliteCorpusStore {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCorpusStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        create_tables(&conn)?;
        Ok(Self {
            path: Some(path),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self {
            path: None,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("TAXONOMY_STORE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from("taxonomy.sqlite")
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Advisory lock held for the lifetime of the returned guard.
    pub fn lock_exclusive(&self) -> Result<Option<StoreLock>, StoreError> {
        match &self.path {
            Some(path) => StoreLock::new(path).map(Some),
            None => Ok(None),
        }
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS items ( \
           item_id TEXT PRIMARY KEY, \
           seq INTEGER NOT NULL UNIQUE, \
           problem TEXT NOT NULL, \
           added_at TEXT NOT NULL \
         ); \
         CREATE TABLE IF NOT EXISTS attempts ( \
           item_id TEXT NOT NULL, \
           dimension TEXT NOT NULL, \
           round INTEGER NOT NULL, \
           status TEXT NOT NULL, \
           payload TEXT, \
           error TEXT, \
           model TEXT NOT NULL DEFAULT '', \
           prompt_hash TEXT NOT NULL DEFAULT '', \
           recorded_at TEXT NOT NULL, \
           PRIMARY KEY (item_id, dimension, round) \
         ); \
         CREATE TABLE IF NOT EXISTS consensus ( \
           item_id TEXT NOT NULL, \
           dimension TEXT NOT NULL, \
           result TEXT NOT NULL, \
           updated_at TEXT NOT NULL, \
           PRIMARY KEY (item_id, dimension) \
         );",
    )?;
    Ok(())
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s}: {e}")))
}

fn attempt_from_row(row: &rusqlite::Row<'_>) -> Result<ExtractionAttempt, StoreError> {
    let dimension: String = row.get(1)?;
    let status: String = row.get(3)?;
    let payload: Option<String> = row.get(4)?;
    let recorded_at: String = row.get(8)?;
    Ok(ExtractionAttempt {
        item_id: row.get(0)?,
        dimension: dimension
            .parse::<Dimension>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        round: row.get::<_, i64>(2)? as u32,
        status: status.parse::<AttemptStatus>().map_err(StoreError::Corrupt)?,
        payload: payload
            .map(|p| serde_json::from_str::<ExtractionPayload>(&p))
            .transpose()?,
        error: row.get(5)?,
        model: row.get(6)?,
        prompt_hash: row.get(7)?,
        recorded_at: parse_time(&recorded_at)?,
    })
}

const ATTEMPT_COLUMNS: &str =
    "a.item_id, a.dimension, a.round, a.status, a.payload, a.error, a.model, a.prompt_hash, a.recorded_at";

#[async_trait]
impl CorpusStore for SqliteCorpusStore {
    async fn register_items(&self, problems: &[Problem]) -> Result<usize, StoreError> {
        let problems = problems.to_vec();
        self.blocking(move |conn| {
            let mut next: i64 =
                conn.query_row("SELECT COALESCE(MAX(seq) + 1, 0) FROM items", [], |r| r.get(0))?;
            let now = Utc::now().to_rfc3339();
            let mut added = 0;
            for p in &problems {
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO items (item_id, seq, problem, added_at) VALUES (?1, ?2, ?3, ?4)",
                    params![p.id, next, serde_json::to_string(p)?, now],
                )?;
                if inserted > 0 {
                    next += 1;
                    added += 1;
                }
            }
            Ok(added)
        })
        .await
    }

    async fn items(&self) -> Result<Vec<StoredItem>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT seq, problem FROM items ORDER BY seq")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let problem: String = row.get(1)?;
                out.push(StoredItem {
                    seq: row.get::<_, i64>(0)? as u64,
                    problem: serde_json::from_str(&problem)?,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn has_attempt(&self, item_id: &str, dimension: Dimension, round: u32) -> Result<bool, StoreError> {
        let item_id = item_id.to_string();
        self.blocking(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM attempts WHERE item_id = ?1 AND dimension = ?2 AND round = ?3",
                    params![item_id, dimension.as_str(), round as i64],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn put_attempt(&self, attempt: &ExtractionAttempt) -> Result<(), StoreError> {
        let a = attempt.clone();
        self.blocking(move |conn| {
            let payload = a.payload.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                "INSERT INTO attempts (item_id, dimension, round, status, payload, error, model, prompt_hash, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(item_id, dimension, round) DO UPDATE SET \
                    status = excluded.status, \
                    payload = excluded.payload, \
                    error = excluded.error, \
                    model = excluded.model, \
                    prompt_hash = excluded.prompt_hash, \
                    recorded_at = excluded.recorded_at",
                params![
                    a.item_id,
                    a.dimension.as_str(),
                    a.round as i64,
                    a.status.as_str(),
                    payload,
                    a.error,
                    a.model,
                    a.prompt_hash,
                    a.recorded_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn attempts_for(&self, item_id: &str, dimension: Dimension) -> Result<Vec<ExtractionAttempt>, StoreError> {
        let item_id = item_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ATTEMPT_COLUMNS} FROM attempts a WHERE a.item_id = ?1 AND a.dimension = ?2 ORDER BY a.round"
            ))?;
            let mut rows = stmt.query(params![item_id, dimension.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(attempt_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    async fn put_consensus(&self, result: &ConsensusResult) -> Result<(), StoreError> {
        let json = serde_json::to_string(result)?;
        let item_id = result.item_id.clone();
        let dimension = result.dimension;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO consensus (item_id, dimension, result, updated_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(item_id, dimension) DO UPDATE SET \
                    result = excluded.result, \
                    updated_at = excluded.updated_at",
                params![item_id, dimension.as_str(), json, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn consensus_for(&self, item_id: &str, dimension: Dimension) -> Result<Option<ConsensusResult>, StoreError> {
        let item_id = item_id.to_string();
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT result FROM consensus WHERE item_id = ?1 AND dimension = ?2",
                    params![item_id, dimension.as_str()],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
        })
        .await
    }

    async fn consensus_corpus(&self) -> Result<Vec<ItemConsensus>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT i.item_id, i.seq, c.result FROM consensus c \
                 JOIN items i ON i.item_id = c.item_id \
                 ORDER BY i.seq, c.dimension",
            )?;
            let mut rows = stmt.query([])?;
            let mut out: Vec<ItemConsensus> = Vec::new();
            while let Some(row) = rows.next()? {
                let item_id: String = row.get(0)?;
                let seq = row.get::<_, i64>(1)? as u64;
                let json: String = row.get(2)?;
                let result: ConsensusResult = serde_json::from_str(&json)?;
                match out.last_mut() {
                    Some(last) if last.item_id == item_id => {
                        last.dimensions.insert(result.dimension, result);
                    }
                    _ => {
                        let mut dimensions = BTreeMap::new();
                        dimensions.insert(result.dimension, result);
                        out.push(ItemConsensus {
                            item_id,
                            seq,
                            dimensions,
                        });
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    async fn item_count(&self) -> Result<usize, StoreError> {
        self.blocking(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))?;
            Ok(n as usize)
        })
        .await
    }
}

#[derive(Debug)]
pub struct StoreLock {
    _file: std::fs::File,
}

impl StoreLock {
    fn new(db_path: &Path) -> Result<Self, StoreError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.try_lock_exclusive().map_err(|e| {
            std::io::Error::new(e.kind(), format!("store is in use by another process: {e}"))
        })?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum ExportRow<'a> {
    Attempt(&'a ExtractionAttempt),
    Consensus(&'a ConsensusResult),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportStats {
    pub attempts: usize,
    pub consensus: usize,
}

impl SqliteCorpusStore {
    /// Write every attempt, then every consensus record, as JSON lines.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<ExportStats, StoreError> {
        let path = path.as_ref().to_path_buf();
        self.blocking(move |conn| {
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            let mut stats = ExportStats::default();

            let mut stmt = conn.prepare(&format!(
                "SELECT {ATTEMPT_COLUMNS} FROM attempts a \
                 LEFT JOIN items i ON i.item_id = a.item_id \
                 ORDER BY i.seq, a.dimension, a.round"
            ))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let attempt = attempt_from_row(row)?;
                writeln!(file, "{}", serde_json::to_string(&ExportRow::Attempt(&attempt))?)?;
                stats.attempts += 1;
            }

            let mut stmt = conn.prepare(
                "SELECT c.result FROM consensus c \
                 LEFT JOIN items i ON i.item_id = c.item_id \
                 ORDER BY i.seq, c.dimension",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let json: String = row.get(0)?;
                let result: ConsensusResult = serde_json::from_str(&json)?;
                writeln!(file, "{}", serde_json::to_string(&ExportRow::Consensus(&result))?)?;
                stats.consensus += 1;
            }
            file.flush()?;
            Ok(stats)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::LabeledValue;

    fn problem(id: &str) -> Problem {
        Problem {
            id: id.into(),
            source: "test".into(),
            title: format!("title {id}"),
            description: String::new(),
            input: String::new(),
            output: String::new(),
            constraints: String::new(),
        }
    }

    #[tokio::test]
    async fn items_keep_first_registration_order() {
        let store = SqliteCorpusStore::in_memory().unwrap();
        assert_eq!(store.register_items(&[problem("b"), problem("a")]).await.unwrap(), 2);
        assert_eq!(store.register_items(&[problem("a"), problem("c")]).await.unwrap(), 1);
        let ids: Vec<String> = store
            .items()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.problem.id)
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(store.item_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn attempts_upsert_by_round() {
        let store = SqliteCorpusStore::in_memory().unwrap();
        let failed = ExtractionAttempt::failure("p", Dimension::Objective, 1, "boom")
            .with_provenance("m", "h");
        store.put_attempt(&failed).await.unwrap();
        assert!(store.has_attempt("p", Dimension::Objective, 1).await.unwrap());
        assert!(!store.has_attempt("p", Dimension::Objective, 2).await.unwrap());
        assert!(!store.has_attempt("p", Dimension::Invariant, 1).await.unwrap());

        let ok = ExtractionAttempt::success(
            "p",
            Dimension::Objective,
            1,
            ExtractionPayload::SingleLabel {
                value: LabeledValue {
                    label: "count".into(),
                    description: String::new(),
                    detail: serde_json::Value::Null,
                },
            },
        );
        store.put_attempt(&ok).await.unwrap();
        let stored = store.attempts_for("p", Dimension::Objective).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_success());
        assert_eq!(stored[0].payload, ok.payload);
    }
}
