//! SQLite-backed execution history.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::debug;

use skillchain_core::error::{Result, SkillchainError};
use skillchain_core::traits::Recorder;
use skillchain_core::types::{ExecutionRecord, NodeStatus, RunId};

const SCHEMA: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;

     CREATE TABLE IF NOT EXISTS records (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         run_id TEXT NOT NULL,
         node_id TEXT NOT NULL,
         attempt INTEGER NOT NULL,
         start_time TEXT NOT NULL,
         duration_ms INTEGER NOT NULL,
         status TEXT NOT NULL,
         error TEXT,
         error_code TEXT
     );

     CREATE INDEX IF NOT EXISTS idx_records_run ON records(run_id, id);";

/// Summary of a recorded run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub records: usize,
    pub failed: usize,
    pub first_start: DateTime<Utc>,
}

/// Append-only execution history in a SQLite database.
pub struct SqliteRecorder {
    conn: Mutex<Connection>,
}

impl SqliteRecorder {
    /// Open or create the history database, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        debug!(path = %path.display(), "Opened history database");
        Self::init(conn)
    }

    /// A private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Most recent runs first.
    pub fn runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT run_id, COUNT(*), SUM(status = 'failed'), MIN(start_time)
                 FROM records
                 GROUP BY run_id
                 ORDER BY MIN(id) DESC
                 LIMIT ?1",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let first: String = row.get(3)?;
                Ok(RunSummary {
                    run_id: RunId(row.get(0)?),
                    records: row.get::<_, i64>(1)? as usize,
                    failed: row.get::<_, i64>(2)? as usize,
                    first_start: parse_time(&first),
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Delete a run's history. Returns the number of records removed.
    pub fn delete_run(&self, run_id: &RunId) -> Result<usize> {
        self.lock()
            .execute("DELETE FROM records WHERE run_id = ?1", params![run_id.0])
            .map_err(db_err)
    }
}

impl Recorder for SqliteRecorder {
    fn record(&self, record: &ExecutionRecord) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO records (run_id, node_id, attempt, start_time, duration_ms, status, error, error_code)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.run_id.0,
                    record.node_id,
                    record.attempt as i64,
                    record.start_time.to_rfc3339(),
                    record.duration_ms as i64,
                    record.status.to_string(),
                    record.error,
                    record.error_code,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn history(&self, run_id: &RunId) -> Result<Vec<ExecutionRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT node_id, attempt, start_time, duration_ms, status, error, error_code
                 FROM records
                 WHERE run_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![run_id.0], |row| {
                let start: String = row.get(2)?;
                let status: String = row.get(4)?;
                Ok(ExecutionRecord {
                    run_id: run_id.clone(),
                    node_id: row.get(0)?,
                    attempt: row.get::<_, i64>(1)? as u32,
                    start_time: parse_time(&start),
                    duration_ms: row.get::<_, i64>(3)? as u64,
                    status: if status == "success" {
                        NodeStatus::Success
                    } else {
                        NodeStatus::Failed
                    },
                    error: row.get(5)?,
                    error_code: row.get(6)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

fn db_err(e: rusqlite::Error) -> SkillchainError {
    SkillchainError::Database(e.to_string())
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(run: &RunId, node: &str, attempt: u32, status: NodeStatus) -> ExecutionRecord {
        ExecutionRecord {
            run_id: run.clone(),
            node_id: node.into(),
            attempt,
            start_time: Utc::now(),
            duration_ms: 12,
            status,
            error: (status == NodeStatus::Failed).then(|| "bad output".to_string()),
            error_code: (status == NodeStatus::Failed).then(|| "invalid".to_string()),
        }
    }

    #[test]
    fn test_history_in_execution_order() {
        let store = SqliteRecorder::in_memory().unwrap();
        let run = RunId::new();
        store.record(&record(&run, "extract", 1, NodeStatus::Success)).unwrap();
        store.record(&record(&run, "validate", 1, NodeStatus::Failed)).unwrap();
        store.record(&record(&run, "extract", 2, NodeStatus::Success)).unwrap();

        let history = store.history(&run).unwrap();
        let seq: Vec<(&str, u32)> = history.iter().map(|r| (r.node_id.as_str(), r.attempt)).collect();
        assert_eq!(seq, vec![("extract", 1), ("validate", 1), ("extract", 2)]);
        assert_eq!(history[1].error_code.as_deref(), Some("invalid"));
        assert!(!history[1].succeeded());
        assert_eq!(history[0].duration_ms, 12);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runs.db");
        let run = RunId::from_string(&uuid::Uuid::new_v4().to_string());
        {
            let store = SqliteRecorder::open(&path).unwrap();
            store.record(&record(&run, "a", 1, NodeStatus::Success)).unwrap();
        }
        let store = SqliteRecorder::open(&path).unwrap();
        assert_eq!(store.history(&run).unwrap().len(), 1);
    }

    #[test]
    fn test_runs_summary_and_delete() {
        let store = SqliteRecorder::in_memory().unwrap();
        let first = RunId::from_string("first");
        let second = RunId::from_string("second");
        store.record(&record(&first, "a", 1, NodeStatus::Success)).unwrap();
        store.record(&record(&first, "b", 1, NodeStatus::Failed)).unwrap();
        store.record(&record(&second, "a", 1, NodeStatus::Success)).unwrap();

        let runs = store.runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, second);
        assert_eq!(runs[1].records, 2);
        assert_eq!(runs[1].failed, 1);

        assert_eq!(store.delete_run(&first).unwrap(), 2);
        assert!(store.history(&first).unwrap().is_empty());
        assert_eq!(store.runs(1).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_run() {
        let store = SqliteRecorder::in_memory().unwrap();
        assert!(store.history(&RunId::new()).unwrap().is_empty());
    }
}
