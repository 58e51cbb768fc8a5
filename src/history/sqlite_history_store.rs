use super::schema::HISTORY_VERSIONED_SCHEMAS;
use super::{HistoricJob, HistoryStore, HistoryWriter};
use crate::jobs::JobKey;
use crate::sqlite_persistence::{
    format_datetime, json_column, open_in_memory, open_versioned, parse_datetime,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const HISTORY_COLUMNS: &str =
    "uid, namespace, name, spec, status, attempts, created_at, finished_at, transitions";

pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path.as_ref(), HISTORY_VERSIONED_SCHEMAS, "history")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_in_memory(HISTORY_VERSIONED_SCHEMAS)?)),
        })
    }

    fn row_to_historic_job(row: &rusqlite::Row) -> rusqlite::Result<HistoricJob> {
        Ok(HistoricJob {
            key: JobKey {
                namespace: row.get("namespace")?,
                name: row.get("name")?,
            },
            uid: row.get("uid")?,
            spec: json_column(row, "spec")?,
            status: json_column(row, "status")?,
            attempts: row.get::<_, i64>("attempts")? as u32,
            created_at: parse_datetime(row, "created_at")?,
            finished_at: parse_datetime(row, "finished_at")?,
            transitions: json_column(row, "transitions")?,
        })
    }
}

impl HistoryWriter for SqliteHistoryStore {
    fn write(&self, job: &HistoricJob) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_history (uid, namespace, name, kind, state, spec, status, attempts, \
             created_at, finished_at, transitions) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                job.uid,
                job.key.namespace,
                job.key.name,
                job.spec.kind().as_str(),
                job.status.state.as_str(),
                serde_json::to_string(&job.spec)?,
                serde_json::to_string(&job.status)?,
                job.attempts as i64,
                format_datetime(&job.created_at),
                format_datetime(&job.finished_at),
                serde_json::to_string(&job.transitions)?,
            ],
        )
        .with_context(|| format!("Failed to write history for job {}", job.key))?;
        Ok(())
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn get(&self, uid: &str) -> Result<Option<HistoricJob>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                &format!("SELECT {} FROM job_history WHERE uid = ?1", HISTORY_COLUMNS),
                params![uid],
                Self::row_to_historic_job,
            )
            .optional()?;
        Ok(job)
    }

    fn list(&self, namespace: Option<&str>, limit: usize) -> Result<Vec<HistoricJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM job_history WHERE (?1 IS NULL OR namespace = ?1) \
             ORDER BY finished_at DESC LIMIT ?2",
            HISTORY_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![namespace, limit as i64], Self::row_to_historic_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn list_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<HistoricJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM job_history WHERE finished_at < ?1 ORDER BY finished_at",
            HISTORY_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![format_datetime(&cutoff)], Self::row_to_historic_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn delete(&self, uid: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM job_history WHERE uid = ?1", params![uid])?;
        Ok(changed > 0)
    }
}
