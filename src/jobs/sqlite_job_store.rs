use super::models::{ClaimFilter, Job, JobKey, JobState, JobStatus, Lease};
use super::notifier::{JobEvent, JobEventKind, JobNotifier, JobSubscription};
use super::schema::JOB_VERSIONED_SCHEMAS;
use super::{lease_expiry, JobStore, JobStoreError};
use crate::sqlite_persistence::{
    format_datetime, json_column, open_in_memory, open_versioned, parse_datetime,
    parse_optional_datetime,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const JOB_COLUMNS: &str = "id, namespace, name, uid, spec, status, lease_holder, \
                           lease_expires_at, attempts, created_at, transitions";

/// SQL predicate matching jobs that are not finished yet.
const LIVE_STATES: &str = "state IN ('pending', 'running')";

/// Job store backed by SQLite.
///
/// Several processes may share one database file: every read-modify-write
/// runs in an immediate transaction and the final UPDATE re-checks the lease
/// condition it was decided on.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    notifier: JobNotifier,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path.as_ref(), JOB_VERSIONED_SCHEMAS, "job")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notifier: JobNotifier::default(),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = open_in_memory(JOB_VERSIONED_SCHEMAS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notifier: JobNotifier::default(),
        })
    }

    /// Use a notifier with a custom per-subscriber capacity.
    pub fn with_notifier(mut self, notifier: JobNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let lease_holder: Option<String> = row.get("lease_holder")?;
        let lease_expires_at = parse_optional_datetime(row, "lease_expires_at")?;
        let lease = match (lease_holder, lease_expires_at) {
            (Some(holder), Some(expires_at)) => Some(Lease { holder, expires_at }),
            _ => None,
        };

        Ok(Job {
            key: JobKey {
                namespace: row.get("namespace")?,
                name: row.get("name")?,
            },
            uid: row.get("uid")?,
            spec: json_column(row, "spec")?,
            status: json_column(row, "status")?,
            lease,
            attempts: row.get::<_, i64>("attempts")? as u32,
            created_at: parse_datetime(row, "created_at")?,
            transitions: json_column(row, "transitions")?,
        })
    }

    fn get_with_id(conn: &Connection, key: &JobKey) -> rusqlite::Result<Option<(i64, Job)>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM jobs WHERE namespace = ?1 AND name = ?2",
                JOB_COLUMNS
            ),
            params![key.namespace, key.name],
            |row| Ok((row.get("id")?, Self::row_to_job(row)?)),
        )
        .optional()
    }

    fn query_jobs(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> rusqlite::Result<Vec<(i64, Job)>> {
        let mut stmt = conn.prepare(sql)?;
        let jobs = stmt
            .query_map(params, |row| Ok((row.get("id")?, Self::row_to_job(row)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Explain a guarded write that touched no row.
    fn lease_failure(conn: &Connection, key: &JobKey) -> JobStoreError {
        match Self::get_with_id(conn, key) {
            Ok(Some(_)) => JobStoreError::LeaseLost(key.clone()),
            Ok(None) => JobStoreError::NotFound(key.clone()),
            Err(e) => e.into(),
        }
    }

    fn publish(&self, key: &JobKey, kind: JobEventKind) {
        self.notifier.publish(JobEvent {
            key: key.clone(),
            kind,
        });
    }
}

impl JobStore for SqliteJobStore {
    fn create(&self, job: Job) -> Result<Job, JobStoreError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO jobs (namespace, name, uid, kind, spec, state, status, lease_holder, \
             lease_expires_at, attempts, created_at, transitions) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.key.namespace,
                job.key.name,
                job.uid,
                job.kind().as_str(),
                serde_json::to_string(&job.spec)?,
                job.status.state.as_str(),
                serde_json::to_string(&job.status)?,
                job.lease.as_ref().map(|l| l.holder.clone()),
                job.lease.as_ref().map(|l| format_datetime(&l.expires_at)),
                job.attempts as i64,
                format_datetime(&job.created_at),
                serde_json::to_string(&job.transitions)?,
            ],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(JobStoreError::AlreadyExists(job.key));
            }
            Err(e) => return Err(e.into()),
        }
        drop(conn);

        self.publish(&job.key, JobEventKind::Created);
        Ok(job)
    }

    fn get(&self, key: &JobKey) -> Result<Option<Job>, JobStoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(Self::get_with_id(&conn, key)?.map(|(_, job)| job))
    }

    fn list(&self, namespace: Option<&str>) -> Result<Vec<Job>, JobStoreError> {
        let conn = self.conn.lock().unwrap();
        let jobs = Self::query_jobs(
            &conn,
            &format!(
                "SELECT {} FROM jobs WHERE (?1 IS NULL OR namespace = ?1) ORDER BY id",
                JOB_COLUMNS
            ),
            params![namespace],
        )?;
        Ok(jobs.into_iter().map(|(_, job)| job).collect())
    }

    fn claim(
        &self,
        filter: &ClaimFilter,
        holder: &str,
        lease_duration: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();
        let now_str = format_datetime(&now);
        let expires_at = lease_expiry(now, lease_duration);

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates = Self::query_jobs(
            &tx,
            &format!(
                "SELECT {} FROM jobs WHERE {} \
                 AND (lease_holder IS NULL OR lease_expires_at <= ?1) \
                 AND (?2 IS NULL OR namespace = ?2) ORDER BY id",
                JOB_COLUMNS, LIVE_STATES
            ),
            params![now_str, filter.namespace],
        )?;

        let mut claimed = None;
        for (id, mut job) in candidates {
            if !filter.matches(&job) {
                continue;
            }
            let previous_attempts = job.attempts;
            job.apply_claim(holder, now, expires_at);

            let changed = tx.execute(
                &format!(
                    "UPDATE jobs SET state = ?1, status = ?2, lease_holder = ?3, \
                     lease_expires_at = ?4, attempts = ?5, transitions = ?6 \
                     WHERE id = ?7 AND attempts = ?8 AND {} \
                     AND (lease_holder IS NULL OR lease_expires_at <= ?9)",
                    LIVE_STATES
                ),
                params![
                    job.status.state.as_str(),
                    serde_json::to_string(&job.status)?,
                    holder,
                    format_datetime(&expires_at),
                    job.attempts as i64,
                    serde_json::to_string(&job.transitions)?,
                    id,
                    previous_attempts as i64,
                    now_str,
                ],
            )?;
            if changed == 1 {
                claimed = Some(job);
                break;
            }
            debug!("Lost claim race on job {}, trying next candidate", job.key);
        }
        tx.commit()?;
        drop(conn);

        if let Some(job) = &claimed {
            self.publish(&job.key, JobEventKind::Updated);
        }
        Ok(claimed)
    }

    fn renew_lease(
        &self,
        key: &JobKey,
        holder: &str,
        new_expiry: DateTime<Utc>,
    ) -> Result<Lease, JobStoreError> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET lease_expires_at = ?1 \
             WHERE namespace = ?2 AND name = ?3 AND lease_holder = ?4 AND lease_expires_at > ?5",
            params![
                format_datetime(&new_expiry),
                key.namespace,
                key.name,
                holder,
                format_datetime(&now),
            ],
        )?;
        if changed == 0 {
            return Err(Self::lease_failure(&conn, key));
        }
        Ok(Lease {
            holder: holder.to_string(),
            expires_at: new_expiry,
        })
    }

    fn update_status(
        &self,
        key: &JobKey,
        holder: &str,
        status: &JobStatus,
    ) -> Result<(), JobStoreError> {
        let now = Utc::now();
        let now_str = format_datetime(&now);

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (id, mut job) = Self::get_with_id(&tx, key)?
            .ok_or_else(|| JobStoreError::NotFound(key.clone()))?;
        if !job
            .lease
            .as_ref()
            .is_some_and(|lease| lease.is_held_by(holder, now))
        {
            return Err(JobStoreError::LeaseLost(key.clone()));
        }

        job.apply_status(status.clone(), now);
        let changed = tx.execute(
            "UPDATE jobs SET state = ?1, status = ?2, transitions = ?3 \
             WHERE id = ?4 AND lease_holder = ?5 AND lease_expires_at > ?6",
            params![
                job.status.state.as_str(),
                serde_json::to_string(&job.status)?,
                serde_json::to_string(&job.transitions)?,
                id,
                holder,
                now_str,
            ],
        )?;
        if changed == 0 {
            return Err(JobStoreError::LeaseLost(key.clone()));
        }
        tx.commit()?;
        drop(conn);

        self.publish(key, JobEventKind::Updated);
        Ok(())
    }

    fn release_lease(
        &self,
        key: &JobKey,
        holder: &str,
        message: &str,
    ) -> Result<(), JobStoreError> {
        let now = Utc::now();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (id, mut job) = Self::get_with_id(&tx, key)?
            .ok_or_else(|| JobStoreError::NotFound(key.clone()))?;
        if job.lease.as_ref().map(|l| l.holder.as_str()) != Some(holder)
            || job.status.state.is_terminal()
        {
            return Err(JobStoreError::LeaseLost(key.clone()));
        }

        job.apply_release(now, message);
        let changed = tx.execute(
            "UPDATE jobs SET state = ?1, status = ?2, lease_holder = NULL, \
             lease_expires_at = NULL, attempts = ?3, transitions = ?4 \
             WHERE id = ?5 AND lease_holder = ?6",
            params![
                JobState::Pending.as_str(),
                serde_json::to_string(&job.status)?,
                job.attempts as i64,
                serde_json::to_string(&job.transitions)?,
                id,
                holder,
            ],
        )?;
        if changed == 0 {
            return Err(JobStoreError::LeaseLost(key.clone()));
        }
        tx.commit()?;
        drop(conn);

        self.publish(key, JobEventKind::Released);
        Ok(())
    }

    fn delete(&self, key: &JobKey) -> Result<(), JobStoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "DELETE FROM jobs WHERE namespace = ?1 AND name = ?2",
            params![key.namespace, key.name],
        )?;
        drop(conn);

        if changed > 0 {
            self.publish(key, JobEventKind::Deleted);
        }
        Ok(())
    }

    fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let conn = self.conn.lock().unwrap();
        let jobs = Self::query_jobs(
            &conn,
            &format!(
                "SELECT {} FROM jobs WHERE {} \
                 AND lease_holder IS NOT NULL AND lease_expires_at <= ?1 ORDER BY id",
                JOB_COLUMNS, LIVE_STATES
            ),
            params![format_datetime(&now)],
        )?;
        Ok(jobs.into_iter().map(|(_, job)| job).collect())
    }

    fn abandon(&self, key: &JobKey, message: &str) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();
        let now_str = format_datetime(&now);

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some((id, mut job)) = Self::get_with_id(&tx, key)? else {
            return Ok(None);
        };
        let expired = job.lease.as_ref().is_some_and(|lease| lease.is_expired(now));
        if !expired || job.status.state.is_terminal() {
            return Ok(None);
        }

        let previous_attempts = job.attempts;
        job.apply_abandon(now, message);
        let changed = tx.execute(
            &format!(
                "UPDATE jobs SET state = ?1, status = ?2, lease_holder = NULL, \
                 lease_expires_at = NULL, transitions = ?3 \
                 WHERE id = ?4 AND attempts = ?5 AND {} AND lease_expires_at <= ?6",
                LIVE_STATES
            ),
            params![
                JobState::Failed.as_str(),
                serde_json::to_string(&job.status)?,
                serde_json::to_string(&job.transitions)?,
                id,
                previous_attempts as i64,
                now_str,
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        tx.commit()?;
        drop(conn);

        self.publish(key, JobEventKind::Updated);
        Ok(Some(job))
    }

    fn subscribe(&self) -> JobSubscription {
        self.notifier.subscribe()
    }
}
