use super::{HistoricJob, HistoryStore, HistoryWriter};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryHistoryStore {
    jobs: Mutex<Vec<HistoricJob>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistoryWriter for InMemoryHistoryStore {
    fn write(&self, job: &HistoricJob) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.iter().any(|existing| existing.uid == job.uid) {
            bail!("history for job {} ({}) already written", job.key, job.uid);
        }
        jobs.push(job.clone());
        Ok(())
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn get(&self, uid: &str) -> Result<Option<HistoricJob>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.iter().find(|job| job.uid == uid).cloned())
    }

    fn list(&self, namespace: Option<&str>, limit: usize) -> Result<Vec<HistoricJob>> {
        let jobs = self.jobs.lock().unwrap();
        let mut matching: Vec<HistoricJob> = jobs
            .iter()
            .filter(|job| namespace.map_or(true, |ns| job.key.namespace == ns))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        matching.truncate(limit);
        Ok(matching)
    }

    fn list_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<HistoricJob>> {
        let jobs = self.jobs.lock().unwrap();
        let mut expired: Vec<HistoricJob> = jobs
            .iter()
            .filter(|job| job.finished_at < cutoff)
            .cloned()
            .collect();
        expired.sort_by_key(|job| job.finished_at);
        Ok(expired)
    }

    fn delete(&self, uid: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|job| job.uid != uid);
        Ok(jobs.len() < before)
    }
}
