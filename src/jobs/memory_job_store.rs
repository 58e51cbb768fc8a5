use super::models::{ClaimFilter, Job, JobKey, JobStatus, Lease};
use super::notifier::{JobEvent, JobEventKind, JobNotifier, JobSubscription};
use super::{lease_expiry, JobStore, JobStoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct State {
    next_seq: u64,
    jobs: HashMap<JobKey, (u64, Job)>,
}

impl State {
    fn ordered(&self) -> Vec<&Job> {
        let mut entries: Vec<&(u64, Job)> = self.jobs.values().collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, job)| job).collect()
    }

    fn job_mut(&mut self, key: &JobKey) -> Result<&mut Job, JobStoreError> {
        self.jobs
            .get_mut(key)
            .map(|(_, job)| job)
            .ok_or_else(|| JobStoreError::NotFound(key.clone()))
    }
}

/// Process-local job store. One mutex makes every operation atomic.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
    notifier: JobNotifier,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifier(notifier: JobNotifier) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notifier,
        }
    }

    fn publish(&self, key: &JobKey, kind: JobEventKind) {
        self.notifier.publish(JobEvent {
            key: key.clone(),
            kind,
        });
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, job: Job) -> Result<Job, JobStoreError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.jobs.contains_key(&job.key) {
                return Err(JobStoreError::AlreadyExists(job.key));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.jobs.insert(job.key.clone(), (seq, job.clone()));
        }
        self.publish(&job.key, JobEventKind::Created);
        Ok(job)
    }

    fn get(&self, key: &JobKey) -> Result<Option<Job>, JobStoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs.get(key).map(|(_, job)| job.clone()))
    }

    fn list(&self, namespace: Option<&str>) -> Result<Vec<Job>, JobStoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .ordered()
            .into_iter()
            .filter(|job| namespace.map_or(true, |ns| job.key.namespace == ns))
            .cloned()
            .collect())
    }

    fn claim(
        &self,
        filter: &ClaimFilter,
        holder: &str,
        lease_duration: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();
        let claimed = {
            let mut state = self.state.lock().unwrap();
            let key = state
                .ordered()
                .into_iter()
                .find(|job| job.is_claimable(now) && filter.matches(job))
                .map(|job| job.key.clone());
            match key {
                Some(key) => {
                    let job = state.job_mut(&key)?;
                    job.apply_claim(holder, now, lease_expiry(now, lease_duration));
                    Some(job.clone())
                }
                None => None,
            }
        };
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
        let mut state = self.state.lock().unwrap();
        let job = state.job_mut(key)?;
        match job.lease.as_mut() {
            Some(lease) if lease.is_held_by(holder, now) => {
                lease.expires_at = new_expiry;
                Ok(lease.clone())
            }
            _ => Err(JobStoreError::LeaseLost(key.clone())),
        }
    }

    fn update_status(
        &self,
        key: &JobKey,
        holder: &str,
        status: &JobStatus,
    ) -> Result<(), JobStoreError> {
        let now = Utc::now();
        {
            let mut state = self.state.lock().unwrap();
            let job = state.job_mut(key)?;
            if !job
                .lease
                .as_ref()
                .is_some_and(|lease| lease.is_held_by(holder, now))
            {
                return Err(JobStoreError::LeaseLost(key.clone()));
            }
            job.apply_status(status.clone(), now);
        }
        self.publish(key, JobEventKind::Updated);
        Ok(())
    }

    fn release_lease(
        &self,
        key: &JobKey,
        holder: &str,
        message: &str,
    ) -> Result<(), JobStoreError> {
        {
            let mut state = self.state.lock().unwrap();
            let job = state.job_mut(key)?;
            if job.lease.as_ref().map(|l| l.holder.as_str()) != Some(holder)
                || job.status.state.is_terminal()
            {
                return Err(JobStoreError::LeaseLost(key.clone()));
            }
            job.apply_release(Utc::now(), message);
        }
        self.publish(key, JobEventKind::Released);
        Ok(())
    }

    fn delete(&self, key: &JobKey) -> Result<(), JobStoreError> {
        let removed = self.state.lock().unwrap().jobs.remove(key).is_some();
        if removed {
            self.publish(key, JobEventKind::Deleted);
        }
        Ok(())
    }

    fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .ordered()
            .into_iter()
            .filter(|job| {
                !job.status.state.is_terminal()
                    && job.lease.as_ref().is_some_and(|lease| lease.is_expired(now))
            })
            .cloned()
            .collect())
    }

    fn abandon(&self, key: &JobKey, message: &str) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();
        let abandoned = {
            let mut state = self.state.lock().unwrap();
            let Some((_, job)) = state.jobs.get_mut(key) else {
                return Ok(None);
            };
            let expired = job.lease.as_ref().is_some_and(|lease| lease.is_expired(now));
            if !expired || job.status.state.is_terminal() {
                return Ok(None);
            }
            job.apply_abandon(now, message);
            job.clone()
        };
        self.publish(key, JobEventKind::Updated);
        Ok(Some(abandoned))
    }

    fn subscribe(&self) -> JobSubscription {
        self.notifier.subscribe()
    }
}
