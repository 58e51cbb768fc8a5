use super::{ItemAction, ItemOutcome, WorkerResult};
use crate::jobs::{JobKey, JobState, JobStatus, JobStore, ResourceSummary};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

struct StatusSink {
    store: Arc<dyn JobStore>,
    key: JobKey,
    holder: String,
}

/// Collects what a worker did and mirrors it into the job's live status.
///
/// Status writes are throttled to one per `interval` and best effort: a failed
/// write is logged and dropped. Lease loss is detected by the driver's renewal.
pub struct ProgressRecorder {
    sink: Option<StatusSink>,
    interval: Duration,
    last_flush: Option<Instant>,
    base: JobStatus,
    message: String,
    total: Option<usize>,
    items: Vec<ItemOutcome>,
    errors: Vec<String>,
}

impl ProgressRecorder {
    pub fn new(
        store: Arc<dyn JobStore>,
        key: JobKey,
        holder: impl Into<String>,
        base: JobStatus,
        interval: Duration,
    ) -> Self {
        Self {
            sink: Some(StatusSink {
                store,
                key,
                holder: holder.into(),
            }),
            ..Self::detached(base, interval)
        }
    }

    /// A recorder that never writes to a store.
    pub fn detached(base: JobStatus, interval: Duration) -> Self {
        Self {
            sink: None,
            interval,
            last_flush: None,
            message: base.message.clone(),
            base,
            total: None,
            items: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
        self.maybe_flush();
    }

    /// Expected number of items; drives the progress fraction.
    pub fn set_total(&mut self, total: usize) {
        self.total = Some(total);
    }

    /// Raise the expected number of items by `extra`.
    pub fn add_total(&mut self, extra: usize) {
        self.total = Some(self.total.unwrap_or(self.items.len()) + extra);
    }

    pub fn record(&mut self, outcome: ItemOutcome) {
        if let Some(error) = &outcome.error {
            self.push_error(format!("{}: {}", outcome.path, error));
        }
        self.items.push(outcome);
        self.maybe_flush();
    }

    /// A job-level error that is not tied to one item.
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.push_error(error.into());
        self.maybe_flush();
    }

    fn push_error(&mut self, error: String) {
        if self.errors.len() < crate::jobs::MAX_STATUS_ERRORS {
            self.errors.push(error);
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn items(&self) -> &[ItemOutcome] {
        &self.items
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Completed fraction, `0.0` while the total is unknown.
    pub fn progress(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => (self.items.len() as f64 / total as f64).min(1.0),
            _ => 0.0,
        }
    }

    pub fn summary(&self) -> Vec<ResourceSummary> {
        let mut groups: BTreeMap<&str, ResourceSummary> = BTreeMap::new();
        for item in &self.items {
            let entry = groups
                .entry(item.group.as_str())
                .or_insert_with(|| ResourceSummary::new(item.group.clone()));
            if item.error.is_some() {
                entry.errors += 1;
                continue;
            }
            match item.action {
                ItemAction::Created => entry.created += 1,
                ItemAction::Updated | ItemAction::Moved => entry.updated += 1,
                ItemAction::Deleted => entry.deleted += 1,
                ItemAction::Unchanged => entry.unchanged += 1,
            }
        }
        groups.into_values().collect()
    }

    /// Snapshot of the live status as it would be written with `state`.
    pub fn status(&self, state: JobState) -> JobStatus {
        JobStatus {
            state,
            progress: if matches!(state, JobState::Succeeded | JobState::Warning) {
                1.0
            } else {
                self.progress()
            },
            message: self.message.clone(),
            started_at: self.base.started_at,
            finished_at: None,
            summary: self.summary(),
            errors: self.errors.clone(),
        }
    }

    fn maybe_flush(&mut self) {
        let due = self
            .last_flush
            .map_or(true, |last| last.elapsed() >= self.interval);
        if due {
            self.flush();
        }
    }

    /// Write the current status now, ignoring the throttle.
    pub fn flush(&mut self) {
        self.last_flush = Some(Instant::now());
        let Some(sink) = &self.sink else {
            return;
        };
        let status = self.status(JobState::Running);
        if let Err(e) = sink.store.update_status(&sink.key, &sink.holder, &status) {
            warn!("Dropped progress update for {}: {}", sink.key, e);
        }
    }

    /// Result of a run that reached its end: `Warning` when anything failed.
    pub fn to_result(&self) -> WorkerResult {
        let state = if self.has_failures() {
            JobState::Warning
        } else {
            JobState::Succeeded
        };
        let message = if self.message.is_empty() {
            match state {
                JobState::Warning => format!("finished with {} errors", self.errors.len()),
                _ => "finished".to_string(),
            }
        } else {
            self.message.clone()
        };
        WorkerResult {
            state,
            message,
            summary: self.summary(),
            items: self.items.clone(),
        }
    }

    pub fn into_result(self) -> WorkerResult {
        self.to_result()
    }
}
