use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of error messages kept on a job status.
pub const MAX_STATUS_ERRORS: usize = 20;

// =============================================================================
// Identity
// =============================================================================

/// Identity of a job: unique per (namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference to the repository a job operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub namespace: String,
    pub name: String,
}

impl RepositoryRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Spec
// =============================================================================

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Export,
    Migrate,
    Delete,
    Move,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Sync,
        JobKind::Export,
        JobKind::Migrate,
        JobKind::Delete,
        JobKind::Move,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Export => "export",
            JobKind::Migrate => "migrate",
            JobKind::Delete => "delete",
            JobKind::Move => "move",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(JobKind::Sync),
            "export" => Some(JobKind::Export),
            "migrate" => Some(JobKind::Migrate),
            "delete" => Some(JobKind::Delete),
            "move" => Some(JobKind::Move),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action-specific parameters, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobAction {
    /// Pull repository content into the instance.
    Sync {
        #[serde(default)]
        incremental: bool,
    },
    /// Push instance content into the repository.
    Export {
        #[serde(default)]
        branch: Option<String>,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    /// Export everything, wipe the namespace, then sync it back from the repository.
    Migrate {
        #[serde(default)]
        history: bool,
        #[serde(default)]
        message: Option<String>,
    },
    /// Remove files from the repository.
    Delete {
        #[serde(default)]
        git_ref: Option<String>,
        paths: Vec<String>,
    },
    /// Move files inside the repository. `target_path` is a directory and ends with `/`.
    Move {
        #[serde(default)]
        git_ref: Option<String>,
        paths: Vec<String>,
        target_path: String,
    },
}

impl JobAction {
    pub fn kind(&self) -> JobKind {
        match self {
            JobAction::Sync { .. } => JobKind::Sync,
            JobAction::Export { .. } => JobKind::Export,
            JobAction::Migrate { .. } => JobKind::Migrate,
            JobAction::Delete { .. } => JobKind::Delete,
            JobAction::Move { .. } => JobKind::Move,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub repository: RepositoryRef,
    pub action: JobAction,
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        self.action.kind()
    }
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    /// Finished, but some items reported errors.
    Warning,
    Failed,
    Stopped,
    Timeout,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Warning => "warning",
            JobState::Failed => "failed",
            JobState::Stopped => "stopped",
            JobState::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "succeeded" => Some(JobState::Succeeded),
            "warning" => Some(JobState::Warning),
            "failed" => Some(JobState::Failed),
            "stopped" => Some(JobState::Stopped),
            "timeout" => Some(JobState::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-group tally of what a worker did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    /// Resource group, e.g. a file extension or resource type.
    pub group: String,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub unchanged: u64,
    pub errors: u64,
}

impl ResourceSummary {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..Default::default()
        }
    }

    pub fn total(&self) -> u64 {
        self.created + self.updated + self.deleted + self.unchanged + self.errors
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    /// Completed fraction in `0.0..=1.0`.
    pub progress: f64,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: Vec<ResourceSummary>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl JobStatus {
    pub fn pending() -> Self {
        Self {
            state: JobState::Pending,
            progress: 0.0,
            message: String::new(),
            started_at: None,
            finished_at: None,
            summary: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Append an error message, keeping at most [`MAX_STATUS_ERRORS`].
    pub fn push_error(&mut self, error: impl Into<String>) {
        if self.errors.len() < MAX_STATUS_ERRORS {
            self.errors.push(error.into());
        }
    }
}

/// Lease embedded in a job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_held_by(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.holder == holder && !self.is_expired(now)
    }
}

/// One entry of a job's state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: JobState,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
}

// =============================================================================
// Job
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub key: JobKey,
    pub uid: String,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub lease: Option<Lease>,
    /// Number of times the job has been claimed.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub transitions: Vec<StateTransition>,
}

impl Job {
    /// A new pending job, ready to be passed to `JobStore::create`.
    pub fn new(key: JobKey, spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            key,
            uid: uuid::Uuid::new_v4().to_string(),
            spec,
            status: JobStatus::pending(),
            lease: None,
            attempts: 0,
            created_at: now,
            transitions: vec![StateTransition {
                state: JobState::Pending,
                at: now,
                message: String::new(),
            }],
        }
    }

    pub fn kind(&self) -> JobKind {
        self.spec.kind()
    }

    /// Whether a claim at `now` may take this job.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.status.state.is_terminal()
            && self.lease.as_ref().map_or(true, |lease| lease.is_expired(now))
    }

    fn record_transition(&mut self, state: JobState, at: DateTime<Utc>, message: &str) {
        self.transitions.push(StateTransition {
            state,
            at,
            message: message.to_string(),
        });
    }

    /// Take the lease for `holder` and move to `Running`.
    pub(crate) fn apply_claim(&mut self, holder: &str, now: DateTime<Utc>, expires_at: DateTime<Utc>) {
        self.lease = Some(Lease {
            holder: holder.to_string(),
            expires_at,
        });
        self.attempts += 1;
        self.status.state = JobState::Running;
        if self.status.started_at.is_none() {
            self.status.started_at = Some(now);
        }
        let message = format!("claimed by {} (attempt {})", holder, self.attempts);
        self.record_transition(JobState::Running, now, &message);
    }

    /// Replace the status, recording a transition when the state changes.
    pub(crate) fn apply_status(&mut self, mut status: JobStatus, now: DateTime<Utc>) {
        if status.state.is_terminal() && status.finished_at.is_none() {
            status.finished_at = Some(now);
        }
        status.errors.truncate(MAX_STATUS_ERRORS);
        let changed = status.state != self.status.state;
        self.status = status;
        if changed {
            let message = self.status.message.clone();
            self.record_transition(self.status.state, now, &message);
        }
    }

    /// Drop the lease and go back to `Pending`. The released attempt does not count.
    pub(crate) fn apply_release(&mut self, now: DateTime<Utc>, message: &str) {
        self.lease = None;
        self.attempts = self.attempts.saturating_sub(1);
        self.status.state = JobState::Pending;
        self.status.message = message.to_string();
        self.record_transition(JobState::Pending, now, message);
    }

    /// Mark as `Failed` without a lease holder, for jobs nobody finished.
    pub(crate) fn apply_abandon(&mut self, now: DateTime<Utc>, message: &str) {
        self.lease = None;
        self.status.state = JobState::Failed;
        self.status.message = message.to_string();
        self.status.finished_at = Some(now);
        self.status.push_error(message);
        self.record_transition(JobState::Failed, now, message);
    }
}

/// Restricts which jobs a claim may return.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    pub namespace: Option<String>,
    /// Only these kinds; `None` means any kind.
    pub kinds: Option<Vec<JobKind>>,
    /// Skip jobs already claimed this many times; `None` or 0 means no limit.
    pub max_attempts: Option<u32>,
}

impl ClaimFilter {
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(namespace) = &self.namespace {
            if &job.key.namespace != namespace {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&job.kind()) {
                return false;
            }
        }
        match self.max_attempts {
            Some(max) if max > 0 => job.attempts < max,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sync_job(namespace: &str, name: &str) -> Job {
        Job::new(
            JobKey::new(namespace, name),
            JobSpec {
                repository: RepositoryRef::new(namespace, "repo"),
                action: JobAction::Sync { incremental: false },
            },
        )
    }

    #[test]
    fn test_state_round_trip_and_terminality() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Succeeded,
            JobState::Warning,
            JobState::Failed,
            JobState::Stopped,
            JobState::Timeout,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Timeout.is_terminal());
        assert!(JobState::parse("bogus").is_none());
    }

    #[test]
    fn test_action_serializes_with_kind_tag() {
        let action = JobAction::Move {
            git_ref: None,
            paths: vec!["a.json".to_string()],
            target_path: "archive/".to_string(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "move");
        assert_eq!(json["target_path"], "archive/");

        let parsed: JobAction = serde_json::from_str(r#"{"kind":"sync"}"#).unwrap();
        assert_eq!(parsed, JobAction::Sync { incremental: false });
        assert_eq!(parsed.kind(), JobKind::Sync);
    }

    #[test]
    fn test_claimable_only_without_live_lease() {
        let now = Utc::now();
        let mut job = sync_job("ns", "a");
        assert!(job.is_claimable(now));

        job.lease = Some(Lease {
            holder: "slot-1".to_string(),
            expires_at: now + Duration::seconds(30),
        });
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + Duration::seconds(31)));

        job.lease = None;
        job.status.state = JobState::Succeeded;
        assert!(!job.is_claimable(now));
    }

    #[test]
    fn test_lease_held_by() {
        let now = Utc::now();
        let lease = Lease {
            holder: "a".to_string(),
            expires_at: now + Duration::seconds(5),
        };
        assert!(lease.is_held_by("a", now));
        assert!(!lease.is_held_by("b", now));
        assert!(!lease.is_held_by("a", now + Duration::seconds(5)));
    }

    #[test]
    fn test_claim_filter() {
        let mut job = sync_job("tenant-1", "a");
        assert!(ClaimFilter::default().matches(&job));

        let by_namespace = ClaimFilter {
            namespace: Some("tenant-2".to_string()),
            ..Default::default()
        };
        assert!(!by_namespace.matches(&job));

        let by_kind = ClaimFilter {
            kinds: Some(vec![JobKind::Export]),
            ..Default::default()
        };
        assert!(!by_kind.matches(&job));

        let by_attempts = ClaimFilter {
            max_attempts: Some(2),
            ..Default::default()
        };
        job.attempts = 1;
        assert!(by_attempts.matches(&job));
        job.attempts = 2;
        assert!(!by_attempts.matches(&job));
    }

    #[test]
    fn test_claim_then_finish_records_transitions() {
        let now = Utc::now();
        let mut job = sync_job("ns", "a");

        job.apply_claim("slot-0", now, now + Duration::seconds(60));
        assert_eq!(job.attempts, 1);
        assert_eq!(job.status.state, JobState::Running);
        assert_eq!(job.status.started_at, Some(now));

        let mut progress = job.status.clone();
        progress.progress = 0.5;
        job.apply_status(progress, now);
        assert_eq!(job.transitions.len(), 2);

        let mut done = job.status.clone();
        done.state = JobState::Succeeded;
        job.apply_status(done, now + Duration::seconds(1));
        assert_eq!(job.transitions.len(), 3);
        assert_eq!(job.status.finished_at, Some(now + Duration::seconds(1)));

        let states: Vec<JobState> = job.transitions.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![JobState::Pending, JobState::Running, JobState::Succeeded]
        );
    }

    #[test]
    fn test_release_keeps_started_at() {
        let now = Utc::now();
        let mut job = sync_job("ns", "a");
        job.apply_claim("slot-0", now, now + Duration::seconds(60));
        job.apply_release(now, "shutting down");

        assert!(job.lease.is_none());
        assert_eq!(job.attempts, 0);
        assert_eq!(job.status.state, JobState::Pending);
        assert_eq!(job.status.started_at, Some(now));
        assert!(job.is_claimable(now));
    }

    #[test]
    fn test_push_error_is_bounded() {
        let mut status = JobStatus::pending();
        for i in 0..(MAX_STATUS_ERRORS + 5) {
            status.push_error(format!("error {}", i));
        }
        assert_eq!(status.errors.len(), MAX_STATUS_ERRORS);
        assert_eq!(status.errors[0], "error 0");
    }
}
