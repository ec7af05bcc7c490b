use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::descriptor::{ArtifactRef, JobDescriptor, Resources};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Staging,
    Running,
    Succeeded,
    Failed,
    Lost,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// States in which a worker holds a reservation for the job.
    pub fn is_assigned(&self) -> bool {
        matches!(self, JobState::Staging | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Staging => write!(f, "staging"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Lost => write!(f, "lost"),
        }
    }
}

/// Why an attempt (or the whole job) failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    StorageUnavailable(String),
    ResourceExceeded(String),
    NonZeroExit(i32),
    MissingOutput(String),
    LaunchFailed(String),
    Lost,
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StorageUnavailable(e) => write!(f, "storage unavailable: {}", e),
            FailureReason::ResourceExceeded(what) => write!(f, "resource exceeded: {}", what),
            FailureReason::NonZeroExit(code) => write!(f, "exited with code {}", code),
            FailureReason::MissingOutput(name) => write!(f, "output file {} missing", name),
            FailureReason::LaunchFailed(e) => write!(f, "container launch failed: {}", e),
            FailureReason::Lost => write!(f, "worker heartbeat lost"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a worker reports back for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerOutcome {
    Succeeded {
        outputs: Vec<ArtifactRef>,
        exit_code: i32,
    },
    Failed {
        reason: FailureReason,
        exit_code: Option<i32>,
    },
    Lost,
}

impl WorkerOutcome {
    pub fn failed(reason: FailureReason) -> Self {
        WorkerOutcome::Failed {
            reason,
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// Mutable scheduling state of one job. Only the scheduler core touches it.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub descriptor: Arc<JobDescriptor>,
    pub state: JobState,
    pub assigned_worker: Option<String>,
    pub grant: Option<Resources>,
    pub retry_count: u32,
    /// Number of dispatches so far; reports carry it to detect stale ones.
    pub attempt: u32,
    pub last_failure: Option<FailureReason>,
    pub outputs: Vec<ArtifactRef>,
    pub exit_code: Option<i32>,
    pub transitions: Vec<Transition>,
    pub seq: u64,
}

impl JobRecord {
    pub fn new(descriptor: Arc<JobDescriptor>, seq: u64) -> Self {
        let at = descriptor.submitted_at;
        Self {
            descriptor,
            state: JobState::Queued,
            assigned_worker: None,
            grant: None,
            retry_count: 0,
            attempt: 0,
            last_failure: None,
            outputs: Vec::new(),
            exit_code: None,
            transitions: vec![Transition {
                state: JobState::Queued,
                at,
            }],
            seq,
        }
    }

    pub fn id(&self) -> Uuid {
        self.descriptor.id
    }

    pub(crate) fn transition(&mut self, state: JobState) {
        self.state = state;
        self.transitions.push(Transition {
            state,
            at: Utc::now(),
        });
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.descriptor.submitted_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        if self.state.is_terminal() {
            self.transitions.last().map(|t| t.at)
        } else {
            None
        }
    }

    /// Immutable snapshot handed out to callers outside the scheduler loop.
    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id(),
            cluster_id: self.descriptor.cluster_id,
            process_id: self.descriptor.process_id,
            image: self.descriptor.image.clone(),
            command: self.descriptor.command.clone(),
            state: self.state,
            assigned_worker: self.assigned_worker.clone(),
            retry_count: self.retry_count,
            attempt: self.attempt,
            last_failure: self.last_failure.clone(),
            outputs: self.outputs.clone(),
            exit_code: self.exit_code,
            transitions: self.transitions.clone(),
            submitted_at: self.submitted_at(),
            finished_at: self.finished_at(),
        }
    }
}

/// Serializable view of a [`JobRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: Uuid,
    pub cluster_id: u64,
    pub process_id: u32,
    pub image: String,
    pub command: Vec<String>,
    pub state: JobState,
    pub assigned_worker: Option<String>,
    pub retry_count: u32,
    pub attempt: u32,
    pub last_failure: Option<FailureReason>,
    pub outputs: Vec<ArtifactRef>,
    pub exit_code: Option<i32>,
    pub transitions: Vec<Transition>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
