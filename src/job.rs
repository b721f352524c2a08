use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The closed set of pipeline stages a job can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Discover,
    Capture,
    Score,
    Generate,
    Deploy,
    Email,
    Followup,
}

impl JobType {
    pub const ALL: [JobType; 7] = [
        JobType::Discover,
        JobType::Capture,
        JobType::Score,
        JobType::Generate,
        JobType::Deploy,
        JobType::Email,
        JobType::Followup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Discover => "discover",
            JobType::Capture => "capture",
            JobType::Score => "score",
            JobType::Generate => "generate",
            JobType::Deploy => "deploy",
            JobType::Email => "email",
            JobType::Followup => "followup",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discover" => Ok(JobType::Discover),
            "capture" => Ok(JobType::Capture),
            "score" => Ok(JobType::Score),
            "generate" => Ok(JobType::Generate),
            "deploy" => Ok(JobType::Deploy),
            "email" => Ok(JobType::Email),
            "followup" => Ok(JobType::Followup),
            other => Err(format!("Unknown job type: {}", other)),
        }
    }
}

/// Current state of a job.
///
/// `Pending` with a future `next_run_at` doubles as "scheduled for retry".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}

/// A unit of pipeline work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: Value,
    pub status: JobStatus,
    /// Lower value dispatches earlier.
    pub priority: i32,
    /// Execution attempts made so far. Never resets, even across retries.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Do not dispatch before this instant (retry delay or future schedule).
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    /// Insertion counter, final FIFO tie-break.
    pub(crate) seq: u64,
}

impl Job {
    pub fn new(job_type: JobType, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type,
            payload,
            status: JobStatus::Pending,
            priority: 0,
            attempts: 0,
            created_at: now,
            updated_at: now,
            next_run_at: None,
            last_error: None,
            result: None,
            seq: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(run_at);
        self
    }

    /// True when the job may be dispatched at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && match self.next_run_at {
                Some(at) => at <= now,
                None => true,
            }
    }

    /// Dispatch ordering key: priority, then age, then insertion order.
    pub(crate) fn order_key(&self) -> (i32, DateTime<Utc>, u64) {
        (self.priority, self.created_at, self.seq)
    }
}

/// Aggregate queue counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
}

/// Aggregate outcome of one `process_all` drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainOutcome {
    pub completed: u64,
    pub failed: u64,
}
