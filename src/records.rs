//! Persisted-record contracts: what the external store keeps about a request,
//! its job, and its collected result.
//!
//! These structs define field names and invariants only; the backing store is
//! out of scope. Timestamps are RFC 3339 strings.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical job status lattice.
///
/// Transitions only move forward: `pending → queued → running → terminal`,
/// where terminal is one of completed, failed, error, or (grid jobs only)
/// deleted. Once terminal, a status never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Error,
    Deleted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
            JobStatus::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Error | JobStatus::Deleted
        )
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Queued => 1,
            JobStatus::Running => 2,
            _ => 3,
        }
    }

    /// Whether moving from `self` to `next` respects the lattice.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "error" => Ok(JobStatus::Error),
            "deleted" => Ok(JobStatus::Deleted),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// A status string outside the canonical set.
#[derive(Debug, thiserror::Error)]
#[error("unknown job status {0:?}")]
pub struct UnknownStatus(pub String);

/// Backend-native reference to a submitted job: an integer for the local
/// queue, a numeric string for the grid engine. The variant is kept explicit
/// so callers cannot confuse one backend's reference with another's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobReference {
    Local(u64),
    Grid(String),
}

/// One user submission for a named service.
///
/// A request has at most one job and at most one result; `pending` stays true
/// until the job reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: i64,
    pub service: String,
    /// Opaque 32-hex-char correlation token.
    pub uuid: String,
    pub timestamp: String,
    pub pending: bool,
    #[serde(default)]
    pub options: Vec<OptionRecord>,
    #[serde(default)]
    pub job: Option<JobRecord>,
    #[serde(default)]
    pub result: Option<ResultRecord>,
}

impl Request {
    pub fn new(id: i64, service: impl Into<String>) -> Self {
        Request {
            id,
            service: service.into(),
            uuid: Uuid::new_v4().simple().to_string(),
            timestamp: now_rfc3339(),
            pending: true,
            options: Vec::new(),
            job: None,
            result: None,
        }
    }

    /// Pending until a job exists; afterwards the job's status.
    pub fn status(&self) -> JobStatus {
        match &self.job {
            Some(job) => job.status,
            None => JobStatus::Pending,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Option values keyed by name, as handed to an executor.
    pub fn value_map(&self) -> HashMap<String, String> {
        self.options
            .iter()
            .map(|opt| (opt.name.clone(), opt.value.clone()))
            .collect()
    }
}

/// Name/value pair bound to one request; the name comes from the service's
/// declared option schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionRecord {
    pub name: String,
    pub value: String,
}

/// Bridge between a request and a backend invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub status: JobStatus,
    pub reference: JobReference,
    pub working_dir: String,
    pub service: String,
    pub configuration: String,
}

impl JobRecord {
    /// Move the status forward along the lattice. Regressions and updates to
    /// a terminal status are refused; returns whether the update applied.
    pub fn try_advance(&mut self, next: JobStatus) -> bool {
        if self.status == next {
            return true;
        }
        if self.status.can_advance_to(next) {
            self.status = next;
            return true;
        }
        false
    }
}

/// Collected outcome of a finished job. `return_code` is absent when the
/// backend cannot supply one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

/// One produced output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub uuid: String,
    pub title: String,
    pub path: String,
    pub mimetype: String,
}

impl FileRecord {
    pub fn new(title: impl Into<String>, path: impl Into<String>, mimetype: impl Into<String>) -> Self {
        FileRecord {
            uuid: Uuid::new_v4().simple().to_string(),
            title: title.into(),
            path: path.into(),
            mimetype: mimetype.into(),
        }
    }
}

/// Current time as an RFC 3339 UTC string, without pulling in a calendar
/// crate.
pub fn now_rfc3339() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_rfc3339(secs)
}

fn format_rfc3339(secs: u64) -> String {
    let (sec, min, hour) = (secs % 60, (secs / 60) % 60, (secs / 3600) % 24);
    let mut days = secs / 86_400;

    let mut year = 1970u64;
    loop {
        let len = if leap(year) { 366 } else { 365 };
        if days < len {
            break;
        }
        days -= len;
        year += 1;
    }

    let lengths = [
        31,
        if leap(year) { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut month = 1;
    for len in lengths {
        if days < len {
            break;
        }
        days -= len;
        month += 1;
    }

    format!(
        "{year:04}-{month:02}-{:02}T{hour:02}:{min:02}:{sec:02}Z",
        days + 1
    )
}

fn leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}
