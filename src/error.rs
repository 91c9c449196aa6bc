//! Error taxonomy for the orchestration core.
//!
//! Scan, planning and validation errors are fatal to job creation and never
//! leave a manifest behind. Execution errors are local to one step record and
//! roll up into the job's terminal status. The CLI wraps all of these in
//! `anyhow` for reporting.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::job::{FailureKind, JobId, JobStatus};

/// Inventory scan failures. Individual unreadable files are not errors.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("input root is unreadable: {}", path.display())]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("input root is not a directory: {}", path.display())]
    NotADirectory { path: PathBuf },
}

/// The planning service was unreachable or its output could not be used.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("planning service unreachable at {endpoint}: {detail}")]
    Unreachable { endpoint: String, detail: String },
    #[error("planning service returned HTTP {status}")]
    Status { status: u16 },
    #[error("planning service reply had no message content: {detail}")]
    BadEnvelope { detail: String },
    #[error("no JSON plan object found in planner output")]
    NoJson { excerpt: String },
    #[error("planner JSON is not a plan: {detail}")]
    Malformed { detail: String, excerpt: String },
}

/// One problem found in an untrusted plan. Always reported as a complete set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("plan has no steps")]
    EmptyPlan,
    #[error("step {step}: unknown tool kind '{tool}'")]
    UnknownTool { step: usize, tool: String },
    #[error("step {step} ({tool}): missing required parameter '{param}'")]
    MissingParam {
        step: usize,
        tool: String,
        param: String,
    },
    #[error("step {step} ({tool}): parameter '{param}' must be {expected}")]
    WrongType {
        step: usize,
        tool: String,
        param: String,
        expected: String,
    },
    #[error("step {step} ({tool}): parameter '{param}' is '{value}', expected one of: {allowed}")]
    InvalidValue {
        step: usize,
        tool: String,
        param: String,
        value: String,
        allowed: String,
    },
    #[error("step {step} ({tool}): input_paths is empty")]
    NoInputs { step: usize, tool: String },
    #[error("step {step}: input path '{path}' is not in the inventory")]
    UnknownPath { step: usize, path: String },
}

/// Failure talking to an external worker service.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{service} unreachable: {detail}")]
    Unreachable {
        service: &'static str,
        detail: String,
    },
    #[error("{service} returned HTTP {status}")]
    Status { service: &'static str, status: u16 },
    #[error("{service} response not understood: {detail}")]
    Protocol {
        service: &'static str,
        detail: String,
    },
    #[error("{service} reported failure: {detail}")]
    Reported {
        service: &'static str,
        detail: String,
    },
    #[error("{service} did not finish before the step deadline")]
    Timeout { service: &'static str },
    #[error("local file error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WorkerError {
    pub(crate) fn from_ureq(service: &'static str, err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(status) => WorkerError::Status { service, status },
            other => WorkerError::Unreachable {
                service,
                detail: other.to_string(),
            },
        }
    }
}

/// Why a step did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionErrorKind {
    #[error("worker error: {detail}")]
    Worker { detail: String },
    #[error("timed out after {budget_secs}s")]
    Timeout { budget_secs: u64 },
    #[error("filesystem error: {detail}")]
    Io { detail: String },
    #[error("interrupted: the process stopped while this step was running")]
    Interrupted,
    #[error("not started: the job was cancelled")]
    Cancelled,
    #[error("not started: step {failed_step} failed")]
    Dependency { failed_step: usize },
}

impl ExecutionErrorKind {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ExecutionErrorKind::Worker { .. } => FailureKind::Worker,
            ExecutionErrorKind::Timeout { .. } => FailureKind::Timeout,
            ExecutionErrorKind::Io { .. } => FailureKind::Io,
            ExecutionErrorKind::Interrupted => FailureKind::Interrupted,
            ExecutionErrorKind::Cancelled => FailureKind::Cancelled,
            ExecutionErrorKind::Dependency { .. } => FailureKind::Dependency,
        }
    }

    pub(crate) fn from_worker(err: &WorkerError, budget_secs: u64) -> Self {
        match err {
            WorkerError::Timeout { .. } => ExecutionErrorKind::Timeout { budget_secs },
            WorkerError::Io { .. } => ExecutionErrorKind::Io {
                detail: err.to_string(),
            },
            other => ExecutionErrorKind::Worker {
                detail: other.to_string(),
            },
        }
    }
}

/// A specific step's failure, carrying the offending step index.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("step {step_index}: {kind}")]
pub struct ExecutionError {
    pub step_index: usize,
    pub kind: ExecutionErrorKind,
}

/// Manifest store failures.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("invalid job id: {0}")]
    InvalidJobId(String),
    #[error("manifest io failure at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("manifest json failure at {}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported manifest version {found} at {}", path.display())]
    Version { path: PathBuf, found: u32 },
}

/// Failures of job lifecycle operations after creation.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] ManifestError),
    #[error("job {0} is already running in this process")]
    AlreadyRunning(JobId),
    #[error("job {job_id} is already {status}")]
    Terminal { job_id: JobId, status: JobStatus },
    #[error("invalid {what} transition: {from} -> {to}")]
    InvalidTransition {
        what: &'static str,
        from: String,
        to: String,
    },
    #[error("output directory unavailable: {}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("step {0} panicked while running")]
    StepPanicked(usize),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Everything that can stop `create_job` before a job exists.
#[derive(Debug, Error)]
pub enum CreateJobError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Planning(#[from] PlanningError),
    #[error("plan rejected with {} validation error(s)", .0.len())]
    Validation(Vec<ValidationError>),
    #[error(transparent)]
    Store(#[from] ManifestError),
}
