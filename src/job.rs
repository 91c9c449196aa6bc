//! Job data model and the state machine rules the Job Manager applies.

use crate::{
    error::{ExecutionErrorKind, JobError, ManifestError},
    inventory::Inventory,
    plan::{StepSpec, ValidatedPlan},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Opaque, time-ordered job handle (a ULID in canonical form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn from_ulid(id: Ulid) -> Self {
        Self(id.to_string())
    }

    /// Accepts only canonical ULIDs, so an id is always safe as a file name.
    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let id = Ulid::from_string(raw.trim())
            .map_err(|_| ManifestError::InvalidJobId(raw.to_string()))?;
        Ok(Self::from_ulid(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Milliseconds since the Unix epoch encoded in the id.
    pub fn timestamp_ms(&self) -> u64 {
        Ulid::from_string(&self.0).map(|u| u.timestamp_ms()).unwrap_or(0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Partial | JobStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
        }
    }

    fn can_become(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => next == JobStatus::Running || next == JobStatus::Failed,
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    fn can_become(self, next: StepStatus) -> bool {
        match self {
            StepStatus::Pending => next == StepStatus::Running || next == StepStatus::Skipped,
            StepStatus::Running => next == StepStatus::Succeeded || next == StepStatus::Failed,
            _ => false,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable cause of a failed or skipped step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Worker,
    Timeout,
    Io,
    Interrupted,
    Cancelled,
    Dependency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub index: usize,
    pub spec: StepSpec,
    pub status: StepStatus,
    /// Paths relative to the job output directory.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

impl StepRecord {
    pub fn new(index: usize, spec: StepSpec) -> Self {
        Self {
            index,
            spec,
            status: StepStatus::Pending,
            outputs: Vec::new(),
            warnings: Vec::new(),
            error: None,
            error_kind: None,
            started_at: None,
            ended_at: None,
        }
    }

    fn transition(&mut self, next: StepStatus) -> Result<(), JobError> {
        if !self.status.can_become(next) {
            return Err(JobError::InvalidTransition {
                what: "step",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self, now: String) -> Result<(), JobError> {
        self.transition(StepStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn succeed(
        &mut self,
        outputs: Vec<String>,
        warnings: Vec<String>,
        now: String,
    ) -> Result<(), JobError> {
        self.transition(StepStatus::Succeeded)?;
        self.outputs = outputs;
        self.warnings = warnings;
        self.ended_at = Some(now);
        Ok(())
    }

    /// Outputs produced before the failure stay recorded.
    pub fn fail(
        &mut self,
        cause: &ExecutionErrorKind,
        outputs: Vec<String>,
        warnings: Vec<String>,
        now: String,
    ) -> Result<(), JobError> {
        self.transition(StepStatus::Failed)?;
        self.outputs = outputs;
        self.warnings = warnings;
        self.error = Some(cause.to_string());
        self.error_kind = Some(cause.failure_kind());
        self.ended_at = Some(now);
        Ok(())
    }

    pub fn skip(&mut self, cause: &ExecutionErrorKind, now: String) -> Result<(), JobError> {
        self.transition(StepStatus::Skipped)?;
        self.error = Some(cause.to_string());
        self.error_kind = Some(cause.failure_kind());
        self.ended_at = Some(now);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: JobId,
    pub intent: String,
    pub status: JobStatus,
    pub plan: ValidatedPlan,
    pub inventory: Inventory,
    pub steps: Vec<StepRecord>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Job {
    pub fn new(
        job_id: JobId,
        intent: String,
        inventory: Inventory,
        plan: ValidatedPlan,
        now: String,
    ) -> Self {
        let steps = plan
            .steps
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, spec)| StepRecord::new(i, spec))
            .collect();
        Self {
            job_id,
            intent,
            status: JobStatus::Pending,
            plan,
            inventory,
            steps,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            cancel_requested: false,
        }
    }

    pub fn set_status(&mut self, next: JobStatus, now: String) -> Result<(), JobError> {
        if !self.status.can_become(next) {
            return Err(JobError::InvalidTransition {
                what: "job",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(now.clone());
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn pending_steps(&self) -> Vec<usize> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.index)
            .collect()
    }
}

/// Terminal job status from a fully settled step list.
pub fn resolve_terminal(steps: &[StepRecord]) -> JobStatus {
    let succeeded = steps
        .iter()
        .filter(|s| s.status == StepStatus::Succeeded)
        .count();
    if !steps.is_empty() && succeeded == steps.len() {
        JobStatus::Completed
    } else if succeeded > 0 {
        JobStatus::Partial
    } else {
        JobStatus::Failed
    }
}

/// Groups `pending` (in plan order) into dispatch batches of at most
/// `max_parallel` consecutive steps with distinct tool kinds and pairwise
/// disjoint inputs. `max_parallel <= 1` yields one step per batch.
pub fn dispatch_batches(
    steps: &[StepRecord],
    pending: &[usize],
    max_parallel: usize,
) -> Vec<Vec<usize>> {
    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut kinds = HashSet::new();
    let mut paths: HashSet<&str> = HashSet::new();

    for &idx in pending {
        let spec = &steps[idx].spec;
        let kind = spec.tool_kind();
        let overlaps = spec.input_paths().iter().any(|p| paths.contains(p.as_str()));
        let fits = current.len() < max_parallel.max(1) && !kinds.contains(&kind) && !overlaps;
        if !current.is_empty() && !fits {
            batches.push(std::mem::take(&mut current));
            kinds.clear();
            paths.clear();
        }
        current.push(idx);
        kinds.insert(kind);
        paths.extend(spec.input_paths().iter().map(String::as_str));
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
