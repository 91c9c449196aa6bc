//! Step executors: one per tool kind, each mapping a validated step onto one
//! worker contract.
//!
//! Executors never return `Err`. Every outcome, including failure, comes
//! back as a `StepOutcome` so the Job Manager can record it on the step.

pub mod doc;
pub mod image;
pub mod pipeline;

use crate::{
    error::{ExecutionErrorKind, WorkerError},
    job::JobId,
    plan::{StepSpec, ToolKind},
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub use doc::DocExecutor;
pub use image::ImageExecutor;
pub use pipeline::{Pipeline, PipelineCatalog, PipelineParam, PipelineSchema};

#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    pub job_id: &'a JobId,
    pub step_index: usize,
    pub input_root: &'a Path,
    /// `<output_dir>/<job_id>`; executors write nowhere else.
    pub output_root: &'a Path,
    pub deadline: Instant,
    pub budget: Duration,
    /// Per-file failures downgrade to warnings when at least one output exists.
    pub partial_outputs: bool,
}

impl StepContext<'_> {
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn input_path(&self, rel: &str) -> PathBuf {
        self.input_root.join(rel)
    }

    pub fn timeout(&self) -> ExecutionErrorKind {
        ExecutionErrorKind::Timeout {
            budget_secs: self.budget.as_secs(),
        }
    }

    pub(crate) fn classify(&self, err: &WorkerError) -> ExecutionErrorKind {
        ExecutionErrorKind::from_worker(err, self.budget.as_secs())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Paths relative to the job output root.
    pub outputs: Vec<String>,
    pub warnings: Vec<String>,
    pub failure: Option<ExecutionErrorKind>,
}

impl StepOutcome {
    pub fn failed(kind: ExecutionErrorKind) -> Self {
        Self {
            failure: Some(kind),
            ..Self::default()
        }
    }
}

pub trait StepExecutor: Send + Sync {
    fn tool_kind(&self) -> ToolKind;
    fn execute(&self, ctx: &StepContext<'_>, spec: &StepSpec) -> StepOutcome;
}

#[derive(Default)]
pub struct ExecutorSet {
    executors: Vec<Box<dyn StepExecutor>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any executor already registered for the same tool kind.
    pub fn register(&mut self, executor: Box<dyn StepExecutor>) {
        let kind = executor.tool_kind();
        self.executors.retain(|e| e.tool_kind() != kind);
        self.executors.push(executor);
    }

    pub fn with(mut self, executor: Box<dyn StepExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, kind: &ToolKind) -> Option<&dyn StepExecutor> {
        self.executors
            .iter()
            .find(|e| &e.tool_kind() == kind)
            .map(|e| e.as_ref())
    }
}

/// Calls `check` until it yields a value, sleeping `interval` between calls.
/// Passing the deadline is a `WorkerError::Timeout`.
pub(crate) fn poll_until<T>(
    service: &'static str,
    deadline: Instant,
    interval: Duration,
    mut check: impl FnMut() -> Result<Option<T>, WorkerError>,
) -> Result<T, WorkerError> {
    loop {
        if let Some(v) = check()? {
            return Ok(v);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(WorkerError::Timeout { service });
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}

/// Folds per-file results into one step outcome.
pub(crate) fn settle(
    ctx: &StepContext<'_>,
    outputs: Vec<String>,
    warnings: Vec<String>,
    first_failure: Option<ExecutionErrorKind>,
) -> StepOutcome {
    let failure = match first_failure {
        None => None,
        Some(ExecutionErrorKind::Timeout { budget_secs }) => {
            Some(ExecutionErrorKind::Timeout { budget_secs })
        }
        Some(_) if ctx.partial_outputs && !outputs.is_empty() => None,
        Some(kind) => Some(kind),
    };
    StepOutcome {
        outputs,
        warnings,
        failure,
    }
}

/// `<dir>/<stem>.<ext>` relative to `root`, suffixed `-2`, `-3`, ... until no
/// file exists there yet.
pub(crate) fn unique_rel(root: &Path, dir: &str, stem: &str, ext: &str) -> String {
    let join = |name: String| {
        if dir.is_empty() {
            name
        } else {
            format!("{dir}/{name}")
        }
    };
    let first = join(format!("{stem}.{ext}"));
    if !root.join(&first).exists() {
        return first;
    }
    let mut n = 2;
    loop {
        let candidate = join(format!("{stem}-{n}.{ext}"));
        if !root.join(&candidate).exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Writes under the job output root, creating parent directories.
pub(crate) fn write_output(root: &Path, rel: &str, bytes: &[u8]) -> Result<(), WorkerError> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| WorkerError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    crate::util::write_atomic(&path, bytes).map_err(|source| WorkerError::Io { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_rel_suffixes_existing_names() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_rel(dir.path(), "docs", "summary-all", "md"), "docs/summary-all.md");
        write_output(dir.path(), "docs/summary-all.md", b"x").unwrap();
        assert_eq!(unique_rel(dir.path(), "docs", "summary-all", "md"), "docs/summary-all-2.md");
    }

    #[test]
    fn poll_until_times_out() {
        let deadline = Instant::now() + Duration::from_millis(30);
        let res: Result<(), _> =
            poll_until("svc", deadline, Duration::from_millis(5), || Ok(None));
        assert!(matches!(res, Err(WorkerError::Timeout { service: "svc" })));
    }
}
