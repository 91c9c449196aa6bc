//! The Job Manager: owns the job state machine and sequences step dispatch.
//!
//! Every transition is persisted before anything else observes it. A job's
//! in-memory copy lives behind one mutex while it runs, and the manifest is
//! only written with that mutex held, so writes for one job never interleave.
//! Lock order is `active` then a job's own mutex, never the reverse.

use crate::{
    config::{Config, FailurePolicy},
    error::{CreateJobError, ExecutionError, ExecutionErrorKind, JobError},
    events::{EventBus, JobEvent},
    executor::{
        DocExecutor, ExecutorSet, ImageExecutor, PipelineCatalog, StepContext, StepOutcome,
    },
    inventory::{Inventory, ScanOptions, scan},
    job::{Job, JobId, JobStatus, StepStatus, dispatch_batches, resolve_terminal},
    manifest::ManifestStore,
    plan::{ToolKind, ValidatedPlan},
    planner::Planner,
    tools::ToolRegistry,
    util::{excerpt, now_rfc3339},
    validate::validate,
    worker::{ComfyClient, ConcurrencyGate, DocServiceClient},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Settings the manager reads on every run.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub state_dir: PathBuf,
    pub scan: ScanOptions,
    pub max_parallel_steps: usize,
    pub on_step_failure: FailurePolicy,
    pub partial_step_outputs: bool,
    pub image_timeout: Duration,
    pub doc_timeout: Duration,
}

impl ManagerOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            input_dir: cfg.input_dir(),
            output_dir: cfg.output_dir(),
            state_dir: cfg.state_dir(),
            scan: ScanOptions {
                follow_symlinks_in_root: cfg.security.follow_symlinks_in_root,
            },
            max_parallel_steps: cfg.jobs.max_parallel_steps.max(1),
            on_step_failure: cfg.jobs.on_step_failure,
            partial_step_outputs: cfg.jobs.partial_step_outputs,
            image_timeout: Duration::from_secs(cfg.timeouts.image_pipeline_seconds.max(1)),
            doc_timeout: Duration::from_secs(cfg.timeouts.doc_analysis_seconds.max(1)),
        }
    }

    fn budget(&self, kind: &ToolKind) -> Duration {
        match kind {
            ToolKind::ImagePipeline => self.image_timeout,
            _ => self.doc_timeout,
        }
    }
}

struct ActiveJob {
    job: Mutex<Job>,
    cancel: AtomicBool,
}

pub struct JobManager {
    opts: ManagerOptions,
    planner: Planner,
    registry: ToolRegistry,
    executors: ExecutorSet,
    store: ManifestStore,
    events: EventBus,
    active: Mutex<HashMap<JobId, Arc<ActiveJob>>>,
    ids: Mutex<ulid::Generator>,
}

impl JobManager {
    pub fn new(
        opts: ManagerOptions,
        planner: Planner,
        registry: ToolRegistry,
        executors: ExecutorSet,
    ) -> Result<Self, JobError> {
        for kind in registry.kinds() {
            if executors.get(kind).is_none() {
                return Err(JobError::Config(format!(
                    "tool {kind} is enabled but has no executor"
                )));
            }
        }
        let store = ManifestStore::open(&opts.state_dir)?;
        Ok(Self {
            opts,
            planner,
            registry,
            executors,
            store,
            events: EventBus::default(),
            active: Mutex::new(HashMap::new()),
            ids: Mutex::new(ulid::Generator::new()),
        })
    }

    /// Production wiring: Ollama planner, ComfyUI and document service workers.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let planner = Planner::from_config(cfg);
        let registry = ToolRegistry::with_enabled(&cfg.tools.enabled)?;
        let catalog = PipelineCatalog::load(Path::new(&cfg.paths.pipelines_dir))?;

        let image = ImageExecutor::new(
            Arc::new(ComfyClient::new(&cfg.workers.image)),
            catalog,
            Arc::new(ConcurrencyGate::new(cfg.workers.image.max_concurrent)),
            cfg.tools.default_pipeline.clone(),
        );
        let doc = DocExecutor::new(
            Arc::new(DocServiceClient::new(&cfg.workers.doc)),
            Arc::new(ConcurrencyGate::new(cfg.workers.doc.max_concurrent)),
        );
        let executors = ExecutorSet::new()
            .with(Box::new(image))
            .with(Box::new(doc));

        Ok(Self::new(
            ManagerOptions::from_config(cfg),
            planner,
            registry,
            executors,
        )?)
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn job_output_dir(&self, id: &JobId) -> PathBuf {
        self.opts.output_dir.join(id.as_str())
    }

    fn next_id(&self) -> JobId {
        let id = self
            .ids
            .lock()
            .generate()
            .unwrap_or_else(|_| ulid::Ulid::new());
        JobId::from_ulid(id)
    }

    /// Scan, plan and validate without creating a job.
    pub fn prepare(&self, intent: &str) -> Result<(Inventory, ValidatedPlan), CreateJobError> {
        let inventory = scan(&self.opts.input_dir, &self.opts.scan)?;
        let draft = self.planner.plan(&inventory, intent, &self.registry)?;
        let plan = validate(&draft, &inventory, &self.registry).map_err(|errors| {
            for e in &errors {
                warn!("plan rejected: {e}");
            }
            CreateJobError::Validation(errors)
        })?;
        Ok((inventory, plan))
    }

    /// Scan, plan, validate, persist as `pending`. Nothing is written unless
    /// every stage succeeds.
    pub fn create_job(&self, intent: &str) -> Result<JobId, CreateJobError> {
        let (inventory, plan) = self.prepare(intent)?;
        let id = self.next_id();
        let job = Job::new(
            id.clone(),
            intent.trim().to_string(),
            inventory,
            plan,
            now_rfc3339(),
        );
        self.store.persist(&job)?;
        info!(
            "job created id={id} steps={} intent=\"{}\"",
            job.steps.len(),
            excerpt(&job.intent, 60)
        );
        self.events.emit(JobEvent::JobCreated {
            job_id: id.clone(),
            steps: job.steps.len(),
        });
        Ok(id)
    }

    pub fn get_job(&self, id: &JobId) -> Result<Job, JobError> {
        let active = self.active.lock().get(id).cloned();
        match active {
            Some(a) => Ok(a.job.lock().clone()),
            None => Ok(self.store.load(id)?),
        }
    }

    pub fn list_jobs(&self, since: Option<OffsetDateTime>) -> Result<Vec<JobId>, JobError> {
        Ok(self.store.list(since)?)
    }

    /// Jobs the manifest says are `running` but nothing in this process drives.
    pub fn resumable_jobs(&self) -> Result<Vec<JobId>, JobError> {
        let mut out = Vec::new();
        for id in self.store.list(None)? {
            if self.active.lock().contains_key(&id) {
                continue;
            }
            match self.store.load(&id) {
                Ok(job) if job.status == JobStatus::Running => out.push(id),
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable manifest {id}: {e}"),
            }
        }
        Ok(out)
    }

    pub fn subscribe(&self) -> mpsc::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Drives a `pending` job, or resumes a `running` one left behind by a
    /// dead process, to a terminal status.
    pub fn run_job(&self, id: &JobId) -> Result<JobStatus, JobError> {
        let active = {
            let mut active = self.active.lock();
            if active.contains_key(id) {
                return Err(JobError::AlreadyRunning(id.clone()));
            }
            let job = self.store.load(id)?;
            if job.status.is_terminal() {
                return Err(JobError::Terminal {
                    job_id: id.clone(),
                    status: job.status,
                });
            }
            let entry = Arc::new(ActiveJob {
                job: Mutex::new(job),
                cancel: AtomicBool::new(false),
            });
            active.insert(id.clone(), entry.clone());
            entry
        };

        let result = self.drive(id, &active);
        self.active.lock().remove(id);
        result
    }

    pub fn cancel_job(&self, id: &JobId) -> Result<JobStatus, JobError> {
        let active = self.active.lock();
        let running_here = active.get(id).cloned();
        if let Some(entry) = running_here {
            drop(active);
            let mut job = entry.job.lock();
            // Finalized but not yet deregistered.
            if job.status.is_terminal() {
                return Err(JobError::Terminal {
                    job_id: id.clone(),
                    status: job.status,
                });
            }
            entry.cancel.store(true, Ordering::SeqCst);
            job.cancel_requested = true;
            job.updated_at = now_rfc3339();
            self.store.persist(&job)?;
            info!("cancel requested for running job {id}");
            return Ok(job.status);
        }

        // Not driven here: the active lock stays held so no run_job can claim
        // the job while its manifest is rewritten.
        let mut job = self.store.load(id)?;
        match job.status {
            s if s.is_terminal() => Err(JobError::Terminal {
                job_id: id.clone(),
                status: s,
            }),
            JobStatus::Pending => {
                let now = now_rfc3339();
                for step in job.steps.iter_mut() {
                    step.skip(&ExecutionErrorKind::Cancelled, now.clone())?;
                }
                job.cancel_requested = true;
                job.set_status(JobStatus::Failed, now)?;
                self.store.persist(&job)?;
                drop(active);
                info!("pending job {id} cancelled");
                self.events.emit(JobEvent::JobStatusChanged {
                    job_id: id.clone(),
                    status: JobStatus::Failed,
                });
                Ok(JobStatus::Failed)
            }
            status => {
                // Driven by another process, or orphaned by a crash.
                self.store.request_cancel(id)?;
                info!("cancel marker written for job {id} ({status})");
                Ok(status)
            }
        }
    }

    fn cancelled(&self, id: &JobId, entry: &ActiveJob) -> bool {
        if entry.cancel.load(Ordering::SeqCst) {
            return true;
        }
        if self.store.cancel_requested(id) {
            entry.cancel.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    fn drive(&self, id: &JobId, entry: &ActiveJob) -> Result<JobStatus, JobError> {
        let output_root = self.job_output_dir(id);
        std::fs::create_dir_all(&output_root).map_err(|source| JobError::OutputDir {
            path: output_root.clone(),
            source,
        })?;

        {
            let mut job = entry.job.lock();
            if job.cancel_requested {
                entry.cancel.store(true, Ordering::SeqCst);
            }
            if job.status == JobStatus::Running {
                self.recover(&mut job)?;
            }
        }

        loop {
            let (batch, failed_step) = {
                let job = entry.job.lock();
                let pending = job.pending_steps();
                if pending.is_empty() {
                    break;
                }
                let failed = job
                    .steps
                    .iter()
                    .find(|s| s.status == StepStatus::Failed)
                    .map(|s| s.index);
                let batches = dispatch_batches(&job.steps, &pending, self.opts.max_parallel_steps);
                (batches.into_iter().next().unwrap_or_default(), failed)
            };
            if batch.is_empty() {
                break;
            }

            if self.cancelled(id, entry) {
                self.skip_pending(id, entry, &ExecutionErrorKind::Cancelled)?;
                break;
            }
            if let (FailurePolicy::SkipRemaining, Some(failed_step)) =
                (self.opts.on_step_failure, failed_step)
            {
                self.skip_pending(id, entry, &ExecutionErrorKind::Dependency { failed_step })?;
                break;
            }

            self.mark_running(id, entry)?;
            if let [idx] = batch.as_slice() {
                self.run_step(id, entry, *idx, &output_root)?;
            } else {
                debug!("job={id} dispatching batch {batch:?}");
                let results: Vec<Result<(), JobError>> = std::thread::scope(|s| {
                    let handles: Vec<_> = batch
                        .iter()
                        .map(|&idx| {
                            let output_root = &output_root;
                            (idx, s.spawn(move || self.run_step(id, entry, idx, output_root)))
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|(idx, h)| h.join().unwrap_or(Err(JobError::StepPanicked(idx))))
                        .collect()
                });
                for r in results {
                    r?;
                }
            }
        }

        self.finalize(id, entry)
    }

    /// A step recorded as `running` was in flight when its process died.
    /// It is failed, never re-executed.
    fn recover(&self, job: &mut Job) -> Result<(), JobError> {
        let now = now_rfc3339();
        let mut changed = false;
        for step in job.steps.iter_mut() {
            if step.status == StepStatus::Running {
                warn!("job={} step={} was interrupted; marking failed", job.job_id, step.index);
                let outputs = std::mem::take(&mut step.outputs);
                let warnings = std::mem::take(&mut step.warnings);
                step.fail(&ExecutionErrorKind::Interrupted, outputs, warnings, now.clone())?;
                changed = true;
            }
        }
        info!("resuming job {} ({} pending steps)", job.job_id, job.pending_steps().len());
        if changed {
            job.updated_at = now;
            self.store.persist(job)?;
        }
        Ok(())
    }

    fn mark_running(&self, id: &JobId, entry: &ActiveJob) -> Result<(), JobError> {
        let mut job = entry.job.lock();
        if job.status != JobStatus::Pending {
            return Ok(());
        }
        job.set_status(JobStatus::Running, now_rfc3339())?;
        self.store.persist(&job)?;
        drop(job);
        info!("job {id} running");
        self.events.emit(JobEvent::JobStatusChanged {
            job_id: id.clone(),
            status: JobStatus::Running,
        });
        Ok(())
    }

    fn skip_pending(
        &self,
        id: &JobId,
        entry: &ActiveJob,
        cause: &ExecutionErrorKind,
    ) -> Result<(), JobError> {
        let now = now_rfc3339();
        let mut job = entry.job.lock();
        let mut skipped = Vec::new();
        for step in job.steps.iter_mut() {
            if step.status == StepStatus::Pending {
                step.skip(cause, now.clone())?;
                skipped.push(step.index);
            }
        }
        job.updated_at = now;
        self.store.persist(&job)?;
        drop(job);
        info!("job={id} skipped steps {skipped:?}: {cause}");
        for step_index in skipped {
            self.events.emit(JobEvent::StepSkipped {
                job_id: id.clone(),
                step_index,
                reason: cause.failure_kind(),
            });
        }
        Ok(())
    }

    fn run_step(
        &self,
        id: &JobId,
        entry: &ActiveJob,
        idx: usize,
        output_root: &Path,
    ) -> Result<(), JobError> {
        let spec = {
            let mut job = entry.job.lock();
            let now = now_rfc3339();
            job.steps[idx].start(now.clone())?;
            job.updated_at = now;
            self.store.persist(&job)?;
            job.steps[idx].spec.clone()
        };
        let kind = spec.tool_kind();
        info!("job={id} step={idx} started tool={kind}");
        self.events.emit(JobEvent::StepStarted {
            job_id: id.clone(),
            step_index: idx,
        });

        let budget = self.opts.budget(&kind);
        let ctx = StepContext {
            job_id: id,
            step_index: idx,
            input_root: &self.opts.input_dir,
            output_root,
            deadline: Instant::now() + budget,
            budget,
            partial_outputs: self.opts.partial_step_outputs,
        };
        let outcome = match self.executors.get(&kind) {
            Some(executor) => executor.execute(&ctx, &spec),
            None => StepOutcome::failed(ExecutionErrorKind::Worker {
                detail: format!("no executor registered for {kind}"),
            }),
        };

        let (status, n_outputs) = {
            let mut job = entry.job.lock();
            let now = now_rfc3339();
            let n = outcome.outputs.len();
            let step = &mut job.steps[idx];
            match &outcome.failure {
                None => step.succeed(outcome.outputs, outcome.warnings, now.clone())?,
                Some(cause) => step.fail(cause, outcome.outputs, outcome.warnings, now.clone())?,
            }
            let status = step.status;
            job.updated_at = now;
            self.store.persist(&job)?;
            (status, n)
        };
        match &outcome.failure {
            None => info!("job={id} step={idx} succeeded outputs={n_outputs}"),
            Some(cause) => {
                let err = ExecutionError {
                    step_index: idx,
                    kind: cause.clone(),
                };
                warn!("job={id} {err}");
            }
        }
        self.events.emit(JobEvent::StepFinished {
            job_id: id.clone(),
            step_index: idx,
            status,
            outputs: n_outputs,
        });
        Ok(())
    }

    fn finalize(&self, id: &JobId, entry: &ActiveJob) -> Result<JobStatus, JobError> {
        let mut job = entry.job.lock();
        let terminal = resolve_terminal(&job.steps);
        job.set_status(terminal, now_rfc3339())?;
        self.store.persist(&job)?;
        drop(job);
        info!("job {id} finished status={terminal}");
        self.events.emit(JobEvent::JobStatusChanged {
            job_id: id.clone(),
            status: terminal,
        });
        Ok(terminal)
    }
}
