use crate::{
    config::Config,
    error::CreateJobError,
    inventory::{ScanOptions, scan},
    job::{Job, JobId},
    manager::JobManager,
    util::{ensure_dir, parse_rfc3339},
    worker::{
        ComfyClient, DocServiceClient, DocWorker, ImageWorker, OllamaClient, PlanningService,
        ServiceHealth,
    },
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "filecherry")]
#[command(about = "Offline job orchestrator: intent + input folder -> validated plan -> worker steps")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./filecherry.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the planner and worker services answer.
    Doctor {},
    /// Print the inventory of the input folder.
    Scan {
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Plan and validate without creating a job.
    Plan { intent: String },
    /// Create a pending job; `--run` also drives it to completion.
    Create {
        intent: String,
        #[arg(long)]
        run: bool,
    },
    Run { job_id: String },
    Status {
        job_id: String,
        /// Print the whole manifest instead of a summary.
        #[arg(long)]
        full: bool,
    },
    Cancel { job_id: String },
    List {
        /// Only jobs created at or after this RFC 3339 timestamp.
        #[arg(long)]
        since: Option<String>,
    },
    /// Resume every job a previous process left running.
    Resume {},
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg_path = resolve_config_path(args.config.as_deref());
    let cfg = Config::load(&cfg_path)?;
    let log_path = resolve_log_path(&cfg);
    let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
    info!("config={}", cfg_path.display());

    if cfg.debug.dump_effective_config {
        let state_dir = cfg.state_dir();
        ensure_dir(&state_dir)?;
        let raw = toml::to_string(&cfg).unwrap_or_default();
        std::fs::write(state_dir.join("effective-config.toml"), raw)?;
    }

    match &args.cmd {
        Command::Doctor {} => doctor(&cfg),
        Command::Scan { input } => scan_cmd(&cfg, input.as_deref()),
        Command::Plan { intent } => plan(&cfg, intent),
        Command::Create { intent, run } => create(&cfg, intent, *run),
        Command::Run { job_id } => run(&cfg, job_id),
        Command::Status { job_id, full } => status(&cfg, job_id, *full),
        Command::Cancel { job_id } => cancel(&cfg, job_id),
        Command::List { since } => list(&cfg, since.as_deref()),
        Command::Resume {} => resume(&cfg),
    }
}

fn resolve_config_path(user: Option<&Path>) -> PathBuf {
    if let Some(p) = user {
        return p.to_path_buf();
    }
    let default = PathBuf::from("filecherry.toml");
    if default.exists() {
        default
    } else {
        PathBuf::from("filecherry.example.toml")
    }
}

fn init_logging(
    args: &Args,
    cfg: &Config,
    file_path: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command results, so log lines go to stderr.
    let console_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(cfg.state_dir().join("logs").join("filecherry.log"))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    JobId::parse(raw).map_err(|e| anyhow!("{e}"))
}

/// Flattens a creation failure into one report, listing every validation error.
fn creation_failure(err: CreateJobError) -> anyhow::Error {
    match err {
        CreateJobError::Validation(errors) => {
            let lines: Vec<String> = errors.iter().map(|e| format!("  - {e}")).collect();
            anyhow!(
                "plan rejected with {} validation error(s):\n{}",
                errors.len(),
                lines.join("\n")
            )
        }
        other => anyhow::Error::new(other),
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    let planner = OllamaClient::new(&cfg.planner);
    let image = ComfyClient::new(&cfg.workers.image);
    let doc = DocServiceClient::new(&cfg.workers.doc);
    let report = vec![
        ServiceHealth::from_result("planner", planner.endpoint(), planner.health()),
        ServiceHealth::from_result("image worker", image.endpoint(), ImageWorker::health(&image)),
        ServiceHealth::from_result("doc worker", doc.endpoint(), DocWorker::health(&doc)),
    ];
    print_json(&report)?;
    if report.iter().all(|h| h.ok) {
        Ok(())
    } else {
        Err(anyhow!("one or more services are unavailable"))
    }
}

fn scan_cmd(cfg: &Config, input: Option<&Path>) -> Result<()> {
    let root = input.map(PathBuf::from).unwrap_or_else(|| cfg.input_dir());
    let opts = ScanOptions {
        follow_symlinks_in_root: cfg.security.follow_symlinks_in_root,
    };
    let inventory = scan(&root, &opts)?;
    print_json(&inventory)
}

fn plan(cfg: &Config, intent: &str) -> Result<()> {
    let manager = JobManager::from_config(cfg)?;
    let (inventory, plan) = manager.prepare(intent).map_err(creation_failure)?;
    print_json(&serde_json::json!({
        "fingerprint": inventory.fingerprint,
        "files": inventory.items.len(),
        "plan": plan,
    }))
}

fn create(cfg: &Config, intent: &str, run_now: bool) -> Result<()> {
    let manager = JobManager::from_config(cfg)?;
    let id = manager.create_job(intent).map_err(creation_failure)?;
    if run_now {
        manager.run_job(&id)?;
    }
    let job = manager.get_job(&id)?;
    print_summary(cfg, &manager, &job)
}

fn run(cfg: &Config, raw_id: &str) -> Result<()> {
    let id = parse_job_id(raw_id)?;
    let manager = JobManager::from_config(cfg)?;
    manager.run_job(&id)?;
    let job = manager.get_job(&id)?;
    print_summary(cfg, &manager, &job)
}

fn status(cfg: &Config, raw_id: &str, full: bool) -> Result<()> {
    let id = parse_job_id(raw_id)?;
    let manager = JobManager::from_config(cfg)?;
    let job = manager.get_job(&id)?;
    if full {
        print_json(&job)
    } else {
        print_json(&job_summary(&manager, &job))
    }
}

fn cancel(cfg: &Config, raw_id: &str) -> Result<()> {
    let id = parse_job_id(raw_id)?;
    let manager = JobManager::from_config(cfg)?;
    let status = manager.cancel_job(&id)?;
    print_json(&serde_json::json!({ "job_id": id, "status": status }))
}

fn list(cfg: &Config, since: Option<&str>) -> Result<()> {
    let since = since.map(parse_rfc3339).transpose()?;
    let manager = JobManager::from_config(cfg)?;
    let ids = manager.list_jobs(since)?;
    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        let job = manager.get_job(&id)?;
        rows.push(serde_json::json!({
            "job_id": job.job_id,
            "status": job.status,
            "created_at": job.created_at,
            "intent": job.intent,
        }));
    }
    print_json(&rows)
}

fn resume(cfg: &Config) -> Result<()> {
    let manager = JobManager::from_config(cfg)?;
    let ids = manager.resumable_jobs()?;
    info!("{} job(s) to resume", ids.len());
    for id in ids {
        let status = manager
            .run_job(&id)
            .with_context(|| format!("resuming job {id}"))?;
        println!("{id} {status}");
    }
    Ok(())
}

fn job_summary(manager: &JobManager, job: &Job) -> serde_json::Value {
    let steps: Vec<serde_json::Value> = job
        .steps
        .iter()
        .map(|s| {
            serde_json::json!({
                "index": s.index,
                "tool": s.spec.tool_kind(),
                "status": s.status,
                "outputs": s.outputs,
                "warnings": s.warnings.len(),
                "error": s.error,
            })
        })
        .collect();
    serde_json::json!({
        "job_id": job.job_id,
        "status": job.status,
        "summary": job.plan.summary,
        "output_dir": manager.job_output_dir(&job.job_id),
        "steps": steps,
    })
}

fn print_summary(cfg: &Config, manager: &JobManager, job: &Job) -> Result<()> {
    if cfg.global.print_summary {
        print_json(&job_summary(manager, job))
    } else {
        println!("{}", job.job_id);
        Ok(())
    }
}
