#![allow(dead_code)]

use filecherry::{
    config::FailurePolicy,
    error::{PlanningError, WorkerError},
    executor::{DocExecutor, ExecutorSet, ImageExecutor, Pipeline, PipelineCatalog, PipelineSchema},
    inventory::ScanOptions,
    manager::{JobManager, ManagerOptions},
    planner::{Planner, PromptTemplate},
    tools::ToolRegistry,
    worker::{
        ConcurrencyGate, DocFailure, DocResult, DocTask, DocWorker, GraphStatus, ImageWorker,
        OutputImage, PlanningRequest, PlanningService, TaskState,
    },
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::time::Duration;

pub struct FakePlanner {
    pub reply: String,
    pub requests: Mutex<Vec<PlanningRequest>>,
}

impl FakePlanner {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl PlanningService for FakePlanner {
    fn complete(&self, req: &PlanningRequest) -> Result<String, PlanningError> {
        self.requests.lock().push(req.clone());
        Ok(self.reply.clone())
    }

    fn health(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    fn endpoint(&self) -> &str {
        "fake://planner"
    }
}

/// Image worker that "processes" every upload except the names in `fail`.
#[derive(Default)]
pub struct FakeImageWorker {
    pub fail: HashSet<String>,
    /// Uploads never finish; the step runs into its deadline.
    pub hang: bool,
    /// Images each finished graph reports; zero counts as one.
    pub outputs_per_image: usize,
    /// Output filenames whose download is refused with a 500.
    pub fail_downloads: HashSet<String>,
    /// The next upload waits on this barrier before returning.
    pub hold: Mutex<Option<Arc<Barrier>>>,
    pub uploads: Mutex<Vec<String>>,
    pub graphs: Mutex<Vec<serde_json::Value>>,
}

impl FakeImageWorker {
    pub fn failing(names: &[&str]) -> Self {
        Self {
            fail: names.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().len()
    }

    /// Blocks the next upload until the returned barrier is waited on.
    pub fn hold_next_upload(&self) -> Arc<Barrier> {
        let barrier = Arc::new(Barrier::new(2));
        *self.hold.lock() = Some(barrier.clone());
        barrier
    }
}

fn loaded_image(graph: &serde_json::Value) -> Option<String> {
    graph.as_object()?.values().find_map(|node| {
        if node.get("class_type")?.as_str()? == "LoadImage" {
            node.get("inputs")?.get("image")?.as_str().map(String::from)
        } else {
            None
        }
    })
}

impl ImageWorker for FakeImageWorker {
    fn upload_image(&self, path: &Path) -> Result<String, WorkerError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        std::fs::metadata(path).map_err(|source| WorkerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.uploads.lock().push(name.clone());
        let held = self.hold.lock().take();
        if let Some(barrier) = held {
            barrier.wait();
        }
        Ok(name)
    }

    fn queue_graph(&self, graph: &serde_json::Value) -> Result<String, WorkerError> {
        self.graphs.lock().push(graph.clone());
        let image = loaded_image(graph).unwrap_or_default();
        Ok(format!("prompt-{image}"))
    }

    fn poll(&self, prompt_id: &str) -> Result<GraphStatus, WorkerError> {
        let image = prompt_id.trim_start_matches("prompt-");
        if self.hang {
            return Ok(GraphStatus::Pending);
        }
        if self.fail.contains(image) {
            return Ok(GraphStatus::Failed {
                message: format!("cannot process {image}"),
            });
        }
        let images = (0..self.outputs_per_image.max(1))
            .map(|k| OutputImage {
                filename: if k == 0 {
                    format!("filecherry_{image}.png")
                } else {
                    format!("filecherry_{image}_{k}.png")
                },
                subfolder: String::new(),
                kind: "output".into(),
            })
            .collect();
        Ok(GraphStatus::Succeeded { images })
    }

    fn download(&self, image: &OutputImage) -> Result<Vec<u8>, WorkerError> {
        if self.fail_downloads.contains(&image.filename) {
            return Err(WorkerError::Status {
                service: "image worker",
                status: 500,
            });
        }
        Ok(format!("PNG:{}", image.filename).into_bytes())
    }

    fn health(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(5)
    }
}

pub struct FakeDocWorker {
    pub markdown: String,
    pub failures: Vec<DocFailure>,
    pub reject: bool,
    pub tasks: Mutex<Vec<DocTask>>,
}

impl FakeDocWorker {
    pub fn ok(markdown: &str) -> Self {
        Self {
            markdown: markdown.into(),
            failures: Vec::new(),
            reject: false,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reject: true,
            ..Self::ok("")
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl DocWorker for FakeDocWorker {
    fn submit(&self, task: &DocTask) -> Result<String, WorkerError> {
        let mut tasks = self.tasks.lock();
        tasks.push(task.clone());
        Ok(format!("task-{}", tasks.len()))
    }

    fn poll(&self, _task_id: &str) -> Result<TaskState, WorkerError> {
        if self.reject {
            Ok(TaskState::Failed {
                message: "document service crashed".into(),
            })
        } else {
            Ok(TaskState::Done)
        }
    }

    fn fetch_result(&self, _task_id: &str) -> Result<DocResult, WorkerError> {
        let sources = self
            .tasks
            .lock()
            .last()
            .map(|t| t.documents.iter().map(|d| d.id.clone()).collect())
            .unwrap_or_default();
        Ok(DocResult {
            markdown: self.markdown.clone(),
            sources,
            failures: self.failures.clone(),
        })
    }

    fn health(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(5)
    }
}

pub fn cleanup_pipeline() -> Pipeline {
    let schema: PipelineSchema = toml::from_str(
        r#"
name = "photo_cleanup_v1"
graph_file = "photo_cleanup_v1.json"
keywords = ["clean", "dealership"]

[[params]]
name = "contrast"
default = 1.0
min = 0.5
max = 2.0
node = "3"
input = "contrast"

[semantic_controls.bright]
contrast = 1.2
"#,
    )
    .expect("pipeline schema");
    Pipeline {
        schema,
        graph: serde_json::json!({
            "1": {"class_type": "LoadImage", "inputs": {"image": "placeholder.png"}},
            "3": {"class_type": "ImageAdjust", "inputs": {"image": ["1", 0], "contrast": 1.0}},
            "9": {"class_type": "SaveImage", "inputs": {"images": ["3", 0]}}
        }),
    }
}

/// Temp workspace with an input folder and state/output dirs.
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("inputs")).expect("inputs dir");
        Self { dir }
    }

    pub fn input_dir(&self) -> PathBuf {
        self.dir.path().join("inputs")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("outputs")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    pub fn write_input(&self, rel: &str, bytes: &[u8]) {
        let path = self.input_dir().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dir");
        }
        std::fs::write(path, bytes).expect("write input");
    }

    pub fn options(&self) -> ManagerOptions {
        ManagerOptions {
            input_dir: self.input_dir(),
            output_dir: self.output_dir(),
            state_dir: self.state_dir(),
            scan: ScanOptions::default(),
            max_parallel_steps: 1,
            on_step_failure: FailurePolicy::Continue,
            partial_step_outputs: true,
            image_timeout: Duration::from_secs(5),
            doc_timeout: Duration::from_secs(5),
        }
    }

    pub fn manifest_count(&self) -> usize {
        match std::fs::read_dir(self.state_dir().join("manifests")) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
                .count(),
            Err(_) => 0,
        }
    }
}

pub struct Harness {
    pub manager: JobManager,
    pub planner: Arc<FakePlanner>,
    pub image: Arc<FakeImageWorker>,
    pub doc: Arc<FakeDocWorker>,
}

struct SharedPlanner(Arc<FakePlanner>);

impl PlanningService for SharedPlanner {
    fn complete(&self, req: &PlanningRequest) -> Result<String, PlanningError> {
        self.0.complete(req)
    }

    fn health(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    fn endpoint(&self) -> &str {
        self.0.endpoint()
    }
}

pub fn harness(
    opts: ManagerOptions,
    planner_reply: &str,
    image: FakeImageWorker,
    doc: FakeDocWorker,
) -> Harness {
    let planner = Arc::new(FakePlanner::new(planner_reply));
    let image = Arc::new(image);
    let doc = Arc::new(doc);

    let executors = ExecutorSet::new()
        .with(Box::new(ImageExecutor::new(
            image.clone(),
            PipelineCatalog::new(vec![cleanup_pipeline()]),
            Arc::new(ConcurrencyGate::new(1)),
            "photo_cleanup_v1",
        )))
        .with(Box::new(DocExecutor::new(
            doc.clone(),
            Arc::new(ConcurrencyGate::new(2)),
        )));
    let manager = JobManager::new(
        opts,
        Planner::new(
            Box::new(SharedPlanner(planner.clone())),
            Arc::new(PromptTemplate::builtin()),
            20,
        ),
        ToolRegistry::builtin(),
        executors,
    )
    .expect("manager");
    Harness {
        manager,
        planner,
        image,
        doc,
    }
}

/// Plan reply with one image step and one doc step.
pub fn two_step_plan(images: &[&str], docs: &[&str]) -> String {
    serde_json::json!({
        "plan": {
            "summary": "clean photos and summarize documents",
            "steps": [
                {"tool": "IMAGE_PIPELINE", "params": {
                    "purpose": "dealership-ready photos",
                    "style": "bright",
                    "input_paths": images,
                }},
                {"tool": "DOC_ANALYSIS", "params": {
                    "query": "summarize the service records",
                    "output_kind": "summary",
                    "input_paths": docs,
                }}
            ]
        }
    })
    .to_string()
}
