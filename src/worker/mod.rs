//! Seams to the external services: the planning model, the image graph
//! engine and the document service. HTTP implementations live in the
//! submodules; tests substitute in-process fakes.

pub mod comfy;
pub mod docsvc;
pub mod gate;
pub mod ollama;
pub mod types;

use crate::error::{PlanningError, WorkerError};
use std::path::Path;
use std::time::Duration;

pub use comfy::ComfyClient;
pub use docsvc::DocServiceClient;
pub use gate::ConcurrencyGate;
pub use ollama::OllamaClient;
pub use types::{
    DocFailure, DocInput, DocResult, DocTask, GraphStatus, OutputImage, PlanningRequest, TaskState,
};

pub trait PlanningService: Send + Sync {
    /// Free-form model output expected to contain one JSON plan object.
    fn complete(&self, req: &PlanningRequest) -> Result<String, PlanningError>;
    fn health(&self) -> Result<(), WorkerError>;
    fn endpoint(&self) -> &str;
}

pub trait ImageWorker: Send + Sync {
    /// Returns the name the engine stored the image under.
    fn upload_image(&self, path: &Path) -> Result<String, WorkerError>;
    /// Returns the engine's prompt id.
    fn queue_graph(&self, graph: &serde_json::Value) -> Result<String, WorkerError>;
    fn poll(&self, prompt_id: &str) -> Result<GraphStatus, WorkerError>;
    fn download(&self, image: &OutputImage) -> Result<Vec<u8>, WorkerError>;
    fn health(&self) -> Result<(), WorkerError>;
    fn poll_interval(&self) -> Duration;
}

pub trait DocWorker: Send + Sync {
    /// Returns the service's task id.
    fn submit(&self, task: &DocTask) -> Result<String, WorkerError>;
    fn poll(&self, task_id: &str) -> Result<TaskState, WorkerError>;
    fn fetch_result(&self, task_id: &str) -> Result<DocResult, WorkerError>;
    fn health(&self) -> Result<(), WorkerError>;
    fn poll_interval(&self) -> Duration;
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceHealth {
    pub service: &'static str,
    pub endpoint: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ServiceHealth {
    pub fn from_result(
        service: &'static str,
        endpoint: &str,
        res: Result<(), WorkerError>,
    ) -> Self {
        match res {
            Ok(()) => Self {
                service,
                endpoint: endpoint.to_string(),
                ok: true,
                detail: None,
            },
            Err(e) => Self {
                service,
                endpoint: endpoint.to_string(),
                ok: false,
                detail: Some(e.to_string()),
            },
        }
    }
}

pub(crate) fn http_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
