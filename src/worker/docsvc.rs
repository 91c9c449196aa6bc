use super::{
    DocWorker, http_agent, join_url,
    types::{DocResult, DocTask, TaskState},
};
use crate::{config::DocWorker as DocWorkerCfg, error::WorkerError};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "doc worker";

/// HTTP client for the document analysis service (submit, poll, fetch).
pub struct DocServiceClient {
    base_url: String,
    submit_path: String,
    status_path: String,
    result_path: String,
    poll_interval: Duration,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct SubmitReply {
    #[serde(alias = "id")]
    task_id: Option<String>,
}

#[derive(Deserialize)]
struct StatusReply {
    #[serde(alias = "state")]
    status: String,
    #[serde(default)]
    error: Option<String>,
}

impl DocServiceClient {
    pub fn new(cfg: &DocWorkerCfg) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            submit_path: cfg.submit_path.clone(),
            status_path: cfg.status_path.clone(),
            result_path: cfg.result_path.clone(),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(10)),
            agent: http_agent(Duration::from_secs(cfg.request_timeout_seconds.max(1))),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn task_url(&self, template: &str, task_id: &str) -> String {
        join_url(&self.base_url, &template.replace("{id}", task_id))
    }
}

fn parse_state(reply: StatusReply) -> Result<TaskState, WorkerError> {
    match reply.status.to_ascii_lowercase().as_str() {
        "queued" | "pending" => Ok(TaskState::Queued),
        "running" | "processing" => Ok(TaskState::Running),
        "done" | "completed" | "succeeded" | "success" => Ok(TaskState::Done),
        "failed" | "error" => Ok(TaskState::Failed {
            message: reply.error.unwrap_or_else(|| "task failed".into()),
        }),
        other => Err(WorkerError::Protocol {
            service: SERVICE,
            detail: format!("unknown task status '{other}'"),
        }),
    }
}

impl DocWorker for DocServiceClient {
    fn submit(&self, task: &DocTask) -> Result<String, WorkerError> {
        let mut resp = self
            .agent
            .post(join_url(&self.base_url, &self.submit_path).as_str())
            .send_json(task)
            .map_err(|e| WorkerError::from_ureq(SERVICE, e))?;
        let reply: SubmitReply = resp.body_mut().read_json().map_err(|e| WorkerError::Protocol {
            service: SERVICE,
            detail: format!("submit reply: {e}"),
        })?;
        let id = reply.task_id.ok_or_else(|| WorkerError::Protocol {
            service: SERVICE,
            detail: "no task_id in submit reply".into(),
        })?;
        debug!("doc task submitted id={id} kind={} docs={}", task.kind, task.documents.len());
        Ok(id)
    }

    fn poll(&self, task_id: &str) -> Result<TaskState, WorkerError> {
        let mut resp = self
            .agent
            .get(self.task_url(&self.status_path, task_id).as_str())
            .call()
            .map_err(|e| WorkerError::from_ureq(SERVICE, e))?;
        let reply: StatusReply = resp.body_mut().read_json().map_err(|e| WorkerError::Protocol {
            service: SERVICE,
            detail: format!("status reply: {e}"),
        })?;
        parse_state(reply)
    }

    fn fetch_result(&self, task_id: &str) -> Result<DocResult, WorkerError> {
        let mut resp = self
            .agent
            .get(self.task_url(&self.result_path, task_id).as_str())
            .call()
            .map_err(|e| WorkerError::from_ureq(SERVICE, e))?;
        resp.body_mut().read_json().map_err(|e| WorkerError::Protocol {
            service: SERVICE,
            detail: format!("result reply: {e}"),
        })
    }

    fn health(&self) -> Result<(), WorkerError> {
        self.agent
            .get(join_url(&self.base_url, "/health").as_str())
            .call()
            .map(|_| ())
            .map_err(|e| WorkerError::from_ureq(SERVICE, e))
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
