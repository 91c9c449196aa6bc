use super::{
    ImageWorker, http_agent, join_url,
    types::{GraphStatus, OutputImage},
};
use crate::{config::ImageWorker as ImageWorkerCfg, error::WorkerError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "image worker";

/// HTTP client for a ComfyUI-style image graph engine.
pub struct ComfyClient {
    base_url: String,
    client_id: String,
    poll_interval: Duration,
    max_download_bytes: u64,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct UploadReply {
    name: String,
    #[serde(default)]
    subfolder: String,
}

#[derive(Deserialize)]
struct QueueReply {
    prompt_id: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    status: Option<HistoryStatus>,
    #[serde(default)]
    outputs: BTreeMap<String, NodeOutput>,
}

#[derive(Deserialize)]
struct HistoryStatus {
    #[serde(default)]
    status_str: String,
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct NodeOutput {
    #[serde(default)]
    images: Vec<OutputImage>,
}

impl ComfyClient {
    pub fn new(cfg: &ImageWorkerCfg) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            client_id: format!("filecherry-{}", ulid::Ulid::new()),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(10)),
            max_download_bytes: cfg.max_download_bytes,
            agent: http_agent(Duration::from_secs(cfg.request_timeout_seconds.max(1))),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => "image/jpeg",
    }
}

fn multipart_body(boundary: &str, file_name: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
    let file_name = file_name.replace('"', "_");
    let mut body = Vec::with_capacity(data.len() + 512);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"image\"; filename=\"{file_name}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"overwrite\"\r\n\r\ntrue\r\n");
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

fn status_message(status: &HistoryStatus) -> String {
    // Messages look like ["execution_error", {"exception_message": "..."}].
    for msg in &status.messages {
        if let Some(pair) = msg.as_array() {
            if pair.first().and_then(|v| v.as_str()) == Some("execution_error") {
                if let Some(text) = pair
                    .get(1)
                    .and_then(|d| d.get("exception_message"))
                    .and_then(|v| v.as_str())
                {
                    return text.trim().to_string();
                }
            }
        }
    }
    "graph execution failed".to_string()
}

impl ImageWorker for ComfyClient {
    fn upload_image(&self, path: &Path) -> Result<String, WorkerError> {
        let data = std::fs::read(path).map_err(|source| WorkerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image");
        let boundary = format!("filecherry-{}", ulid::Ulid::new());
        let body = multipart_body(&boundary, file_name, content_type_for(path), &data);

        let mut resp = self
            .agent
            .post(self.url("/upload/image").as_str())
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .send(&body[..])
            .map_err(|e| WorkerError::from_ureq(SERVICE, e))?;
        let reply: UploadReply = resp.body_mut().read_json().map_err(|e| WorkerError::Protocol {
            service: SERVICE,
            detail: format!("upload reply: {e}"),
        })?;
        debug!("uploaded {} as {}", path.display(), reply.name);
        if reply.subfolder.is_empty() {
            Ok(reply.name)
        } else {
            Ok(format!("{}/{}", reply.subfolder, reply.name))
        }
    }

    fn queue_graph(&self, graph: &serde_json::Value) -> Result<String, WorkerError> {
        let body = serde_json::json!({ "prompt": graph, "client_id": self.client_id });
        let mut resp = self
            .agent
            .post(self.url("/prompt").as_str())
            .send_json(&body)
            .map_err(|e| WorkerError::from_ureq(SERVICE, e))?;
        let reply: QueueReply = resp.body_mut().read_json().map_err(|e| WorkerError::Protocol {
            service: SERVICE,
            detail: format!("queue reply: {e}"),
        })?;
        if let Some(err) = reply.error {
            return Err(WorkerError::Reported {
                service: SERVICE,
                detail: err.to_string(),
            });
        }
        reply.prompt_id.ok_or_else(|| WorkerError::Protocol {
            service: SERVICE,
            detail: "no prompt_id in queue reply".into(),
        })
    }

    fn poll(&self, prompt_id: &str) -> Result<GraphStatus, WorkerError> {
        let mut resp = self
            .agent
            .get(self.url(&format!("/history/{prompt_id}")).as_str())
            .call()
            .map_err(|e| WorkerError::from_ureq(SERVICE, e))?;
        let mut history: BTreeMap<String, HistoryEntry> =
            resp.body_mut().read_json().map_err(|e| WorkerError::Protocol {
                service: SERVICE,
                detail: format!("history reply: {e}"),
            })?;
        let Some(entry) = history.remove(prompt_id) else {
            return Ok(GraphStatus::Pending);
        };
        let Some(status) = entry.status else {
            return Ok(GraphStatus::Pending);
        };
        match status.status_str.as_str() {
            "success" => Ok(GraphStatus::Succeeded {
                images: entry
                    .outputs
                    .into_values()
                    .flat_map(|n| n.images)
                    .collect(),
            }),
            "error" => Ok(GraphStatus::Failed {
                message: status_message(&status),
            }),
            _ => Ok(GraphStatus::Pending),
        }
    }

    fn download(&self, image: &OutputImage) -> Result<Vec<u8>, WorkerError> {
        let mut resp = self
            .agent
            .get(self.url("/view").as_str())
            .query("filename", &image.filename)
            .query("subfolder", &image.subfolder)
            .query("type", &image.kind)
            .call()
            .map_err(|e| WorkerError::from_ureq(SERVICE, e))?;
        resp.body_mut()
            .with_config()
            .limit(self.max_download_bytes)
            .read_to_vec()
            .map_err(|e| WorkerError::Protocol {
                service: SERVICE,
                detail: format!("download {}: {e}", image.filename),
            })
    }

    fn health(&self) -> Result<(), WorkerError> {
        self.agent
            .get(self.url("/system_stats").as_str())
            .call()
            .map(|_| ())
            .map_err(|e| WorkerError::from_ureq(SERVICE, e))
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
