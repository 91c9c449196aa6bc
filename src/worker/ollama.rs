use super::{PlanningService, http_agent, join_url, types::PlanningRequest};
use crate::{
    config::Planner as PlannerCfg,
    error::{PlanningError, WorkerError},
};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Planning service backed by a local Ollama `/api/chat` endpoint.
pub struct OllamaClient {
    base_url: String,
    model: String,
    temperature: f32,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct ChatReply {
    message: Option<ChatMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

impl OllamaClient {
    pub fn new(cfg: &PlannerCfg) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            agent: http_agent(Duration::from_secs(cfg.request_timeout_seconds.max(1))),
        }
    }

    fn unreachable(&self, detail: String) -> PlanningError {
        PlanningError::Unreachable {
            endpoint: self.base_url.clone(),
            detail,
        }
    }
}

/// JSON schema handed to Ollama's structured output `format`.
fn plan_format() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" },
            "steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "tool": { "type": "string" },
                        "params": { "type": "object" }
                    },
                    "required": ["tool", "params"]
                }
            }
        },
        "required": ["summary", "steps"]
    })
}

impl PlanningService for OllamaClient {
    fn complete(&self, req: &PlanningRequest) -> Result<String, PlanningError> {
        let url = join_url(&self.base_url, "/api/chat");
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": req.system_context },
                { "role": "user", "content": req.user_message() },
            ],
            "stream": false,
            "format": plan_format(),
            "options": { "temperature": self.temperature },
        });
        debug!("planner request model={} url={url}", self.model);

        let mut resp = match self.agent.post(url.as_str()).send_json(&body) {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(status)) => return Err(PlanningError::Status { status }),
            Err(e) => return Err(self.unreachable(e.to_string())),
        };
        let reply: ChatReply = resp
            .body_mut()
            .read_json()
            .map_err(|e| PlanningError::BadEnvelope {
                detail: e.to_string(),
            })?;
        if let Some(err) = reply.error {
            return Err(PlanningError::BadEnvelope { detail: err });
        }
        match reply.message {
            Some(m) if !m.content.trim().is_empty() => Ok(m.content),
            _ => Err(PlanningError::BadEnvelope {
                detail: "empty message content".into(),
            }),
        }
    }

    fn health(&self) -> Result<(), WorkerError> {
        let url = join_url(&self.base_url, "/api/tags");
        self.agent
            .get(url.as_str())
            .call()
            .map(|_| ())
            .map_err(|e| WorkerError::from_ureq("planner", e))
    }

    fn endpoint(&self) -> &str {
        &self.base_url
    }
}
