use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One planning round trip: everything the planning service gets to see.
#[derive(Debug, Clone, Serialize)]
pub struct PlanningRequest {
    pub system_context: String,
    pub inventory_summary: String,
    pub intent: String,
    pub tool_schema: serde_json::Value,
}

impl PlanningRequest {
    pub fn user_message(&self) -> String {
        let tools = serde_json::to_string_pretty(&self.tool_schema).unwrap_or_default();
        format!(
            "Available tools:\n{tools}\n\nInventory:\n{}\n\nUser request: {}\n\n\
             Respond with a single JSON object: \
             {{\"summary\": string, \"steps\": [{{\"tool\": string, \"params\": object}}]}}. \
             Use only paths listed in the inventory.",
            self.inventory_summary, self.intent
        )
    }
}

/// Image file reference as reported by the image graph engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_image_kind")]
    pub kind: String,
}

fn default_image_kind() -> String {
    "output".into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphStatus {
    /// Not in history yet, or still executing.
    Pending,
    Succeeded { images: Vec<OutputImage> },
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DocInput {
    /// Inventory-relative path, echoed back in sources and failures.
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocTask {
    pub kind: String,
    pub query: String,
    pub documents: Vec<DocInput>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocResult {
    #[serde(default)]
    pub markdown: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub failures: Vec<DocFailure>,
}
