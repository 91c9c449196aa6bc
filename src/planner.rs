//! Planning client: inventory + intent in, untrusted `PlanDraft` out.
//!
//! One request per call and no retry. Model output may wrap the plan in prose
//! or code fences; extraction tolerates that but nothing else.

use crate::{
    config::Config,
    error::PlanningError,
    inventory::Inventory,
    plan::{PlanDraft, StepDraft, ToolKind},
    tools::ToolRegistry,
    util::excerpt,
    worker::{OllamaClient, PlanningRequest, PlanningService},
};
use regex::Regex;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

const EXCERPT_CHARS: usize = 400;
const EXAMPLES_HEADING: &str = "## Examples";

const BUILTIN_PROMPT: &str = r#"You are the planning component of FileCherry, an offline file-processing appliance.
The user has placed files in an input folder and described what they want.

1. Read the inventory of available files.
2. Understand the user's intent.
3. Build a plan using only the available tools.
4. Reference only file paths that appear in the inventory, exactly as written.

Respond with ONLY valid JSON in this format:
{
  "summary": "Brief description of what will be done",
  "steps": [
    { "tool": "TOOL_NAME", "params": { "input_paths": ["..."] } }
  ]
}"#;

static FENCED_JSON: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n?(.*?)```").ok());

/// System context for the planning service, loaded once at startup.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    system: String,
}

impl PromptTemplate {
    pub fn builtin() -> Self {
        Self {
            system: BUILTIN_PROMPT.to_string(),
        }
    }

    /// Everything before the examples heading. Blank text falls back to the builtin.
    pub fn from_text(text: &str) -> Self {
        let head = match text.find(EXAMPLES_HEADING) {
            Some(idx) => &text[..idx],
            None => text,
        };
        let head = head.trim();
        if head.is_empty() {
            Self::builtin()
        } else {
            Self {
                system: head.to_string(),
            }
        }
    }

    /// Missing or unreadable files fall back to the builtin prompt with a warning.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!("loaded planner prompt from {}", path.display());
                Self::from_text(&text)
            }
            Err(e) => {
                warn!(
                    "planner prompt unavailable at {} ({e}); using builtin",
                    path.display()
                );
                Self::builtin()
            }
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }
}

pub struct Planner {
    service: Box<dyn PlanningService>,
    prompt: Arc<PromptTemplate>,
    max_listed_paths: usize,
    log_responses: bool,
}

impl Planner {
    pub fn new(
        service: Box<dyn PlanningService>,
        prompt: Arc<PromptTemplate>,
        max_listed_paths: usize,
    ) -> Self {
        Self {
            service,
            prompt,
            max_listed_paths,
            log_responses: false,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let prompt = Arc::new(PromptTemplate::load(Path::new(&cfg.paths.prompt_path)));
        let mut planner = Self::new(
            Box::new(OllamaClient::new(&cfg.planner)),
            prompt,
            cfg.planner.max_listed_paths,
        );
        planner.log_responses = cfg.debug.log_planner_response;
        planner
    }

    pub fn plan(
        &self,
        inventory: &Inventory,
        intent: &str,
        registry: &ToolRegistry,
    ) -> Result<PlanDraft, PlanningError> {
        let req = PlanningRequest {
            system_context: self.prompt.system().to_string(),
            inventory_summary: inventory_summary(inventory, self.max_listed_paths),
            intent: intent.trim().to_string(),
            tool_schema: registry.prompt_json(),
        };
        info!(
            "planning intent=\"{}\" files={} endpoint={}",
            excerpt(&req.intent, 60),
            inventory.items.len(),
            self.service.endpoint()
        );

        let raw = self.service.complete(&req)?;
        if self.log_responses {
            debug!("planner raw response: {raw}");
        }

        let value = extract_plan_json(&raw).ok_or_else(|| PlanningError::NoJson {
            excerpt: excerpt(&raw, EXCERPT_CHARS),
        })?;
        let draft = parse_plan(&value).map_err(|detail| PlanningError::Malformed {
            detail,
            excerpt: excerpt(&raw, EXCERPT_CHARS),
        })?;
        info!("plan draft steps={} summary=\"{}\"", draft.steps.len(), excerpt(&draft.summary, 80));
        Ok(draft)
    }
}

/// Per-kind counts followed by the first `max_paths` paths.
pub fn inventory_summary(inventory: &Inventory, max_paths: usize) -> String {
    let mut out = format!("Found {} files:\n", inventory.items.len());
    for (kind, count) in inventory.counts() {
        out.push_str(&format!("- {count} {}(s)\n", kind.as_str()));
    }
    out.push_str("\nFile paths:\n");
    for item in inventory.items.iter().take(max_paths) {
        let kind = if item.unreadable {
            "unreadable"
        } else {
            item.kind.as_str()
        };
        out.push_str(&format!("- {} ({kind})\n", item.path));
    }
    if inventory.items.len() > max_paths {
        out.push_str(&format!(
            "... and {} more files\n",
            inventory.items.len() - max_paths
        ));
    }
    out
}

/// First JSON object in `raw`: fenced blocks win, then the first balanced
/// `{...}` that parses.
pub fn extract_plan_json(raw: &str) -> Option<Value> {
    if let Some(re) = FENCED_JSON.as_ref() {
        for cap in re.captures_iter(raw) {
            let body = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
            if let Some(v) = first_object(body) {
                return Some(v);
            }
        }
    }
    first_object(raw)
}

fn first_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        if let Some(close) = matching_brace(bytes, open) {
            if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(&text[open..=close]) {
                return Some(v);
            }
        }
        start = open + 1;
    }
    None
}

/// Index of the brace closing the one at `open`, skipping braces inside strings.
fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Accepts `{"plan": {...}}` or a bare plan object.
pub fn parse_plan(value: &Value) -> Result<PlanDraft, String> {
    let obj = value.as_object().ok_or("plan is not a JSON object")?;
    let plan = match obj.get("plan") {
        Some(Value::Object(inner)) => inner,
        Some(_) => return Err("'plan' is not an object".into()),
        None => obj,
    };

    let summary = match plan.get("summary") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => "No summary provided".to_string(),
    };

    let steps = match plan.get("steps") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, s)| parse_step(i, s))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err("'steps' is not an array".into()),
    };

    Ok(PlanDraft { summary, steps })
}

fn parse_step(idx: usize, value: &Value) -> Result<StepDraft, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| format!("step {idx} is not an object"))?;
    let tool = match obj.get("tool") {
        Some(Value::String(name)) => ToolKind::parse(name),
        // Fails validation like any other unregistered tool.
        _ => ToolKind::Unknown("<missing>".into()),
    };
    let mut params = match obj.get("params") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(p)) => p.clone(),
        Some(_) => return Err(format!("step {idx}: 'params' is not an object")),
    };
    if !params.contains_key("input_paths") {
        if let Some(paths) = obj.get("input_paths") {
            params.insert("input_paths".into(), paths.clone());
        }
    }
    Ok(StepDraft { tool, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_fenced_block_before_loose_braces() {
        let raw = "Sure {not json}\n```json\n{\"summary\": \"x\", \"steps\": []}\n```\nDone.";
        assert_eq!(
            extract_plan_json(raw),
            Some(json!({"summary": "x", "steps": []}))
        );
    }

    #[test]
    fn extracts_balanced_object_with_braces_in_strings() {
        let raw = r#"Here is the plan: {"summary": "use {braces}", "steps": []} thanks"#;
        assert_eq!(
            extract_plan_json(raw),
            Some(json!({"summary": "use {braces}", "steps": []}))
        );
    }

    #[test]
    fn no_json_yields_none() {
        assert_eq!(extract_plan_json("I cannot help with that."), None);
        assert_eq!(extract_plan_json("{ unterminated"), None);
    }

    #[test]
    fn wrapped_and_step_level_paths_are_normalized() {
        let v = json!({"plan": {"steps": [
            {"tool": "image_pipeline", "input_paths": ["a.jpg"], "params": {"purpose": "clean"}},
            {"params": {}}
        ]}});
        let draft = parse_plan(&v).unwrap();
        assert_eq!(draft.summary, "No summary provided");
        assert_eq!(draft.steps[0].tool, ToolKind::ImagePipeline);
        assert_eq!(draft.steps[0].input_paths(), vec!["a.jpg"]);
        assert_eq!(draft.steps[1].tool, ToolKind::Unknown("<missing>".into()));
    }

    #[test]
    fn prompt_template_stops_at_examples() {
        let t = PromptTemplate::from_text("System rules.\n\n## Examples\nUser: hi");
        assert_eq!(t.system(), "System rules.");
        assert_eq!(PromptTemplate::from_text("## Examples\nx").system(), BUILTIN_PROMPT);
    }
}
