use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Registered categories of work. Anything else the planner names is `Unknown`
/// and never survives validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ToolKind {
    ImagePipeline,
    DocAnalysis,
    Unknown(String),
}

impl ToolKind {
    pub fn parse(name: &str) -> Self {
        let norm = name.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "IMAGE_PIPELINE" => ToolKind::ImagePipeline,
            "DOC_ANALYSIS" => ToolKind::DocAnalysis,
            _ => ToolKind::Unknown(name.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ToolKind::ImagePipeline => "IMAGE_PIPELINE",
            ToolKind::DocAnalysis => "DOC_ANALYSIS",
            ToolKind::Unknown(name) => name,
        }
    }
}

impl From<String> for ToolKind {
    fn from(s: String) -> Self {
        ToolKind::parse(&s)
    }
}

impl From<ToolKind> for String {
    fn from(kind: ToolKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Untrusted plan as parsed from planner output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub summary: String,
    pub steps: Vec<StepDraft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDraft {
    pub tool: ToolKind,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl StepDraft {
    /// `input_paths` entries that are strings; other shapes are a validation concern.
    pub fn input_paths(&self) -> Vec<&str> {
        match self.params.get("input_paths") {
            Some(serde_json::Value::Array(items)) => {
                items.iter().filter_map(|v| v.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Plan that passed validation against one inventory snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedPlan {
    pub summary: String,
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "params")]
pub enum StepSpec {
    #[serde(rename = "IMAGE_PIPELINE")]
    ImagePipeline(ImagePipelineParams),
    #[serde(rename = "DOC_ANALYSIS")]
    DocAnalysis(DocAnalysisParams),
}

impl StepSpec {
    pub fn tool_kind(&self) -> ToolKind {
        match self {
            StepSpec::ImagePipeline(_) => ToolKind::ImagePipeline,
            StepSpec::DocAnalysis(_) => ToolKind::DocAnalysis,
        }
    }

    pub fn input_paths(&self) -> &[String] {
        match self {
            StepSpec::ImagePipeline(p) => &p.input_paths,
            StepSpec::DocAnalysis(p) => &p.input_paths,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePipelineParams {
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    /// Explicit pipeline schema name; otherwise chosen from `purpose`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub adjustments: BTreeMap<String, f64>,
    pub input_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[default]
    Summary,
    Qa,
    ClusteredReport,
    Search,
}

impl OutputKind {
    pub const ALL: &'static [&'static str] = &["summary", "qa", "clustered_report", "search"];

    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Summary => "summary",
            OutputKind::Qa => "qa",
            OutputKind::ClusteredReport => "clustered_report",
            OutputKind::Search => "search",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocAnalysisParams {
    pub query: String,
    #[serde(default)]
    pub output_kind: OutputKind,
    pub input_paths: Vec<String>,
}
