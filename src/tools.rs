//! Registered tool kinds and their parameter schemas.
//!
//! The same schema drives the planner prompt and plan validation.

use crate::{
    error::JobError,
    plan::{OutputKind, ToolKind},
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    /// Array of strings.
    Array,
    /// Object whose values are all numbers.
    NumberMap,
}

impl ParamType {
    pub fn describe(self) -> &'static str {
        match self {
            ParamType::String => "a string",
            ParamType::Array => "an array of strings",
            ParamType::NumberMap => "an object of numbers",
        }
    }

    pub fn accepts(self, value: &serde_json::Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Array => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| v.is_string())),
            ParamType::NumberMap => value
                .as_object()
                .is_some_and(|m| m.values().all(|v| v.is_number())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamSchema {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub ty: ParamType,
    pub required: bool,
    pub description: &'static str,
    #[serde(rename = "enum", skip_serializing_if = "<[_]>::is_empty")]
    pub allowed: &'static [&'static str],
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: ToolKind,
    pub description: &'static str,
    pub params: Vec<ParamSchema>,
}

#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: Vec<ToolSchema>,
}

impl ToolRegistry {
    pub fn builtin() -> Self {
        Self {
            tools: vec![image_pipeline_schema(), doc_analysis_schema()],
        }
    }

    /// Builtin tools restricted to the names in `enabled`.
    pub fn with_enabled(enabled: &[String]) -> Result<Self, JobError> {
        let builtin = Self::builtin();
        let mut tools = Vec::new();
        for name in enabled {
            let kind = ToolKind::parse(name);
            match builtin.get(&kind) {
                Some(schema) => tools.push(schema.clone()),
                None => {
                    return Err(JobError::Config(format!(
                        "unknown tool in tools.enabled: {name}"
                    )));
                }
            }
        }
        Ok(Self { tools })
    }

    pub fn get(&self, kind: &ToolKind) -> Option<&ToolSchema> {
        self.tools.iter().find(|t| &t.name == kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ToolKind> {
        self.tools.iter().map(|t| &t.name)
    }

    /// Schema as sent to the planning service.
    pub fn prompt_json(&self) -> serde_json::Value {
        serde_json::json!({ "tools": self.tools })
    }
}

fn image_pipeline_schema() -> ToolSchema {
    ToolSchema {
        name: ToolKind::ImagePipeline,
        description: "Process images through an image-graph pipeline (cleanup, enhancement, style adjustments)",
        params: vec![
            ParamSchema {
                name: "purpose",
                ty: ParamType::String,
                required: true,
                description: "What to do with the images, e.g. 'dealership-ready car photos'",
                allowed: &[],
            },
            ParamSchema {
                name: "style",
                ty: ParamType::String,
                required: false,
                description: "Style preferences, e.g. 'bright, premium look, less saturated'",
                allowed: &[],
            },
            ParamSchema {
                name: "pipeline",
                ty: ParamType::String,
                required: false,
                description: "Explicit pipeline name when the user asked for one",
                allowed: &[],
            },
            ParamSchema {
                name: "adjustments",
                ty: ParamType::NumberMap,
                required: false,
                description: "Numeric overrides such as contrast, brightness, saturation",
                allowed: &[],
            },
            ParamSchema {
                name: "input_paths",
                ty: ParamType::Array,
                required: true,
                description: "Image paths exactly as listed in the inventory",
                allowed: &[],
            },
        ],
    }
}

fn doc_analysis_schema() -> ToolSchema {
    ToolSchema {
        name: ToolKind::DocAnalysis,
        description: "Analyze documents: summarize, answer a question, compile by subject, or search",
        params: vec![
            ParamSchema {
                name: "query",
                ty: ParamType::String,
                required: true,
                description: "What to analyze or find in the documents",
                allowed: &[],
            },
            ParamSchema {
                name: "output_kind",
                ty: ParamType::String,
                required: false,
                description: "Type of output to generate (default summary)",
                allowed: OutputKind::ALL,
            },
            ParamSchema {
                name: "input_paths",
                ty: ParamType::Array,
                required: true,
                description: "Document paths exactly as listed in the inventory",
                allowed: &[],
            },
        ],
    }
}
