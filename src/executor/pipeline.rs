//! Image pipeline contracts loaded from `paths.pipelines_dir`.
//!
//! Each `<name>.toml` schema names a graph JSON file, the tunable parameters
//! with bounds and node bindings, purpose keywords, and per-style semantic
//! controls.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineParam {
    pub name: String,
    pub default: f64,
    pub min: f64,
    pub max: f64,
    /// Graph node id and input key the value is written to.
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
}

impl PipelineParam {
    pub fn clamp(&self, v: f64) -> f64 {
        if v.is_nan() {
            self.default
        } else {
            v.clamp(self.min, self.max)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub graph_file: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub params: Vec<PipelineParam>,
    #[serde(default)]
    pub semantic_controls: BTreeMap<String, BTreeMap<String, f64>>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub schema: PipelineSchema,
    pub graph: serde_json::Value,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Defaults, then semantic controls for `hints`, then explicit
    /// adjustments; every value is clamped to its declared bounds.
    pub fn resolve_params(
        &self,
        hints: &[&str],
        adjustments: &BTreeMap<String, f64>,
    ) -> (BTreeMap<String, f64>, Vec<String>) {
        let mut values: BTreeMap<String, f64> = self
            .schema
            .params
            .iter()
            .map(|p| (p.name.clone(), p.default))
            .collect();
        let mut notes = Vec::new();

        for hint in hints {
            if let Some(controls) = self.schema.semantic_controls.get(*hint) {
                for (k, v) in controls {
                    if let Some(slot) = values.get_mut(k) {
                        *slot = *v;
                    }
                }
            }
        }

        for (k, v) in adjustments {
            match values.get_mut(k) {
                Some(slot) => *slot = *v,
                None => notes.push(format!(
                    "adjustment '{k}' is not a parameter of pipeline {}; ignored",
                    self.name()
                )),
            }
        }

        for p in &self.schema.params {
            if let Some(slot) = values.get_mut(&p.name) {
                let clamped = p.clamp(*slot);
                if clamped != *slot {
                    notes.push(format!(
                        "{} {} clamped to {} (allowed {}..={})",
                        p.name, slot, clamped, p.min, p.max
                    ));
                    *slot = clamped;
                }
            }
        }

        (values, notes)
    }

    /// Copy of the graph with the uploaded image in every `LoadImage` node and
    /// each bound parameter written to its node input.
    pub fn prepare_graph(
        &self,
        uploaded_image: &str,
        values: &BTreeMap<String, f64>,
    ) -> Result<serde_json::Value, String> {
        let mut graph = self.graph.clone();
        let nodes = graph
            .as_object_mut()
            .ok_or_else(|| format!("graph of pipeline {} is not an object", self.name()))?;

        let mut injected = 0;
        for node in nodes.values_mut() {
            if node.get("class_type").and_then(|c| c.as_str()) == Some("LoadImage") {
                if let Some(inputs) = node.get_mut("inputs").and_then(|i| i.as_object_mut()) {
                    inputs.insert("image".into(), uploaded_image.into());
                    injected += 1;
                }
            }
        }
        if injected == 0 {
            return Err(format!("pipeline {} has no LoadImage node", self.name()));
        }

        for p in &self.schema.params {
            let (Some(node_id), Some(input)) = (&p.node, &p.input) else {
                continue;
            };
            let Some(value) = values.get(&p.name) else {
                continue;
            };
            let inputs = nodes
                .get_mut(node_id)
                .and_then(|n| n.get_mut("inputs"))
                .and_then(|i| i.as_object_mut())
                .ok_or_else(|| {
                    format!(
                        "pipeline {}: param {} bound to missing node {node_id}",
                        self.name(),
                        p.name
                    )
                })?;
            inputs.insert(input.clone(), serde_json::json!(value));
        }
        Ok(graph)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineCatalog {
    pipelines: Vec<Pipeline>,
}

impl PipelineCatalog {
    pub fn new(mut pipelines: Vec<Pipeline>) -> Self {
        pipelines.sort_by(|a, b| a.schema.name.cmp(&b.schema.name));
        Self { pipelines }
    }

    /// Loads every `*.toml` schema in `dir` and the graph it names. A missing
    /// directory yields an empty catalog.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            warn!("pipelines dir not found: {}", dir.display());
            return Ok(Self::default());
        }
        let mut pipelines = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("reading pipelines dir {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading pipeline schema {}", path.display()))?;
            let schema: PipelineSchema = toml::from_str(&raw)
                .with_context(|| format!("parsing pipeline schema {}", path.display()))?;
            for p in &schema.params {
                if p.min > p.max {
                    return Err(anyhow!(
                        "pipeline {}: param {} has min > max",
                        schema.name,
                        p.name
                    ));
                }
            }
            let graph_path = dir.join(&schema.graph_file);
            let graph_raw = std::fs::read_to_string(&graph_path)
                .with_context(|| format!("reading pipeline graph {}", graph_path.display()))?;
            let graph: serde_json::Value = serde_json::from_str(&graph_raw)
                .with_context(|| format!("parsing pipeline graph {}", graph_path.display()))?;
            pipelines.push(Pipeline { schema, graph });
        }
        let catalog = Self::new(pipelines);
        info!(
            "loaded {} pipeline(s) from {}",
            catalog.pipelines.len(),
            dir.display()
        );
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.schema.name == name)
    }

    /// Explicit name, else the first pipeline whose keyword appears in
    /// `purpose`, else `default`.
    pub fn select(
        &self,
        explicit: Option<&str>,
        purpose: &str,
        default: &str,
    ) -> Result<&Pipeline, String> {
        if let Some(name) = explicit {
            return self
                .get(name)
                .ok_or_else(|| format!("unknown pipeline '{name}'"));
        }
        let purpose = purpose.to_lowercase();
        let by_keyword = self.pipelines.iter().find(|p| {
            p.schema
                .keywords
                .iter()
                .any(|k| !k.is_empty() && purpose.contains(&k.to_lowercase()))
        });
        by_keyword
            .or_else(|| self.get(default))
            .ok_or_else(|| {
                format!("no pipeline matches purpose and default '{default}' is not installed")
            })
    }
}

/// Style words mapped to the hint names pipelines declare controls for.
pub fn style_hints(style: Option<&str>) -> Vec<&'static str> {
    let Some(style) = style else {
        return Vec::new();
    };
    let s = style.to_lowercase();
    let less_saturated = ["less saturated", "less_saturated", "desaturated", "less saturation"]
        .iter()
        .any(|t| s.contains(t));

    let mut hints = Vec::new();
    for (term, hint) in [
        ("premium", "premium"),
        ("professional", "professional"),
        ("bright", "bright"),
        ("vibrant", "vibrant"),
        ("muted", "muted"),
    ] {
        if s.contains(term) {
            hints.push(hint);
        }
    }
    if less_saturated {
        hints.push("less_saturated");
    } else if s.contains("saturated") && !hints.contains(&"vibrant") {
        hints.push("vibrant");
    }
    hints
}
