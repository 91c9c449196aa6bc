//! Plan validation: the only way a `PlanDraft` becomes a `ValidatedPlan`.
//!
//! Validation is pure and exhaustive. Every problem in the draft is reported,
//! not just the first one.

use crate::{
    error::ValidationError,
    inventory::Inventory,
    plan::{
        DocAnalysisParams, ImagePipelineParams, PlanDraft, StepDraft, StepSpec, ToolKind,
        ValidatedPlan,
    },
    tools::{ToolRegistry, ToolSchema},
};
use serde_json::{Map, Value};

pub fn validate(
    draft: &PlanDraft,
    inventory: &Inventory,
    registry: &ToolRegistry,
) -> Result<ValidatedPlan, Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut steps = Vec::with_capacity(draft.steps.len());

    if draft.steps.is_empty() {
        errors.push(ValidationError::EmptyPlan);
    }

    for (idx, step) in draft.steps.iter().enumerate() {
        let before = errors.len();
        let schema = match (&step.tool, registry.get(&step.tool)) {
            (ToolKind::Unknown(_), _) | (_, None) => {
                errors.push(ValidationError::UnknownTool {
                    step: idx,
                    tool: step.tool.to_string(),
                });
                None
            }
            (_, Some(schema)) => Some(schema),
        };

        let params = present_params(&step.params);
        if let Some(schema) = schema {
            check_params(idx, schema, &params, &mut errors);
        }
        check_paths(idx, step, inventory, &mut errors);

        if errors.len() == before {
            if let Some(spec) = typed_step(idx, step, params, &mut errors) {
                steps.push(spec);
            }
        }
    }

    if errors.is_empty() {
        Ok(ValidatedPlan {
            summary: draft.summary.clone(),
            steps,
        })
    } else {
        Err(errors)
    }
}

/// Drops explicit nulls so that `"style": null` reads as an absent optional.
fn present_params(params: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn check_params(
    step: usize,
    schema: &ToolSchema,
    params: &Map<String, Value>,
    errors: &mut Vec<ValidationError>,
) {
    let tool = schema.name.to_string();
    for p in &schema.params {
        let Some(value) = params.get(p.name) else {
            if p.required {
                errors.push(ValidationError::MissingParam {
                    step,
                    tool: tool.clone(),
                    param: p.name.to_string(),
                });
            }
            continue;
        };
        if !p.ty.accepts(value) {
            errors.push(ValidationError::WrongType {
                step,
                tool: tool.clone(),
                param: p.name.to_string(),
                expected: p.ty.describe().to_string(),
            });
            continue;
        }
        if !p.allowed.is_empty() {
            let got = value.as_str().unwrap_or_default();
            if !p.allowed.contains(&got) {
                errors.push(ValidationError::InvalidValue {
                    step,
                    tool: tool.clone(),
                    param: p.name.to_string(),
                    value: got.to_string(),
                    allowed: p.allowed.join(", "),
                });
            }
        }
    }

    if let Some(Value::Array(paths)) = params.get("input_paths") {
        if paths.is_empty() {
            errors.push(ValidationError::NoInputs { step, tool });
        }
    }
}

/// Runs for unknown tools too, so one pass reports both kinds of problem.
fn check_paths(
    step: usize,
    draft: &StepDraft,
    inventory: &Inventory,
    errors: &mut Vec<ValidationError>,
) {
    for path in draft.input_paths() {
        if !inventory.contains(path) {
            errors.push(ValidationError::UnknownPath {
                step,
                path: path.to_string(),
            });
        }
    }
}

fn typed_step(
    step: usize,
    draft: &StepDraft,
    params: Map<String, Value>,
    errors: &mut Vec<ValidationError>,
) -> Option<StepSpec> {
    let value = Value::Object(params);
    let result = match draft.tool {
        ToolKind::ImagePipeline => {
            serde_json::from_value::<ImagePipelineParams>(value).map(StepSpec::ImagePipeline)
        }
        ToolKind::DocAnalysis => {
            serde_json::from_value::<DocAnalysisParams>(value).map(StepSpec::DocAnalysis)
        }
        ToolKind::Unknown(_) => return None,
    };
    match result {
        Ok(spec) => Some(spec),
        Err(err) => {
            // Schema checks passed, so this is a schema/struct mismatch.
            errors.push(ValidationError::WrongType {
                step,
                tool: draft.tool.to_string(),
                param: "params".into(),
                expected: err.to_string(),
            });
            None
        }
    }
}
