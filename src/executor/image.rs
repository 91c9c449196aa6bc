use super::{
    StepContext, StepExecutor, StepOutcome, poll_until, settle, unique_rel, write_output,
    pipeline::{Pipeline, PipelineCatalog, style_hints},
};
use crate::{
    error::{ExecutionErrorKind, WorkerError},
    plan::{ImagePipelineParams, StepSpec, ToolKind},
    worker::{ConcurrencyGate, GraphStatus, ImageWorker},
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const SERVICE: &str = "image worker";

/// `IMAGE_PIPELINE`: one graph run per input image.
pub struct ImageExecutor {
    worker: Arc<dyn ImageWorker>,
    catalog: PipelineCatalog,
    gate: Arc<ConcurrencyGate>,
    default_pipeline: String,
}

impl ImageExecutor {
    pub fn new(
        worker: Arc<dyn ImageWorker>,
        catalog: PipelineCatalog,
        gate: Arc<ConcurrencyGate>,
        default_pipeline: impl Into<String>,
    ) -> Self {
        Self {
            worker,
            catalog,
            gate,
            default_pipeline: default_pipeline.into(),
        }
    }

    fn run(&self, ctx: &StepContext<'_>, params: &ImagePipelineParams) -> StepOutcome {
        let pipeline = match self.catalog.select(
            params.pipeline.as_deref(),
            &params.purpose,
            &self.default_pipeline,
        ) {
            Ok(p) => p,
            Err(detail) => return StepOutcome::failed(ExecutionErrorKind::Worker { detail }),
        };
        let hints = style_hints(params.style.as_deref());
        let (values, mut warnings) = pipeline.resolve_params(&hints, &params.adjustments);
        info!(
            "job={} step={} pipeline={} images={} hints={:?}",
            ctx.job_id,
            ctx.step_index,
            pipeline.name(),
            params.input_paths.len(),
            hints
        );

        let mut outputs = Vec::new();
        let mut first_failure = None;
        for rel in &params.input_paths {
            if ctx.expired() {
                warnings.push(format!("{rel}: not processed, step deadline passed"));
                first_failure = Some(ctx.timeout());
                break;
            }
            if let Err(err) = self.process_one(ctx, pipeline, &values, rel, &mut outputs) {
                warn!("job={} step={} image {rel} failed: {err}", ctx.job_id, ctx.step_index);
                warnings.push(format!("{rel}: {err}"));
                let kind = ctx.classify(&err);
                let timed_out = matches!(kind, ExecutionErrorKind::Timeout { .. });
                first_failure.get_or_insert(kind);
                if timed_out {
                    first_failure = Some(ctx.timeout());
                    break;
                }
            }
        }
        settle(ctx, outputs, warnings, first_failure)
    }

    fn process_one(
        &self,
        ctx: &StepContext<'_>,
        pipeline: &Pipeline,
        values: &BTreeMap<String, f64>,
        rel: &str,
        outputs: &mut Vec<String>,
    ) -> Result<(), WorkerError> {
        let _permit = self.gate.acquire();
        let src = ctx.input_path(rel);
        let uploaded = self.worker.upload_image(&src)?;
        let graph = pipeline
            .prepare_graph(&uploaded, values)
            .map_err(|detail| WorkerError::Protocol {
                service: SERVICE,
                detail,
            })?;
        let prompt_id = self.worker.queue_graph(&graph)?;
        let images = poll_until(SERVICE, ctx.deadline, self.worker.poll_interval(), || {
            match self.worker.poll(&prompt_id)? {
                GraphStatus::Pending => Ok(None),
                GraphStatus::Succeeded { images } => Ok(Some(images)),
                GraphStatus::Failed { message } => Err(WorkerError::Reported {
                    service: SERVICE,
                    detail: message,
                }),
            }
        })?;
        if images.is_empty() {
            return Err(WorkerError::Protocol {
                service: SERVICE,
                detail: "graph finished without output images".into(),
            });
        }

        // Recorded as soon as written: every file on disk is in `outputs`.
        let (dir, stem, input_ext) = output_naming(rel);
        for (n, image) in images.iter().enumerate() {
            let bytes = self.worker.download(image)?;
            let ext = Path::new(&image.filename)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .unwrap_or_else(|| input_ext.clone());
            let out = unique_rel(ctx.output_root, &dir, &format!("{stem}_processed_{n}"), &ext);
            write_output(ctx.output_root, &out, &bytes)?;
            outputs.push(out);
        }
        Ok(())
    }
}

/// `images/<parent of rel>`, the input stem, and its extension (`png` if none).
fn output_naming(rel: &str) -> (String, String, String) {
    let path = Path::new(rel);
    let parent = path
        .parent()
        .and_then(|p| p.to_str())
        .filter(|p| !p.is_empty());
    let dir = match parent {
        Some(p) => format!("images/{p}"),
        None => "images".to_string(),
    };
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image")
        .to_string();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "png".to_string());
    (dir, stem, ext)
}

impl StepExecutor for ImageExecutor {
    fn tool_kind(&self) -> ToolKind {
        ToolKind::ImagePipeline
    }

    fn execute(&self, ctx: &StepContext<'_>, spec: &StepSpec) -> StepOutcome {
        match spec {
            StepSpec::ImagePipeline(params) => self.run(ctx, params),
            other => StepOutcome::failed(ExecutionErrorKind::Worker {
                detail: format!("image executor cannot run {} steps", other.tool_kind()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::output_naming;

    #[test]
    fn outputs_mirror_input_subdirectories() {
        assert_eq!(
            output_naming("cars/front.JPG"),
            ("images/cars".into(), "front".into(), "jpg".into())
        );
        assert_eq!(
            output_naming("raw"),
            ("images".into(), "raw".into(), "png".into())
        );
    }
}
