use super::{StepContext, StepExecutor, StepOutcome, poll_until, settle, unique_rel, write_output};
use crate::{
    error::{ExecutionErrorKind, WorkerError},
    plan::{DocAnalysisParams, OutputKind, StepSpec, ToolKind},
    util::{now_rfc3339, safe_file_stem},
    worker::{ConcurrencyGate, DocInput, DocResult, DocTask, DocWorker, TaskState},
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const SERVICE: &str = "doc worker";
const SUBJECT_STEM_MAX: usize = 50;

/// `DOC_ANALYSIS`: one document-service task per step.
pub struct DocExecutor {
    worker: Arc<dyn DocWorker>,
    gate: Arc<ConcurrencyGate>,
}

impl DocExecutor {
    pub fn new(worker: Arc<dyn DocWorker>, gate: Arc<ConcurrencyGate>) -> Self {
        Self { worker, gate }
    }

    fn run(&self, ctx: &StepContext<'_>, params: &DocAnalysisParams) -> StepOutcome {
        info!(
            "job={} step={} doc analysis kind={} docs={}",
            ctx.job_id,
            ctx.step_index,
            params.output_kind.as_str(),
            params.input_paths.len()
        );
        let result = match self.analyze(ctx, params) {
            Ok(r) => r,
            Err(err) => {
                warn!("job={} step={} doc task failed: {err}", ctx.job_id, ctx.step_index);
                return StepOutcome::failed(ctx.classify(&err));
            }
        };

        let warnings: Vec<String> = result
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.id, f.error))
            .collect();
        let doc_failure = (!result.failures.is_empty()).then(|| ExecutionErrorKind::Worker {
            detail: format!(
                "{} of {} documents could not be analyzed",
                result.failures.len(),
                params.input_paths.len()
            ),
        });

        if result.markdown.trim().is_empty() || result.failures.len() >= params.input_paths.len() {
            return StepOutcome {
                outputs: Vec::new(),
                warnings,
                failure: Some(ExecutionErrorKind::Worker {
                    detail: "document service returned no usable content".into(),
                }),
            };
        }

        let rel = output_rel(ctx.output_root, params);
        let body = render(params, &result);
        if let Err(err) = write_output(ctx.output_root, &rel, body.as_bytes()) {
            return StepOutcome {
                outputs: Vec::new(),
                warnings,
                failure: Some(ctx.classify(&err)),
            };
        }
        settle(ctx, vec![rel], warnings, doc_failure)
    }

    fn analyze(
        &self,
        ctx: &StepContext<'_>,
        params: &DocAnalysisParams,
    ) -> Result<DocResult, WorkerError> {
        let task = DocTask {
            kind: params.output_kind.as_str().to_string(),
            query: params.query.clone(),
            documents: params
                .input_paths
                .iter()
                .map(|rel| DocInput {
                    id: rel.clone(),
                    path: ctx.input_path(rel),
                })
                .collect(),
        };
        let _permit = self.gate.acquire();
        let task_id = self.worker.submit(&task)?;
        poll_until(SERVICE, ctx.deadline, self.worker.poll_interval(), || {
            match self.worker.poll(&task_id)? {
                TaskState::Queued | TaskState::Running => Ok(None),
                TaskState::Done => Ok(Some(())),
                TaskState::Failed { message } => Err(WorkerError::Reported {
                    service: SERVICE,
                    detail: message,
                }),
            }
        })?;
        self.worker.fetch_result(&task_id)
    }
}

fn output_rel(root: &Path, params: &DocAnalysisParams) -> String {
    match params.output_kind {
        OutputKind::Summary => unique_rel(root, "docs", "summary-all", "md"),
        OutputKind::Search => unique_rel(root, "docs", "search-results", "md"),
        OutputKind::ClusteredReport => unique_rel(
            root,
            "docs/by-subject",
            &safe_file_stem(&params.query, SUBJECT_STEM_MAX),
            "md",
        ),
        OutputKind::Qa => {
            let mut n = 1;
            loop {
                let rel = format!("docs/qa/question-{n}.md");
                if !root.join(&rel).exists() {
                    return rel;
                }
                n += 1;
            }
        }
    }
}

fn quoted(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Markdown with a front matter block naming the query, time and sources.
fn render(params: &DocAnalysisParams, result: &DocResult) -> String {
    let sources = if result.sources.is_empty() {
        let failed: Vec<&str> = result.failures.iter().map(|f| f.id.as_str()).collect();
        params
            .input_paths
            .iter()
            .filter(|p| !failed.contains(&p.as_str()))
            .cloned()
            .collect()
    } else {
        result.sources.clone()
    };

    let mut out = String::from("---\n");
    out.push_str(&format!("query: {}\n", quoted(&params.query)));
    out.push_str(&format!("output_kind: {}\n", params.output_kind.as_str()));
    out.push_str(&format!("generated_at: {}\n", quoted(&now_rfc3339())));
    out.push_str("sources:\n");
    for s in &sources {
        out.push_str(&format!("  - {}\n", quoted(s)));
    }
    out.push_str("---\n\n");
    out.push_str(result.markdown.trim());
    out.push('\n');
    out
}

impl StepExecutor for DocExecutor {
    fn tool_kind(&self) -> ToolKind {
        ToolKind::DocAnalysis
    }

    fn execute(&self, ctx: &StepContext<'_>, spec: &StepSpec) -> StepOutcome {
        match spec {
            StepSpec::DocAnalysis(params) => self.run(ctx, params),
            other => StepOutcome::failed(ExecutionErrorKind::Worker {
                detail: format!("doc executor cannot run {} steps", other.tool_kind()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::DocFailure;

    fn params(kind: OutputKind, query: &str) -> DocAnalysisParams {
        DocAnalysisParams {
            query: query.into(),
            output_kind: kind,
            input_paths: vec!["a.pdf".into(), "b.pdf".into()],
        }
    }

    #[test]
    fn front_matter_escapes_query_and_skips_failed_sources() {
        let result = DocResult {
            markdown: "# Summary\n\nbody".into(),
            sources: vec![],
            failures: vec![DocFailure {
                id: "b.pdf".into(),
                error: "encrypted".into(),
            }],
        };
        let text = render(&params(OutputKind::Summary, "say \"hi\""), &result);
        assert!(text.starts_with("---\nquery: \"say \\\"hi\\\"\"\n"));
        assert!(text.contains("sources:\n  - \"a.pdf\"\n---"));
        assert!(!text.contains("b.pdf"));
        assert!(text.ends_with("body\n"));
    }

    #[test]
    fn qa_and_subject_paths() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            output_rel(dir.path(), &params(OutputKind::Qa, "q")),
            "docs/qa/question-1.md"
        );
        write_output(dir.path(), "docs/qa/question-1.md", b"x").unwrap();
        assert_eq!(
            output_rel(dir.path(), &params(OutputKind::Qa, "q")),
            "docs/qa/question-2.md"
        );
        assert_eq!(
            output_rel(dir.path(), &params(OutputKind::ClusteredReport, "Q3 / budget")),
            "docs/by-subject/Q3-budget.md"
        );
    }
}
