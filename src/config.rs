use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub planner: Planner,
    #[serde(default)]
    pub workers: Workers,
    #[serde(default)]
    pub tools: Tools,
    #[serde(default)]
    pub jobs: Jobs,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub debug: Debug,
    #[serde(default)]
    pub security: Security,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Rejects settings the engine cannot honor. Everything else is clamped at use.
    pub fn check(&self) -> Result<()> {
        if self.jobs.max_parallel_steps == 0 {
            return Err(anyhow!("jobs.max_parallel_steps must be >= 1"));
        }
        if self.tools.enabled.is_empty() {
            return Err(anyhow!("tools.enabled must name at least one tool"));
        }
        for url in [
            &self.planner.base_url,
            &self.workers.image.base_url,
            &self.workers.doc.base_url,
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow!("service url must be http(s): {url}"));
            }
            if self.global.offline_only && !is_loopback_url(url) {
                return Err(anyhow!(
                    "offline_only=true but service url is not loopback: {url}"
                ));
            }
        }
        Ok(())
    }

    pub fn input_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.input_dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.output_dir)
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.state_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Global {
    pub offline_only: bool,
    pub print_summary: bool,
}
impl Default for Global {
    fn default() -> Self {
        Self {
            offline_only: true,
            print_summary: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub input_dir: String,
    pub output_dir: String,
    pub state_dir: String,
    pub pipelines_dir: String,
    pub prompt_path: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            input_dir: "data/inputs".into(),
            output_dir: "data/outputs".into(),
            state_dir: "data/runtime".into(),
            pipelines_dir: "config/pipelines".into(),
            prompt_path: "config/planner_prompt.md".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Planner {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub request_timeout_seconds: u64,
    pub max_listed_paths: usize,
}
impl Default for Planner {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".into(),
            model: "phi3:mini".into(),
            temperature: 0.3,
            request_timeout_seconds: 300,
            max_listed_paths: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workers {
    #[serde(default)]
    pub image: ImageWorker,
    #[serde(default)]
    pub doc: DocWorker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageWorker {
    pub base_url: String,
    pub request_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub max_concurrent: usize,
    pub max_download_bytes: u64,
}
impl Default for ImageWorker {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8188".into(),
            request_timeout_seconds: 600,
            poll_interval_ms: 1000,
            max_concurrent: 1,
            max_download_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocWorker {
    pub base_url: String,
    pub request_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub max_concurrent: usize,
    pub submit_path: String,
    pub status_path: String,
    pub result_path: String,
}
impl Default for DocWorker {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8190".into(),
            request_timeout_seconds: 300,
            poll_interval_ms: 500,
            max_concurrent: 2,
            submit_path: "/tasks".into(),
            status_path: "/tasks/{id}".into(),
            result_path: "/tasks/{id}/result".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tools {
    pub enabled: Vec<String>,
    pub default_pipeline: String,
}
impl Default for Tools {
    fn default() -> Self {
        Self {
            enabled: vec!["IMAGE_PIPELINE".into(), "DOC_ANALYSIS".into()],
            default_pipeline: "photo_cleanup_v1".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep dispatching later steps after one fails.
    Continue,
    /// Mark every not-yet-started step skipped after the first failure.
    SkipRemaining,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Jobs {
    pub max_parallel_steps: usize,
    pub on_step_failure: FailurePolicy,
    pub partial_step_outputs: bool,
}
impl Default for Jobs {
    fn default() -> Self {
        Self {
            max_parallel_steps: 1,
            on_step_failure: FailurePolicy::Continue,
            partial_step_outputs: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub image_pipeline_seconds: u64,
    pub doc_analysis_seconds: u64,
}
impl Default for Timeouts {
    fn default() -> Self {
        Self {
            image_pipeline_seconds: 900,
            doc_analysis_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: true,
            file_path: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Debug {
    pub dump_effective_config: bool,
    pub log_planner_response: bool,
}
impl Default for Debug {
    fn default() -> Self {
        Self {
            dump_effective_config: false,
            log_planner_response: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Security {
    /// Include symlinks whose target is a regular file inside the input root.
    pub follow_symlinks_in_root: bool,
}
impl Default for Security {
    fn default() -> Self {
        Self {
            follow_symlinks_in_root: true,
        }
    }
}

fn is_loopback_url(url: &str) -> bool {
    let rest = url
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let host = rest.split(['/', '?']).next().unwrap_or("");
    let host = if host.starts_with('[') {
        host.split(']').next().map(|h| h.trim_start_matches('[')).unwrap_or("")
    } else {
        host.split(':').next().unwrap_or("")
    };
    host == "localhost" || host == "::1" || host.starts_with("127.")
}
