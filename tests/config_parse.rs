use filecherry::config::{Config, FailurePolicy};

#[test]
fn parse_example_config() {
    let raw = include_str!("../filecherry.example.toml");
    let cfg: Config = toml::from_str(raw).expect("parse TOML");
    cfg.check().expect("example config passes checks");
    assert!(cfg.jobs.max_parallel_steps >= 1);
    assert_eq!(cfg.jobs.on_step_failure, FailurePolicy::Continue);
    assert_eq!(cfg.tools.enabled, vec!["IMAGE_PIPELINE", "DOC_ANALYSIS"]);
    assert!(!cfg.paths.state_dir.is_empty());
    assert_eq!(cfg.workers.doc.status_path, "/tasks/{id}");
}

#[test]
fn empty_config_takes_defaults() {
    let cfg: Config = toml::from_str("").expect("parse empty TOML");
    cfg.check().expect("defaults pass checks");
    assert!(cfg.global.offline_only);
    assert_eq!(cfg.jobs.max_parallel_steps, 1);
    assert!(cfg.jobs.partial_step_outputs);
    assert!(cfg.security.follow_symlinks_in_root);
}

#[test]
fn offline_only_rejects_remote_services() {
    let cfg: Config = toml::from_str(
        r#"
[planner]
base_url = "http://planner.example.com:11434"
"#,
    )
    .expect("parse TOML");
    let err = cfg.check().expect_err("remote planner must be rejected");
    assert!(err.to_string().contains("not loopback"), "{err}");

    let relaxed: Config = toml::from_str(
        r#"
[global]
offline_only = false

[planner]
base_url = "http://planner.example.com:11434"
"#,
    )
    .expect("parse TOML");
    relaxed.check().expect("remote allowed when offline_only=false");
}

#[test]
fn zero_parallelism_is_rejected() {
    let cfg: Config = toml::from_str(
        r#"
[jobs]
max_parallel_steps = 0
on_step_failure = "skip_remaining"
"#,
    )
    .expect("parse TOML");
    assert_eq!(cfg.jobs.on_step_failure, FailurePolicy::SkipRemaining);
    assert!(cfg.check().is_err());
}
