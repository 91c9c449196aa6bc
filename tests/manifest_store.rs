use filecherry::{
    error::ManifestError,
    inventory::{Inventory, InventoryItem, ItemKind},
    job::{Job, JobId, JobStatus, StepStatus},
    manifest::ManifestStore,
    plan::{DocAnalysisParams, OutputKind, StepSpec, ValidatedPlan},
    util::parse_rfc3339,
};
use std::path::Path;
use ulid::Ulid;

fn sample_job(id: JobId) -> Job {
    let inventory = Inventory::from_items(
        Path::new("/in"),
        vec![InventoryItem {
            path: "a.pdf".into(),
            kind: ItemKind::Document,
            size_bytes: 3,
            unreadable: false,
        }],
    );
    let plan = ValidatedPlan {
        summary: "summarize".into(),
        steps: vec![StepSpec::DocAnalysis(DocAnalysisParams {
            query: "what is in a.pdf?".into(),
            output_kind: OutputKind::Summary,
            input_paths: vec!["a.pdf".into()],
        })],
    };
    Job::new(
        id,
        "summarize a.pdf".into(),
        inventory,
        plan,
        "2026-01-01T00:00:00Z".into(),
    )
}

fn id_at(ms: u64) -> JobId {
    JobId::from_ulid(Ulid::from_parts(ms, 7))
}

#[test]
fn persist_then_load_returns_same_job() {
    let dir = tempfile::tempdir().unwrap();
    let store = ManifestStore::open(dir.path()).unwrap();
    let mut job = sample_job(id_at(1_700_000_000_000));
    job.steps[0].start("2026-01-01T00:00:01Z".into()).unwrap();
    job.set_status(JobStatus::Running, "2026-01-01T00:00:01Z".into())
        .unwrap();

    store.persist(&job).unwrap();
    assert!(store.exists(&job.job_id));
    let loaded = store.load(&job.job_id).unwrap();
    assert_eq!(loaded, job);
    assert_eq!(loaded.steps[0].status, StepStatus::Running);

    let raw = std::fs::read_to_string(store.manifest_path(&job.job_id)).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["v"], 1);
    assert_eq!(value["jobId"], job.job_id.as_str());
    assert_eq!(value["plan"]["steps"][0]["tool"], "DOC_ANALYSIS");
}

#[test]
fn missing_and_malformed_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = ManifestStore::open(dir.path()).unwrap();
    let err = store.load(&id_at(1)).unwrap_err();
    assert!(matches!(err, ManifestError::NotFound(_)));

    assert!(matches!(
        JobId::parse("../etc/passwd"),
        Err(ManifestError::InvalidJobId(_))
    ));
}

#[test]
fn unknown_manifest_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = ManifestStore::open(dir.path()).unwrap();
    let job = sample_job(id_at(5));
    store.persist(&job).unwrap();

    let path = store.manifest_path(&job.job_id);
    let mut value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    value["v"] = serde_json::json!(99);
    std::fs::write(&path, value.to_string()).unwrap();

    assert!(matches!(
        store.load(&job.job_id),
        Err(ManifestError::Version { found: 99, .. })
    ));
}

#[test]
fn list_is_ordered_and_filtered_by_creation_time() {
    let dir = tempfile::tempdir().unwrap();
    let store = ManifestStore::open(dir.path()).unwrap();
    let early = parse_rfc3339("2025-01-01T00:00:00Z").unwrap();
    let late = parse_rfc3339("2025-06-01T00:00:00Z").unwrap();
    let ms = |t: time::OffsetDateTime| (t.unix_timestamp_nanos() / 1_000_000) as u64;

    let new = id_at(ms(late) + 1);
    let old = id_at(ms(early));
    store.persist(&sample_job(new.clone())).unwrap();
    store.persist(&sample_job(old.clone())).unwrap();
    std::fs::write(dir.path().join("manifests/notes.txt"), b"ignored").unwrap();

    assert_eq!(store.list(None).unwrap(), vec![old.clone(), new.clone()]);
    assert_eq!(store.list(Some(late)).unwrap(), vec![new]);
}

#[test]
fn concurrent_persists_of_distinct_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let store = ManifestStore::open(dir.path()).unwrap();
    let ids: Vec<JobId> = (0..8).map(|i| id_at(1_000 + i)).collect();

    std::thread::scope(|s| {
        for id in &ids {
            let store = &store;
            s.spawn(move || {
                for _ in 0..5 {
                    store.persist(&sample_job(id.clone())).unwrap();
                }
            });
        }
    });

    assert_eq!(store.list(None).unwrap(), ids);
    for id in &ids {
        assert_eq!(store.load(id).unwrap().job_id, *id);
    }
}

#[test]
fn cancel_marker_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = ManifestStore::open(dir.path()).unwrap();
    let id = id_at(42);
    assert!(!store.cancel_requested(&id));
    store.request_cancel(&id).unwrap();
    assert!(store.cancel_requested(&id));
    assert!(store.list(None).unwrap().is_empty());
}
