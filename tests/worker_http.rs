use filecherry::{
    config,
    error::WorkerError,
    worker::{
        ComfyClient, DocInput, DocServiceClient, DocTask, DocWorker, GraphStatus, ImageWorker,
        OutputImage, TaskState,
    },
};
use httpmock::prelude::*;
use serde_json::json;
use std::time::Duration;

fn comfy(server: &MockServer) -> ComfyClient {
    ComfyClient::new(&config::ImageWorker {
        base_url: server.base_url(),
        request_timeout_seconds: 5,
        ..config::ImageWorker::default()
    })
}

fn docsvc(server: &MockServer) -> DocServiceClient {
    DocServiceClient::new(&config::DocWorker {
        base_url: server.base_url(),
        request_timeout_seconds: 5,
        ..config::DocWorker::default()
    })
}

#[test]
fn comfy_upload_queue_poll_download() {
    let server = MockServer::start();
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("car.png");
    std::fs::write(&src, b"PNGDATA").unwrap();

    let upload = server.mock(|when, then| {
        when.method(POST).path("/upload/image");
        then.status(200)
            .json_body(json!({"name": "car.png", "subfolder": "", "type": "input"}));
    });
    let queue = server.mock(|when, then| {
        when.method(POST).path("/prompt");
        then.status(200)
            .json_body(json!({"prompt_id": "p-1", "number": 3, "node_errors": {}}));
    });
    let history = server.mock(|when, then| {
        when.method(GET).path("/history/p-1");
        then.status(200).json_body(json!({
            "p-1": {
                "status": {"status_str": "success", "completed": true, "messages": []},
                "outputs": {
                    "9": {"images": [{"filename": "filecherry_00001_.png", "subfolder": "", "type": "output"}]}
                }
            }
        }));
    });
    let view = server.mock(|when, then| {
        when.method(GET)
            .path("/view")
            .query_param("filename", "filecherry_00001_.png")
            .query_param("type", "output");
        then.status(200).body("OUTPUT-BYTES");
    });

    let client = comfy(&server);
    let name = client.upload_image(&src).unwrap();
    assert_eq!(name, "car.png");
    let prompt_id = client
        .queue_graph(&json!({"1": {"class_type": "LoadImage", "inputs": {"image": name}}}))
        .unwrap();
    assert_eq!(prompt_id, "p-1");

    let images = match client.poll(&prompt_id).unwrap() {
        GraphStatus::Succeeded { images } => images,
        other => panic!("unexpected status {other:?}"),
    };
    assert_eq!(images.len(), 1);
    let bytes = client.download(&images[0]).unwrap();
    assert_eq!(bytes, b"OUTPUT-BYTES");

    upload.assert();
    queue.assert();
    history.assert();
    view.assert();
}

#[test]
fn comfy_history_pending_and_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/history/p-pending");
        then.status(200).json_body(json!({}));
    });
    server.mock(|when, then| {
        when.method(GET).path("/history/p-bad");
        then.status(200).json_body(json!({
            "p-bad": {
                "status": {
                    "status_str": "error",
                    "messages": [["execution_error", {"exception_message": "CUDA out of memory"}]]
                },
                "outputs": {}
            }
        }));
    });

    let client = comfy(&server);
    assert_eq!(client.poll("p-pending").unwrap(), GraphStatus::Pending);
    assert_eq!(
        client.poll("p-bad").unwrap(),
        GraphStatus::Failed {
            message: "CUDA out of memory".into()
        }
    );
}

#[test]
fn comfy_rejected_graph_is_reported() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/prompt");
        then.status(400).json_body(json!({"error": {"message": "invalid prompt"}}));
    });
    let err = comfy(&server).queue_graph(&json!({})).unwrap_err();
    assert!(matches!(err, WorkerError::Status { status: 400, .. }));
}

#[test]
fn comfy_download_respects_size_limit() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/view");
        then.status(200).body("0123456789");
    });
    let client = ComfyClient::new(&config::ImageWorker {
        base_url: server.base_url(),
        max_download_bytes: 4,
        ..config::ImageWorker::default()
    });
    let err = client
        .download(&OutputImage {
            filename: "big.png".into(),
            subfolder: String::new(),
            kind: "output".into(),
        })
        .unwrap_err();
    assert!(matches!(err, WorkerError::Protocol { .. }));
}

#[test]
fn doc_service_submit_poll_fetch() {
    let server = MockServer::start();
    let submit = server.mock(|when, then| {
        when.method(POST).path("/tasks");
        then.status(202).json_body(json!({"task_id": "t-7"}));
    });
    let status = server.mock(|when, then| {
        when.method(GET).path("/tasks/t-7");
        then.status(200).json_body(json!({"status": "completed"}));
    });
    let result = server.mock(|when, then| {
        when.method(GET).path("/tasks/t-7/result");
        then.status(200).json_body(json!({
            "markdown": "# Summary\nOil changed in 2021.",
            "sources": ["records/a.pdf"],
            "failures": [{"id": "records/b.pdf", "error": "encrypted"}]
        }));
    });

    let client = docsvc(&server);
    let task = DocTask {
        kind: "summary".into(),
        query: "service history".into(),
        documents: vec![DocInput {
            id: "records/a.pdf".into(),
            path: "/in/records/a.pdf".into(),
        }],
    };
    let id = client.submit(&task).unwrap();
    assert_eq!(id, "t-7");
    assert_eq!(client.poll(&id).unwrap(), TaskState::Done);
    let res = client.fetch_result(&id).unwrap();
    assert!(res.markdown.starts_with("# Summary"));
    assert_eq!(res.sources, vec!["records/a.pdf"]);
    assert_eq!(res.failures[0].error, "encrypted");

    submit.assert();
    status.assert();
    result.assert();
}

#[test]
fn doc_service_failed_and_unknown_states() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/tasks/t-fail");
        then.status(200)
            .json_body(json!({"state": "error", "error": "no text layer"}));
    });
    server.mock(|when, then| {
        when.method(GET).path("/tasks/t-odd");
        then.status(200).json_body(json!({"status": "sleeping"}));
    });

    let client = docsvc(&server);
    assert_eq!(
        client.poll("t-fail").unwrap(),
        TaskState::Failed {
            message: "no text layer".into()
        }
    );
    assert!(matches!(
        client.poll("t-odd").unwrap_err(),
        WorkerError::Protocol { .. }
    ));
}

#[test]
fn slow_http_reply_is_unreachable_not_a_step_timeout() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/system_stats");
        then.status(200).json_body(json!({})).delay(Duration::from_secs(3));
    });
    server.mock(|when, then| {
        when.method(GET).path("/history/p-slow");
        then.status(200).json_body(json!({})).delay(Duration::from_secs(3));
    });
    let client = ComfyClient::new(&config::ImageWorker {
        base_url: server.base_url(),
        request_timeout_seconds: 1,
        ..config::ImageWorker::default()
    });

    assert!(matches!(
        client.health().unwrap_err(),
        WorkerError::Unreachable { .. }
    ));
    let err = client.poll("p-slow").unwrap_err();
    assert!(matches!(err, WorkerError::Unreachable { .. }), "{err:?}");
}
