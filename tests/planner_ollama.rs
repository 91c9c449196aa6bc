use filecherry::{
    config,
    error::PlanningError,
    inventory::{Inventory, InventoryItem, ItemKind},
    plan::ToolKind,
    planner::{Planner, PromptTemplate},
    tools::ToolRegistry,
    worker::{OllamaClient, PlanningService},
};
use httpmock::prelude::*;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

fn planner_for(server: &MockServer) -> Planner {
    let cfg = config::Planner {
        base_url: server.base_url(),
        request_timeout_seconds: 5,
        ..config::Planner::default()
    };
    Planner::new(
        Box::new(OllamaClient::new(&cfg)),
        Arc::new(PromptTemplate::builtin()),
        20,
    )
}

fn inventory() -> Inventory {
    Inventory::from_items(
        Path::new("/in"),
        vec![
            InventoryItem {
                path: "car.jpg".into(),
                kind: ItemKind::Image,
                size_bytes: 100,
                unreadable: false,
            },
            InventoryItem {
                path: "records/service.pdf".into(),
                kind: ItemKind::Document,
                size_bytes: 200,
                unreadable: false,
            },
        ],
    )
}

#[test]
fn plan_is_extracted_from_prose_reply() {
    let server = MockServer::start();
    let content = "Here is your plan:\n```json\n{\"summary\": \"clean the car photo\", \"steps\": [{\"tool\": \"IMAGE_PIPELINE\", \"params\": {\"purpose\": \"dealership\", \"input_paths\": [\"car.jpg\"]}}]}\n```\nLet me know!";
    let chat = server.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "model": "phi3:mini",
                "message": {"role": "assistant", "content": content},
                "done": true
            }));
    });

    let draft = planner_for(&server)
        .plan(&inventory(), "make my car photo look good", &ToolRegistry::builtin())
        .expect("plan parsed");

    chat.assert();
    assert_eq!(draft.summary, "clean the car photo");
    assert_eq!(draft.steps.len(), 1);
    assert_eq!(draft.steps[0].tool, ToolKind::ImagePipeline);
    assert_eq!(draft.steps[0].input_paths(), vec!["car.jpg"]);
}

#[test]
fn reply_without_json_is_a_planning_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"message": {"role": "assistant", "content": "I am not sure what you mean."}}));
    });

    let err = planner_for(&server)
        .plan(&inventory(), "do something", &ToolRegistry::builtin())
        .unwrap_err();
    match err {
        PlanningError::NoJson { excerpt } => assert!(excerpt.contains("not sure")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn server_error_is_reported_with_status() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(500).body("model not loaded");
    });

    let err = planner_for(&server)
        .plan(&inventory(), "anything", &ToolRegistry::builtin())
        .unwrap_err();
    assert!(matches!(err, PlanningError::Status { status: 500 }));
}

#[test]
fn unreachable_service_is_reported() {
    let cfg = config::Planner {
        base_url: "http://127.0.0.1:9".into(),
        request_timeout_seconds: 2,
        ..config::Planner::default()
    };
    let client = OllamaClient::new(&cfg);
    assert!(client.health().is_err());
    let planner = Planner::new(Box::new(client), Arc::new(PromptTemplate::builtin()), 20);
    let err = planner
        .plan(&inventory(), "anything", &ToolRegistry::builtin())
        .unwrap_err();
    assert!(matches!(err, PlanningError::Unreachable { .. }));
}

#[test]
fn health_uses_tags_endpoint() {
    let server = MockServer::start();
    let tags = server.mock(|when, then| {
        when.method(GET).path("/api/tags");
        then.status(200).json_body(json!({"models": []}));
    });
    let cfg = config::Planner {
        base_url: server.base_url(),
        ..config::Planner::default()
    };
    OllamaClient::new(&cfg).health().expect("healthy");
    tags.assert();
}
