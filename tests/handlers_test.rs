// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admin API tests driving the router directly.

mod common;

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use stack_updater::server::router;

use common::{harness, manifest_server, stack_engine, wait_terminal};

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_start_accepts_and_reports_session() {
    let server = manifest_server("1.5.0", true).await;
    let h = harness(stack_engine(), &server.uri());
    let app = router(h.orchestrator.clone());

    let (status, body) = send(&app, post_json("/admin/update/start", json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["target_version"], "1.5.0");
    assert_eq!(body["channel"], "stable");
    assert!(body["update_id"].as_str().is_some());
}

#[tokio::test]
async fn test_start_conflicts_while_in_flight() {
    let server = manifest_server("1.5.0", true).await;
    let engine = stack_engine();
    engine.set_pull_delay(Duration::from_millis(300));
    let h = harness(engine, &server.uri());
    let app = router(h.orchestrator.clone());

    let (status, first) = send(&app, post_json("/admin/update/start", json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(&app, post_json("/admin/update/start", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "update_in_progress");
    assert_eq!(body["active_session"], first["update_id"]);
}

#[tokio::test]
async fn test_start_rejects_unpublished_version() {
    let server = manifest_server("1.5.0", true).await;
    let h = harness(stack_engine(), &server.uri());
    let app = router(h.orchestrator.clone());

    let (status, body) = send(
        &app,
        post_json("/admin/update/start", json!({ "version": "9.9.9" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_target");
}

#[tokio::test]
async fn test_status_of_unknown_session_is_404() {
    let server = manifest_server("1.5.0", true).await;
    let h = harness(stack_engine(), &server.uri());
    let app = router(h.orchestrator.clone());

    let (status, body) = send(
        &app,
        get("/admin/update/status?update_id=00000000-0000-0000-0000-000000000001"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown_session");

    // No sessions at all behaves the same.
    let (status, _) = send(&app, get("/admin/update/status")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_status_reports_terminal_snapshot() {
    let server = manifest_server("1.5.0", true).await;
    let h = harness(stack_engine(), &server.uri());
    let app = router(h.orchestrator.clone());

    let (_, started) = send(&app, post_json("/admin/update/start", json!({}))).await;
    let id: uuid::Uuid = started["update_id"].as_str().unwrap().parse().unwrap();
    wait_terminal(&h.store, id).await;

    let (status, body) = send(&app, get(&format!("/admin/update/status?update_id={id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "completed");
    assert_eq!(body["outcome"], "succeeded");
    assert_eq!(body["progress"], 100);
    assert!(body["log_tail"].as_array().is_some());
}

#[tokio::test]
async fn test_cancel_completed_session_is_too_late() {
    let server = manifest_server("1.5.0", true).await;
    let h = harness(stack_engine(), &server.uri());
    let app = router(h.orchestrator.clone());

    let (_, started) = send(&app, post_json("/admin/update/start", json!({}))).await;
    let id: uuid::Uuid = started["update_id"].as_str().unwrap().parse().unwrap();
    wait_terminal(&h.store, id).await;

    let (status, body) = send(
        &app,
        post_json("/admin/update/cancel", json!({ "update_id": id })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "too_late");
}

#[tokio::test]
async fn test_cancel_without_active_session_is_404() {
    let server = manifest_server("1.5.0", true).await;
    let h = harness(stack_engine(), &server.uri());
    let app = router(h.orchestrator.clone());

    let (status, _) = send(&app, post_json("/admin/update/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_version_report_shows_update_available() {
    let server = manifest_server("1.5.0", true).await;
    let h = harness(stack_engine(), &server.uri());
    let app = router(h.orchestrator.clone());

    let (status, body) = send(&app, get("/admin/version")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["latest"]["version"], "1.5.0");
    // Target images ride along so clients can show what would change.
    assert_eq!(body["latest"]["services"]["backend"], "acme/backend:1.5.0");
    assert_eq!(body["latest"]["digests"]["backend"], "sha256:backnew");
    assert_eq!(body["update_available"], true);
    assert_eq!(body["current"]["backend"]["image"], "acme/backend:1.4.0");
}

#[tokio::test]
async fn test_stream_of_unknown_session_is_404() {
    let server = manifest_server("1.5.0", true).await;
    let h = harness(stack_engine(), &server.uri());
    let app = router(h.orchestrator.clone());

    let (status, _) = send(
        &app,
        get("/admin/update/stream?update_id=00000000-0000-0000-0000-000000000002"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
