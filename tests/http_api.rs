mod common;

use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{Map, Value};
use tower::ServiceExt;

use runwire::config::ServerConfig;
use runwire::messages::RunStartRequest;
use runwire::providers::ProviderCatalog;
use runwire::server::{build_router, AppState};

use common::echo;

async fn router(api_key: Option<&str>) -> (Router, AppState) {
    let config = ServerConfig { api_key: api_key.map(str::to_string), ..ServerConfig::default() };
    let state = AppState::from_config(&config, echo(Duration::from_millis(1)), ProviderCatalog::from_vars(Vec::<(String, String)>::new()))
        .await
        .unwrap();
    (build_router(state.clone(), None).unwrap(), state)
}

async fn get(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn version_is_open_without_a_key() {
    let (app, _) = router(None).await;
    let (status, body) = get(&app, request("/api/version")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn configured_key_is_required_in_any_form() {
    let (app, _) = router(Some("s3cret")).await;

    let (status, body) = get(&app, request("/api/env")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let wrong = Request::builder().uri("/api/env").header("x-api-key", "nope").body(Body::empty()).unwrap();
    assert_eq!(get(&app, wrong).await.0, StatusCode::UNAUTHORIZED);

    let header_form = Request::builder().uri("/api/env").header("x-api-key", "s3cret").body(Body::empty()).unwrap();
    let (status, body) = get(&app, header_form).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["configuration"]["authRequired"], true);
    assert!(!body.to_string().contains("s3cret"));

    let bearer = Request::builder()
        .uri("/api/runs")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(get(&app, bearer).await.0, StatusCode::OK);

    assert_eq!(get(&app, request("/api/runs?api-key=s3cret")).await.0, StatusCode::OK);
}

#[tokio::test]
async fn socket_upgrade_is_rejected_without_the_key() {
    let (app, _) = router(Some("s3cret")).await;
    let upgrade = Request::builder()
        .uri("/")
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Body::empty())
        .unwrap();
    assert_eq!(get(&app, upgrade).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let (app, _) = router(None).await;
    let (status, body) = get(&app, request("/api/runs/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "run_not_found");
}

#[tokio::test]
async fn finished_runs_are_served_from_history() {
    let (app, state) = router(None).await;
    let ack = state.registry().start_run(
        RunStartRequest {
            run_id: "r1".into(),
            script: "poem".into(),
            files: vec!["a".into()],
            options: Map::new(),
        },
        None,
    );
    assert!(ack.status.ok);

    let mut record = Value::Null;
    for _ in 0..100 {
        let (status, body) = get(&app, request("/api/runs/r1")).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == "success" {
            record = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(record["output"], "a\n");
    assert_eq!(record["exitCode"], 0);

    let (_, runs) = get(&app, request("/api/runs")).await;
    assert_eq!(runs["active"], Value::Array(vec![]));
    assert_eq!(runs["recent"][0]["runId"], "r1");
}
