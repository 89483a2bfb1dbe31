use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`

use doubleteam::api::{AppState, models::HealthResponse, router};
use doubleteam::config::Config;
use doubleteam::pipeline::Application;
use doubleteam::streaming::{Message, MockProducer, Producer};

/// Creates a minimal config for testing, bypassing file-based loading
fn create_test_config() -> Config {
    let config_toml = r#"
[server]
bind_addr = "127.0.0.1:8080"
queue_size = 16
max_payload_bytes = "1KB"

[overflow]
provider = "memory"
    "#;

    toml::from_str(config_toml).expect("Failed to parse test config")
}

/// Builds a router over a single accepting producer
fn build_test_app() -> (Router, Arc<Application>, Arc<MockProducer>) {
    let config = create_test_config();
    let primary = Arc::new(MockProducer::accepting("primary"));
    let app = Arc::new(
        Application::new(vec![primary.clone() as Arc<dyn Producer>], config.server.queue_size)
            .expect("Failed to start pipeline"),
    );

    let state = AppState::new(app.clone(), &config.server);
    (router(state), app, primary)
}

fn post_message(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .uri("/")
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_send_message_success() {
    let (router, app, primary) = build_test_app();

    let payload = json!({"topic": "clicks", "key": "user-1", "data": "{\"page\":1}"});
    let response = router
        .oneshot(post_message(payload.to_string()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "accepted");

    app.close().await.unwrap();
    assert_eq!(
        primary.accepted(),
        vec![Message::new("clicks", "user-1", "{\"page\":1}")]
    );
}

#[tokio::test]
async fn test_key_and_data_are_optional() {
    let (router, app, primary) = build_test_app();

    let response = router
        .oneshot(post_message(json!({"topic": "pings"}).to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    app.close().await.unwrap();
    let accepted = primary.accepted();
    assert_eq!(accepted.len(), 1);
    assert!(accepted[0].key().is_none());
    assert!(accepted[0].data().is_empty());
}

#[tokio::test]
async fn test_rejects_wrong_content_type() {
    let (router, _app, _primary) = build_test_app();

    let request = Request::builder()
        .uri("/")
        .method("POST")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(json!({"topic": "t"}).to_string()))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_PAYLOAD");
}

#[tokio::test]
async fn test_rejects_invalid_json_and_empty_topic() {
    let (router, _app, _primary) = build_test_app();

    let response = ServiceExt::<Request<Body>>::oneshot(router.clone(), post_message("{not json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .oneshot(post_message(json!({"topic": "  ", "data": "d"}).to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rejects_oversized_body() {
    let (router, _app, _primary) = build_test_app();

    let payload = json!({"topic": "t", "data": "x".repeat(2048)});
    let response = router
        .oneshot(post_message(payload.to_string()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_json(response).await["code"], "PAYLOAD_TOO_LARGE");
}

#[tokio::test]
async fn test_unhealthy_pipeline_refuses_messages() {
    let (router, _app, primary) = build_test_app();
    primary.set_healthy(false);

    let response = router
        .oneshot(post_message(json!({"topic": "t"}).to_string()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], "UNAVAILABLE");
}

#[tokio::test]
async fn test_closed_pipeline_refuses_messages() {
    let (router, app, _primary) = build_test_app();
    app.close().await.unwrap();

    let response = router
        .oneshot(post_message(json!({"topic": "t"}).to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_health_reports_producers() {
    let (router, _app, primary) = build_test_app();

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = ServiceExt::<Request<Body>>::oneshot(router.clone(), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.components["primary"], "healthy");
    assert_eq!(health.lost, 0);

    primary.set_healthy(false);
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = body_json(response).await;
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["reason"], "producer primary is unhealthy");
}

#[tokio::test]
async fn test_metrics_snapshot() {
    let (router, app, _primary) = build_test_app();

    ServiceExt::<Request<Body>>::oneshot(
        router.clone(),
        post_message(json!({"topic": "t"}).to_string()),
    )
    .await
    .unwrap();

    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["sent"], 1);
    assert_eq!(body["queues"][0]["name"], "primary");
    assert_eq!(body["queues"][1]["name"], "terminal");

    app.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let (router, _app, _primary) = build_test_app();

    let request = Request::builder().uri("/jobs").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}
