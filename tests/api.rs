//! End-to-end checks against the assembled router.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use sandboxd::{AppState, Config};

fn test_app() -> axum::Router {
    let mut config = Config::default();
    config.shell.workspace_dir = "/tmp".to_string();
    sandboxd::routes::build_router(AppState::new(config))
}

fn api_request(method: Method, path: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(path)
        .header("x-sandbox-id", "sbx-test")
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_open() {
    let app = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn missing_sandbox_id_is_rejected() {
    let app = test_app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/expose-port")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"port": 9092}).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn expose_list_unexpose_round_trip() {
    let app = test_app();

    let response = app
        .clone()
        .oneshot(api_request(
            Method::POST,
            "/api/expose-port",
            Some(json!({"port": 9092, "name": "web"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["port"]["port"], 9092);
    assert_eq!(body["port"]["status"], "active");

    let response = app
        .clone()
        .oneshot(api_request(Method::GET, "/api/exposed-ports", None))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["ports"][0]["port"], 9092);

    let response = app
        .clone()
        .oneshot(api_request(Method::DELETE, "/api/exposed-ports/9092", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Reserved ports never make it in.
    let response = app
        .oneshot(api_request(
            Method::POST,
            "/api/expose-port",
            Some(json!({"port": 8080})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "INVALID_PORT");
}

#[tokio::test]
async fn binary_write_read_round_trip() {
    use base64::Engine;
    let app = test_app();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob.bin").to_string_lossy().into_owned();

    let bytes: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);

    let response = app
        .clone()
        .oneshot(api_request(
            Method::POST,
            "/api/write",
            Some(json!({"path": path, "content": encoded, "encoding": "base64"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(api_request(
            Method::POST,
            "/api/read",
            Some(json!({"path": path, "encoding": "base64"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["encoding"], "base64");
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(body["content"].as_str().unwrap())
        .unwrap();
    assert_eq!(decoded, bytes);
}

#[tokio::test]
async fn delete_directory_requires_recursive() {
    let app = test_app();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_string_lossy().into_owned();

    let response = app
        .clone()
        .oneshot(api_request(
            Method::POST,
            "/api/delete",
            Some(json!({"path": path})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "CANNOT_DELETE_DIRECTORY_WITH_DELETE_FILE");
}

#[tokio::test]
async fn execute_runs_on_the_default_session() {
    let app = test_app();

    let response = app
        .clone()
        .oneshot(api_request(
            Method::POST,
            "/api/execute",
            Some(json!({"command": "echo integration-check"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["exitCode"], 0);
    assert_eq!(body["stdout"], "integration-check\n");

    // Tear the session shells down from the inside.
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/cleanup")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn terminal_without_upgrade_is_426() {
    let app = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/terminal/t1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "NOT_WEBSOCKET_REQUEST");
}

#[tokio::test]
async fn unknown_process_is_404() {
    let app = test_app();
    let response = app
        .oneshot(api_request(Method::GET, "/api/process/ghost", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], "PROCESS_NOT_FOUND");
}

#[tokio::test]
async fn unsupported_code_language_is_rejected() {
    let app = test_app();
    let response = app
        .oneshot(api_request(
            Method::POST,
            "/api/code/context/create",
            Some(json!({"language": "ruby"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn git_checkout_rejects_unlisted_hosts() {
    let app = test_app();
    let response = app
        .oneshot(api_request(
            Method::POST,
            "/api/git/checkout",
            Some(json!({"repoUrl": "https://evil.example.com/repo.git"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["code"], "GIT_URL_SECURITY_VIOLATION");
}
