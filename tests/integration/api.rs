use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chatlink::AppState;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tower::ServiceExt;

// create_app reads CHATLINK_* environment variables; the guard keeps
// parallel tests from seeing each other's overrides mid-setup.
static ENV_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

async fn build_app(extra_env: &[(&str, String)]) -> (AppState, Router, TempDir) {
    let guard = ENV_GUARD.lock().await;
    let dir = tempfile::tempdir().unwrap();
    std::env::remove_var("CHATLINK_TOKEN");
    std::env::remove_var("CHATLINK_AI_URL");
    std::env::remove_var("CHATLINK_SIDECAR_URL");
    std::env::set_var("CHATLINK_CONFIG", dir.path().join("missing.json"));
    std::env::set_var(
        "CHATLINK_DATABASE_URL",
        format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("state.sqlite").display()
        ),
    );
    std::env::set_var("CHATLINK_MEDIA_DIR", dir.path().join("media"));
    for (key, value) in extra_env {
        std::env::set_var(key, value);
    }
    let (state, router) = chatlink::create_app().await.unwrap();
    for (key, _) in extra_env {
        std::env::remove_var(key);
    }
    drop(guard);
    (state, router, dir)
}

async fn call(
    router: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("X-Chatlink-Token", token);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health_and_status_are_public() {
    let (_state, router, _dir) = build_app(&[]).await;

    let (status, body) = call(&router, "GET", "/v1/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call(&router, "GET", "/v1/status", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["pending_notifications"], 0);
}

#[tokio::test]
async fn test_session_crud_over_http() {
    let (_state, router, _dir) = build_app(&[]).await;

    let (status, created) = call(
        &router,
        "POST",
        "/v1/sessions",
        None,
        Some(json!({"id": "s1", "tenant_id": "t1", "auto_reply": true})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["id"], "s1");
    assert_eq!(created["status"], "disconnected");

    let (status, fetched) = call(&router, "GET", "/v1/sessions/s1", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["tenant_id"], "t1");
    assert_eq!(fetched["auto_reply"], true);

    let (status, listed) = call(&router, "GET", "/v1/sessions?tenant_id=t1", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, updated) = call(
        &router,
        "PUT",
        "/v1/sessions/s1",
        None,
        Some(json!({"auto_reply_mode": "auto", "away_message": "back soon"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["auto_reply_mode"], "auto");
    assert_eq!(updated["away_message"], "back soon");

    let (status, _) = call(&router, "DELETE", "/v1/sessions/s1", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&router, "GET", "/v1/sessions/s1", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_send_on_disconnected_session_is_conflict() {
    let (state, router, _dir) = build_app(&[]).await;

    call(
        &router,
        "POST",
        "/v1/sessions",
        None,
        Some(json!({"id": "s1", "tenant_id": "t1"})),
    )
    .await;

    let (status, body) = call(
        &router,
        "POST",
        "/v1/sessions/s1/send",
        None,
        Some(json!({"to": "0100 1234567", "content": {"type": "text", "body": "hi"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "session not connected");

    // Nothing was persisted for the failed send.
    let count = chatlink::db::count_messages(&state.pool, state.db_kind, "s1")
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn test_connect_with_unreachable_sidecar_is_bad_gateway() {
    // Grab a port nothing is listening on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (_state, router, _dir) = build_app(&[(
        "CHATLINK_SIDECAR_URL",
        format!("http://127.0.0.1:{port}"),
    )])
    .await;

    call(
        &router,
        "POST",
        "/v1/sessions",
        None,
        Some(json!({"id": "s1", "tenant_id": "t1"})),
    )
    .await;
    let (status, _) = call(&router, "POST", "/v1/sessions/s1/connect", None, None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_auth_token_guards_the_operation_surface() {
    let (_state, router, _dir) =
        build_app(&[("CHATLINK_TOKEN", "sekrit".to_string())]).await;

    let (status, _) = call(&router, "GET", "/v1/sessions", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = call(&router, "GET", "/v1/sessions", Some("wrong"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = call(&router, "GET", "/v1/sessions", Some("sekrit"), None).await;
    assert_eq!(status, StatusCode::OK);

    // Health stays public even with a token configured.
    let (status, _) = call(&router, "GET", "/v1/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_notification_surface_end_to_end() {
    let (_state, router, _dir) = build_app(&[]).await;

    let (status, settings) = call(
        &router,
        "PUT",
        "/v1/notifications/settings/t1",
        None,
        Some(json!({"enabled": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(settings["enabled"], true);

    let (status, fetched) =
        call(&router, "GET", "/v1/notifications/settings/t1", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["tenant_id"], "t1");

    let (status, template) = call(
        &router,
        "POST",
        "/v1/notifications/templates",
        None,
        Some(json!({
            "event_type": "ORDER_SHIPPED",
            "category": "orders",
            "body": "Order {orderNumber} is on its way."
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(template["event_type"], "ORDER_SHIPPED");

    // No session exists for the tenant: a typed rejection, not an error.
    let (status, outcome) = call(
        &router,
        "POST",
        "/v1/notifications/send",
        None,
        Some(json!({
            "tenant_id": "t1",
            "recipient_phone": "0100 1234567",
            "event_type": "ORDER_SHIPPED",
            "variables": {"orderNumber": "1001"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["result"], "rejected");
    assert_eq!(outcome["reason"], "no_session");

    let (status, stats) = call(
        &router,
        "GET",
        "/v1/notifications/stats?tenant_id=t1",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["sent"], 0);

    let (status, logs) = call(
        &router,
        "GET",
        "/v1/notifications/logs?tenant_id=t1",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(logs.as_array().unwrap().is_empty());
}
