pub mod ai;
pub mod config;
pub mod credentials;
pub mod crm;
pub mod db;
pub mod identity;
pub mod ingest;
pub mod notify;
pub mod outbound;
pub mod protocol;
pub mod session;
pub mod ws;

pub use config::Config;

use self::ai::AiBridge;
use self::config::{load_config, resolve_database_url, resolve_media_dir};
use self::credentials::CredentialStore;
use self::crm::CrmBridge;
use self::db::DbKind;
use self::ingest::Pipeline;
use self::notify::{NotificationRequest, NotificationService};
use self::outbound::{OutboundContent, OutboundService, SendError, SendOptions};
use self::protocol::SidecarClient;
use self::session::SessionManager;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub db_kind: DbKind,
    pub http: reqwest::Client,
    pub ws_tx: broadcast::Sender<ws::WsEvent>,
    pub media_dir: PathBuf,
    pub creds: CredentialStore,
    pub manager: SessionManager,
    pub outbound: OutboundService,
    pub notify: NotificationService,
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    sqlx::any::install_default_drivers();

    let config = load_config();
    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;

    let media_dir = resolve_media_dir(&config);
    let http = reqwest::Client::new();
    let (ws_tx, _) = broadcast::channel(100);

    let creds = CredentialStore::new(
        pool.clone(),
        db_kind,
        std::time::Duration::from_millis(config.bridge.credential_debounce_ms),
    );
    let client = Arc::new(SidecarClient::new(
        http.clone(),
        config.sidecar.url.clone(),
        config.sidecar.event_wait_seconds,
    ));
    let manager = SessionManager::new(
        pool.clone(),
        db_kind,
        config.bridge.clone(),
        client,
        creds.clone(),
        ws_tx.clone(),
    );
    let outbound = OutboundService::new(
        pool.clone(),
        db_kind,
        config.bridge.clone(),
        manager.clone(),
        ws_tx.clone(),
    );
    let crm = CrmBridge::new(pool.clone(), db_kind);
    let ai = AiBridge::new(
        http.clone(),
        config.ai.clone(),
        pool.clone(),
        db_kind,
        outbound.clone(),
        ws_tx.clone(),
    );
    let pipeline = Pipeline::new(
        pool.clone(),
        db_kind,
        config.bridge.clone(),
        media_dir.clone(),
        config.media.base_url.clone(),
        ws_tx.clone(),
        crm,
        ai,
    );
    manager.set_inbound_handler(Arc::new(pipeline));

    let notify = NotificationService::new(
        pool.clone(),
        db_kind,
        config.queue.clone(),
        config.bridge.default_country_code.clone(),
        manager.clone(),
        outbound.clone(),
        ws_tx.clone(),
    );
    notify.spawn_worker();

    let state = AppState {
        config: config.clone(),
        pool,
        db_kind,
        http,
        ws_tx,
        media_dir,
        creds,
        manager: manager.clone(),
        outbound,
        notify,
    };

    tokio::spawn(async move {
        if let Err(err) = manager.restore_all().await {
            error!("session restore failed: {err}");
        }
    });

    let authed_routes = Router::new()
        .route("/v1/sessions", post(create_session).get(list_sessions))
        .route(
            "/v1/sessions/:id",
            get(get_session).put(update_session).delete(delete_session),
        )
        .route("/v1/sessions/:id/connect", post(connect_session))
        .route("/v1/sessions/:id/disconnect", post(disconnect_session))
        .route("/v1/sessions/:id/contacts", get(list_contacts))
        .route("/v1/sessions/:id/messages", get(list_messages))
        .route("/v1/sessions/:id/send", post(send_message))
        .route("/v1/sessions/:id/chats/:jid/read", post(mark_chat_read))
        .route("/v1/sessions/:id/chats/:jid/modify", post(modify_chat))
        .route("/v1/notifications/send", post(send_notification))
        .route("/v1/notifications/schedule", post(schedule_notification))
        .route("/v1/notifications/logs", get(notification_logs))
        .route("/v1/notifications/stats", get(notification_stats))
        .route(
            "/v1/notifications/settings/:tenant_id",
            get(get_notification_settings).put(put_notification_settings),
        )
        .route(
            "/v1/notifications/templates",
            get(list_notification_templates).post(upsert_notification_template),
        )
        .route("/v1/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/media/*path", get(serve_media));

    let app = Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state.clone());

    Ok((state, app))
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = state.config.auth.token.as_ref() {
        let header = headers.get("X-Chatlink-Token").and_then(|v| v.to_str().ok());
        if header != Some(token.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = db::count_sessions(&state.pool, state.db_kind).await.unwrap_or(0);
    let messages = db::count_all_messages(&state.pool, state.db_kind)
        .await
        .unwrap_or(0);
    let pending_notifications = db::count_pending_queue(&state.pool, state.db_kind)
        .await
        .unwrap_or(0);
    Json(json!({
        "sessions": sessions,
        "messages": messages,
        "pending_notifications": pending_notifications,
        "credential_writes": state.creds.write_count(),
    }))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let rx = state.ws_tx.subscribe();
    let token = state.config.auth.token.clone();
    ws.on_upgrade(move |socket| ws::handle_ws(socket, rx, token))
}

async fn serve_media(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> impl IntoResponse {
    if path.contains("..") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let full = state.media_dir.join(&path);
    match tokio::fs::read(&full).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

// ----------------------------------------------------------------- sessions

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    id: Option<String>,
    tenant_id: String,
    #[serde(default)]
    auto_reply: Option<bool>,
    #[serde(default)]
    auto_reply_mode: Option<String>,
    #[serde(default)]
    working_hours_start: Option<String>,
    #[serde(default)]
    working_hours_end: Option<String>,
    #[serde(default)]
    away_message: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let now = Utc::now();
    let record = db::SessionRow {
        id: req.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        tenant_id: req.tenant_id,
        status: "disconnected".to_string(),
        phone_number: None,
        avatar_url: None,
        auto_reply: req.auto_reply.unwrap_or(false),
        auto_reply_mode: req.auto_reply_mode.unwrap_or_else(|| "suggest".to_string()),
        working_hours_start: req.working_hours_start,
        working_hours_end: req.working_hours_end,
        away_message: req.away_message,
        last_connected_at: None,
        last_disconnected_at: None,
        created_at: now,
        updated_at: now,
    };
    match db::upsert_session(&state.pool, state.db_kind, &record).await {
        Ok(()) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct TenantQuery {
    tenant_id: Option<String>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<TenantQuery>,
) -> impl IntoResponse {
    match db::list_sessions(&state.pool, state.db_kind, query.tenant_id.as_deref()).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(err) => store_error(err),
    }
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match db::get_session(&state.pool, state.db_kind, &id).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateSessionRequest {
    #[serde(default)]
    auto_reply: Option<bool>,
    #[serde(default)]
    auto_reply_mode: Option<String>,
    #[serde(default)]
    working_hours_start: Option<String>,
    #[serde(default)]
    working_hours_end: Option<String>,
    #[serde(default)]
    away_message: Option<String>,
}

async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateSessionRequest>,
) -> impl IntoResponse {
    let mut record = match db::get_session(&state.pool, state.db_kind, &id).await {
        Ok(Some(session)) => session,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return store_error(err),
    };
    if let Some(auto_reply) = req.auto_reply {
        record.auto_reply = auto_reply;
    }
    if let Some(mode) = req.auto_reply_mode {
        record.auto_reply_mode = mode;
    }
    if req.working_hours_start.is_some() {
        record.working_hours_start = req.working_hours_start;
    }
    if req.working_hours_end.is_some() {
        record.working_hours_end = req.working_hours_end;
    }
    if req.away_message.is_some() {
        record.away_message = req.away_message;
    }
    record.updated_at = Utc::now();
    match db::upsert_session(&state.pool, state.db_kind, &record).await {
        Ok(()) => Json(record).into_response(),
        Err(err) => store_error(err),
    }
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.delete(&id).await {
        Ok(()) => Json(json!({"status": "deleted"})).into_response(),
        Err(err) => {
            error!("session delete failed for {id}: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn connect_session(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let session = match db::get_session(&state.pool, state.db_kind, &id).await {
        Ok(Some(session)) => session,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return store_error(err),
    };
    match state.manager.create(&id, &session.tenant_id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "connecting"})),
        )
            .into_response(),
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn disconnect_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.close(&id).await {
        Ok(()) => Json(json!({"status": "disconnected"})).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

// -------------------------------------------------------- chats and messages

#[derive(Debug, Deserialize)]
struct Pagination {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_contacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(page): Query<Pagination>,
) -> impl IntoResponse {
    let limit = page.limit.unwrap_or(100).min(500);
    let offset = page.offset.unwrap_or(0);
    match db::list_contacts(&state.pool, state.db_kind, &id, limit, offset).await {
        Ok(contacts) => Json(contacts).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    jid: String,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(200).min(500);
    let offset = query.offset.unwrap_or(0);
    let jid = identity::canonical_jid(&query.jid, &state.config.bridge.default_country_code);
    match db::list_messages(&state.pool, state.db_kind, &id, &jid, limit, offset).await {
        Ok(messages) => Json(messages).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    to: String,
    content: OutboundContent,
    #[serde(default)]
    quoted_id: Option<String>,
    #[serde(default)]
    simulate_typing: Option<bool>,
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> impl IntoResponse {
    let opts = SendOptions {
        quoted_id: req.quoted_id,
        simulate_typing: req.simulate_typing.unwrap_or(false),
        ai_generated: false,
        ai_confidence: None,
    };
    match state.outbound.send(&id, &req.to, req.content, opts).await {
        Ok(message) => Json(message).into_response(),
        Err(err) => send_error(err),
    }
}

async fn mark_chat_read(
    State(state): State<AppState>,
    Path((id, jid)): Path<(String, String)>,
) -> impl IntoResponse {
    let jid = identity::canonical_jid(&jid, &state.config.bridge.default_country_code);
    match state.manager.mark_read(&id, &jid).await {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct ChatModifyRequest {
    action: String,
    #[serde(default = "default_true")]
    value: bool,
}

fn default_true() -> bool {
    true
}

async fn modify_chat(
    State(state): State<AppState>,
    Path((id, jid)): Path<(String, String)>,
    Json(req): Json<ChatModifyRequest>,
) -> impl IntoResponse {
    let jid = identity::canonical_jid(&jid, &state.config.bridge.default_country_code);
    if let Err(err) = db::set_contact_flag(
        &state.pool,
        state.db_kind,
        &id,
        &jid,
        &req.action,
        req.value,
        Utc::now(),
    )
    .await
    {
        return store_error(err);
    }
    if let Some(live) = state.manager.current(&id).await {
        let _ = live.connection.chat_modify(&jid, &req.action).await;
    }
    Json(json!({"status": "ok"})).into_response()
}

// ------------------------------------------------------------- notifications

async fn send_notification(
    State(state): State<AppState>,
    Json(req): Json<NotificationRequest>,
) -> impl IntoResponse {
    match state.notify.send(req).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => {
            error!("notification send failed: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn schedule_notification(
    State(state): State<AppState>,
    Json(req): Json<NotificationRequest>,
) -> impl IntoResponse {
    match state.notify.schedule(req).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => {
            error!("notification schedule failed: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tenant_id: String,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn notification_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100).min(500);
    let offset = query.offset.unwrap_or(0);
    match db::list_notification_logs(&state.pool, state.db_kind, &query.tenant_id, limit, offset)
        .await
    {
        Ok(logs) => Json(logs).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    tenant_id: String,
}

async fn notification_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> impl IntoResponse {
    match state.notify.stats(&query.tenant_id).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn get_notification_settings(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    match db::get_notification_settings(&state.pool, state.db_kind, &tenant_id).await {
        Ok(Some(settings)) => Json(settings).into_response(),
        Ok(None) => Json(db::NotificationSettingsRow::defaults(&tenant_id)).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct SettingsRequest {
    enabled: bool,
    #[serde(default)]
    default_session_id: Option<String>,
    #[serde(default)]
    quiet_start: Option<String>,
    #[serde(default)]
    quiet_end: Option<String>,
}

async fn put_notification_settings(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<SettingsRequest>,
) -> impl IntoResponse {
    let record = db::NotificationSettingsRow {
        tenant_id,
        enabled: req.enabled,
        default_session_id: req.default_session_id,
        quiet_start: req.quiet_start,
        quiet_end: req.quiet_end,
        updated_at: Utc::now(),
    };
    match db::upsert_notification_settings(&state.pool, state.db_kind, &record).await {
        Ok(()) => Json(record).into_response(),
        Err(err) => store_error(err),
    }
}

async fn list_notification_templates(
    State(state): State<AppState>,
    Query(query): Query<TenantQuery>,
) -> impl IntoResponse {
    let tenant_id = query.tenant_id.unwrap_or_default();
    match db::list_templates(&state.pool, state.db_kind, &tenant_id).await {
        Ok(templates) => Json(templates).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct TemplateRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
    event_type: String,
    #[serde(default = "default_category")]
    category: String,
    body: String,
    #[serde(default)]
    buttons: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    active: bool,
}

fn default_category() -> String {
    "general".to_string()
}

async fn upsert_notification_template(
    State(state): State<AppState>,
    Json(req): Json<TemplateRequest>,
) -> impl IntoResponse {
    let now = Utc::now();
    let record = db::NotificationTemplateRow {
        id: req.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        tenant_id: req.tenant_id,
        event_type: req.event_type,
        category: req.category,
        body: req.body,
        buttons: req.buttons,
        active: req.active,
        usage_count: 0,
        created_at: now,
        updated_at: now,
    };
    match db::upsert_template(&state.pool, state.db_kind, &record).await {
        Ok(()) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => store_error(err),
    }
}

// --------------------------------------------------------------- error maps

fn store_error(err: db::StoreError) -> axum::response::Response {
    error!("store error: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}

fn send_error(err: SendError) -> axum::response::Response {
    let status = match &err {
        SendError::NoSession => StatusCode::NOT_FOUND,
        SendError::NotConnected => StatusCode::CONFLICT,
        SendError::InvalidRecipient(_) => StatusCode::BAD_REQUEST,
        SendError::Transport(_) => StatusCode::BAD_GATEWAY,
        SendError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}
