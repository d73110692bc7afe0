use async_trait::async_trait;
use chatlink::ai::AiBridge;
use chatlink::config::{AiConfig, BridgeConfig};
use chatlink::credentials::CredentialStore;
use chatlink::db::{self, DbKind, MessageRow};
use chatlink::outbound::OutboundService;
use chatlink::protocol::{ProtocolClient, ProtocolConnection, ProtocolEvent};
use chatlink::session::SessionManager;
use chatlink::ws::WsEvent;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct RecordingConnection {
    sent: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl ProtocolConnection for RecordingConnection {
    async fn send(&self, to: &str, payload: &Value) -> anyhow::Result<String> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), payload.clone()));
        Ok(format!("SRV-{}", sent.len()))
    }
    async fn download_media(&self, _message_id: &str) -> anyhow::Result<bytes::Bytes> {
        Ok(bytes::Bytes::new())
    }
    async fn send_presence(&self, _to: &str, _state: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn chat_modify(&self, _jid: &str, _action: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn profile_picture(&self, _jid: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
    async fn group_metadata(&self, _jid: &str) -> anyhow::Result<Value> {
        Ok(json!({}))
    }
    async fn logout(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingClient {
    connections: Mutex<Vec<Arc<RecordingConnection>>>,
}

impl RecordingClient {
    fn latest(&self) -> Arc<RecordingConnection> {
        self.connections.lock().unwrap().last().unwrap().clone()
    }
}

#[async_trait]
impl ProtocolClient for RecordingClient {
    async fn connect(
        &self,
        _session_id: &str,
        _credential: Option<Value>,
    ) -> anyhow::Result<(Arc<dyn ProtocolConnection>, mpsc::Receiver<ProtocolEvent>)> {
        let (_tx, rx) = mpsc::channel(1);
        let conn = Arc::new(RecordingConnection::default());
        self.connections.lock().unwrap().push(conn.clone());
        Ok((conn, rx))
    }
}

struct Harness {
    pool: AnyPool,
    client: Arc<RecordingClient>,
    bridge: AiBridge,
    ws_rx: broadcast::Receiver<WsEvent>,
}

async fn harness(ai_url: Option<String>) -> Harness {
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::init_db(&pool, DbKind::Sqlite).await.unwrap();

    let client = Arc::new(RecordingClient::default());
    let (ws_tx, ws_rx) = broadcast::channel(64);
    let cfg = BridgeConfig {
        typing_ms_per_char: 0,
        ..BridgeConfig::default()
    };
    let creds = CredentialStore::new(
        pool.clone(),
        DbKind::Sqlite,
        std::time::Duration::from_millis(50),
    );
    let manager = SessionManager::new(
        pool.clone(),
        DbKind::Sqlite,
        cfg.clone(),
        client.clone(),
        creds,
        ws_tx.clone(),
    );
    manager.create("s1", "t1").await.unwrap();
    db::set_session_connected(&pool, DbKind::Sqlite, "s1", "209990000000", Utc::now())
        .await
        .unwrap();
    let outbound = OutboundService::new(
        pool.clone(),
        DbKind::Sqlite,
        cfg,
        manager,
        ws_tx.clone(),
    );
    let bridge = AiBridge::new(
        reqwest::Client::new(),
        AiConfig {
            url: ai_url,
            api_token: None,
        },
        pool.clone(),
        DbKind::Sqlite,
        outbound,
        ws_tx,
    );
    Harness {
        pool,
        client,
        bridge,
        ws_rx,
    }
}

async fn session_with(
    pool: &AnyPool,
    auto_reply: bool,
    mode: &str,
    hours: Option<(&str, &str)>,
    away: Option<&str>,
) -> db::SessionRow {
    let mut row = db::get_session(pool, DbKind::Sqlite, "s1").await.unwrap().unwrap();
    row.auto_reply = auto_reply;
    row.auto_reply_mode = mode.to_string();
    row.working_hours_start = hours.map(|(s, _)| s.to_string());
    row.working_hours_end = hours.map(|(_, e)| e.to_string());
    row.away_message = away.map(|m| m.to_string());
    db::upsert_session(pool, DbKind::Sqlite, &row).await.unwrap();
    db::get_session(pool, DbKind::Sqlite, "s1").await.unwrap().unwrap()
}

fn inbound_text(text: &str) -> MessageRow {
    let now = Utc::now();
    MessageRow {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: "s1".to_string(),
        external_id: "IN-1".to_string(),
        jid: "201001234567@s.whatsapp.net".to_string(),
        direction: "inbound".to_string(),
        msg_type: "text".to_string(),
        content: Some(text.to_string()),
        media_url: None,
        quoted_id: None,
        status: "delivered".to_string(),
        from_me: false,
        ai_generated: false,
        ai_confidence: None,
        timestamp: now,
        created_at: now,
    }
}

#[tokio::test]
async fn test_disabled_flag_short_circuits() {
    let server = MockServer::start().await;
    let h = harness(Some(format!("{}/generate", server.uri()))).await;
    let session = session_with(&h.pool, false, "auto", None, None).await;

    h.bridge.handle_inbound(session, inbound_text("hi")).await;
    assert!(h.client.latest().sent.lock().unwrap().is_empty());
    // No generation request reached the server either.
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_auto_mode_sends_generated_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "Thanks for reaching out!",
            "confidence": 0.91,
            "intent": "greeting"
        })))
        .mount(&server)
        .await;
    let h = harness(Some(format!("{}/generate", server.uri()))).await;
    let session = session_with(&h.pool, true, "auto", None, None).await;

    h.bridge.handle_inbound(session, inbound_text("hello?")).await;

    let sent = h.client.latest().sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1["text"], "Thanks for reaching out!");

    let stored = db::get_message_by_external_id(&h.pool, DbKind::Sqlite, "s1", "SRV-1")
        .await
        .unwrap()
        .unwrap();
    assert!(stored.ai_generated);
    assert_eq!(stored.ai_confidence, Some(0.91));
}

#[tokio::test]
async fn test_suggest_mode_emits_instead_of_sending() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "Suggested wording",
            "confidence": 0.4
        })))
        .mount(&server)
        .await;
    let mut h = harness(Some(format!("{}/generate", server.uri()))).await;
    let session = session_with(&h.pool, true, "suggest", None, None).await;

    h.bridge.handle_inbound(session, inbound_text("question")).await;

    assert!(h.client.latest().sent.lock().unwrap().is_empty());
    let mut saw_suggestion = false;
    while let Ok(event) = h.ws_rx.try_recv() {
        if event.event == "ai:suggestion" {
            saw_suggestion = true;
            assert_eq!(event.payload["text"], "Suggested wording");
        }
    }
    assert!(saw_suggestion);
}

#[tokio::test]
async fn test_media_gets_canned_ack_without_generation() {
    let server = MockServer::start().await;
    let h = harness(Some(format!("{}/generate", server.uri()))).await;
    let session = session_with(&h.pool, true, "auto", None, None).await;

    let mut message = inbound_text("");
    message.msg_type = "image".to_string();
    message.content = None;
    h.bridge.handle_inbound(session, message).await;

    let sent = h.client.latest().sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1["text"].as_str().unwrap().contains("image"));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_away_message_sent_once_per_hour() {
    let server = MockServer::start().await;
    let h = harness(Some(format!("{}/generate", server.uri()))).await;
    // A working window two hours ahead of now can never contain now.
    let now = Utc::now();
    let start = (now + chrono::Duration::hours(2)).format("%H:%M").to_string();
    let end = (now + chrono::Duration::hours(3)).format("%H:%M").to_string();
    let session = session_with(
        &h.pool,
        true,
        "auto",
        Some((start.as_str(), end.as_str())),
        Some("We are closed, back soon."),
    )
    .await;

    h.bridge.handle_inbound(session.clone(), inbound_text("anyone?")).await;
    h.bridge.handle_inbound(session, inbound_text("hello??")).await;

    let sent = h.client.latest().sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1["text"], "We are closed, back soon.");
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_no_generation_url_means_inert() {
    let h = harness(None).await;
    let session = session_with(&h.pool, true, "auto", None, None).await;
    h.bridge.handle_inbound(session, inbound_text("hi")).await;
    assert!(h.client.latest().sent.lock().unwrap().is_empty());
}
