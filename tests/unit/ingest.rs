use async_trait::async_trait;
use chatlink::ai::AiBridge;
use chatlink::config::{AiConfig, BridgeConfig};
use chatlink::credentials::CredentialStore;
use chatlink::crm::CrmBridge;
use chatlink::db::{self, DbKind};
use chatlink::ingest::{extract_content, Pipeline};
use chatlink::outbound::OutboundService;
use chatlink::protocol::{ProtocolClient, ProtocolConnection, ProtocolEvent, RawMessage};
use chatlink::session::{InboundHandler, LiveConnection, SessionManager};
use chatlink::ws::WsEvent;
use serde_json::{json, Value};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

struct NoopConnection;

#[async_trait]
impl ProtocolConnection for NoopConnection {
    async fn send(&self, _to: &str, _payload: &Value) -> anyhow::Result<String> {
        Ok("SRV-1".to_string())
    }
    async fn download_media(&self, _message_id: &str) -> anyhow::Result<bytes::Bytes> {
        Ok(bytes::Bytes::from_static(b"jpeg-bytes"))
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

struct NoopClient;

#[async_trait]
impl ProtocolClient for NoopClient {
    async fn connect(
        &self,
        _session_id: &str,
        _credential: Option<Value>,
    ) -> anyhow::Result<(Arc<dyn ProtocolConnection>, mpsc::Receiver<ProtocolEvent>)> {
        let (_tx, rx) = mpsc::channel(1);
        Ok((Arc::new(NoopConnection), rx))
    }
}

struct Harness {
    pool: AnyPool,
    pipeline: Pipeline,
    live: LiveConnection,
    ws_rx: broadcast::Receiver<WsEvent>,
    _media: tempfile::TempDir,
}

async fn harness() -> Harness {
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::init_db(&pool, DbKind::Sqlite).await.unwrap();

    let now = chrono::Utc::now();
    db::ensure_session(&pool, DbKind::Sqlite, "s1", "t1", now).await.unwrap();
    db::set_session_connected(&pool, DbKind::Sqlite, "s1", "209990000000", now)
        .await
        .unwrap();

    let (ws_tx, ws_rx) = broadcast::channel(64);
    let cfg = BridgeConfig::default();
    let creds = CredentialStore::new(pool.clone(), DbKind::Sqlite, Duration::from_millis(50));
    let manager = SessionManager::new(
        pool.clone(),
        DbKind::Sqlite,
        cfg.clone(),
        Arc::new(NoopClient),
        creds,
        ws_tx.clone(),
    );
    let outbound = OutboundService::new(
        pool.clone(),
        DbKind::Sqlite,
        cfg.clone(),
        manager,
        ws_tx.clone(),
    );
    let ai = AiBridge::new(
        reqwest::Client::new(),
        AiConfig::default(),
        pool.clone(),
        DbKind::Sqlite,
        outbound,
        ws_tx.clone(),
    );
    let crm = CrmBridge::new(pool.clone(), DbKind::Sqlite);
    let media = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(
        pool.clone(),
        DbKind::Sqlite,
        cfg,
        media.path().to_path_buf(),
        "/media".to_string(),
        ws_tx,
        crm,
        ai,
    );
    let live = LiveConnection {
        session_id: "s1".to_string(),
        tenant_id: "t1".to_string(),
        conn_seq: 1,
        connection: Arc::new(NoopConnection),
    };
    Harness {
        pool,
        pipeline,
        live,
        ws_rx,
        _media: media,
    }
}

fn text_message(id: &str, text: &str) -> RawMessage {
    RawMessage {
        id: id.to_string(),
        chat: "0100 1234567@s.whatsapp.net".to_string(),
        participant: None,
        from_me: false,
        push_name: Some("Sara".to_string()),
        timestamp: chrono::Utc::now().timestamp(),
        payload: json!({"conversation": text}),
        status: None,
    }
}

fn drain_events(rx: &mut broadcast::Receiver<WsEvent>) -> Vec<WsEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

const JID: &str = "201001234567@s.whatsapp.net";

#[tokio::test]
async fn test_new_inbound_text_creates_full_record_chain() {
    let mut h = harness().await;
    h.pipeline
        .on_messages(&h.live, true, vec![text_message("EXT1", "hi there")])
        .await;

    // Message row under the canonical jid.
    let messages = db::list_messages(&h.pool, DbKind::Sqlite, "s1", JID, 10, 0).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].direction, "inbound");
    assert_eq!(messages[0].content.as_deref(), Some("hi there"));

    // Contact aggregate with one unread and the push name.
    let contact = db::get_contact(&h.pool, DbKind::Sqlite, "s1", JID).await.unwrap().unwrap();
    assert_eq!(contact.unread_count, 1);
    assert_eq!(contact.display_name.as_deref(), Some("Sara"));

    // Customer created as a lead and linked back to the contact.
    let customer = db::get_customer_by_phone(&h.pool, DbKind::Sqlite, "t1", "201001234567")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(customer.status, "lead");
    assert_eq!(contact.customer_id.as_deref(), Some(customer.id.as_str()));

    // One active conversation.
    let conversation =
        db::get_active_conversation(&h.pool, DbKind::Sqlite, "t1", &customer.id, "whatsapp")
            .await
            .unwrap()
            .unwrap();
    assert_eq!(conversation.unread_count, 1);

    // Realtime fan-out carried a message:new for the tenant.
    let events = drain_events(&mut h.ws_rx);
    assert!(events.iter().any(|e| e.event == "message:new" && e.tenant_id == "t1"));
}

#[tokio::test]
async fn test_redelivery_updates_in_place() {
    let mut h = harness().await;
    h.pipeline
        .on_messages(&h.live, true, vec![text_message("EXT1", "hi there")])
        .await;
    drain_events(&mut h.ws_rx);

    // Same external id, redelivered with a progressed status.
    let mut redelivered = text_message("EXT1", "hi there");
    redelivered.status = Some("sent".to_string());
    h.pipeline.on_messages(&h.live, true, vec![redelivered]).await;

    let messages = db::list_messages(&h.pool, DbKind::Sqlite, "s1", JID, 10, 0).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, "sent");

    // Unread unchanged, no duplicate conversation entries.
    let contact = db::get_contact(&h.pool, DbKind::Sqlite, "s1", JID).await.unwrap().unwrap();
    assert_eq!(contact.unread_count, 1);
    let customer = db::get_customer_by_phone(&h.pool, DbKind::Sqlite, "t1", "201001234567")
        .await
        .unwrap()
        .unwrap();
    let conversation =
        db::get_active_conversation(&h.pool, DbKind::Sqlite, "t1", &customer.id, "whatsapp")
            .await
            .unwrap()
            .unwrap();
    assert_eq!(conversation.unread_count, 1);
}

#[tokio::test]
async fn test_backfill_batches_are_ignored() {
    let h = harness().await;
    h.pipeline
        .on_messages(&h.live, false, vec![text_message("OLD1", "history")])
        .await;
    assert_eq!(db::count_messages(&h.pool, DbKind::Sqlite, "s1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_stale_events_are_dropped() {
    let h = harness().await;
    let mut stale = text_message("STALE1", "from the past");
    stale.timestamp = chrono::Utc::now().timestamp() - 3600;
    h.pipeline.on_messages(&h.live, true, vec![stale]).await;
    assert_eq!(db::count_messages(&h.pool, DbKind::Sqlite, "s1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_own_messages_do_not_increment_unread() {
    let h = harness().await;
    let mut own = text_message("MINE1", "sent from phone");
    own.from_me = true;
    own.push_name = Some("Me".to_string());
    h.pipeline.on_messages(&h.live, true, vec![own]).await;

    let messages = db::list_messages(&h.pool, DbKind::Sqlite, "s1", JID, 10, 0).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].direction, "outbound");
    let contact = db::get_contact(&h.pool, DbKind::Sqlite, "s1", JID).await.unwrap().unwrap();
    assert_eq!(contact.unread_count, 0);
    // The sender's own push name never becomes the contact name.
    assert!(contact.display_name.is_none());
}

#[tokio::test]
async fn test_status_broadcast_routes_to_status_store() {
    let h = harness().await;
    let status = RawMessage {
        id: "ST1".to_string(),
        chat: "status@broadcast".to_string(),
        participant: Some("0100 1234567@s.whatsapp.net".to_string()),
        from_me: false,
        push_name: None,
        timestamp: chrono::Utc::now().timestamp(),
        payload: json!({"conversation": "my status"}),
        status: None,
    };
    h.pipeline.on_messages(&h.live, true, vec![status]).await;

    assert_eq!(db::count_messages(&h.pool, DbKind::Sqlite, "s1").await.unwrap(), 0);
    let count: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM status_updates")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(count, 1);

    // Expired status rows get pruned.
    let future = chrono::Utc::now() + chrono::Duration::hours(25);
    let pruned = db::delete_expired_status_updates(&h.pool, DbKind::Sqlite, future)
        .await
        .unwrap();
    assert_eq!(pruned, 1);
}

#[tokio::test]
async fn test_media_message_downloads_to_disk() {
    let h = harness().await;
    let image = RawMessage {
        id: "IMG1".to_string(),
        chat: "0100 1234567@s.whatsapp.net".to_string(),
        participant: None,
        from_me: false,
        push_name: None,
        timestamp: chrono::Utc::now().timestamp(),
        payload: json!({"imageMessage": {"caption": "look at this"}}),
        status: None,
    };
    h.pipeline.on_messages(&h.live, true, vec![image]).await;

    let messages = db::list_messages(&h.pool, DbKind::Sqlite, "s1", JID, 10, 0).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].msg_type, "image");
    let media_url = messages[0].media_url.clone().unwrap();
    assert!(media_url.starts_with("/media/s1/"));

    let on_disk = h._media.path().join("s1").join("IMG1.jpg");
    assert_eq!(std::fs::read(on_disk).unwrap(), b"jpeg-bytes");
}

#[tokio::test]
async fn test_unknown_payload_skipped_entirely() {
    let h = harness().await;
    let unknown = RawMessage {
        id: "UNK1".to_string(),
        chat: "0100 1234567@s.whatsapp.net".to_string(),
        participant: None,
        from_me: false,
        push_name: None,
        timestamp: chrono::Utc::now().timestamp(),
        payload: json!({"futureMessageKind": {}}),
        status: None,
    };
    h.pipeline.on_messages(&h.live, true, vec![unknown]).await;
    assert_eq!(db::count_messages(&h.pool, DbKind::Sqlite, "s1").await.unwrap(), 0);
    assert!(db::get_contact(&h.pool, DbKind::Sqlite, "s1", JID).await.unwrap().is_none());
}

#[tokio::test]
async fn test_group_messages_skip_crm() {
    let h = harness().await;
    let group = RawMessage {
        id: "GRP1".to_string(),
        chat: "1203630416-1633@g.us".to_string(),
        participant: Some("0100 1234567@s.whatsapp.net".to_string()),
        from_me: false,
        push_name: Some("Sara".to_string()),
        timestamp: chrono::Utc::now().timestamp(),
        payload: json!({"conversation": "group hello"}),
        status: None,
    };
    h.pipeline.on_messages(&h.live, true, vec![group]).await;

    let messages = db::list_messages(&h.pool, DbKind::Sqlite, "s1", "1203630416-1633@g.us", 10, 0)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert!(
        db::get_customer_by_phone(&h.pool, DbKind::Sqlite, "t1", "201001234567")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_message_status_event_advances_and_emits() {
    let mut h = harness().await;
    let mut own = text_message("OUT1", "sent");
    own.from_me = true;
    h.pipeline.on_messages(&h.live, true, vec![own]).await;
    drain_events(&mut h.ws_rx);

    h.pipeline
        .on_message_status(&h.live, "OUT1".to_string(), JID.to_string(), "read".to_string())
        .await;
    let row = db::get_message_by_external_id(&h.pool, DbKind::Sqlite, "s1", "OUT1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "read");
    let events = drain_events(&mut h.ws_rx);
    assert!(events.iter().any(|e| e.event == "message:status"));

    // A late downgrade is ignored and emits nothing.
    h.pipeline
        .on_message_status(&h.live, "OUT1".to_string(), JID.to_string(), "sent".to_string())
        .await;
    let row = db::get_message_by_external_id(&h.pool, DbKind::Sqlite, "s1", "OUT1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "read");
    assert!(drain_events(&mut h.ws_rx).is_empty());
}

#[test]
fn test_extract_content_table() {
    assert_eq!(
        extract_content(&json!({"conversation": "x"})).unwrap().msg_type,
        "text"
    );
    assert_eq!(
        extract_content(&json!({"stickerMessage": {}})).unwrap().msg_type,
        "sticker"
    );
    assert_eq!(
        extract_content(&json!({"audioMessage": {}})).unwrap().msg_type,
        "audio"
    );
    assert!(extract_content(&json!({})).is_none());
}
