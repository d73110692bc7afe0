use async_trait::async_trait;
use chatlink::config::BridgeConfig;
use chatlink::credentials::CredentialStore;
use chatlink::db::{self, DbKind};
use chatlink::protocol::{ProtocolClient, ProtocolConnection, ProtocolEvent};
use chatlink::session::{SessionManager, SessionStatus};
use serde_json::{json, Value};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

#[derive(Default)]
struct MockConnection {
    sent: Mutex<Vec<(String, Value)>>,
    logouts: AtomicUsize,
}

#[async_trait]
impl ProtocolConnection for MockConnection {
    async fn send(&self, to: &str, payload: &Value) -> anyhow::Result<String> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), payload.clone()));
        Ok(format!("SRV-{}", sent.len()))
    }

    async fn download_media(&self, _message_id: &str) -> anyhow::Result<bytes::Bytes> {
        Ok(bytes::Bytes::from_static(b"media-bytes"))
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
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockClient {
    connects: AtomicUsize,
    handles: Mutex<Vec<(String, mpsc::Sender<ProtocolEvent>, Arc<MockConnection>)>>,
}

impl MockClient {
    fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn latest_tx(&self, session_id: &str) -> mpsc::Sender<ProtocolEvent> {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _, _)| id == session_id)
            .map(|(_, tx, _)| tx.clone())
            .expect("no connection for session")
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    async fn connect(
        &self,
        session_id: &str,
        _credential: Option<Value>,
    ) -> anyhow::Result<(Arc<dyn ProtocolConnection>, mpsc::Receiver<ProtocolEvent>)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(MockConnection::default());
        self.handles
            .lock()
            .unwrap()
            .push((session_id.to_string(), tx, conn.clone()));
        Ok((conn, rx))
    }
}

async fn test_pool() -> AnyPool {
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::init_db(&pool, DbKind::Sqlite).await.unwrap();
    pool
}

fn fast_bridge_config() -> BridgeConfig {
    BridgeConfig {
        reconnect_delay_seconds: 0,
        ..BridgeConfig::default()
    }
}

struct Harness {
    pool: AnyPool,
    client: Arc<MockClient>,
    creds: CredentialStore,
    manager: SessionManager,
}

async fn harness() -> Harness {
    let pool = test_pool().await;
    let client = Arc::new(MockClient::default());
    let creds = CredentialStore::new(pool.clone(), DbKind::Sqlite, Duration::from_millis(20));
    let (ws_tx, _) = broadcast::channel(64);
    let manager = SessionManager::new(
        pool.clone(),
        DbKind::Sqlite,
        fast_bridge_config(),
        client.clone(),
        creds.clone(),
        ws_tx,
    );
    Harness {
        pool,
        client,
        creds,
        manager,
    }
}

async fn status_of(pool: &AnyPool, id: &str) -> String {
    db::get_session(pool, DbKind::Sqlite, id)
        .await
        .unwrap()
        .unwrap()
        .status
}

#[test]
fn test_status_parse_roundtrip() {
    assert_eq!(SessionStatus::parse("qr_pending"), Some(SessionStatus::QrPending));
    assert_eq!(SessionStatus::parse("logged_out"), Some(SessionStatus::LoggedOut));
    assert_eq!(SessionStatus::parse("nonsense"), None);
    assert!(SessionStatus::LoggedOut.is_terminal());
}

#[tokio::test]
async fn test_duplicate_create_is_noop() {
    let h = harness().await;
    h.manager.create("s1", "t1").await.unwrap();
    h.manager.create("s1", "t1").await.unwrap();
    h.manager.create("s1", "t1").await.unwrap();
    assert_eq!(h.client.connect_count(), 1);
    assert!(h.manager.current("s1").await.is_some());
}

#[tokio::test]
async fn test_open_event_marks_connected_and_flushes_creds() {
    let h = harness().await;
    h.manager.create("s1", "t1").await.unwrap();
    let tx = h.client.latest_tx("s1");
    tx.send(ProtocolEvent::Opened {
        phone: "201001234567:4@s.whatsapp.net".to_string(),
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let row = db::get_session(&h.pool, DbKind::Sqlite, "s1").await.unwrap().unwrap();
    assert_eq!(row.status, "connected");
    assert_eq!(row.phone_number.as_deref(), Some("201001234567"));
    assert!(row.last_connected_at.is_some());
    // The once-per-login immediate credential flush.
    assert_eq!(h.creds.write_count(), 1);
}

#[tokio::test]
async fn test_qr_event_moves_to_qr_pending() {
    let h = harness().await;
    h.manager.create("s1", "t1").await.unwrap();
    let tx = h.client.latest_tx("s1");
    tx.send(ProtocolEvent::ConnectionUpdate {
        qr: Some("QR-BLOB".to_string()),
        pairing_code: None,
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(status_of(&h.pool, "s1").await, "qr_pending");
}

#[tokio::test]
async fn test_plain_disconnect_schedules_reconnect() {
    let h = harness().await;
    h.manager.create("s1", "t1").await.unwrap();
    let tx = h.client.latest_tx("s1");
    tx.send(ProtocolEvent::Closed {
        code: Some(500),
        message: "stream errored".to_string(),
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    // Reconnect delay is zero in tests: a second connect must have happened.
    assert!(h.client.connect_count() >= 2);
}

#[tokio::test]
async fn test_logged_out_close_wipes_creds_and_stops() {
    let h = harness().await;
    db::save_credentials(&h.pool, DbKind::Sqlite, "s1", "{}", chrono::Utc::now())
        .await
        .unwrap();
    h.manager.create("s1", "t1").await.unwrap();
    let tx = h.client.latest_tx("s1");
    tx.send(ProtocolEvent::Closed {
        code: Some(401),
        message: "logged out".to_string(),
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(status_of(&h.pool, "s1").await, "logged_out");
    assert!(db::load_credentials(&h.pool, DbKind::Sqlite, "s1").await.unwrap().is_none());
    assert!(h.manager.current("s1").await.is_none());
    assert_eq!(h.client.connect_count(), 1);
}

#[tokio::test]
async fn test_corruption_close_force_deletes_without_reconnect() {
    let h = harness().await;
    db::save_credentials(&h.pool, DbKind::Sqlite, "s1", "{}", chrono::Utc::now())
        .await
        .unwrap();
    h.manager.create("s1", "t1").await.unwrap();
    let tx = h.client.latest_tx("s1");
    tx.send(ProtocolEvent::Closed {
        code: Some(500),
        message: "Bad MAC verification failed".to_string(),
    })
    .await
    .unwrap();
    // Well past the (zero) reconnect delay: no new connection attempt may
    // appear, or the corrupt-reconnect loop is back.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(status_of(&h.pool, "s1").await, "logged_out");
    assert!(db::load_credentials(&h.pool, DbKind::Sqlite, "s1").await.unwrap().is_none());
    assert!(h.manager.current("s1").await.is_none());
    assert_eq!(h.client.connect_count(), 1);
}

#[tokio::test]
async fn test_stale_events_from_superseded_connection_are_discarded() {
    let h = harness().await;
    h.manager.create("s1", "t1").await.unwrap();
    let old_tx = h.client.latest_tx("s1");

    h.manager.close("s1").await.unwrap();
    assert_eq!(status_of(&h.pool, "s1").await, "disconnected");
    assert!(h.manager.current("s1").await.is_none());

    // The superseded connection reports an open: it must not mutate state.
    old_tx
        .send(ProtocolEvent::Opened {
            phone: "201001234567@s.whatsapp.net".to_string(),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(status_of(&h.pool, "s1").await, "disconnected");
}

#[tokio::test]
async fn test_manual_close_suppresses_reconnect() {
    let h = harness().await;
    h.manager.create("s1", "t1").await.unwrap();
    h.manager.close("s1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.client.connect_count(), 1);
    assert_eq!(status_of(&h.pool, "s1").await, "disconnected");
}

#[tokio::test]
async fn test_delete_erases_store_records() {
    let h = harness().await;
    h.manager.create("s1", "t1").await.unwrap();
    h.manager.delete("s1").await.unwrap();
    assert!(db::get_session(&h.pool, DbKind::Sqlite, "s1").await.unwrap().is_none());
    assert!(db::load_credentials(&h.pool, DbKind::Sqlite, "s1").await.unwrap().is_none());
    assert!(h.manager.current("s1").await.is_none());
}

#[tokio::test]
async fn test_restore_all_reopens_resumable_sessions() {
    let h = harness().await;
    let now = chrono::Utc::now();
    db::ensure_session(&h.pool, DbKind::Sqlite, "a", "t1", now).await.unwrap();
    db::set_session_connected(&h.pool, DbKind::Sqlite, "a", "201001111111", now).await.unwrap();
    db::ensure_session(&h.pool, DbKind::Sqlite, "b", "t1", now).await.unwrap();
    db::set_session_disconnected(&h.pool, DbKind::Sqlite, "b", "disconnected", now).await.unwrap();
    db::ensure_session(&h.pool, DbKind::Sqlite, "c", "t1", now).await.unwrap();
    db::set_session_disconnected(&h.pool, DbKind::Sqlite, "c", "logged_out", now).await.unwrap();

    let restored = h.manager.restore_all().await.unwrap();
    assert_eq!(restored, 2);
    assert_eq!(h.client.connect_count(), 2);
    assert!(h.manager.current("a").await.is_some());
    assert!(h.manager.current("b").await.is_some());
    assert!(h.manager.current("c").await.is_none());
}

#[tokio::test]
async fn test_connected_session_prefers_default() {
    let h = harness().await;
    let now = chrono::Utc::now();
    h.manager.create("s1", "t1").await.unwrap();
    h.manager.create("s2", "t1").await.unwrap();
    db::set_session_connected(&h.pool, DbKind::Sqlite, "s1", "201001111111", now).await.unwrap();
    db::set_session_connected(&h.pool, DbKind::Sqlite, "s2", "201002222222", now).await.unwrap();

    let live = h.manager.connected_session("t1", Some("s2")).await.unwrap();
    assert_eq!(live.session_id, "s2");

    // Unknown preferred falls back to any connected session.
    let live = h.manager.connected_session("t1", Some("missing")).await.unwrap();
    assert!(live.session_id == "s1" || live.session_id == "s2");

    assert!(h.manager.connected_session("t2", None).await.is_none());
}
