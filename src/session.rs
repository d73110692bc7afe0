//! Session lifecycle management.
//!
//! One `SessionManager` instance owns the registry of live protocol
//! connections for the whole process. Each session id maps to at most one
//! current `LiveConnection`; every event handler first checks that the
//! connection that produced the event is still the registered one, so a
//! superseded connection from an earlier reconnect attempt can never
//! mutate shared state.

use crate::config::BridgeConfig;
use crate::credentials::CredentialStore;
use crate::db::{self, DbKind, StoreResult};
use crate::identity;
use crate::protocol::{
    ContactUpdate, DisconnectReason, ProtocolClient, ProtocolEvent, RawMessage,
};
use crate::ws::{self, WsEvent};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::AnyPool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    QrPending,
    Connected,
    Disconnected,
    Reconnecting,
    LoggedOut,
    Deleted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::QrPending => "qr_pending",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::LoggedOut => "logged_out",
            SessionStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "connecting" => Some(SessionStatus::Connecting),
            "qr_pending" => Some(SessionStatus::QrPending),
            "connected" => Some(SessionStatus::Connected),
            "disconnected" => Some(SessionStatus::Disconnected),
            "reconnecting" => Some(SessionStatus::Reconnecting),
            "logged_out" => Some(SessionStatus::LoggedOut),
            "deleted" => Some(SessionStatus::Deleted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::LoggedOut | SessionStatus::Deleted)
    }

    /// The legal edge set of the lifecycle state machine.
    pub fn can_transition(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (_, Deleted) => true,
            (Connecting, QrPending) => true,
            (QrPending, Connecting) => true,
            (Connecting, Connected) => true,
            (QrPending, Connected) => true,
            (Connecting, Disconnected) | (QrPending, Disconnected) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Reconnecting) => true,
            (Reconnecting, Connecting) => true,
            (Connecting, LoggedOut) | (QrPending, LoggedOut) => true,
            (Connected, LoggedOut) | (Disconnected, LoggedOut) => true,
            _ => false,
        }
    }
}

/// The registered connection for a session: the protocol handle plus the
/// process-unique sequence number the stale-event guard compares.
pub struct LiveConnection {
    pub session_id: String,
    pub tenant_id: String,
    pub conn_seq: u64,
    pub connection: Arc<dyn crate::protocol::ProtocolConnection>,
}

/// Downstream consumer of message-class events; wired in after
/// construction to break the manager/pipeline cycle.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_messages(&self, live: &LiveConnection, live_batch: bool, items: Vec<RawMessage>);
    async fn on_message_status(&self, live: &LiveConnection, id: String, chat: String, status: String);
    async fn on_contacts(&self, live: &LiveConnection, items: Vec<ContactUpdate>);
}

struct ManagerInner {
    pool: AnyPool,
    kind: DbKind,
    cfg: BridgeConfig,
    client: Arc<dyn ProtocolClient>,
    creds: CredentialStore,
    registry: Mutex<HashMap<String, Arc<LiveConnection>>>,
    manually_closed: Mutex<HashSet<String>>,
    seq: AtomicU64,
    ws_tx: broadcast::Sender<WsEvent>,
    handler: OnceLock<Arc<dyn InboundHandler>>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        pool: AnyPool,
        kind: DbKind,
        cfg: BridgeConfig,
        client: Arc<dyn ProtocolClient>,
        creds: CredentialStore,
        ws_tx: broadcast::Sender<WsEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                pool,
                kind,
                cfg,
                client,
                creds,
                registry: Mutex::new(HashMap::new()),
                manually_closed: Mutex::new(HashSet::new()),
                seq: AtomicU64::new(0),
                ws_tx,
                handler: OnceLock::new(),
            }),
        }
    }

    pub fn set_inbound_handler(&self, handler: Arc<dyn InboundHandler>) {
        let _ = self.inner.handler.set(handler);
    }

    pub async fn current(&self, session_id: &str) -> Option<Arc<LiveConnection>> {
        self.inner.registry.lock().await.get(session_id).cloned()
    }

    /// The stale-event guard: true only while `live` is the registered
    /// connection for its session id.
    pub async fn is_current(&self, live: &LiveConnection) -> bool {
        self.inner
            .registry
            .lock()
            .await
            .get(&live.session_id)
            .map(|current| current.conn_seq == live.conn_seq)
            .unwrap_or(false)
    }

    /// Picks a connected session for a tenant: the preferred one when it
    /// is live and connected, otherwise any connected session.
    pub async fn connected_session(
        &self,
        tenant_id: &str,
        preferred: Option<&str>,
    ) -> Option<Arc<LiveConnection>> {
        let candidates: Vec<Arc<LiveConnection>> = {
            let registry = self.inner.registry.lock().await;
            registry
                .values()
                .filter(|live| live.tenant_id == tenant_id)
                .cloned()
                .collect()
        };
        let mut fallback = None;
        for live in candidates {
            let connected = db::get_session(&self.inner.pool, self.inner.kind, &live.session_id)
                .await
                .ok()
                .flatten()
                .map(|row| row.status == "connected")
                .unwrap_or(false);
            if !connected {
                continue;
            }
            if preferred == Some(live.session_id.as_str()) {
                return Some(live);
            }
            if fallback.is_none() {
                fallback = Some(live);
            }
        }
        fallback
    }

    /// Opens a connection for the session and registers it. A session id
    /// already present in the registry makes this a no-op, which is what
    /// prevents concurrent duplicate connections.
    pub async fn create(&self, session_id: &str, tenant_id: &str) -> anyhow::Result<()> {
        {
            let registry = self.inner.registry.lock().await;
            if registry.contains_key(session_id) {
                return Ok(());
            }
        }
        self.inner.manually_closed.lock().await.remove(session_id);

        let now = Utc::now();
        db::ensure_session(&self.inner.pool, self.inner.kind, session_id, tenant_id, now).await?;
        db::set_session_status(
            &self.inner.pool,
            self.inner.kind,
            session_id,
            SessionStatus::Connecting.as_str(),
            now,
        )
        .await?;

        let state = self.inner.creds.load(session_id).await?;
        let (connection, events) = match self
            .inner
            .client
            .connect(session_id, state.credential.clone())
            .await
        {
            Ok(pair) => pair,
            Err(err) => {
                error!("connect failed for {session_id}: {err:#}");
                let _ = db::set_session_disconnected(
                    &self.inner.pool,
                    self.inner.kind,
                    session_id,
                    SessionStatus::Disconnected.as_str(),
                    Utc::now(),
                )
                .await;
                self.schedule_reconnect(session_id, tenant_id);
                return Err(err);
            }
        };

        let conn_seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let live = Arc::new(LiveConnection {
            session_id: session_id.to_string(),
            tenant_id: tenant_id.to_string(),
            conn_seq,
            connection,
        });

        {
            let mut registry = self.inner.registry.lock().await;
            if registry.contains_key(session_id) {
                // Lost a create race; the registered connection wins.
                return Ok(());
            }
            registry.insert(session_id.to_string(), live.clone());
        }

        info!("session {session_id} connecting (seq {conn_seq})");
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_events(live, events).await;
        });
        Ok(())
    }

    /// Best-effort logout, immediate deregistration, status `disconnected`.
    pub async fn close(&self, session_id: &str) -> anyhow::Result<()> {
        self.inner
            .manually_closed
            .lock()
            .await
            .insert(session_id.to_string());
        let live = self.inner.registry.lock().await.remove(session_id);
        if let Some(live) = live {
            if let Err(err) = live.connection.logout().await {
                debug!("logout for {session_id} failed: {err:#}");
            }
        }
        db::set_session_disconnected(
            &self.inner.pool,
            self.inner.kind,
            session_id,
            SessionStatus::Disconnected.as_str(),
            Utc::now(),
        )
        .await?;
        Ok(())
    }

    /// Close plus permanent erasure of credentials and store records.
    pub async fn delete(&self, session_id: &str) -> anyhow::Result<()> {
        let tenant_id = db::get_session(&self.inner.pool, self.inner.kind, session_id)
            .await?
            .map(|row| row.tenant_id);
        self.close(session_id).await?;
        self.inner.creds.delete(session_id).await;
        db::delete_session_data(&self.inner.pool, self.inner.kind, session_id).await?;
        if let Some(tenant_id) = tenant_id {
            ws::emit(
                &self.inner.ws_tx,
                &tenant_id,
                "connection",
                json!({"session_id": session_id, "status": SessionStatus::Deleted.as_str()}),
            );
        }
        info!("session {session_id} deleted");
        Ok(())
    }

    /// Reopens every store-persisted session that was connected or
    /// disconnected when the process last stopped.
    pub async fn restore_all(&self) -> StoreResult<usize> {
        let rows = db::sessions_to_restore(&self.inner.pool, self.inner.kind).await?;
        let total = rows.len();
        let creates = rows.iter().map(|row| self.create(&row.id, &row.tenant_id));
        let results = futures::future::join_all(creates).await;
        let restored = results.iter().filter(|r| r.is_ok()).count();
        if total > 0 {
            info!("restored {restored}/{total} sessions");
        }
        Ok(restored)
    }

    /// Atomic unread reset plus a best-effort read receipt at the
    /// protocol level.
    pub async fn mark_read(&self, session_id: &str, jid: &str) -> StoreResult<()> {
        db::reset_contact_unread(&self.inner.pool, self.inner.kind, session_id, jid, Utc::now())
            .await?;
        if let Some(live) = self.current(session_id).await {
            if let Err(err) = live.connection.chat_modify(jid, "read").await {
                debug!("read receipt for {session_id}/{jid} failed: {err:#}");
            }
        }
        Ok(())
    }

    async fn run_events(
        &self,
        live: Arc<LiveConnection>,
        mut events: tokio::sync::mpsc::Receiver<ProtocolEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if !self.is_current(&live).await {
                debug!(
                    "discarding event from superseded connection {} (seq {})",
                    live.session_id, live.conn_seq
                );
                continue;
            }
            match event {
                ProtocolEvent::ConnectionUpdate { qr, pairing_code } => {
                    self.on_qr(&live, qr, pairing_code).await;
                }
                ProtocolEvent::Opened { phone } => {
                    self.on_open(&live, phone).await;
                }
                ProtocolEvent::Closed { code, message } => {
                    self.on_close(&live, code, message).await;
                    break;
                }
                ProtocolEvent::CredsUpdate { credential, keys } => {
                    self.inner
                        .creds
                        .apply_update(&live.session_id, credential, keys)
                        .await;
                }
                ProtocolEvent::Messages { live: live_batch, items } => {
                    if let Some(handler) = self.inner.handler.get() {
                        handler.on_messages(&live, live_batch, items).await;
                    }
                }
                ProtocolEvent::MessageStatus { id, chat, status } => {
                    if let Some(handler) = self.inner.handler.get() {
                        handler.on_message_status(&live, id, chat, status).await;
                    }
                }
                ProtocolEvent::Presence { chat, state } => {
                    ws::emit(
                        &self.inner.ws_tx,
                        &live.tenant_id,
                        "presence",
                        json!({"session_id": live.session_id, "chat": chat, "state": state}),
                    );
                }
                ProtocolEvent::CallUpdate { from, status } => {
                    ws::emit(
                        &self.inner.ws_tx,
                        &live.tenant_id,
                        "call:update",
                        json!({"session_id": live.session_id, "from": from, "status": status}),
                    );
                }
                ProtocolEvent::ContactsUpdate { items } => {
                    if let Some(handler) = self.inner.handler.get() {
                        handler.on_contacts(&live, items).await;
                    }
                }
                ProtocolEvent::GroupsUpdate { items } => {
                    self.on_groups_update(&live, items).await;
                }
            }
        }
        debug!("event loop ended for {} (seq {})", live.session_id, live.conn_seq);
    }

    async fn on_qr(&self, live: &LiveConnection, qr: Option<String>, pairing_code: Option<String>) {
        if qr.is_none() && pairing_code.is_none() {
            return;
        }
        info!("session {} waiting for pairing", live.session_id);
        let _ = db::set_session_status(
            &self.inner.pool,
            self.inner.kind,
            &live.session_id,
            SessionStatus::QrPending.as_str(),
            Utc::now(),
        )
        .await;
        ws::emit(
            &self.inner.ws_tx,
            &live.tenant_id,
            "qr",
            json!({"session_id": live.session_id, "qr": qr, "pairing_code": pairing_code}),
        );
    }

    async fn on_open(&self, live: &LiveConnection, phone: String) {
        let normalized = identity::canonical_phone(&phone, &self.inner.cfg.default_country_code);
        info!("session {} connected as {}", live.session_id, normalized);
        let _ = db::set_session_connected(
            &self.inner.pool,
            self.inner.kind,
            &live.session_id,
            &normalized,
            Utc::now(),
        )
        .await;

        // The one unconditional flush per login event.
        self.inner.creds.save(&live.session_id).await;

        ws::emit(
            &self.inner.ws_tx,
            &live.tenant_id,
            "connection",
            json!({
                "session_id": live.session_id,
                "status": SessionStatus::Connected.as_str(),
                "phone": normalized,
            }),
        );

        // Best-effort profile sync; failure never affects the session.
        let connection = live.connection.clone();
        let pool = self.inner.pool.clone();
        let kind = self.inner.kind;
        let session_id = live.session_id.clone();
        tokio::spawn(async move {
            match connection.profile_picture("me").await {
                Ok(Some(url)) => {
                    let _ = db::set_session_avatar(&pool, kind, &session_id, &url, Utc::now()).await;
                }
                Ok(None) => {}
                Err(err) => debug!("profile sync for {session_id} failed: {err:#}"),
            }
        });
    }

    async fn on_close(&self, live: &LiveConnection, code: Option<u16>, message: String) {
        let reason = DisconnectReason::classify(code, &message);
        self.remove_if_current(live).await;
        let now = Utc::now();

        if reason.is_logged_out() {
            info!("session {} logged out, wiping credentials", live.session_id);
            self.inner.creds.delete(&live.session_id).await;
            let _ = db::set_session_disconnected(
                &self.inner.pool,
                self.inner.kind,
                &live.session_id,
                SessionStatus::LoggedOut.as_str(),
                now,
            )
            .await;
            ws::emit(
                &self.inner.ws_tx,
                &live.tenant_id,
                "connection",
                json!({"session_id": live.session_id, "status": SessionStatus::LoggedOut.as_str()}),
            );
            return;
        }

        if reason.is_auth_corruption() {
            // Fatal for this session only: reconnecting with corrupt key
            // material would loop forever, so force a logout instead.
            warn!(
                "credential corruption on session {}, forcing logout: {}",
                live.session_id, message
            );
            self.inner.creds.delete(&live.session_id).await;
            let _ = db::set_session_disconnected(
                &self.inner.pool,
                self.inner.kind,
                &live.session_id,
                SessionStatus::LoggedOut.as_str(),
                now,
            )
            .await;
            ws::emit(
                &self.inner.ws_tx,
                &live.tenant_id,
                "connection",
                json!({"session_id": live.session_id, "status": SessionStatus::LoggedOut.as_str()}),
            );
            return;
        }

        info!(
            "session {} disconnected ({:?}), reconnect in {}s",
            live.session_id, reason, self.inner.cfg.reconnect_delay_seconds
        );
        let _ = db::set_session_disconnected(
            &self.inner.pool,
            self.inner.kind,
            &live.session_id,
            SessionStatus::Disconnected.as_str(),
            now,
        )
        .await;
        ws::emit(
            &self.inner.ws_tx,
            &live.tenant_id,
            "connection",
            json!({"session_id": live.session_id, "status": SessionStatus::Disconnected.as_str()}),
        );
        self.schedule_reconnect(&live.session_id, &live.tenant_id);
    }

    async fn on_groups_update(&self, live: &LiveConnection, items: Vec<serde_json::Value>) {
        for item in items {
            let Some(jid) = item.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let subject = item.get("subject").and_then(|v| v.as_str());
            if subject.is_none() {
                continue;
            }
            let jid = identity::canonical_jid(jid, &self.inner.cfg.default_country_code);
            // Roster bookkeeping only: no unread movement.
            let _ = db::touch_contact(
                &self.inner.pool,
                self.inner.kind,
                &live.session_id,
                &jid,
                None,
                subject,
                None,
                0,
                None,
                Utc::now(),
            )
            .await;
        }
    }

    async fn remove_if_current(&self, live: &LiveConnection) {
        let mut registry = self.inner.registry.lock().await;
        let is_current = registry
            .get(&live.session_id)
            .map(|current| current.conn_seq == live.conn_seq)
            .unwrap_or(false);
        if is_current {
            registry.remove(&live.session_id);
        }
    }

    fn schedule_reconnect(&self, session_id: &str, tenant_id: &str) {
        let manager = self.clone();
        let session_id = session_id.to_string();
        let tenant_id = tenant_id.to_string();
        let delay = std::time::Duration::from_secs(self.inner.cfg.reconnect_delay_seconds);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if manager.current(&session_id).await.is_some() {
                return;
            }
            if manager.inner.manually_closed.lock().await.contains(&session_id) {
                return;
            }
            let _ = db::set_session_status(
                &manager.inner.pool,
                manager.inner.kind,
                &session_id,
                SessionStatus::Reconnecting.as_str(),
                Utc::now(),
            )
            .await;
            if let Err(err) = manager.create(&session_id, &tenant_id).await {
                error!("reconnect failed for {session_id}: {err:#}");
            }
        });
    }
}
