//! The uniform send API used by HTTP callers, the notification queue and
//! the auto-reply bridge. A send validates the session is connected
//! before anything else; nothing is persisted unless the transport
//! accepted the message and assigned it an id.

use crate::config::BridgeConfig;
use crate::db::{self, DbKind, MessageRow, StoreError};
use crate::identity;
use crate::session::SessionManager;
use crate::ws::{self, WsEvent};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::AnyPool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("session not found")]
    NoSession,

    #[error("session not connected")]
    NotConnected,

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundContent {
    Text {
        body: String,
    },
    Image {
        url: String,
        #[serde(default)]
        caption: Option<String>,
    },
    Video {
        url: String,
        #[serde(default)]
        caption: Option<String>,
    },
    Audio {
        url: String,
    },
    Document {
        url: String,
        #[serde(default)]
        filename: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        address: Option<String>,
    },
    ContactCard {
        display_name: String,
        vcard: String,
    },
    Reaction {
        message_id: String,
        emoji: String,
    },
    Buttons {
        text: String,
        buttons: Vec<ButtonSpec>,
    },
    List {
        title: String,
        text: String,
        button_text: String,
        sections: Value,
    },
    Product {
        product_id: String,
        title: String,
        #[serde(default)]
        body: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ButtonSpec {
    pub id: String,
    pub title: String,
}

impl OutboundContent {
    pub fn msg_type(&self) -> &'static str {
        match self {
            OutboundContent::Text { .. } => "text",
            OutboundContent::Image { .. } => "image",
            OutboundContent::Video { .. } => "video",
            OutboundContent::Audio { .. } => "audio",
            OutboundContent::Document { .. } => "document",
            OutboundContent::Location { .. } => "location",
            OutboundContent::ContactCard { .. } => "contact",
            OutboundContent::Reaction { .. } => "reaction",
            OutboundContent::Buttons { .. } => "buttons",
            OutboundContent::List { .. } => "list",
            OutboundContent::Product { .. } => "product",
        }
    }

    /// Human-readable summary persisted as the message content.
    pub fn summary(&self) -> Option<String> {
        match self {
            OutboundContent::Text { body } => Some(body.clone()),
            OutboundContent::Image { caption, .. } | OutboundContent::Video { caption, .. } => {
                caption.clone()
            }
            OutboundContent::Audio { .. } => None,
            OutboundContent::Document { filename, .. } => filename.clone(),
            OutboundContent::Location {
                latitude,
                longitude,
                name,
                address,
            } => Some(
                json!({
                    "latitude": latitude,
                    "longitude": longitude,
                    "name": name,
                    "address": address,
                })
                .to_string(),
            ),
            OutboundContent::ContactCard { display_name, .. } => Some(display_name.clone()),
            OutboundContent::Reaction { emoji, .. } => Some(emoji.clone()),
            OutboundContent::Buttons { text, .. } => Some(text.clone()),
            OutboundContent::List { text, .. } => Some(text.clone()),
            OutboundContent::Product { title, body, .. } => {
                Some(body.clone().unwrap_or_else(|| title.clone()))
            }
        }
    }

    /// The wire payload handed to the protocol connection.
    pub fn to_payload(&self, quoted_id: Option<&str>) -> Value {
        let mut payload = match self {
            OutboundContent::Text { body } => json!({"text": body}),
            OutboundContent::Image { url, caption } => {
                json!({"image": {"url": url}, "caption": caption})
            }
            OutboundContent::Video { url, caption } => {
                json!({"video": {"url": url}, "caption": caption})
            }
            OutboundContent::Audio { url } => json!({"audio": {"url": url}}),
            OutboundContent::Document { url, filename } => {
                json!({"document": {"url": url}, "filename": filename})
            }
            OutboundContent::Location {
                latitude,
                longitude,
                name,
                address,
            } => json!({
                "location": {
                    "latitude": latitude,
                    "longitude": longitude,
                    "name": name,
                    "address": address,
                }
            }),
            OutboundContent::ContactCard {
                display_name,
                vcard,
            } => json!({"contact": {"display_name": display_name, "vcard": vcard}}),
            OutboundContent::Reaction { message_id, emoji } => {
                json!({"reaction": {"message_id": message_id, "emoji": emoji}})
            }
            OutboundContent::Buttons { text, buttons } => {
                let buttons: Vec<Value> = buttons
                    .iter()
                    .map(|b| json!({"id": b.id, "title": b.title}))
                    .collect();
                json!({"buttons": {"text": text, "buttons": buttons}})
            }
            OutboundContent::List {
                title,
                text,
                button_text,
                sections,
            } => json!({
                "list": {
                    "title": title,
                    "text": text,
                    "button_text": button_text,
                    "sections": sections,
                }
            }),
            OutboundContent::Product {
                product_id,
                title,
                body,
            } => json!({"product": {"id": product_id, "title": title, "body": body}}),
        };
        if let Some(quoted) = quoted_id {
            payload["quoted_id"] = Value::String(quoted.to_string());
        }
        payload
    }

    fn typing_length(&self) -> usize {
        match self {
            OutboundContent::Text { body } => body.chars().count(),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub quoted_id: Option<String>,
    pub simulate_typing: bool,
    pub ai_generated: bool,
    pub ai_confidence: Option<f64>,
}

struct OutboundInner {
    pool: AnyPool,
    kind: DbKind,
    cfg: BridgeConfig,
    manager: SessionManager,
    ws_tx: broadcast::Sender<WsEvent>,
}

#[derive(Clone)]
pub struct OutboundService {
    inner: Arc<OutboundInner>,
}

impl OutboundService {
    pub fn new(
        pool: AnyPool,
        kind: DbKind,
        cfg: BridgeConfig,
        manager: SessionManager,
        ws_tx: broadcast::Sender<WsEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(OutboundInner {
                pool,
                kind,
                cfg,
                manager,
                ws_tx,
            }),
        }
    }

    pub async fn send(
        &self,
        session_id: &str,
        to: &str,
        content: OutboundContent,
        opts: SendOptions,
    ) -> Result<MessageRow, SendError> {
        let session = db::get_session(&self.inner.pool, self.inner.kind, session_id)
            .await?
            .ok_or(SendError::NoSession)?;
        if session.status != "connected" {
            return Err(SendError::NotConnected);
        }
        let live = self
            .inner
            .manager
            .current(session_id)
            .await
            .ok_or(SendError::NotConnected)?;

        let jid = identity::to_send_jid(to, &self.inner.cfg.default_country_code)
            .ok_or_else(|| SendError::InvalidRecipient(to.to_string()))?;

        if opts.simulate_typing {
            let chars = content.typing_length();
            if chars > 0 {
                let ms = (chars as u64 * self.inner.cfg.typing_ms_per_char)
                    .min(self.inner.cfg.typing_max_ms);
                if live.connection.send_presence(&jid, "composing").await.is_ok() {
                    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                    let _ = live.connection.send_presence(&jid, "paused").await;
                }
            }
        }

        let payload = content.to_payload(opts.quoted_id.as_deref());
        let external_id = live
            .connection
            .send(&jid, &payload)
            .await
            .map_err(|err| SendError::Transport(err.to_string()))?;

        let now = Utc::now();
        let record = MessageRow {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            external_id,
            jid: jid.clone(),
            direction: "outbound".to_string(),
            msg_type: content.msg_type().to_string(),
            content: content.summary(),
            media_url: None,
            quoted_id: opts.quoted_id.clone(),
            status: "sent".to_string(),
            from_me: true,
            ai_generated: opts.ai_generated,
            ai_confidence: opts.ai_confidence,
            timestamp: now,
            created_at: now,
        };
        db::upsert_message(&self.inner.pool, self.inner.kind, &record).await?;

        // Outgoing touch: no unread movement, no display-name overwrite
        // from our own profile.
        let phone = if identity::is_group_jid(&jid) {
            None
        } else {
            Some(identity::canonical_phone(
                &jid,
                &self.inner.cfg.default_country_code,
            ))
        };
        if let Err(err) = db::touch_contact(
            &self.inner.pool,
            self.inner.kind,
            session_id,
            &jid,
            phone.as_deref(),
            None,
            None,
            0,
            Some(now),
            now,
        )
        .await
        {
            debug!("contact touch failed for {session_id}/{jid}: {err}");
        }

        ws::emit(
            &self.inner.ws_tx,
            &session.tenant_id,
            "message:sent",
            json!({"session_id": session_id, "message": record}),
        );
        Ok(record)
    }

    pub async fn send_text(
        &self,
        session_id: &str,
        to: &str,
        body: &str,
        opts: SendOptions,
    ) -> Result<MessageRow, SendError> {
        self.send(
            session_id,
            to,
            OutboundContent::Text {
                body: body.to_string(),
            },
            opts,
        )
        .await
    }

    pub async fn send_reaction(
        &self,
        session_id: &str,
        to: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<MessageRow, SendError> {
        self.send(
            session_id,
            to,
            OutboundContent::Reaction {
                message_id: message_id.to_string(),
                emoji: emoji.to_string(),
            },
            SendOptions::default(),
        )
        .await
    }

    pub async fn send_buttons(
        &self,
        session_id: &str,
        to: &str,
        text: &str,
        buttons: Vec<ButtonSpec>,
        opts: SendOptions,
    ) -> Result<MessageRow, SendError> {
        self.send(
            session_id,
            to,
            OutboundContent::Buttons {
                text: text.to_string(),
                buttons,
            },
            opts,
        )
        .await
    }
}
