//! Inbound message normalization and persistence.
//!
//! Protocol batches arrive at least once; persistence is an upsert keyed
//! by `(session_id, external message id)`, so a redelivered event only
//! rewrites mutable fields of the row it already created. Only live
//! batches are processed, and within them events older than the
//! staleness window are dropped to keep reconnects from replaying
//! history.

use crate::ai::AiBridge;
use crate::config::BridgeConfig;
use crate::crm::CrmBridge;
use crate::db::{self, DbKind, MessageRow, StatusUpdateRow};
use crate::identity;
use crate::protocol::{ContactUpdate, RawMessage};
use crate::session::{InboundHandler, LiveConnection};
use crate::ws::{self, WsEvent};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use sqlx::AnyPool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

const STATUS_EXPIRY_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub msg_type: &'static str,
    pub content: Option<String>,
    pub quoted_id: Option<String>,
    pub media_ext: Option<&'static str>,
}

/// Type-dispatched content extraction. Unrecognized payloads return
/// `None` and the event is skipped entirely.
pub fn extract_content(payload: &Value) -> Option<Extracted> {
    if let Some(text) = payload.get("conversation").and_then(|v| v.as_str()) {
        return Some(Extracted {
            msg_type: "text",
            content: Some(text.to_string()),
            quoted_id: None,
            media_ext: None,
        });
    }
    if let Some(extended) = payload.get("extendedTextMessage") {
        return Some(Extracted {
            msg_type: "text",
            content: extended
                .get("text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            quoted_id: extended
                .get("contextInfo")
                .and_then(|v| v.get("stanzaId"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            media_ext: None,
        });
    }
    if let Some(image) = payload.get("imageMessage") {
        return Some(Extracted {
            msg_type: "image",
            content: image
                .get("caption")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            quoted_id: None,
            media_ext: Some("jpg"),
        });
    }
    if let Some(video) = payload.get("videoMessage") {
        return Some(Extracted {
            msg_type: "video",
            content: video
                .get("caption")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            quoted_id: None,
            media_ext: Some("mp4"),
        });
    }
    if payload.get("audioMessage").is_some() {
        return Some(Extracted {
            msg_type: "audio",
            content: None,
            quoted_id: None,
            media_ext: Some("ogg"),
        });
    }
    if let Some(document) = payload.get("documentMessage") {
        return Some(Extracted {
            msg_type: "document",
            content: document
                .get("fileName")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            quoted_id: None,
            media_ext: Some("bin"),
        });
    }
    if payload.get("stickerMessage").is_some() {
        return Some(Extracted {
            msg_type: "sticker",
            content: None,
            quoted_id: None,
            media_ext: Some("webp"),
        });
    }
    if let Some(location) = payload.get("locationMessage") {
        let serialized = json!({
            "latitude": location.get("degreesLatitude"),
            "longitude": location.get("degreesLongitude"),
            "name": location.get("name"),
            "address": location.get("address"),
        });
        return Some(Extracted {
            msg_type: "location",
            content: Some(serialized.to_string()),
            quoted_id: None,
            media_ext: None,
        });
    }
    if let Some(contact) = payload.get("contactMessage") {
        let serialized = json!({
            "display_name": contact.get("displayName"),
            "vcard": contact.get("vcard"),
        });
        return Some(Extracted {
            msg_type: "contact",
            content: Some(serialized.to_string()),
            quoted_id: None,
            media_ext: None,
        });
    }
    if let Some(reaction) = payload.get("reactionMessage") {
        return Some(Extracted {
            msg_type: "reaction",
            content: reaction
                .get("text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            quoted_id: reaction
                .get("key")
                .and_then(|v| v.get("id"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            media_ext: None,
        });
    }
    if let Some(buttons) = payload.get("buttonsResponseMessage") {
        return Some(Extracted {
            msg_type: "buttons_reply",
            content: buttons
                .get("selectedDisplayText")
                .or_else(|| buttons.get("selectedButtonId"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            quoted_id: None,
            media_ext: None,
        });
    }
    if let Some(list) = payload.get("listResponseMessage") {
        return Some(Extracted {
            msg_type: "list_reply",
            content: list
                .get("singleSelectReply")
                .and_then(|v| v.get("selectedRowId"))
                .or_else(|| list.get("title"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            quoted_id: None,
            media_ext: None,
        });
    }
    if let Some(template) = payload.get("templateButtonReplyMessage") {
        return Some(Extracted {
            msg_type: "template_reply",
            content: template
                .get("selectedDisplayText")
                .or_else(|| template.get("selectedId"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            quoted_id: None,
            media_ext: None,
        });
    }
    if let Some(template) = payload.get("templateMessage") {
        return Some(Extracted {
            msg_type: "template",
            content: template
                .get("hydratedTemplate")
                .and_then(|v| v.get("hydratedContentText"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            quoted_id: None,
            media_ext: None,
        });
    }
    if let Some(product) = payload.get("productMessage") {
        return Some(Extracted {
            msg_type: "product",
            content: product
                .get("product")
                .and_then(|v| v.get("title"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            quoted_id: None,
            media_ext: None,
        });
    }
    None
}

fn event_timestamp(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn sanitize_file_stem(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

struct PipelineInner {
    pool: AnyPool,
    kind: DbKind,
    cfg: BridgeConfig,
    media_dir: PathBuf,
    media_base_url: String,
    ws_tx: broadcast::Sender<WsEvent>,
    crm: CrmBridge,
    ai: AiBridge,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn new(
        pool: AnyPool,
        kind: DbKind,
        cfg: BridgeConfig,
        media_dir: PathBuf,
        media_base_url: String,
        ws_tx: broadcast::Sender<WsEvent>,
        crm: CrmBridge,
        ai: AiBridge,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                pool,
                kind,
                cfg,
                media_dir,
                media_base_url,
                ws_tx,
                crm,
                ai,
            }),
        }
    }

    async fn download_media(
        &self,
        live: &LiveConnection,
        message_id: &str,
        ext: &str,
    ) -> Option<String> {
        let bytes = match live.connection.download_media(message_id).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    "media download failed for {}/{}: {err:#}",
                    live.session_id, message_id
                );
                return None;
            }
        };
        let dir = self.inner.media_dir.join(&live.session_id);
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            warn!("media dir create failed: {err}");
            return None;
        }
        let filename = format!("{}.{}", sanitize_file_stem(message_id), ext);
        let path = dir.join(&filename);
        if let Err(err) = tokio::fs::write(&path, &bytes).await {
            warn!("media write failed for {}: {err}", path.display());
            return None;
        }
        Some(format!(
            "{}/{}/{}",
            self.inner.media_base_url, live.session_id, filename
        ))
    }

    async fn record_status_update(&self, live: &LiveConnection, raw: &RawMessage) {
        let Some(extracted) = extract_content(&raw.payload) else {
            return;
        };
        let mut media_url = None;
        if let Some(ext) = extracted.media_ext {
            media_url = self.download_media(live, &raw.id, ext).await;
        }
        let now = Utc::now();
        let sender = raw
            .participant
            .as_deref()
            .map(|p| identity::canonical_jid(p, &self.inner.cfg.default_country_code))
            .unwrap_or_else(|| identity::STATUS_BROADCAST.to_string());
        let row = StatusUpdateRow {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: live.session_id.clone(),
            jid: sender,
            msg_type: extracted.msg_type.to_string(),
            content: extracted.content,
            media_url,
            expires_at: now + Duration::hours(STATUS_EXPIRY_HOURS),
            created_at: now,
        };
        if let Err(err) = db::insert_status_update(&self.inner.pool, self.inner.kind, &row).await {
            warn!("status update insert failed: {err}");
        }
    }

    async fn ingest_one(&self, live: &LiveConnection, session: &db::SessionRow, raw: RawMessage) {
        if identity::is_status_broadcast(&raw.chat) {
            self.record_status_update(live, &raw).await;
            return;
        }
        let Some(extracted) = extract_content(&raw.payload) else {
            return;
        };
        let cc = &self.inner.cfg.default_country_code;
        let jid = identity::resolve_chat_jid(&raw.chat, raw.participant.as_deref(), raw.from_me, cc);
        let is_group = identity::is_group_jid(&jid);

        let mut media_url = None;
        if let Some(ext) = extracted.media_ext {
            media_url = self.download_media(live, &raw.id, ext).await;
        }

        let status = raw
            .status
            .clone()
            .unwrap_or_else(|| if raw.from_me { "sent" } else { "delivered" }.to_string());
        let direction = if raw.from_me { "outbound" } else { "inbound" };
        let timestamp = event_timestamp(raw.timestamp);
        let now = Utc::now();
        let record = MessageRow {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: live.session_id.clone(),
            external_id: raw.id.clone(),
            jid: jid.clone(),
            direction: direction.to_string(),
            msg_type: extracted.msg_type.to_string(),
            content: extracted.content.clone(),
            media_url,
            quoted_id: extracted.quoted_id.clone(),
            status,
            from_me: raw.from_me,
            ai_generated: false,
            ai_confidence: None,
            timestamp,
            created_at: now,
        };

        let inserted = match db::upsert_message(&self.inner.pool, self.inner.kind, &record).await {
            Ok(inserted) => inserted,
            Err(err) => {
                error!(
                    "message upsert failed for {}/{}: {err}",
                    live.session_id, raw.id
                );
                return;
            }
        };

        let unread_delta = if inserted && !raw.from_me { 1 } else { 0 };
        let display_name = if raw.from_me {
            None
        } else {
            raw.push_name.as_deref()
        };
        let phone = if is_group {
            None
        } else {
            Some(identity::canonical_phone(&jid, cc))
        };
        if let Err(err) = db::touch_contact(
            &self.inner.pool,
            self.inner.kind,
            &live.session_id,
            &jid,
            phone.as_deref(),
            display_name,
            None,
            unread_delta,
            Some(timestamp),
            now,
        )
        .await
        {
            warn!("contact update failed for {}/{}: {err}", live.session_id, jid);
        }

        // CRM sync mirrors individual chats only, and only on first
        // arrival so redeliveries never duplicate timeline entries.
        if inserted && !is_group {
            if let Some(phone) = phone.as_deref().filter(|p| !p.is_empty()) {
                if let Some(customer_id) = self
                    .inner
                    .crm
                    .sync_message_best_effort(
                        &live.tenant_id,
                        phone,
                        display_name,
                        None,
                        direction,
                        extracted.msg_type,
                        extracted.content.as_deref(),
                        Some(&raw.id),
                    )
                    .await
                {
                    let _ = db::link_contact_customer(
                        &self.inner.pool,
                        self.inner.kind,
                        &live.session_id,
                        &jid,
                        &customer_id,
                        now,
                    )
                    .await;
                }
            }
        }

        ws::emit(
            &self.inner.ws_tx,
            &live.tenant_id,
            "message:new",
            json!({"session_id": live.session_id, "message": record}),
        );
        if unread_delta > 0 {
            ws::emit(
                &self.inner.ws_tx,
                &live.tenant_id,
                "notification:new",
                json!({
                    "kind": "message",
                    "session_id": live.session_id,
                    "jid": jid,
                    "preview": record.content,
                }),
            );
        }

        if inserted && !raw.from_me && !is_group {
            let ai = self.inner.ai.clone();
            let session = session.clone();
            let message = record;
            tokio::spawn(async move {
                ai.handle_inbound(session, message).await;
            });
        }
    }
}

#[async_trait]
impl InboundHandler for Pipeline {
    async fn on_messages(&self, live: &LiveConnection, live_batch: bool, items: Vec<RawMessage>) {
        // Historical backfill batches never enter the pipeline.
        if !live_batch {
            return;
        }
        let session = match db::get_session(&self.inner.pool, self.inner.kind, &live.session_id).await
        {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(err) => {
                error!("session lookup failed for {}: {err}", live.session_id);
                return;
            }
        };
        let now = Utc::now().timestamp();
        for raw in items {
            if now - raw.timestamp > self.inner.cfg.staleness_window_seconds {
                debug!(
                    "dropping stale event {} ({}s old)",
                    raw.id,
                    now - raw.timestamp
                );
                continue;
            }
            self.ingest_one(live, &session, raw).await;
        }
    }

    async fn on_message_status(
        &self,
        live: &LiveConnection,
        id: String,
        chat: String,
        status: String,
    ) {
        match db::advance_message_status(&self.inner.pool, self.inner.kind, &live.session_id, &id, &status)
            .await
        {
            Ok(true) => {
                ws::emit(
                    &self.inner.ws_tx,
                    &live.tenant_id,
                    "message:status",
                    json!({
                        "session_id": live.session_id,
                        "external_id": id,
                        "chat": chat,
                        "status": status,
                    }),
                );
            }
            Ok(false) => {}
            Err(err) => warn!("status update failed for {}/{}: {err}", live.session_id, id),
        }
    }

    async fn on_contacts(&self, live: &LiveConnection, items: Vec<ContactUpdate>) {
        let cc = &self.inner.cfg.default_country_code;
        for item in items {
            let jid = identity::canonical_jid(&item.jid, cc);
            let phone = if identity::is_group_jid(&jid) {
                None
            } else {
                Some(identity::canonical_phone(&jid, cc))
            };
            // Roster refresh: names and avatars only, unread untouched.
            if let Err(err) = db::touch_contact(
                &self.inner.pool,
                self.inner.kind,
                &live.session_id,
                &jid,
                phone.as_deref(),
                item.name.as_deref(),
                item.avatar_url.as_deref(),
                0,
                None,
                Utc::now(),
            )
            .await
            {
                warn!("contact refresh failed for {}/{}: {err}", live.session_id, jid);
            }
        }
    }
}
