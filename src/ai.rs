//! Optional per-message auto-reply hook.
//!
//! Gated entirely by the session's auto-reply flag; outside working
//! hours a single away message per identity per hour is sent instead of
//! calling the generator. Depending on the tenant mode the generated
//! reply is either transmitted directly (tagged as AI output with its
//! confidence) or surfaced to a human as a realtime suggestion.

use crate::config::AiConfig;
use crate::db::{self, DbKind, MessageRow, SessionRow};
use crate::outbound::{OutboundService, SendOptions};
use crate::ws::{self, WsEvent};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const HISTORY_LIMIT: i64 = 10;
const AWAY_SUPPRESSION_MINUTES: i64 = 60;

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    content: &'a str,
    history: Vec<HistoryEntry>,
    customer_profile: serde_json::Value,
    tenant_config: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HistoryEntry {
    direction: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationResponse {
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub suggested_products: Option<Vec<serde_json::Value>>,
}

pub fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// True when `now` falls inside the configured working hours. Missing or
/// malformed bounds mean always-on. Windows crossing midnight work.
pub fn within_working_hours(
    now: DateTime<Utc>,
    start: Option<&str>,
    end: Option<&str>,
) -> bool {
    let (Some(start), Some(end)) = (start.and_then(parse_hhmm), end.and_then(parse_hhmm)) else {
        return true;
    };
    let time = now.time();
    if start <= end {
        time >= start && time < end
    } else {
        time >= start || time < end
    }
}

/// Fixed acknowledgment per media type, used instead of a generation
/// call for non-text inbound content.
pub fn media_ack(msg_type: &str) -> Option<&'static str> {
    match msg_type {
        "image" => Some("Thanks! We received your image and will get back to you shortly."),
        "video" => Some("Thanks! We received your video and will get back to you shortly."),
        "audio" => Some("Thanks! We received your voice message and will get back to you shortly."),
        "document" => Some("Thanks! We received your document and will get back to you shortly."),
        "sticker" => Some("Thanks for the sticker!"),
        "location" => Some("Thanks! We received your location."),
        "contact" => Some("Thanks! We received the contact card."),
        _ => None,
    }
}

struct AiInner {
    http: reqwest::Client,
    cfg: AiConfig,
    pool: AnyPool,
    kind: DbKind,
    outbound: OutboundService,
    ws_tx: broadcast::Sender<WsEvent>,
    away_sent: tokio::sync::Mutex<HashMap<String, DateTime<Utc>>>,
}

#[derive(Clone)]
pub struct AiBridge {
    inner: Arc<AiInner>,
}

impl AiBridge {
    pub fn new(
        http: reqwest::Client,
        cfg: AiConfig,
        pool: AnyPool,
        kind: DbKind,
        outbound: OutboundService,
        ws_tx: broadcast::Sender<WsEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(AiInner {
                http,
                cfg,
                pool,
                kind,
                outbound,
                ws_tx,
                away_sent: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn handle_inbound(&self, session: SessionRow, message: MessageRow) {
        if !session.auto_reply {
            return;
        }

        // Non-text content gets a canned acknowledgment in auto mode and
        // never reaches the generator.
        if message.msg_type != "text" {
            if session.auto_reply_mode == "auto" {
                if let Some(ack) = media_ack(&message.msg_type) {
                    if let Err(err) = self
                        .inner
                        .outbound
                        .send_text(&session.id, &message.jid, ack, SendOptions::default())
                        .await
                    {
                        debug!("media ack failed for {}: {err}", session.id);
                    }
                }
            }
            return;
        }

        let now = Utc::now();
        if !within_working_hours(
            now,
            session.working_hours_start.as_deref(),
            session.working_hours_end.as_deref(),
        ) {
            self.send_away_message(&session, &message.jid, now).await;
            return;
        }

        let Some(url) = self.inner.cfg.url.clone() else {
            return;
        };
        let content = message.content.clone().unwrap_or_default();
        if content.is_empty() {
            return;
        }

        let response = match self.generate(&url, &session, &message, &content).await {
            Ok(response) => response,
            Err(err) => {
                warn!("generation call failed for {}: {err:#}", session.id);
                return;
            }
        };
        let Some(text) = response.text.clone().filter(|t| !t.is_empty()) else {
            return;
        };

        if session.auto_reply_mode == "auto" {
            let opts = SendOptions {
                quoted_id: None,
                simulate_typing: true,
                ai_generated: true,
                ai_confidence: response.confidence,
            };
            if let Err(err) = self
                .inner
                .outbound
                .send_text(&session.id, &message.jid, &text, opts)
                .await
            {
                warn!("auto reply failed for {}: {err}", session.id);
            }
        } else {
            ws::emit(
                &self.inner.ws_tx,
                &session.tenant_id,
                "ai:suggestion",
                json!({
                    "session_id": session.id,
                    "jid": message.jid,
                    "in_reply_to": message.external_id,
                    "text": text,
                    "confidence": response.confidence,
                    "intent": response.intent,
                    "sentiment": response.sentiment,
                }),
            );
        }
    }

    async fn send_away_message(&self, session: &SessionRow, jid: &str, now: DateTime<Utc>) {
        let Some(away) = session.away_message.as_deref().filter(|m| !m.is_empty()) else {
            return;
        };
        let key = format!("{}:{}", session.id, jid);
        {
            let mut sent = self.inner.away_sent.lock().await;
            if let Some(last) = sent.get(&key) {
                if now - *last < Duration::minutes(AWAY_SUPPRESSION_MINUTES) {
                    return;
                }
            }
            sent.insert(key, now);
        }
        if let Err(err) = self
            .inner
            .outbound
            .send_text(&session.id, jid, away, SendOptions::default())
            .await
        {
            debug!("away message failed for {}: {err}", session.id);
        }
    }

    async fn generate(
        &self,
        url: &str,
        session: &SessionRow,
        message: &MessageRow,
        content: &str,
    ) -> anyhow::Result<GenerationResponse> {
        let history = db::list_messages(
            &self.inner.pool,
            self.inner.kind,
            &session.id,
            &message.jid,
            HISTORY_LIMIT,
            0,
        )
        .await
        .unwrap_or_default()
        .into_iter()
        .rev()
        .filter_map(|row| {
            row.content.map(|content| HistoryEntry {
                direction: row.direction,
                content,
            })
        })
        .collect();

        let contact = db::get_contact(&self.inner.pool, self.inner.kind, &session.id, &message.jid)
            .await
            .ok()
            .flatten();
        let customer_profile = match contact {
            Some(contact) => json!({
                "phone": contact.phone,
                "display_name": contact.display_name,
                "customer_id": contact.customer_id,
            }),
            None => json!({}),
        };

        let request = GenerationRequest {
            content,
            history,
            customer_profile,
            tenant_config: json!({
                "tenant_id": session.tenant_id,
                "auto_reply_mode": session.auto_reply_mode,
                "working_hours_start": session.working_hours_start,
                "working_hours_end": session.working_hours_end,
            }),
        };

        let mut req = self.inner.http.post(url).json(&request);
        if let Some(token) = self.inner.cfg.api_token.as_ref() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("generation service error: {} {}", status, body));
        }
        Ok(resp.json().await?)
    }
}
