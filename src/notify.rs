//! Templated, rate-limited notification delivery.
//!
//! Immediate sends render a template, write a log row and dispatch
//! through the outbound service; quiet hours or an explicit schedule
//! divert the rendered content into the queue instead. The queue worker
//! drains due items in priority order with a fixed inter-item delay to
//! respect the network's sending-rate expectations, and a retry ceiling
//! after which an item is terminally FAILED.

use crate::ai::parse_hhmm;
use crate::config::QueueConfig;
use crate::db::{
    self, DbKind, NotificationLogRow, NotificationQueueRow, NotificationSettingsRow,
};
use crate::identity;
use crate::outbound::{ButtonSpec, OutboundService, SendOptions};
use crate::session::SessionManager;
use crate::ws::{self, WsEvent};
use chrono::{DateTime, Days, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyFailure {
    #[error("notifications disabled for tenant")]
    NotificationsDisabled,

    #[error("no session for tenant")]
    NoSession,

    #[error("no connected session for tenant")]
    SessionNotConnected,

    #[error("no template for event type")]
    NoTemplate,
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum NotifyOutcome {
    Sent {
        log_id: String,
        message_id: String,
    },
    Scheduled {
        queue_id: String,
        scheduled_at: DateTime<Utc>,
    },
    SendFailed {
        log_id: String,
        reason: String,
    },
    Rejected {
        reason: NotifyFailure,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationRequest {
    pub tenant_id: String,
    pub recipient_phone: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub event_type: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub schedule_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_kind: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
}

fn default_category() -> String {
    "general".to_string()
}

/// `{name}` placeholder substitution. Unresolved placeholders render as
/// the empty string; rendering never fails.
pub fn render_template(body: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                if let Some(value) = vars.get(name) {
                    out.push_str(value);
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// When `now` falls inside the quiet window, returns the exact end of
/// that window (possibly tomorrow for windows crossing midnight).
pub fn quiet_deferral(
    now: DateTime<Utc>,
    start: Option<&str>,
    end: Option<&str>,
) -> Option<DateTime<Utc>> {
    let (start, end) = (start.and_then(parse_hhmm)?, end.and_then(parse_hhmm)?);
    let time = now.time();
    if start <= end {
        if time >= start && time < end {
            return Some(now.date_naive().and_time(end).and_utc());
        }
        None
    } else if time >= start {
        let tomorrow = now.date_naive().checked_add_days(Days::new(1))?;
        Some(tomorrow.and_time(end).and_utc())
    } else if time < end {
        Some(now.date_naive().and_time(end).and_utc())
    } else {
        None
    }
}

#[derive(Debug, Serialize, Default)]
pub struct NotificationStats {
    pub sent: i64,
    pub failed: i64,
    pub sending: i64,
    pub queue_pending: i64,
    pub queue_processing: i64,
    pub queue_sent: i64,
    pub queue_failed: i64,
}

struct NotifyInner {
    pool: AnyPool,
    kind: DbKind,
    cfg: QueueConfig,
    country_code: String,
    manager: SessionManager,
    outbound: OutboundService,
    ws_tx: broadcast::Sender<WsEvent>,
}

#[derive(Clone)]
pub struct NotificationService {
    inner: Arc<NotifyInner>,
}

impl NotificationService {
    pub fn new(
        pool: AnyPool,
        kind: DbKind,
        cfg: QueueConfig,
        country_code: String,
        manager: SessionManager,
        outbound: OutboundService,
        ws_tx: broadcast::Sender<WsEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(NotifyInner {
                pool,
                kind,
                cfg,
                country_code,
                manager,
                outbound,
                ws_tx,
            }),
        }
    }

    async fn settings(&self, tenant_id: &str) -> NotificationSettingsRow {
        db::get_notification_settings(&self.inner.pool, self.inner.kind, tenant_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| NotificationSettingsRow::defaults(tenant_id))
    }

    pub async fn send(&self, req: NotificationRequest) -> anyhow::Result<NotifyOutcome> {
        let settings = self.settings(&req.tenant_id).await;
        if !settings.enabled {
            return Ok(NotifyOutcome::Rejected {
                reason: NotifyFailure::NotificationsDisabled,
            });
        }

        if req.schedule_at.is_some() {
            return self.schedule(req).await;
        }

        let sessions =
            db::list_sessions(&self.inner.pool, self.inner.kind, Some(&req.tenant_id)).await?;
        if sessions.is_empty() {
            return Ok(NotifyOutcome::Rejected {
                reason: NotifyFailure::NoSession,
            });
        }
        let Some(live) = self
            .inner
            .manager
            .connected_session(&req.tenant_id, settings.default_session_id.as_deref())
            .await
        else {
            return Ok(NotifyOutcome::Rejected {
                reason: NotifyFailure::SessionNotConnected,
            });
        };

        let now = Utc::now();
        if let Some(window_end) = quiet_deferral(
            now,
            settings.quiet_start.as_deref(),
            settings.quiet_end.as_deref(),
        ) {
            let mut deferred = req;
            deferred.schedule_at = Some(window_end);
            return self.schedule(deferred).await;
        }

        let Some(template) =
            db::find_template(&self.inner.pool, self.inner.kind, &req.tenant_id, &req.event_type)
                .await?
        else {
            return Ok(NotifyOutcome::Rejected {
                reason: NotifyFailure::NoTemplate,
            });
        };
        let content = render_template(&template.body, &req.variables);
        let recipient = identity::canonical_phone(&req.recipient_phone, &self.inner.country_code);

        let log = NotificationLogRow {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: req.tenant_id.clone(),
            recipient: recipient.clone(),
            event_type: req.event_type.clone(),
            category: req.category.clone(),
            content: content.clone(),
            status: "SENDING".to_string(),
            transport_message_id: None,
            failure_reason: None,
            source_kind: req.source_kind.clone(),
            source_id: req.source_id.clone(),
            created_at: now,
            updated_at: now,
        };
        db::insert_notification_log(&self.inner.pool, self.inner.kind, &log).await?;

        let buttons: Option<Vec<ButtonSpec>> = template
            .buttons
            .clone()
            .and_then(|value| serde_json::from_value(value).ok());
        let result = match buttons {
            Some(buttons) if !buttons.is_empty() => {
                self.inner
                    .outbound
                    .send_buttons(&live.session_id, &recipient, &content, buttons, SendOptions::default())
                    .await
            }
            _ => {
                self.inner
                    .outbound
                    .send_text(&live.session_id, &recipient, &content, SendOptions::default())
                    .await
            }
        };

        match result {
            Ok(message) => {
                db::set_notification_log_result(
                    &self.inner.pool,
                    self.inner.kind,
                    &log.id,
                    "SENT",
                    Some(&message.external_id),
                    None,
                    Utc::now(),
                )
                .await?;
                db::bump_template_usage(&self.inner.pool, self.inner.kind, &template.id).await?;
                ws::emit(
                    &self.inner.ws_tx,
                    &req.tenant_id,
                    "notification:new",
                    json!({
                        "kind": "notification",
                        "event_type": req.event_type,
                        "recipient": recipient,
                        "log_id": log.id,
                    }),
                );
                Ok(NotifyOutcome::Sent {
                    log_id: log.id,
                    message_id: message.external_id,
                })
            }
            Err(err) => {
                let reason = err.to_string();
                db::set_notification_log_result(
                    &self.inner.pool,
                    self.inner.kind,
                    &log.id,
                    "FAILED",
                    None,
                    Some(&reason),
                    Utc::now(),
                )
                .await?;
                Ok(NotifyOutcome::SendFailed {
                    log_id: log.id,
                    reason,
                })
            }
        }
    }

    /// Same rendering and validation as `send`, but the outcome is a
    /// queue item rather than an immediate dispatch.
    pub async fn schedule(&self, req: NotificationRequest) -> anyhow::Result<NotifyOutcome> {
        let settings = self.settings(&req.tenant_id).await;
        if !settings.enabled {
            return Ok(NotifyOutcome::Rejected {
                reason: NotifyFailure::NotificationsDisabled,
            });
        }
        let Some(template) =
            db::find_template(&self.inner.pool, self.inner.kind, &req.tenant_id, &req.event_type)
                .await?
        else {
            return Ok(NotifyOutcome::Rejected {
                reason: NotifyFailure::NoTemplate,
            });
        };
        let content = render_template(&template.body, &req.variables);
        let recipient = identity::canonical_phone(&req.recipient_phone, &self.inner.country_code);

        let now = Utc::now();
        let scheduled_at = req.schedule_at.unwrap_or(now);
        let item = NotificationQueueRow {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: req.tenant_id.clone(),
            recipient,
            event_type: req.event_type.clone(),
            category: req.category.clone(),
            content,
            priority: req.priority.unwrap_or(0),
            scheduled_at,
            retry_count: 0,
            max_retries: self.inner.cfg.max_retries,
            status: "PENDING".to_string(),
            last_error: None,
            source_kind: req.source_kind.clone(),
            source_id: req.source_id.clone(),
            created_at: now,
            updated_at: now,
        };
        db::insert_queue_item(&self.inner.pool, self.inner.kind, &item).await?;
        Ok(NotifyOutcome::Scheduled {
            queue_id: item.id,
            scheduled_at,
        })
    }

    /// One poller tick: claim due items, deliver with pacing, retry or
    /// terminally fail. Returns the number delivered.
    pub async fn process_queue_once(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        // Expired ephemeral status records ride along with the poll tick.
        let _ = db::delete_expired_status_updates(&self.inner.pool, self.inner.kind, now).await;

        let batch =
            db::claim_due_queue_items(&self.inner.pool, self.inner.kind, now, self.inner.cfg.batch_size)
                .await?;
        let mut delivered = 0;
        for (index, item) in batch.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.inner.cfg.item_delay_ms))
                    .await;
            }
            match self.deliver_queue_item(item).await {
                Ok(()) => delivered += 1,
                Err(reason) => self.retry_or_fail(item, &reason).await,
            }
        }
        Ok(delivered)
    }

    async fn deliver_queue_item(&self, item: &NotificationQueueRow) -> Result<(), String> {
        let settings = self.settings(&item.tenant_id).await;
        if !settings.enabled {
            return Err("notifications disabled".to_string());
        }
        let live = self
            .inner
            .manager
            .connected_session(&item.tenant_id, settings.default_session_id.as_deref())
            .await
            .ok_or_else(|| "no connected session".to_string())?;
        self.inner
            .outbound
            .send_text(&live.session_id, &item.recipient, &item.content, SendOptions::default())
            .await
            .map_err(|err| err.to_string())?;
        db::complete_queue_item(&self.inner.pool, self.inner.kind, &item.id, Utc::now())
            .await
            .map_err(|err| err.to_string())?;
        ws::emit(
            &self.inner.ws_tx,
            &item.tenant_id,
            "notification:new",
            json!({
                "kind": "notification",
                "event_type": item.event_type,
                "recipient": item.recipient,
                "queue_id": item.id,
            }),
        );
        Ok(())
    }

    async fn retry_or_fail(&self, item: &NotificationQueueRow, reason: &str) {
        let now = Utc::now();
        let retries = item.retry_count + 1;
        if retries > item.max_retries {
            warn!(
                "queue item {} exhausted {} retries, failing: {reason}",
                item.id, item.max_retries
            );
            let _ = db::fail_queue_item(
                &self.inner.pool,
                self.inner.kind,
                &item.id,
                item.max_retries,
                reason,
                now,
            )
            .await;
        } else {
            let next = now + Duration::seconds(self.inner.cfg.retry_delay_seconds);
            let _ = db::requeue_item(
                &self.inner.pool,
                self.inner.kind,
                &item.id,
                retries,
                next,
                reason,
                now,
            )
            .await;
        }
    }

    pub fn spawn_worker(&self) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        let interval = std::time::Duration::from_secs(service.inner.cfg.poll_interval_seconds);
        tokio::spawn(async move {
            info!("notification queue worker started");
            loop {
                if let Err(err) = service.process_queue_once().await {
                    error!("queue tick failed: {err:#}");
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    pub async fn stats(&self, tenant_id: &str) -> anyhow::Result<NotificationStats> {
        let mut stats = NotificationStats::default();
        for (status, count) in
            db::notification_log_counts(&self.inner.pool, self.inner.kind, tenant_id).await?
        {
            match status.as_str() {
                "SENT" => stats.sent = count,
                "FAILED" => stats.failed = count,
                "SENDING" => stats.sending = count,
                _ => {}
            }
        }
        for (status, count) in
            db::notification_queue_counts(&self.inner.pool, self.inner.kind, tenant_id).await?
        {
            match status.as_str() {
                "PENDING" => stats.queue_pending = count,
                "PROCESSING" => stats.queue_processing = count,
                "SENT" => stats.queue_sent = count,
                "FAILED" => stats.queue_failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }
}
