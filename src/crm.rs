//! Reconciliation of chat identities into the internal customer and
//! conversation model. This is a best-effort mirror of the primary
//! message record: every operation is idempotent, and a failure is
//! logged without ever aborting the ingestion that triggered it.

use crate::db::{
    self, ConversationMessageRow, ConversationRow, CustomerRow, DbKind, StoreResult,
};
use chrono::Utc;
use sqlx::AnyPool;
use std::sync::Arc;
use tracing::warn;

pub const CHANNEL: &str = "whatsapp";

struct CrmInner {
    pool: AnyPool,
    kind: DbKind,
}

#[derive(Clone)]
pub struct CrmBridge {
    inner: Arc<CrmInner>,
}

impl CrmBridge {
    pub fn new(pool: AnyPool, kind: DbKind) -> Self {
        Self {
            inner: Arc::new(CrmInner { pool, kind }),
        }
    }

    /// Looks a customer up by phone, creating a lead when absent.
    /// An already-known customer gets its avatar backfilled when missing.
    pub async fn find_or_create_customer(
        &self,
        tenant_id: &str,
        phone: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> StoreResult<CustomerRow> {
        if let Some(existing) =
            db::get_customer_by_phone(&self.inner.pool, self.inner.kind, tenant_id, phone).await?
        {
            if existing.avatar_url.is_none() {
                if let Some(avatar) = avatar_url {
                    db::set_customer_avatar(
                        &self.inner.pool,
                        self.inner.kind,
                        &existing.id,
                        avatar,
                        Utc::now(),
                    )
                    .await?;
                }
            }
            return Ok(existing);
        }

        let now = Utc::now();
        let record = CustomerRow {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            phone: phone.to_string(),
            name: display_name.map(|s| s.to_string()),
            avatar_url: avatar_url.map(|s| s.to_string()),
            status: "lead".to_string(),
            created_at: now,
            updated_at: now,
        };
        db::insert_customer(&self.inner.pool, self.inner.kind, &record).await?;
        // A concurrent insert for the same phone loses on the unique key;
        // re-read so both callers see the surviving row.
        match db::get_customer_by_phone(&self.inner.pool, self.inner.kind, tenant_id, phone).await? {
            Some(row) => Ok(row),
            None => Ok(record),
        }
    }

    /// One active conversation per (tenant, customer, channel).
    pub async fn find_or_create_conversation(
        &self,
        tenant_id: &str,
        customer_id: &str,
    ) -> StoreResult<ConversationRow> {
        if let Some(existing) = db::get_active_conversation(
            &self.inner.pool,
            self.inner.kind,
            tenant_id,
            customer_id,
            CHANNEL,
        )
        .await?
        {
            return Ok(existing);
        }
        let record = ConversationRow {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            customer_id: customer_id.to_string(),
            channel: CHANNEL.to_string(),
            status: "active".to_string(),
            unread_count: 0,
            last_message_at: None,
            preview: None,
            created_at: Utc::now(),
        };
        db::insert_conversation(&self.inner.pool, self.inner.kind, &record).await?;
        Ok(record)
    }

    /// Appends one normalized message to the tenant's unified timeline,
    /// bumping last-activity and (for inbound only) the unread counter.
    /// Returns the customer id so the caller can link the chat contact.
    pub async fn sync_message(
        &self,
        tenant_id: &str,
        phone: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
        direction: &str,
        msg_type: &str,
        content: Option<&str>,
        external_id: Option<&str>,
    ) -> StoreResult<String> {
        let customer = self
            .find_or_create_customer(tenant_id, phone, display_name, avatar_url)
            .await?;
        let conversation = self
            .find_or_create_conversation(tenant_id, &customer.id)
            .await?;

        let now = Utc::now();
        let row = ConversationMessageRow {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation.id.clone(),
            direction: direction.to_string(),
            msg_type: msg_type.to_string(),
            content: content.map(|s| s.to_string()),
            external_id: external_id.map(|s| s.to_string()),
            created_at: now,
        };
        db::insert_conversation_message(&self.inner.pool, self.inner.kind, &row).await?;

        let unread_delta = if direction == "inbound" { 1 } else { 0 };
        db::bump_conversation(
            &self.inner.pool,
            self.inner.kind,
            &conversation.id,
            content,
            unread_delta,
            now,
        )
        .await?;
        Ok(customer.id)
    }

    /// The non-fatal wrapper ingestion calls: any error is reduced to a
    /// log line.
    pub async fn sync_message_best_effort(
        &self,
        tenant_id: &str,
        phone: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
        direction: &str,
        msg_type: &str,
        content: Option<&str>,
        external_id: Option<&str>,
    ) -> Option<String> {
        match self
            .sync_message(
                tenant_id,
                phone,
                display_name,
                avatar_url,
                direction,
                msg_type,
                content,
                external_id,
            )
            .await
        {
            Ok(customer_id) => Some(customer_id),
            Err(err) => {
                warn!("crm sync failed for tenant {tenant_id}: {err}");
                None
            }
        }
    }
}
