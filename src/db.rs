use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, AnyPool, Row};
use std::borrow::Cow;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_lowercase();
            msg.contains("locked") || msg.contains("busy") || msg.contains("deadlock")
        }
        _ => false,
    }
}

pub fn is_permission_denied(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = err {
        let msg = db.message().to_lowercase();
        msg.contains("permission denied")
            || msg.contains("insufficient privilege")
            || msg.contains("must be owner")
            || msg.contains("readonly database")
            || msg.contains("attempt to write a readonly")
    } else {
        false
    }
}

fn classify(err: sqlx::Error) -> StoreError {
    if is_permission_denied(&err) {
        StoreError::PermissionDenied(err.to_string())
    } else {
        StoreError::Database(err)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        classify(err)
    }
}

/// Runs a store operation with bounded retries on transient failures
/// (lock contention, pool timeouts, I/O). Everything else is classified
/// and returned on the first attempt.
pub async fn with_retry<'a, T>(
    mut op: impl FnMut() -> BoxFuture<'a, Result<T, sqlx::Error>>,
) -> StoreResult<T> {
    let mut attempt: u64 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < 2 => {
                attempt += 1;
                tokio::time::sleep(std::time::Duration::from_millis(100 * attempt)).await;
            }
            Err(err) => return Err(classify(err)),
        }
    }
}

fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn opt_i64_to_datetime(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.map(i64_to_datetime)
}

fn bool_to_i64(v: bool) -> i64 {
    if v {
        1
    } else {
        0
    }
}

/// Delivery-status ordering used to keep message status monotonic:
/// a `delivered` row never drops back to `sent` on a late event.
pub fn status_rank(status: &str) -> i32 {
    match status {
        "pending" => 0,
        "sent" => 1,
        "delivered" => 2,
        "read" => 3,
        _ => -1,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub tenant_id: String,
    pub status: String,
    pub phone_number: Option<String>,
    pub avatar_url: Option<String>,
    pub auto_reply: bool,
    pub auto_reply_mode: String,
    pub working_hours_start: Option<String>,
    pub working_hours_end: Option<String>,
    pub away_message: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRow {
    pub id: String,
    pub session_id: String,
    pub jid: String,
    pub phone: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub pinned: bool,
    pub archived: bool,
    pub muted: bool,
    pub unread_count: i64,
    pub customer_id: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub session_id: String,
    pub external_id: String,
    pub jid: String,
    pub direction: String,
    pub msg_type: String,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub quoted_id: Option<String>,
    pub status: String,
    pub from_me: bool,
    pub ai_generated: bool,
    pub ai_confidence: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateRow {
    pub id: String,
    pub session_id: String,
    pub jid: String,
    pub msg_type: String,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerRow {
    pub id: String,
    pub tenant_id: String,
    pub phone: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub status: String,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub channel: String,
    pub status: String,
    pub unread_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub preview: Option<String>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessageRow {
    pub id: String,
    pub conversation_id: String,
    pub direction: String,
    pub msg_type: String,
    pub content: Option<String>,
    pub external_id: Option<String>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettingsRow {
    pub tenant_id: String,
    pub enabled: bool,
    pub default_session_id: Option<String>,
    pub quiet_start: Option<String>,
    pub quiet_end: Option<String>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

impl NotificationSettingsRow {
    pub fn defaults(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            enabled: true,
            default_session_id: None,
            quiet_start: None,
            quiet_end: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTemplateRow {
    pub id: String,
    pub tenant_id: Option<String>,
    pub event_type: String,
    pub category: String,
    pub body: String,
    pub buttons: Option<serde_json::Value>,
    pub active: bool,
    pub usage_count: i64,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationLogRow {
    pub id: String,
    pub tenant_id: String,
    pub recipient: String,
    pub event_type: String,
    pub category: String,
    pub content: String,
    pub status: String,
    pub transport_message_id: Option<String>,
    pub failure_reason: Option<String>,
    pub source_kind: Option<String>,
    pub source_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationQueueRow {
    pub id: String,
    pub tenant_id: String,
    pub recipient: String,
    pub event_type: String,
    pub category: String,
    pub content: String,
    pub priority: i64,
    pub scheduled_at: DateTime<Utc>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub status: String,
    pub last_error: Option<String>,
    pub source_kind: Option<String>,
    pub source_id: Option<String>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> StoreResult<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            status TEXT NOT NULL,
            phone_number TEXT,
            avatar_url TEXT,
            auto_reply INTEGER NOT NULL,
            auto_reply_mode TEXT NOT NULL,
            working_hours_start TEXT,
            working_hours_end TEXT,
            away_message TEXT,
            last_connected_at INTEGER,
            last_disconnected_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_sessions_tenant ON sessions(tenant_id)"#,
        r#"CREATE TABLE IF NOT EXISTS credentials (
            session_id TEXT PRIMARY KEY,
            blob TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS contacts (
            id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            jid TEXT NOT NULL,
            phone TEXT,
            display_name TEXT,
            avatar_url TEXT,
            pinned INTEGER NOT NULL,
            archived INTEGER NOT NULL,
            muted INTEGER NOT NULL,
            unread_count INTEGER NOT NULL,
            customer_id TEXT,
            last_message_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (session_id, jid)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS messages (
            id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            external_id TEXT NOT NULL,
            jid TEXT NOT NULL,
            direction TEXT NOT NULL,
            msg_type TEXT NOT NULL,
            content TEXT,
            media_url TEXT,
            quoted_id TEXT,
            status TEXT NOT NULL,
            from_me INTEGER NOT NULL,
            ai_generated INTEGER NOT NULL,
            ai_confidence REAL,
            timestamp INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (session_id, external_id)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(session_id, jid, timestamp)"#,
        r#"CREATE TABLE IF NOT EXISTS status_updates (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            jid TEXT NOT NULL,
            msg_type TEXT NOT NULL,
            content TEXT,
            media_url TEXT,
            expires_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_status_expiry ON status_updates(expires_at)"#,
        r#"CREATE TABLE IF NOT EXISTS customers (
            id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            phone TEXT NOT NULL,
            name TEXT,
            avatar_url TEXT,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, phone)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            status TEXT NOT NULL,
            unread_count INTEGER NOT NULL,
            last_message_at INTEGER,
            preview TEXT,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_conversations_customer ON conversations(tenant_id, customer_id, channel)"#,
        r#"CREATE TABLE IF NOT EXISTS conversation_messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            direction TEXT NOT NULL,
            msg_type TEXT NOT NULL,
            content TEXT,
            external_id TEXT,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS notification_settings (
            tenant_id TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL,
            default_session_id TEXT,
            quiet_start TEXT,
            quiet_end TEXT,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS notification_templates (
            id TEXT PRIMARY KEY,
            tenant_id TEXT,
            event_type TEXT NOT NULL,
            category TEXT NOT NULL,
            body TEXT NOT NULL,
            buttons TEXT,
            active INTEGER NOT NULL,
            usage_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_templates_event ON notification_templates(event_type)"#,
        r#"CREATE TABLE IF NOT EXISTS notification_logs (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            recipient TEXT NOT NULL,
            event_type TEXT NOT NULL,
            category TEXT NOT NULL,
            content TEXT NOT NULL,
            status TEXT NOT NULL,
            transport_message_id TEXT,
            failure_reason TEXT,
            source_kind TEXT,
            source_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_notification_logs_tenant ON notification_logs(tenant_id, created_at)"#,
        r#"CREATE TABLE IF NOT EXISTS notification_queue (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            recipient TEXT NOT NULL,
            event_type TEXT NOT NULL,
            category TEXT NOT NULL,
            content TEXT NOT NULL,
            priority INTEGER NOT NULL,
            scheduled_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL,
            max_retries INTEGER NOT NULL,
            status TEXT NOT NULL,
            last_error TEXT,
            source_kind TEXT,
            source_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_queue_due ON notification_queue(status, scheduled_at)"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

// ---------------------------------------------------------------- sessions

fn map_session(row: &AnyRow) -> Result<SessionRow, sqlx::Error> {
    Ok(SessionRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        status: row.try_get("status")?,
        phone_number: row.try_get("phone_number")?,
        avatar_url: row.try_get("avatar_url")?,
        auto_reply: row.try_get::<i64, _>("auto_reply")? != 0,
        auto_reply_mode: row.try_get("auto_reply_mode")?,
        working_hours_start: row.try_get("working_hours_start")?,
        working_hours_end: row.try_get("working_hours_end")?,
        away_message: row.try_get("away_message")?,
        last_connected_at: opt_i64_to_datetime(row.try_get("last_connected_at")?),
        last_disconnected_at: opt_i64_to_datetime(row.try_get("last_disconnected_at")?),
        created_at: i64_to_datetime(row.try_get("created_at")?),
        updated_at: i64_to_datetime(row.try_get("updated_at")?),
    })
}

const SESSION_COLS: &str = "id, tenant_id, status, phone_number, avatar_url, auto_reply, auto_reply_mode, working_hours_start, working_hours_end, away_message, last_connected_at, last_disconnected_at, created_at, updated_at";

pub async fn upsert_session(pool: &AnyPool, kind: DbKind, record: &SessionRow) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO sessions (
            id, tenant_id, status, phone_number, avatar_url, auto_reply, auto_reply_mode,
            working_hours_start, working_hours_end, away_message,
            last_connected_at, last_disconnected_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            tenant_id=excluded.tenant_id,
            auto_reply=excluded.auto_reply,
            auto_reply_mode=excluded.auto_reply_mode,
            working_hours_start=excluded.working_hours_start,
            working_hours_end=excluded.working_hours_end,
            away_message=excluded.away_message,
            updated_at=excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.tenant_id)
        .bind(&record.status)
        .bind(record.phone_number.as_deref())
        .bind(record.avatar_url.as_deref())
        .bind(bool_to_i64(record.auto_reply))
        .bind(&record.auto_reply_mode)
        .bind(record.working_hours_start.as_deref())
        .bind(record.working_hours_end.as_deref())
        .bind(record.away_message.as_deref())
        .bind(record.last_connected_at.map(datetime_to_i64))
        .bind(record.last_disconnected_at.map(datetime_to_i64))
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

/// Inserts a minimal row if the session is unknown; an existing row is
/// left untouched so reconnects never clobber operator-edited flags.
pub async fn ensure_session(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    tenant_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO sessions (
            id, tenant_id, status, phone_number, avatar_url, auto_reply, auto_reply_mode,
            working_hours_start, working_hours_end, away_message,
            last_connected_at, last_disconnected_at, created_at, updated_at
        ) VALUES (?, ?, 'connecting', NULL, NULL, 0, 'suggest', NULL, NULL, NULL, NULL, NULL, ?, ?)
        ON CONFLICT(id) DO NOTHING"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(id)
        .bind(tenant_id)
        .bind(datetime_to_i64(now))
        .bind(datetime_to_i64(now))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_session(pool: &AnyPool, kind: DbKind, id: &str) -> StoreResult<Option<SessionRow>> {
    let query = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLS);
    let sql = rewrite_sql(&query, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(map_session).transpose().map_err(classify)
}

pub async fn list_sessions(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: Option<&str>,
) -> StoreResult<Vec<SessionRow>> {
    let rows = match tenant_id {
        Some(tenant) => {
            let query = format!(
                "SELECT {} FROM sessions WHERE tenant_id = ? ORDER BY created_at ASC",
                SESSION_COLS
            );
            let sql = rewrite_sql(&query, kind);
            sqlx::query(sql.as_ref()).bind(tenant).fetch_all(pool).await?
        }
        None => {
            let query = format!("SELECT {} FROM sessions ORDER BY created_at ASC", SESSION_COLS);
            let sql = rewrite_sql(&query, kind);
            sqlx::query(sql.as_ref()).fetch_all(pool).await?
        }
    };
    rows.iter().map(map_session).collect::<Result<_, _>>().map_err(classify)
}

pub async fn sessions_to_restore(pool: &AnyPool, kind: DbKind) -> StoreResult<Vec<SessionRow>> {
    let query = format!(
        "SELECT {} FROM sessions WHERE status IN ('connected', 'disconnected')",
        SESSION_COLS
    );
    let sql = rewrite_sql(&query, kind);
    let rows = sqlx::query(sql.as_ref()).fetch_all(pool).await?;
    rows.iter().map(map_session).collect::<Result<_, _>>().map_err(classify)
}

pub async fn set_session_status(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    status: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?", kind);
    sqlx::query(sql.as_ref())
        .bind(status)
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_session_connected(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    phone: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        "UPDATE sessions SET status = 'connected', phone_number = ?, last_connected_at = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(phone)
        .bind(datetime_to_i64(now))
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_session_disconnected(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    status: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        "UPDATE sessions SET status = ?, last_disconnected_at = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(status)
        .bind(datetime_to_i64(now))
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_session_avatar(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    avatar_url: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        "UPDATE sessions SET avatar_url = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(avatar_url)
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Permanently removes a session and everything keyed by it.
pub async fn delete_session_data(pool: &AnyPool, kind: DbKind, id: &str) -> StoreResult<()> {
    for stmt in [
        "DELETE FROM messages WHERE session_id = ?",
        "DELETE FROM contacts WHERE session_id = ?",
        "DELETE FROM status_updates WHERE session_id = ?",
        "DELETE FROM credentials WHERE session_id = ?",
        "DELETE FROM sessions WHERE id = ?",
    ] {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).bind(id).execute(pool).await?;
    }
    Ok(())
}

// ------------------------------------------------------------- credentials

pub async fn load_credentials(
    pool: &AnyPool,
    kind: DbKind,
    session_id: &str,
) -> StoreResult<Option<String>> {
    let sql = rewrite_sql("SELECT blob FROM credentials WHERE session_id = ?", kind);
    let row = sqlx::query(sql.as_ref())
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(Some(row.try_get("blob").map_err(classify)?)),
        None => Ok(None),
    }
}

pub async fn save_credentials(
    pool: &AnyPool,
    kind: DbKind,
    session_id: &str,
    blob: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO credentials (session_id, blob, updated_at) VALUES (?, ?, ?)
           ON CONFLICT(session_id) DO UPDATE SET blob=excluded.blob, updated_at=excluded.updated_at"#,
        kind,
    );
    let sql = sql.as_ref();
    let ts = datetime_to_i64(now);
    with_retry(move || {
        Box::pin(async move {
            sqlx::query(sql)
                .bind(session_id)
                .bind(blob)
                .bind(ts)
                .execute(pool)
                .await
                .map(|_| ())
        })
    })
    .await
}

pub async fn delete_credentials(pool: &AnyPool, kind: DbKind, session_id: &str) -> StoreResult<()> {
    let sql = rewrite_sql("DELETE FROM credentials WHERE session_id = ?", kind);
    sqlx::query(sql.as_ref()).bind(session_id).execute(pool).await?;
    Ok(())
}

// ----------------------------------------------------------------- contacts

fn map_contact(row: &AnyRow) -> Result<ContactRow, sqlx::Error> {
    Ok(ContactRow {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        jid: row.try_get("jid")?,
        phone: row.try_get("phone")?,
        display_name: row.try_get("display_name")?,
        avatar_url: row.try_get("avatar_url")?,
        pinned: row.try_get::<i64, _>("pinned")? != 0,
        archived: row.try_get::<i64, _>("archived")? != 0,
        muted: row.try_get::<i64, _>("muted")? != 0,
        unread_count: row.try_get("unread_count")?,
        customer_id: row.try_get("customer_id")?,
        last_message_at: opt_i64_to_datetime(row.try_get("last_message_at")?),
        created_at: i64_to_datetime(row.try_get("created_at")?),
        updated_at: i64_to_datetime(row.try_get("updated_at")?),
    })
}

const CONTACT_COLS: &str = "id, session_id, jid, phone, display_name, avatar_url, pinned, archived, muted, unread_count, customer_id, last_message_at, created_at, updated_at";

/// Insert-or-update of the per-chat aggregate. `unread_delta` is added to
/// the existing counter; name/avatar/phone only fill in when the incoming
/// value is non-null, so an outgoing touch never erases what a richer
/// inbound event already recorded.
pub async fn touch_contact(
    pool: &AnyPool,
    kind: DbKind,
    session_id: &str,
    jid: &str,
    phone: Option<&str>,
    display_name: Option<&str>,
    avatar_url: Option<&str>,
    unread_delta: i64,
    last_message_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO contacts (
            id, session_id, jid, phone, display_name, avatar_url,
            pinned, archived, muted, unread_count, customer_id, last_message_at,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, 0, 0, 0, ?, NULL, ?, ?, ?)
        ON CONFLICT(session_id, jid) DO UPDATE SET
            phone = COALESCE(excluded.phone, contacts.phone),
            display_name = COALESCE(excluded.display_name, contacts.display_name),
            avatar_url = COALESCE(excluded.avatar_url, contacts.avatar_url),
            unread_count = contacts.unread_count + excluded.unread_count,
            last_message_at = COALESCE(excluded.last_message_at, contacts.last_message_at),
            updated_at = excluded.updated_at"#,
        kind,
    );
    let id = uuid::Uuid::new_v4().to_string();
    let sql = sql.as_ref();
    let id = id.as_str();
    let last_ts = last_message_at.map(datetime_to_i64);
    let ts = datetime_to_i64(now);
    with_retry(move || {
        Box::pin(async move {
            sqlx::query(sql)
                .bind(id)
                .bind(session_id)
                .bind(jid)
                .bind(phone)
                .bind(display_name)
                .bind(avatar_url)
                .bind(unread_delta)
                .bind(last_ts)
                .bind(ts)
                .bind(ts)
                .execute(pool)
                .await
                .map(|_| ())
        })
    })
    .await
}

pub async fn get_contact(
    pool: &AnyPool,
    kind: DbKind,
    session_id: &str,
    jid: &str,
) -> StoreResult<Option<ContactRow>> {
    let query = format!(
        "SELECT {} FROM contacts WHERE session_id = ? AND jid = ?",
        CONTACT_COLS
    );
    let sql = rewrite_sql(&query, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(session_id)
        .bind(jid)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_contact).transpose().map_err(classify)
}

pub async fn list_contacts(
    pool: &AnyPool,
    kind: DbKind,
    session_id: &str,
    limit: i64,
    offset: i64,
) -> StoreResult<Vec<ContactRow>> {
    let query = format!(
        "SELECT {} FROM contacts WHERE session_id = ? ORDER BY last_message_at DESC LIMIT ? OFFSET ?",
        CONTACT_COLS
    );
    let sql = rewrite_sql(&query, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(session_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(map_contact).collect::<Result<_, _>>().map_err(classify)
}

/// Atomic unread reset for mark-as-read.
pub async fn reset_contact_unread(
    pool: &AnyPool,
    kind: DbKind,
    session_id: &str,
    jid: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        "UPDATE contacts SET unread_count = 0, updated_at = ? WHERE session_id = ? AND jid = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(session_id)
        .bind(jid)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_contact_flag(
    pool: &AnyPool,
    kind: DbKind,
    session_id: &str,
    jid: &str,
    flag: &str,
    value: bool,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let column = match flag {
        "pin" => "pinned",
        "archive" => "archived",
        "mute" => "muted",
        _ => return Ok(()),
    };
    let sql = rewrite_sql(
        &format!(
            "UPDATE contacts SET {} = ?, updated_at = ? WHERE session_id = ? AND jid = ?",
            column
        ),
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(bool_to_i64(value))
        .bind(datetime_to_i64(now))
        .bind(session_id)
        .bind(jid)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn link_contact_customer(
    pool: &AnyPool,
    kind: DbKind,
    session_id: &str,
    jid: &str,
    customer_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        "UPDATE contacts SET customer_id = ?, updated_at = ? WHERE session_id = ? AND jid = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(customer_id)
        .bind(datetime_to_i64(now))
        .bind(session_id)
        .bind(jid)
        .execute(pool)
        .await?;
    Ok(())
}

// ----------------------------------------------------------------- messages

fn map_message(row: &AnyRow) -> Result<MessageRow, sqlx::Error> {
    Ok(MessageRow {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        external_id: row.try_get("external_id")?,
        jid: row.try_get("jid")?,
        direction: row.try_get("direction")?,
        msg_type: row.try_get("msg_type")?,
        content: row.try_get("content")?,
        media_url: row.try_get("media_url")?,
        quoted_id: row.try_get("quoted_id")?,
        status: row.try_get("status")?,
        from_me: row.try_get::<i64, _>("from_me")? != 0,
        ai_generated: row.try_get::<i64, _>("ai_generated")? != 0,
        ai_confidence: row.try_get("ai_confidence")?,
        timestamp: i64_to_datetime(row.try_get("timestamp")?),
        created_at: i64_to_datetime(row.try_get("created_at")?),
    })
}

const MESSAGE_COLS: &str = "id, session_id, external_id, jid, direction, msg_type, content, media_url, quoted_id, status, from_me, ai_generated, ai_confidence, timestamp, created_at";

pub async fn get_message_by_external_id(
    pool: &AnyPool,
    kind: DbKind,
    session_id: &str,
    external_id: &str,
) -> StoreResult<Option<MessageRow>> {
    let sql = rewrite_sql(
        &format!(
            "SELECT {} FROM messages WHERE session_id = ? AND external_id = ?",
            MESSAGE_COLS
        ),
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(session_id)
        .bind(external_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_message).transpose().map_err(classify)
}

async fn insert_message(pool: &AnyPool, kind: DbKind, record: &MessageRow) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO messages (
            id, session_id, external_id, jid, direction, msg_type, content, media_url,
            quoted_id, status, from_me, ai_generated, ai_confidence, timestamp, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    let sql = sql.as_ref();
    with_retry(move || {
        Box::pin(async move {
            sqlx::query(sql)
                .bind(&record.id)
                .bind(&record.session_id)
                .bind(&record.external_id)
                .bind(&record.jid)
                .bind(&record.direction)
                .bind(&record.msg_type)
                .bind(record.content.as_deref())
                .bind(record.media_url.as_deref())
                .bind(record.quoted_id.as_deref())
                .bind(&record.status)
                .bind(bool_to_i64(record.from_me))
                .bind(bool_to_i64(record.ai_generated))
                .bind(record.ai_confidence)
                .bind(datetime_to_i64(record.timestamp))
                .bind(datetime_to_i64(record.created_at))
                .execute(pool)
                .await
                .map(|_| ())
        })
    })
    .await
}

async fn update_message(pool: &AnyPool, kind: DbKind, record: &MessageRow) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"UPDATE messages SET
            content = ?, media_url = COALESCE(?, media_url), quoted_id = COALESCE(?, quoted_id),
            status = ?
        WHERE session_id = ? AND external_id = ?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(record.content.as_deref())
        .bind(record.media_url.as_deref())
        .bind(record.quoted_id.as_deref())
        .bind(&record.status)
        .bind(&record.session_id)
        .bind(&record.external_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Insert-or-update keyed by `(session_id, external_id)`. Returns `true`
/// when the row was newly inserted; a redelivered or superseding event
/// only rewrites the mutable fields of the existing row.
pub async fn upsert_message(pool: &AnyPool, kind: DbKind, record: &MessageRow) -> StoreResult<bool> {
    match get_message_by_external_id(pool, kind, &record.session_id, &record.external_id).await? {
        Some(_) => {
            update_message(pool, kind, record).await?;
            Ok(false)
        }
        None => {
            insert_message(pool, kind, record).await?;
            Ok(true)
        }
    }
}

/// Applies a delivery-status update, never downgrading an already
/// further-progressed status.
pub async fn advance_message_status(
    pool: &AnyPool,
    kind: DbKind,
    session_id: &str,
    external_id: &str,
    status: &str,
) -> StoreResult<bool> {
    let existing = match get_message_by_external_id(pool, kind, session_id, external_id).await? {
        Some(row) => row,
        None => return Ok(false),
    };
    if status_rank(status) <= status_rank(&existing.status) {
        return Ok(false);
    }
    let sql = rewrite_sql(
        "UPDATE messages SET status = ? WHERE session_id = ? AND external_id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(status)
        .bind(session_id)
        .bind(external_id)
        .execute(pool)
        .await?;
    Ok(true)
}

pub async fn list_messages(
    pool: &AnyPool,
    kind: DbKind,
    session_id: &str,
    jid: &str,
    limit: i64,
    offset: i64,
) -> StoreResult<Vec<MessageRow>> {
    let sql = rewrite_sql(
        &format!(
            "SELECT {} FROM messages WHERE session_id = ? AND jid = ? ORDER BY timestamp DESC LIMIT ? OFFSET ?",
            MESSAGE_COLS
        ),
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(session_id)
        .bind(jid)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(map_message).collect::<Result<_, _>>().map_err(classify)
}

pub async fn count_messages(pool: &AnyPool, kind: DbKind, session_id: &str) -> StoreResult<i64> {
    let sql = rewrite_sql("SELECT COUNT(1) FROM messages WHERE session_id = ?", kind);
    let count = sqlx::query_scalar::<_, i64>(sql.as_ref())
        .bind(session_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ------------------------------------------------------------ status updates

pub async fn insert_status_update(
    pool: &AnyPool,
    kind: DbKind,
    record: &StatusUpdateRow,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO status_updates (id, session_id, jid, msg_type, content, media_url, expires_at, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.jid)
        .bind(&record.msg_type)
        .bind(record.content.as_deref())
        .bind(record.media_url.as_deref())
        .bind(datetime_to_i64(record.expires_at))
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_expired_status_updates(
    pool: &AnyPool,
    kind: DbKind,
    now: DateTime<Utc>,
) -> StoreResult<u64> {
    let sql = rewrite_sql("DELETE FROM status_updates WHERE expires_at <= ?", kind);
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------- customers

fn map_customer(row: &AnyRow) -> Result<CustomerRow, sqlx::Error> {
    Ok(CustomerRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        phone: row.try_get("phone")?,
        name: row.try_get("name")?,
        avatar_url: row.try_get("avatar_url")?,
        status: row.try_get("status")?,
        created_at: i64_to_datetime(row.try_get("created_at")?),
        updated_at: i64_to_datetime(row.try_get("updated_at")?),
    })
}

pub async fn get_customer_by_phone(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: &str,
    phone: &str,
) -> StoreResult<Option<CustomerRow>> {
    let sql = rewrite_sql(
        "SELECT id, tenant_id, phone, name, avatar_url, status, created_at, updated_at FROM customers WHERE tenant_id = ? AND phone = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(tenant_id)
        .bind(phone)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_customer).transpose().map_err(classify)
}

pub async fn insert_customer(pool: &AnyPool, kind: DbKind, record: &CustomerRow) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO customers (id, tenant_id, phone, name, avatar_url, status, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(tenant_id, phone) DO NOTHING"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.tenant_id)
        .bind(&record.phone)
        .bind(record.name.as_deref())
        .bind(record.avatar_url.as_deref())
        .bind(&record.status)
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_customer_avatar(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    avatar_url: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        "UPDATE customers SET avatar_url = ?, updated_at = ? WHERE id = ? AND avatar_url IS NULL",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(avatar_url)
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ------------------------------------------------------------- conversations

fn map_conversation(row: &AnyRow) -> Result<ConversationRow, sqlx::Error> {
    Ok(ConversationRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        customer_id: row.try_get("customer_id")?,
        channel: row.try_get("channel")?,
        status: row.try_get("status")?,
        unread_count: row.try_get("unread_count")?,
        last_message_at: opt_i64_to_datetime(row.try_get("last_message_at")?),
        preview: row.try_get("preview")?,
        created_at: i64_to_datetime(row.try_get("created_at")?),
    })
}

pub async fn get_active_conversation(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: &str,
    customer_id: &str,
    channel: &str,
) -> StoreResult<Option<ConversationRow>> {
    let sql = rewrite_sql(
        r#"SELECT id, tenant_id, customer_id, channel, status, unread_count, last_message_at, preview, created_at
           FROM conversations
           WHERE tenant_id = ? AND customer_id = ? AND channel = ? AND status = 'active'
           LIMIT 1"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(tenant_id)
        .bind(customer_id)
        .bind(channel)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_conversation).transpose().map_err(classify)
}

pub async fn insert_conversation(
    pool: &AnyPool,
    kind: DbKind,
    record: &ConversationRow,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO conversations (id, tenant_id, customer_id, channel, status, unread_count, last_message_at, preview, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.tenant_id)
        .bind(&record.customer_id)
        .bind(&record.channel)
        .bind(&record.status)
        .bind(record.unread_count)
        .bind(record.last_message_at.map(datetime_to_i64))
        .bind(record.preview.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn bump_conversation(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    preview: Option<&str>,
    unread_delta: i64,
    last_message_at: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"UPDATE conversations SET
            preview = COALESCE(?, preview),
            unread_count = unread_count + ?,
            last_message_at = ?
        WHERE id = ?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(preview)
        .bind(unread_delta)
        .bind(datetime_to_i64(last_message_at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn insert_conversation_message(
    pool: &AnyPool,
    kind: DbKind,
    record: &ConversationMessageRow,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO conversation_messages (id, conversation_id, direction, msg_type, content, external_id, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.conversation_id)
        .bind(&record.direction)
        .bind(&record.msg_type)
        .bind(record.content.as_deref())
        .bind(record.external_id.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

// ----------------------------------------------------- notification settings

pub async fn get_notification_settings(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: &str,
) -> StoreResult<Option<NotificationSettingsRow>> {
    let sql = rewrite_sql(
        "SELECT tenant_id, enabled, default_session_id, quiet_start, quiet_end, updated_at FROM notification_settings WHERE tenant_id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(Some(NotificationSettingsRow {
            tenant_id: row.try_get("tenant_id").map_err(classify)?,
            enabled: row.try_get::<i64, _>("enabled").map_err(classify)? != 0,
            default_session_id: row.try_get("default_session_id").map_err(classify)?,
            quiet_start: row.try_get("quiet_start").map_err(classify)?,
            quiet_end: row.try_get("quiet_end").map_err(classify)?,
            updated_at: i64_to_datetime(row.try_get("updated_at").map_err(classify)?),
        })),
        None => Ok(None),
    }
}

pub async fn upsert_notification_settings(
    pool: &AnyPool,
    kind: DbKind,
    record: &NotificationSettingsRow,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO notification_settings (tenant_id, enabled, default_session_id, quiet_start, quiet_end, updated_at)
           VALUES (?, ?, ?, ?, ?, ?)
           ON CONFLICT(tenant_id) DO UPDATE SET
             enabled=excluded.enabled,
             default_session_id=excluded.default_session_id,
             quiet_start=excluded.quiet_start,
             quiet_end=excluded.quiet_end,
             updated_at=excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.tenant_id)
        .bind(bool_to_i64(record.enabled))
        .bind(record.default_session_id.as_deref())
        .bind(record.quiet_start.as_deref())
        .bind(record.quiet_end.as_deref())
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

// ----------------------------------------------------- notification templates

fn map_template(row: &AnyRow) -> Result<NotificationTemplateRow, sqlx::Error> {
    let buttons: Option<String> = row.try_get("buttons")?;
    Ok(NotificationTemplateRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        event_type: row.try_get("event_type")?,
        category: row.try_get("category")?,
        body: row.try_get("body")?,
        buttons: buttons.and_then(|v| serde_json::from_str(&v).ok()),
        active: row.try_get::<i64, _>("active")? != 0,
        usage_count: row.try_get("usage_count")?,
        created_at: i64_to_datetime(row.try_get("created_at")?),
        updated_at: i64_to_datetime(row.try_get("updated_at")?),
    })
}

const TEMPLATE_COLS: &str = "id, tenant_id, event_type, category, body, buttons, active, usage_count, created_at, updated_at";

pub async fn upsert_template(
    pool: &AnyPool,
    kind: DbKind,
    record: &NotificationTemplateRow,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO notification_templates (id, tenant_id, event_type, category, body, buttons, active, usage_count, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
             body=excluded.body,
             buttons=excluded.buttons,
             category=excluded.category,
             active=excluded.active,
             updated_at=excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(record.tenant_id.as_deref())
        .bind(&record.event_type)
        .bind(&record.category)
        .bind(&record.body)
        .bind(record.buttons.as_ref().map(|v| v.to_string()))
        .bind(bool_to_i64(record.active))
        .bind(record.usage_count)
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

/// Tenant-specific template first, system default (NULL tenant) as the
/// fallback.
pub async fn find_template(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: &str,
    event_type: &str,
) -> StoreResult<Option<NotificationTemplateRow>> {
    let sql = rewrite_sql(
        &format!(
            r#"SELECT {} FROM notification_templates
               WHERE event_type = ? AND active = 1 AND (tenant_id = ? OR tenant_id IS NULL)
               ORDER BY CASE WHEN tenant_id IS NULL THEN 1 ELSE 0 END
               LIMIT 1"#,
            TEMPLATE_COLS
        ),
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(event_type)
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_template).transpose().map_err(classify)
}

pub async fn list_templates(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: &str,
) -> StoreResult<Vec<NotificationTemplateRow>> {
    let sql = rewrite_sql(
        &format!(
            "SELECT {} FROM notification_templates WHERE tenant_id = ? OR tenant_id IS NULL ORDER BY event_type ASC",
            TEMPLATE_COLS
        ),
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).bind(tenant_id).fetch_all(pool).await?;
    rows.iter().map(map_template).collect::<Result<_, _>>().map_err(classify)
}

pub async fn bump_template_usage(pool: &AnyPool, kind: DbKind, id: &str) -> StoreResult<()> {
    let sql = rewrite_sql(
        "UPDATE notification_templates SET usage_count = usage_count + 1 WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref()).bind(id).execute(pool).await?;
    Ok(())
}

// ---------------------------------------------------------- notification logs

fn map_log(row: &AnyRow) -> Result<NotificationLogRow, sqlx::Error> {
    Ok(NotificationLogRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        recipient: row.try_get("recipient")?,
        event_type: row.try_get("event_type")?,
        category: row.try_get("category")?,
        content: row.try_get("content")?,
        status: row.try_get("status")?,
        transport_message_id: row.try_get("transport_message_id")?,
        failure_reason: row.try_get("failure_reason")?,
        source_kind: row.try_get("source_kind")?,
        source_id: row.try_get("source_id")?,
        created_at: i64_to_datetime(row.try_get("created_at")?),
        updated_at: i64_to_datetime(row.try_get("updated_at")?),
    })
}

const LOG_COLS: &str = "id, tenant_id, recipient, event_type, category, content, status, transport_message_id, failure_reason, source_kind, source_id, created_at, updated_at";

pub async fn insert_notification_log(
    pool: &AnyPool,
    kind: DbKind,
    record: &NotificationLogRow,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO notification_logs (id, tenant_id, recipient, event_type, category, content, status, transport_message_id, failure_reason, source_kind, source_id, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.tenant_id)
        .bind(&record.recipient)
        .bind(&record.event_type)
        .bind(&record.category)
        .bind(&record.content)
        .bind(&record.status)
        .bind(record.transport_message_id.as_deref())
        .bind(record.failure_reason.as_deref())
        .bind(record.source_kind.as_deref())
        .bind(record.source_id.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_notification_log_result(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    status: &str,
    transport_message_id: Option<&str>,
    failure_reason: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        "UPDATE notification_logs SET status = ?, transport_message_id = ?, failure_reason = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(status)
        .bind(transport_message_id)
        .bind(failure_reason)
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_notification_logs(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: &str,
    limit: i64,
    offset: i64,
) -> StoreResult<Vec<NotificationLogRow>> {
    let sql = rewrite_sql(
        &format!(
            "SELECT {} FROM notification_logs WHERE tenant_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
            LOG_COLS
        ),
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(tenant_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(map_log).collect::<Result<_, _>>().map_err(classify)
}

pub async fn notification_log_counts(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: &str,
) -> StoreResult<Vec<(String, i64)>> {
    let sql = rewrite_sql(
        "SELECT status, COUNT(1) AS total FROM notification_logs WHERE tenant_id = ? GROUP BY status",
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).bind(tenant_id).fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push((
            row.try_get("status").map_err(classify)?,
            row.try_get("total").map_err(classify)?,
        ));
    }
    Ok(out)
}

// --------------------------------------------------------- notification queue

fn map_queue_item(row: &AnyRow) -> Result<NotificationQueueRow, sqlx::Error> {
    Ok(NotificationQueueRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        recipient: row.try_get("recipient")?,
        event_type: row.try_get("event_type")?,
        category: row.try_get("category")?,
        content: row.try_get("content")?,
        priority: row.try_get("priority")?,
        scheduled_at: i64_to_datetime(row.try_get("scheduled_at")?),
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        status: row.try_get("status")?,
        last_error: row.try_get("last_error")?,
        source_kind: row.try_get("source_kind")?,
        source_id: row.try_get("source_id")?,
        created_at: i64_to_datetime(row.try_get("created_at")?),
        updated_at: i64_to_datetime(row.try_get("updated_at")?),
    })
}

const QUEUE_COLS: &str = "id, tenant_id, recipient, event_type, category, content, priority, scheduled_at, retry_count, max_retries, status, last_error, source_kind, source_id, created_at, updated_at";

pub async fn insert_queue_item(
    pool: &AnyPool,
    kind: DbKind,
    record: &NotificationQueueRow,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO notification_queue (id, tenant_id, recipient, event_type, category, content, priority, scheduled_at, retry_count, max_retries, status, last_error, source_kind, source_id, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.tenant_id)
        .bind(&record.recipient)
        .bind(&record.event_type)
        .bind(&record.category)
        .bind(&record.content)
        .bind(record.priority)
        .bind(datetime_to_i64(record.scheduled_at))
        .bind(record.retry_count)
        .bind(record.max_retries)
        .bind(&record.status)
        .bind(record.last_error.as_deref())
        .bind(record.source_kind.as_deref())
        .bind(record.source_id.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

/// Claims a batch of due items (highest priority first, oldest schedule
/// first) and marks them PROCESSING so a second poller pass will not pick
/// them up again.
pub async fn claim_due_queue_items(
    pool: &AnyPool,
    kind: DbKind,
    now: DateTime<Utc>,
    limit: i64,
) -> StoreResult<Vec<NotificationQueueRow>> {
    let sql = rewrite_sql(
        &format!(
            r#"SELECT {} FROM notification_queue
               WHERE status = 'PENDING' AND scheduled_at <= ?
               ORDER BY priority DESC, scheduled_at ASC
               LIMIT ?"#,
            QUEUE_COLS
        ),
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(limit)
        .fetch_all(pool)
        .await?;

    let items: Vec<NotificationQueueRow> = rows
        .iter()
        .map(map_queue_item)
        .collect::<Result<_, _>>()
        .map_err(classify)?;

    if !items.is_empty() {
        let ids: Vec<&str> = items.iter().map(|r| r.id.as_str()).collect();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let base_sql = format!(
            "UPDATE notification_queue SET status='PROCESSING', updated_at=? WHERE id IN ({})",
            placeholders
        );
        let update_sql = rewrite_sql(&base_sql, kind);
        let mut query = sqlx::query(update_sql.as_ref()).bind(datetime_to_i64(now));
        for id in ids {
            query = query.bind(id);
        }
        query.execute(pool).await?;
    }

    Ok(items)
}

pub async fn complete_queue_item(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        "UPDATE notification_queue SET status='SENT', last_error=NULL, updated_at=? WHERE id=?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn requeue_item(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    retry_count: i64,
    next_attempt_at: DateTime<Utc>,
    error: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        "UPDATE notification_queue SET status='PENDING', retry_count=?, scheduled_at=?, last_error=?, updated_at=? WHERE id=?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(retry_count)
        .bind(datetime_to_i64(next_attempt_at))
        .bind(error)
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn fail_queue_item(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    retry_count: i64,
    error: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = rewrite_sql(
        "UPDATE notification_queue SET status='FAILED', retry_count=?, last_error=?, updated_at=? WHERE id=?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(retry_count)
        .bind(error)
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_queue_item(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
) -> StoreResult<Option<NotificationQueueRow>> {
    let sql = rewrite_sql(
        &format!("SELECT {} FROM notification_queue WHERE id = ?", QUEUE_COLS),
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(map_queue_item).transpose().map_err(classify)
}

pub async fn notification_queue_counts(
    pool: &AnyPool,
    kind: DbKind,
    tenant_id: &str,
) -> StoreResult<Vec<(String, i64)>> {
    let sql = rewrite_sql(
        "SELECT status, COUNT(1) AS total FROM notification_queue WHERE tenant_id = ? GROUP BY status",
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).bind(tenant_id).fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push((
            row.try_get("status").map_err(classify)?,
            row.try_get("total").map_err(classify)?,
        ));
    }
    Ok(out)
}

pub async fn count_pending_queue(pool: &AnyPool, kind: DbKind) -> StoreResult<i64> {
    let sql = rewrite_sql(
        "SELECT COUNT(1) FROM notification_queue WHERE status = 'PENDING'",
        kind,
    );
    let count = sqlx::query_scalar::<_, i64>(sql.as_ref()).fetch_one(pool).await?;
    Ok(count)
}

pub async fn count_sessions(pool: &AnyPool, kind: DbKind) -> StoreResult<i64> {
    let sql = rewrite_sql("SELECT COUNT(1) FROM sessions", kind);
    let count = sqlx::query_scalar::<_, i64>(sql.as_ref()).fetch_one(pool).await?;
    Ok(count)
}

pub async fn count_all_messages(pool: &AnyPool, kind: DbKind) -> StoreResult<i64> {
    let sql = rewrite_sql("SELECT COUNT(1) FROM messages", kind);
    let count = sqlx::query_scalar::<_, i64>(sql.as_ref()).fetch_one(pool).await?;
    Ok(count)
}
