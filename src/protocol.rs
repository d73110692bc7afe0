//! Boundary to the external messaging protocol.
//!
//! The wire protocol itself lives in a sidecar process and is consumed as
//! an opaque client: `ProtocolClient::connect` yields a connection handle
//! for imperative operations plus an ordered stream of events for that
//! session. `SidecarClient` is the production implementation, speaking
//! plain HTTP to the sidecar and long-polling its event feed.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Close codes reported by the protocol layer, folded into the three
/// classes the session lifecycle cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    LoggedOut,
    AuthCorruption,
    Replaced,
    TimedOut,
    ConnectionLost,
    Other(String),
}

impl DisconnectReason {
    pub fn classify(code: Option<u16>, message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("bad mac")
            || lower.contains("failed to decrypt")
            || lower.contains("invalid mac")
        {
            return DisconnectReason::AuthCorruption;
        }
        match code {
            Some(401) => DisconnectReason::LoggedOut,
            Some(403) => DisconnectReason::LoggedOut,
            Some(440) => DisconnectReason::Replaced,
            Some(408) => DisconnectReason::TimedOut,
            Some(_) => DisconnectReason::ConnectionLost,
            None => {
                if lower.contains("logged out") {
                    DisconnectReason::LoggedOut
                } else if lower.is_empty() {
                    DisconnectReason::ConnectionLost
                } else {
                    DisconnectReason::Other(message.to_string())
                }
            }
        }
    }

    pub fn is_logged_out(&self) -> bool {
        matches!(self, DisconnectReason::LoggedOut)
    }

    /// Credential corruption is fatal for the session regardless of any
    /// other flag: reconnecting with the same key material would fail the
    /// same way forever.
    pub fn is_auth_corruption(&self) -> bool {
        matches!(self, DisconnectReason::AuthCorruption)
    }
}

/// A single raw message event as delivered by the protocol layer.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub id: String,
    pub chat: String,
    #[serde(default)]
    pub participant: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub push_name: Option<String>,
    pub timestamp: i64,
    pub payload: Value,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContactUpdate {
    pub jid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    ConnectionUpdate {
        qr: Option<String>,
        pairing_code: Option<String>,
    },
    Opened {
        phone: String,
    },
    Closed {
        code: Option<u16>,
        message: String,
    },
    CredsUpdate {
        credential: Option<Value>,
        keys: BTreeMap<String, BTreeMap<String, Option<Vec<u8>>>>,
    },
    Messages {
        live: bool,
        items: Vec<RawMessage>,
    },
    MessageStatus {
        id: String,
        chat: String,
        status: String,
    },
    Presence {
        chat: String,
        state: String,
    },
    CallUpdate {
        from: String,
        status: String,
    },
    ContactsUpdate {
        items: Vec<ContactUpdate>,
    },
    GroupsUpdate {
        items: Vec<Value>,
    },
}

/// Imperative operations on a live connection. The handle stays valid
/// until a `Closed` event is observed for it.
#[async_trait]
pub trait ProtocolConnection: Send + Sync {
    /// Transmits a prepared message payload, returning the
    /// protocol-assigned message id.
    async fn send(&self, to: &str, payload: &Value) -> anyhow::Result<String>;

    async fn download_media(&self, message_id: &str) -> anyhow::Result<bytes::Bytes>;

    async fn send_presence(&self, to: &str, state: &str) -> anyhow::Result<()>;

    async fn chat_modify(&self, jid: &str, action: &str) -> anyhow::Result<()>;

    async fn profile_picture(&self, jid: &str) -> anyhow::Result<Option<String>>;

    async fn group_metadata(&self, jid: &str) -> anyhow::Result<Value>;

    async fn logout(&self) -> anyhow::Result<()>;
}

/// Opens protocol connections. One call per session lifecycle attempt;
/// reconnects go through a fresh `connect`.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn connect(
        &self,
        session_id: &str,
        credential: Option<Value>,
    ) -> anyhow::Result<(Arc<dyn ProtocolConnection>, mpsc::Receiver<ProtocolEvent>)>;
}

pub struct SidecarClient {
    http: reqwest::Client,
    base_url: String,
    event_wait_seconds: u64,
}

impl SidecarClient {
    pub fn new(http: reqwest::Client, base_url: String, event_wait_seconds: u64) -> Self {
        Self {
            http,
            base_url,
            event_wait_seconds,
        }
    }
}

struct SidecarConnection {
    http: reqwest::Client,
    base_url: String,
    session_id: String,
}

impl SidecarConnection {
    fn url(&self, suffix: &str) -> String {
        format!("{}/sessions/{}/{}", self.base_url, self.session_id, suffix)
    }

    async fn post_json(&self, suffix: &str, body: &Value) -> anyhow::Result<Value> {
        let resp = self.http.post(self.url(suffix)).json(body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("sidecar error: {} {}", status, body));
        }
        Ok(resp.json().await.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ProtocolConnection for SidecarConnection {
    async fn send(&self, to: &str, payload: &Value) -> anyhow::Result<String> {
        let body = serde_json::json!({"to": to, "payload": payload});
        let value = self.post_json("messages", &body).await?;
        value
            .get("message_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("sidecar send returned no message id"))
    }

    async fn download_media(&self, message_id: &str) -> anyhow::Result<bytes::Bytes> {
        let resp = self
            .http
            .get(self.url(&format!("media/{}", message_id)))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("media download failed: {}", resp.status()));
        }
        Ok(resp.bytes().await?)
    }

    async fn send_presence(&self, to: &str, state: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({"to": to, "state": state});
        self.post_json("presence", &body).await?;
        Ok(())
    }

    async fn chat_modify(&self, jid: &str, action: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({"jid": jid, "action": action});
        self.post_json("chat-modify", &body).await?;
        Ok(())
    }

    async fn profile_picture(&self, jid: &str) -> anyhow::Result<Option<String>> {
        let resp = self
            .http
            .get(self.url("profile-picture"))
            .query(&[("jid", jid)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let value: Value = resp.json().await?;
        Ok(value
            .get("url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }

    async fn group_metadata(&self, jid: &str) -> anyhow::Result<Value> {
        let resp = self
            .http
            .get(self.url(&format!("groups/{}", jid)))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("group metadata failed: {}", resp.status()));
        }
        Ok(resp.json().await?)
    }

    async fn logout(&self) -> anyhow::Result<()> {
        self.post_json("logout", &Value::Null).await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for SidecarClient {
    async fn connect(
        &self,
        session_id: &str,
        credential: Option<Value>,
    ) -> anyhow::Result<(Arc<dyn ProtocolConnection>, mpsc::Receiver<ProtocolEvent>)> {
        let body = serde_json::json!({"credential": credential});
        let resp = self
            .http
            .post(format!("{}/sessions/{}/connect", self.base_url, session_id))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("sidecar connect failed: {} {}", status, text));
        }

        let (tx, rx) = mpsc::channel::<ProtocolEvent>(100);
        let http = self.http.clone();
        let events_url = format!("{}/sessions/{}/events", self.base_url, session_id);
        let wait = self.event_wait_seconds;
        tokio::spawn(async move {
            run_event_poller(http, events_url, wait, tx).await;
        });

        let conn = Arc::new(SidecarConnection {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            session_id: session_id.to_string(),
        });
        Ok((conn, rx))
    }
}

/// Long-polls the sidecar event feed and forwards parsed events in
/// arrival order. Exits when the receiver is dropped or after forwarding
/// a close event.
async fn run_event_poller(
    http: reqwest::Client,
    events_url: String,
    wait_seconds: u64,
    tx: mpsc::Sender<ProtocolEvent>,
) {
    loop {
        let resp = http
            .get(&events_url)
            .query(&[("wait", wait_seconds.to_string())])
            .send()
            .await;
        let batch = match resp {
            Ok(resp) if resp.status().is_success() => {
                resp.json::<Vec<Value>>().await.unwrap_or_default()
            }
            Ok(resp) => {
                debug!("event poll returned {}", resp.status());
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
            Err(err) => {
                debug!("event poll failed: {err:#}");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        for raw in batch {
            let Some(event) = parse_sidecar_event(&raw) else {
                warn!("unrecognized sidecar event: {raw}");
                continue;
            };
            let closing = matches!(event, ProtocolEvent::Closed { .. });
            if tx.send(event).await.is_err() {
                return;
            }
            if closing {
                return;
            }
        }
    }
}

pub fn parse_sidecar_event(raw: &Value) -> Option<ProtocolEvent> {
    let kind = raw.get("type").and_then(|v| v.as_str())?;
    match kind {
        "connection.update" => Some(ProtocolEvent::ConnectionUpdate {
            qr: raw.get("qr").and_then(|v| v.as_str()).map(|s| s.to_string()),
            pairing_code: raw
                .get("pairing_code")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        }),
        "connection.open" => Some(ProtocolEvent::Opened {
            phone: raw
                .get("phone")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        "connection.close" => Some(ProtocolEvent::Closed {
            code: raw.get("code").and_then(|v| v.as_u64()).map(|v| v as u16),
            message: raw
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        "creds.update" => {
            let mut keys = BTreeMap::new();
            if let Some(categories) = raw.get("keys").and_then(|v| v.as_object()) {
                for (category, entries) in categories {
                    let mut decoded: BTreeMap<String, Option<Vec<u8>>> = BTreeMap::new();
                    if let Some(entries) = entries.as_object() {
                        for (id, value) in entries {
                            match value.as_str() {
                                Some(b64) => {
                                    if let Ok(bytes) = BASE64_STANDARD.decode(b64) {
                                        decoded.insert(id.clone(), Some(bytes));
                                    }
                                }
                                None => {
                                    decoded.insert(id.clone(), None);
                                }
                            }
                        }
                    }
                    keys.insert(category.clone(), decoded);
                }
            }
            Some(ProtocolEvent::CredsUpdate {
                credential: raw.get("credential").filter(|v| !v.is_null()).cloned(),
                keys,
            })
        }
        "messages.upsert" => {
            let live = raw
                .get("delivery")
                .and_then(|v| v.as_str())
                .map(|v| v == "notify")
                .unwrap_or_else(|| raw.get("live").and_then(|v| v.as_bool()).unwrap_or(false));
            let items = raw
                .get("items")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|item| serde_json::from_value(item.clone()).ok())
                        .collect()
                })
                .unwrap_or_default();
            Some(ProtocolEvent::Messages { live, items })
        }
        "messages.update" => Some(ProtocolEvent::MessageStatus {
            id: raw.get("id").and_then(|v| v.as_str())?.to_string(),
            chat: raw
                .get("chat")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            status: raw
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        "presence.update" => Some(ProtocolEvent::Presence {
            chat: raw.get("chat").and_then(|v| v.as_str())?.to_string(),
            state: raw
                .get("state")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        "call.update" => Some(ProtocolEvent::CallUpdate {
            from: raw.get("from").and_then(|v| v.as_str())?.to_string(),
            status: raw
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        "contacts.update" => {
            let items = raw
                .get("items")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|item| serde_json::from_value(item.clone()).ok())
                        .collect()
                })
                .unwrap_or_default();
            Some(ProtocolEvent::ContactsUpdate { items })
        }
        "groups.update" => Some(ProtocolEvent::GroupsUpdate {
            items: raw
                .get("items")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default(),
        }),
        _ => None,
    }
}
