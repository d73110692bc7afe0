use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;

/// A realtime event scoped to one tenant's room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    pub tenant_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsCommand {
    #[serde(rename = "connect")]
    Connect {
        token: Option<String>,
        tenant_id: String,
    },
    #[serde(rename = "subscribe")]
    Subscribe { events: Option<Vec<String>> },
    #[serde(rename = "ping")]
    Ping,
}

/// Fire-and-forget emit into the fan-out channel. Nobody listening is
/// not an error.
pub fn emit(
    tx: &broadcast::Sender<WsEvent>,
    tenant_id: &str,
    event: &str,
    payload: serde_json::Value,
) {
    let _ = tx.send(WsEvent {
        tenant_id: tenant_id.to_string(),
        event: event.to_string(),
        payload,
    });
}

pub async fn handle_ws(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<WsEvent>,
    auth_token: Option<String>,
) {
    let mut tenant: Option<String> = None;
    let mut subscriptions: Option<HashSet<String>> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                if msg.is_none() {
                    break;
                }
                if let Some(Ok(Message::Close(_))) = msg {
                    break;
                }
                if let Some(Ok(Message::Text(text))) = msg {
                    if let Ok(cmd) = serde_json::from_str::<WsCommand>(&text) {
                        match cmd {
                            WsCommand::Connect { token, tenant_id } => {
                                if let Some(expected) = auth_token.as_ref() {
                                    if token.as_deref() != Some(expected.as_str()) {
                                        let _ = socket.send(Message::Close(None)).await;
                                        break;
                                    }
                                }
                                let ack = WsEvent {
                                    tenant_id: tenant_id.clone(),
                                    event: "presence".to_string(),
                                    payload: serde_json::json!({"status": "connected"}),
                                };
                                tenant = Some(tenant_id);
                                let _ = socket.send(Message::Text(serde_json::to_string(&ack).unwrap_or_default())).await;
                            }
                            WsCommand::Subscribe { events } => {
                                subscriptions = events.map(|items| items.into_iter().collect());
                            }
                            WsCommand::Ping => {
                                let health = WsEvent {
                                    tenant_id: tenant.clone().unwrap_or_default(),
                                    event: "health".to_string(),
                                    payload: serde_json::json!({"status": "ok"}),
                                };
                                let _ = socket.send(Message::Text(serde_json::to_string(&health).unwrap_or_default())).await;
                            }
                        }
                    }
                }
            }
            evt = rx.recv() => {
                if let Ok(evt) = evt {
                    // Tenant rooms: nothing is delivered before connect,
                    // and never across tenants.
                    let Some(tenant) = tenant.as_ref() else {
                        continue;
                    };
                    if &evt.tenant_id != tenant {
                        continue;
                    }
                    if let Some(subs) = subscriptions.as_ref() {
                        if !subs.contains(&evt.event) {
                            continue;
                        }
                    }
                    let text = serde_json::to_string(&evt).unwrap_or_default();
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
