//! Per-session credential and key-material storage.
//!
//! Key material arrives from the protocol layer as raw byte buffers and
//! must round-trip exactly, so the persisted blob uses an explicit codec
//! with base64-encoded bytes. Reads are cache-first; writes are debounced
//! per session with cancel-and-reschedule semantics, except for the
//! immediate flush issued once per completed login.

use crate::db::{self, DbKind, StoreError, StoreResult};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::AnyPool;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredentialState {
    pub credential: Option<Value>,
    pub keys_by_category: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

#[derive(Serialize, Deserialize)]
struct EncodedState {
    credential: Option<Value>,
    keys: BTreeMap<String, BTreeMap<String, String>>,
}

pub fn encode_state(state: &CredentialState) -> StoreResult<String> {
    let mut keys = BTreeMap::new();
    for (category, entries) in &state.keys_by_category {
        let encoded: BTreeMap<String, String> = entries
            .iter()
            .map(|(id, bytes)| (id.clone(), BASE64_STANDARD.encode(bytes)))
            .collect();
        keys.insert(category.clone(), encoded);
    }
    let encoded = EncodedState {
        credential: state.credential.clone(),
        keys,
    };
    Ok(serde_json::to_string(&encoded)?)
}

pub fn decode_state(blob: &str) -> anyhow::Result<CredentialState> {
    let encoded: EncodedState = serde_json::from_str(blob)?;
    let mut keys_by_category = BTreeMap::new();
    for (category, entries) in encoded.keys {
        let mut decoded = BTreeMap::new();
        for (id, b64) in entries {
            decoded.insert(id, BASE64_STANDARD.decode(b64.as_bytes())?);
        }
        keys_by_category.insert(category, decoded);
    }
    Ok(CredentialState {
        credential: encoded.credential,
        keys_by_category,
    })
}

struct CredInner {
    pool: AnyPool,
    kind: DbKind,
    debounce: Duration,
    cache: Mutex<HashMap<String, CredentialState>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    perm_denied_logged: AtomicBool,
    writes: AtomicU64,
}

#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<CredInner>,
}

impl CredentialStore {
    pub fn new(pool: AnyPool, kind: DbKind, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(CredInner {
                pool,
                kind,
                debounce,
                cache: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                perm_denied_logged: AtomicBool::new(false),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Loads the credential state for a session, cache-first. A missing
    /// row yields the empty state (the session will go through pairing);
    /// an undecodable row is treated the same after a warning.
    pub async fn load(&self, session_id: &str) -> StoreResult<CredentialState> {
        {
            let cache = self.inner.cache.lock().await;
            if let Some(state) = cache.get(session_id) {
                return Ok(state.clone());
            }
        }
        let state = match db::load_credentials(&self.inner.pool, self.inner.kind, session_id).await? {
            Some(blob) => match decode_state(&blob) {
                Ok(state) => state,
                Err(err) => {
                    warn!("undecodable credential blob for {session_id}: {err:#}");
                    CredentialState::default()
                }
            },
            None => CredentialState::default(),
        };
        let mut cache = self.inner.cache.lock().await;
        Ok(cache.entry(session_id.to_string()).or_insert(state).clone())
    }

    /// Partial key lookup from the cached state.
    pub async fn get(
        &self,
        session_id: &str,
        category: &str,
        ids: &[String],
    ) -> BTreeMap<String, Vec<u8>> {
        let cache = self.inner.cache.lock().await;
        let mut out = BTreeMap::new();
        if let Some(entries) = cache
            .get(session_id)
            .and_then(|state| state.keys_by_category.get(category))
        {
            for id in ids {
                if let Some(bytes) = entries.get(id) {
                    out.insert(id.clone(), bytes.clone());
                }
            }
        }
        out
    }

    /// Merges a credential/key update into the cache and schedules a
    /// debounced write-back. A `None` key value removes the entry.
    pub async fn apply_update(
        &self,
        session_id: &str,
        credential: Option<Value>,
        keys: BTreeMap<String, BTreeMap<String, Option<Vec<u8>>>>,
    ) {
        {
            let mut cache = self.inner.cache.lock().await;
            let state = cache.entry(session_id.to_string()).or_default();
            if credential.is_some() {
                state.credential = credential;
            }
            for (category, entries) in keys {
                let slot = state.keys_by_category.entry(category).or_default();
                for (id, bytes) in entries {
                    match bytes {
                        Some(bytes) => {
                            slot.insert(id, bytes);
                        }
                        None => {
                            slot.remove(&id);
                        }
                    }
                }
            }
        }
        self.schedule_flush(session_id).await;
    }

    /// Immediate unconditional flush, bypassing any pending debounce.
    pub async fn save(&self, session_id: &str) {
        {
            let mut timers = self.inner.timers.lock().await;
            if let Some(handle) = timers.remove(session_id) {
                handle.abort();
            }
        }
        self.flush(session_id).await;
    }

    /// Drops the cached state, aborts any pending write and deletes the
    /// persisted row.
    pub async fn delete(&self, session_id: &str) {
        {
            let mut timers = self.inner.timers.lock().await;
            if let Some(handle) = timers.remove(session_id) {
                handle.abort();
            }
        }
        self.inner.cache.lock().await.remove(session_id);
        if let Err(err) =
            db::delete_credentials(&self.inner.pool, self.inner.kind, session_id).await
        {
            error!("credential delete failed for {session_id}: {err}");
        }
    }

    /// Number of completed store writes, for the status surface and the
    /// write-coalescing checks.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    async fn schedule_flush(&self, session_id: &str) {
        let mut timers = self.inner.timers.lock().await;
        if let Some(handle) = timers.remove(session_id) {
            handle.abort();
        }
        let store = self.clone();
        let id = session_id.to_string();
        let debounce = self.inner.debounce;
        timers.insert(
            session_id.to_string(),
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                store.flush(&id).await;
            }),
        );
    }

    async fn flush(&self, session_id: &str) {
        let blob = {
            let cache = self.inner.cache.lock().await;
            match cache.get(session_id) {
                Some(state) => match encode_state(state) {
                    Ok(blob) => blob,
                    Err(err) => {
                        error!("credential encode failed for {session_id}: {err}");
                        return;
                    }
                },
                None => return,
            }
        };
        match db::save_credentials(
            &self.inner.pool,
            self.inner.kind,
            session_id,
            &blob,
            chrono::Utc::now(),
        )
        .await
        {
            Ok(()) => {
                self.inner.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(StoreError::PermissionDenied(msg)) => {
                // The cache stays authoritative for the rest of the
                // process lifetime; only the first denial is logged.
                if !self.inner.perm_denied_logged.swap(true, Ordering::Relaxed) {
                    warn!("credential writes denied by store, continuing in-memory: {msg}");
                }
            }
            Err(err) => {
                error!("credential write failed for {session_id}: {err}");
            }
        }
    }
}
