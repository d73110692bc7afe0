use chatlink::credentials::{decode_state, encode_state, CredentialState, CredentialStore};
use chatlink::db::{self, DbKind};
use serde_json::json;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::collections::BTreeMap;
use std::time::Duration;

async fn test_pool() -> AnyPool {
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::init_db(&pool, DbKind::Sqlite).await.unwrap();
    pool
}

fn key_update(category: &str, id: &str, bytes: &[u8]) -> BTreeMap<String, BTreeMap<String, Option<Vec<u8>>>> {
    let mut entries = BTreeMap::new();
    entries.insert(id.to_string(), Some(bytes.to_vec()));
    let mut keys = BTreeMap::new();
    keys.insert(category.to_string(), entries);
    keys
}

#[test]
fn test_codec_roundtrips_raw_bytes_exactly() {
    let mut keys = BTreeMap::new();
    let mut sessions = BTreeMap::new();
    sessions.insert("peer.1".to_string(), vec![0u8, 1, 2, 253, 254, 255]);
    keys.insert("session".to_string(), sessions);
    let state = CredentialState {
        credential: Some(json!({"me": {"id": "201001234567:3@s.whatsapp.net"}})),
        keys_by_category: keys,
    };

    let blob = encode_state(&state).unwrap();
    assert_eq!(decode_state(&blob).unwrap(), state);
}

#[tokio::test]
async fn test_rapid_sets_coalesce_into_one_write() {
    let pool = test_pool().await;
    let store = CredentialStore::new(pool.clone(), DbKind::Sqlite, Duration::from_millis(80));

    for i in 0..10u8 {
        store
            .apply_update("s1", None, key_update("pre-key", &i.to_string(), &[i]))
            .await;
    }
    // All ten sets landed within the debounce window: nothing flushed yet.
    assert_eq!(store.write_count(), 0);
    assert!(db::load_credentials(&pool, DbKind::Sqlite, "s1").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.write_count(), 1);

    let blob = db::load_credentials(&pool, DbKind::Sqlite, "s1")
        .await
        .unwrap()
        .unwrap();
    let state = decode_state(&blob).unwrap();
    assert_eq!(state.keys_by_category["pre-key"].len(), 10);
}

#[tokio::test]
async fn test_save_flushes_immediately_and_cancels_timer() {
    let pool = test_pool().await;
    let store = CredentialStore::new(pool.clone(), DbKind::Sqlite, Duration::from_millis(200));

    store
        .apply_update("s1", Some(json!({"registration_id": 9})), BTreeMap::new())
        .await;
    store.save("s1").await;
    assert_eq!(store.write_count(), 1);
    assert!(db::load_credentials(&pool, DbKind::Sqlite, "s1").await.unwrap().is_some());

    // The pending debounce timer was cancelled; no second write follows.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn test_set_after_save_schedules_new_write() {
    let pool = test_pool().await;
    let store = CredentialStore::new(pool.clone(), DbKind::Sqlite, Duration::from_millis(50));

    store
        .apply_update("s1", Some(json!({"a": 1})), BTreeMap::new())
        .await;
    store.save("s1").await;
    store
        .apply_update("s1", Some(json!({"a": 2})), BTreeMap::new())
        .await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(store.write_count(), 2);

    let blob = db::load_credentials(&pool, DbKind::Sqlite, "s1")
        .await
        .unwrap()
        .unwrap();
    let state = decode_state(&blob).unwrap();
    assert_eq!(state.credential.unwrap()["a"], 2);
}

#[tokio::test]
async fn test_null_key_value_removes_entry() {
    let pool = test_pool().await;
    let store = CredentialStore::new(pool.clone(), DbKind::Sqlite, Duration::from_millis(20));

    store
        .apply_update("s1", None, key_update("app-state", "k1", &[1, 2, 3]))
        .await;
    let mut removal = BTreeMap::new();
    let mut entries: BTreeMap<String, Option<Vec<u8>>> = BTreeMap::new();
    entries.insert("k1".to_string(), None);
    removal.insert("app-state".to_string(), entries);
    store.apply_update("s1", None, removal).await;

    let got = store.get("s1", "app-state", &["k1".to_string()]).await;
    assert!(got.is_empty());
}

#[tokio::test]
async fn test_get_returns_partial_map() {
    let pool = test_pool().await;
    let store = CredentialStore::new(pool, DbKind::Sqlite, Duration::from_millis(20));

    store.apply_update("s1", None, key_update("sender-key", "g1", &[7])).await;
    store.apply_update("s1", None, key_update("sender-key", "g2", &[9])).await;

    let got = store
        .get(
            "s1",
            "sender-key",
            &["g1".to_string(), "missing".to_string()],
        )
        .await;
    assert_eq!(got.len(), 1);
    assert_eq!(got["g1"], vec![7]);
}

#[tokio::test]
async fn test_load_falls_back_to_store_and_caches() {
    let pool = test_pool().await;
    let kind = DbKind::Sqlite;
    let state = CredentialState {
        credential: Some(json!({"noise_key": "zzz"})),
        keys_by_category: BTreeMap::new(),
    };
    db::save_credentials(&pool, kind, "s1", &encode_state(&state).unwrap(), chrono::Utc::now())
        .await
        .unwrap();

    let store = CredentialStore::new(pool, kind, Duration::from_millis(20));
    let loaded = store.load("s1").await.unwrap();
    assert_eq!(loaded, state);
}

#[tokio::test]
async fn test_delete_wipes_cache_and_row() {
    let pool = test_pool().await;
    let store = CredentialStore::new(pool.clone(), DbKind::Sqlite, Duration::from_millis(20));

    store.apply_update("s1", Some(json!({"x": 1})), BTreeMap::new()).await;
    store.save("s1").await;
    assert!(db::load_credentials(&pool, DbKind::Sqlite, "s1").await.unwrap().is_some());

    store.delete("s1").await;
    assert!(db::load_credentials(&pool, DbKind::Sqlite, "s1").await.unwrap().is_none());
    let reloaded = store.load("s1").await.unwrap();
    assert!(reloaded.credential.is_none());
}

#[tokio::test]
async fn test_undecodable_blob_degrades_to_empty_state() {
    let pool = test_pool().await;
    db::save_credentials(&pool, DbKind::Sqlite, "s1", "corrupted ][", chrono::Utc::now())
        .await
        .unwrap();
    let store = CredentialStore::new(pool, DbKind::Sqlite, Duration::from_millis(20));
    let state = store.load("s1").await.unwrap();
    assert!(state.credential.is_none());
    assert!(state.keys_by_category.is_empty());
}
