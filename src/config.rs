use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub sidecar: SidecarConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8095,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.chatlink/state.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub dir: String,
    pub base_url: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            dir: "~/.chatlink/media".to_string(),
            base_url: "/media".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarConfig {
    pub url: String,
    pub event_wait_seconds: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:4040".to_string(),
            event_wait_seconds: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AiConfig {
    pub url: Option<String>,
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub reconnect_delay_seconds: u64,
    pub credential_debounce_ms: u64,
    pub staleness_window_seconds: i64,
    pub typing_ms_per_char: u64,
    pub typing_max_ms: u64,
    pub default_country_code: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_seconds: 5,
            credential_debounce_ms: 1000,
            staleness_window_seconds: 60,
            typing_ms_per_char: 30,
            typing_max_ms: 5000,
            default_country_code: "20".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub poll_interval_seconds: u64,
    pub batch_size: i64,
    pub item_delay_ms: u64,
    pub retry_delay_seconds: i64,
    pub max_retries: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 10,
            batch_size: 10,
            item_delay_ms: 2000,
            retry_delay_seconds: 300,
            max_retries: 3,
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("CHATLINK_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.chatlink/chatlink.json"))
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();

    let mut cfg = Config::default();

    if config_path.exists() {
        if let Ok(raw) = fs::read_to_string(&config_path) {
            if let Ok(file_cfg) = serde_json::from_str::<Config>(&raw) {
                cfg = file_cfg;
            }
        }
    }

    // Override from environment
    if let Ok(token) = env::var("CHATLINK_TOKEN") {
        if !token.trim().is_empty() {
            cfg.auth.token = Some(token);
        }
    }

    if let Ok(url) = env::var("CHATLINK_DATABASE_URL") {
        if !url.trim().is_empty() {
            cfg.database.url = Some(url);
        }
    }

    if let Ok(path) = env::var("CHATLINK_SQLITE_PATH") {
        if !path.trim().is_empty() {
            cfg.database.sqlite_path = path;
        }
    }

    if let Ok(dir) = env::var("CHATLINK_MEDIA_DIR") {
        if !dir.trim().is_empty() {
            cfg.media.dir = dir;
        }
    }

    if let Ok(url) = env::var("CHATLINK_SIDECAR_URL") {
        if !url.trim().is_empty() {
            cfg.sidecar.url = url;
        }
    }

    if let Ok(url) = env::var("CHATLINK_AI_URL") {
        if !url.trim().is_empty() {
            cfg.ai.url = Some(url);
        }
    }

    if let Ok(token) = env::var("CHATLINK_AI_TOKEN") {
        if !token.trim().is_empty() {
            cfg.ai.api_token = Some(token);
        }
    }

    cfg
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}", path.to_string_lossy())
}

pub fn resolve_media_dir(cfg: &Config) -> PathBuf {
    let dir = expand_tilde(&cfg.media.dir);
    let _ = fs::create_dir_all(&dir);
    dir
}
