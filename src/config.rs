use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub cache: CacheConfig,
    pub contacts: ContactsConfig,
    pub dedup: DedupConfig,
    pub spool: SpoolConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.msg-gateway/state.sqlite".to_string(),
            max_connections: 8,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub load_lock_ttl_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            load_lock_ttl_secs: 10,
            poll_interval_ms: 200,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn load_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.load_lock_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactsConfig {
    pub max_resolve_attempts: u32,
    pub max_name_length: usize,
    pub describe_timeout_ms: u64,
}

impl Default for ContactsConfig {
    fn default() -> Self {
        Self {
            max_resolve_attempts: 5,
            max_name_length: 128,
            describe_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub msgs_key: String,
    pub external_ids_key: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            msgs_key: "seen-msgs".to_string(),
            external_ids_key: "seen-external-ids".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub dir: String,
    pub flush_interval_secs: u64,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            dir: "~/.msg-gateway/spool".to_string(),
            flush_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { timeout_ms: 15_000 }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
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
    env::var("MSG_GATEWAY_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.msg-gateway/msg-gateway.json"))
}

pub fn ensure_config_dir() {
    let path = resolve_config_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();
    let mut cfg = Config::default();

    if config_path.exists() {
        match fs::read_to_string(&config_path) {
            Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                Ok(file_cfg) => cfg = file_cfg,
                Err(err) => {
                    tracing::warn!("ignoring unparseable config {}: {err}", config_path.display())
                }
            },
            Err(err) => tracing::warn!("cannot read config {}: {err}", config_path.display()),
        }
    }

    apply_env_overrides(&mut cfg);
    cfg
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(url) = env_value("MSG_GATEWAY_DATABASE_URL") {
        cfg.database.url = Some(url);
    }

    if let Some(path) = env_value("MSG_GATEWAY_SQLITE_PATH") {
        cfg.database.sqlite_path = path;
    }

    if let Some(url) = env_value("MSG_GATEWAY_REDIS_URL") {
        cfg.redis.url = Some(url);
    }

    if let Some(dir) = env_value("MSG_GATEWAY_SPOOL_DIR") {
        cfg.spool.dir = dir;
    }
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}?mode=rwc", path.to_string_lossy())
}

pub fn resolve_spool_dir(cfg: &Config) -> PathBuf {
    expand_tilde(&cfg.spool.dir)
}
