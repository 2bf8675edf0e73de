use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::codec::KeyPair;
use crate::error::ConfigError;

/// Root configuration for docsession.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub store: StoreConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
}

/// Which timestamp semantic a store keeps on its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TimestampMode {
    /// Timestamp moves only on save.
    #[default]
    Modified,
    /// Timestamp also moves on every load, so TTL expiry counts from last access.
    LastAccessed,
}

impl TimestampMode {
    /// Name of the record field holding the timestamp.
    pub fn field(self) -> &'static str {
        match self {
            TimestampMode::Modified => "modified",
            TimestampMode::LastAccessed => "lastAccessed",
        }
    }

    pub fn touches_on_load(self) -> bool {
        self == TimestampMode::LastAccessed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// Cookie attributes and lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    pub path: String,
    pub domain: Option<String>,
    /// Seconds. Negative deletes the session, zero makes a browser-session cookie.
    pub max_age: i64,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            domain: None,
            max_age: 86400 * 30,
            secure: false,
            http_only: true,
            same_site: Some(SameSite::Lax),
        }
    }
}

/// Hex-encoded key material for one codec.
#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyPairConfig {
    pub hash_key: String,
    pub block_key: Option<String>,
}

impl std::fmt::Debug for KeyPairConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairConfig")
            .field("hash_key", &"[REDACTED]")
            .field("block_key", &self.block_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl KeyPairConfig {
    pub fn to_key_pair(&self) -> Result<KeyPair, ConfigError> {
        let hash_key = hex::decode(self.hash_key.trim())
            .map_err(|e| ConfigError::Invalid(format!("hashKey is not hex: {e}")))?;
        let block_key = self
            .block_key
            .as_deref()
            .map(|k| {
                hex::decode(k.trim())
                    .map_err(|e| ConfigError::Invalid(format!("blockKey is not hex: {e}")))
            })
            .transpose()?;
        Ok(KeyPair::new(hash_key, block_key))
    }
}

/// Construction-time configuration of a session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub collection: String,
    pub options: SessionOptions,
    /// Declare a TTL index on the timestamp field at construction.
    pub ensure_ttl: bool,
    pub timestamp_mode: TimestampMode,
    /// Newest first: the first pair encodes, all pairs are tried on decode.
    pub key_pairs: Vec<KeyPairConfig>,
    /// Maximum token age accepted on decode. Unset keeps the codec default of
    /// 30 days; record lifetime is governed by `options.maxAge` and the TTL index.
    pub token_max_age: Option<i64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            collection: "sessions".to_string(),
            options: SessionOptions::default(),
            ensure_ttl: true,
            timestamp_mode: TimestampMode::Modified,
            key_pairs: Vec::new(),
            token_max_age: None,
        }
    }
}

impl StoreConfig {
    pub fn key_pairs(&self) -> Result<Vec<KeyPair>, ConfigError> {
        if self.key_pairs.is_empty() {
            return Err(ConfigError::NoKeys);
        }
        self.key_pairs.iter().map(KeyPairConfig::to_key_pair).collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.trim().is_empty() {
            return Err(ConfigError::Invalid("collection must not be empty".into()));
        }
        for pair in self.key_pairs()? {
            pair.validate().map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    /// MongoDB connection string. Empty selects the in-memory cluster.
    pub mongo_url: String,
    /// Database name; falls back to the one in the connection string.
    pub database: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub session_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            session_name: "docsession".to_string(),
        }
    }
}

// ====== Config loading/saving ======

/// Load configuration from environment variables.
///
/// Priority:
/// 1. `DOCSESSION_CONFIG` env var, full JSON config
/// 2. Individual env vars (merged on top of the file config)
/// 3. File fallback (`~/.docsession/config.json`)
pub fn load_config_from_env() -> Config {
    if let Ok(json) = std::env::var("DOCSESSION_CONFIG") {
        match serde_json::from_str::<Config>(&json) {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!("Failed to parse DOCSESSION_CONFIG: {}", e);
            }
        }
    }

    let mut cfg = load_config(None);

    if let Ok(hash_key) = std::env::var("DOCSESSION_HASH_KEY") {
        let block_key = std::env::var("DOCSESSION_BLOCK_KEY").ok();
        // Env keys are the newest pair; file keys remain for decoding.
        cfg.store
            .key_pairs
            .insert(0, KeyPairConfig { hash_key, block_key });
    }
    if let Ok(v) = std::env::var("DOCSESSION_MONGO_URL") {
        cfg.database.mongo_url = v;
    }
    if let Ok(v) = std::env::var("DOCSESSION_COLLECTION") {
        cfg.store.collection = v;
    }
    if let Ok(v) = std::env::var("DOCSESSION_MAX_AGE") {
        match v.trim().parse::<i64>() {
            Ok(secs) => cfg.store.options.max_age = secs,
            Err(e) => tracing::warn!("Ignoring DOCSESSION_MAX_AGE={}: {}", v, e),
        }
    }

    cfg
}

/// Get the default configuration file path.
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".docsession")
        .join("config.json")
}

/// Load configuration from file or create default.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if path.exists() {
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to parse config from {}: {}", path.display(), e);
                    tracing::warn!("Using default configuration.");
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config from {}: {}", path.display(), e);
                tracing::warn!("Using default configuration.");
            }
        }
    }

    Config::default()
}

/// Save configuration to file.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> Result<(), ConfigError> {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(())
}
