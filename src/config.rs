//! Broker configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (`OSB_*`)
//! 2. Config file (`--config PATH`, or `.osb/config.yaml` discovered upward)
//! 3. Defaults
//!
//! Config file discovery:
//! - Searches the current directory and its parents for `.osb/config.yaml`
//! - Falls back to `<user config dir>/osbroker/config.yaml`
//! - Every section and field is optional; missing values keep their defaults

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::crypto::EncryptionScheme;

const REDACTED: &str = "<redacted>";

/// Resolved broker configuration (matches the YAML structure)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub engine: EngineConfig,
    pub catalog: CatalogConfig,

    /// Path of the config file that was loaded, if any
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
    /// Basic auth is enforced when a username is set
    pub basic_auth: BasicAuthConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            basic_auth: BasicAuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redis,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => anyhow::bail!("unknown storage backend: {}", other),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: i64,
    pub enable_tls: bool,
    /// Namespace for every key this broker writes
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: String::new(),
            db: 0,
            enable_tls: false,
            prefix: "osb".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub encryption_scheme: EncryptionScheme,
    pub aes256: Aes256Config,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Aes256Config {
    /// 32 characters
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue_capacity: usize,
    pub drain_timeout_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            drain_timeout_seconds: 30,
        }
    }
}

impl EngineConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub enable_fake_service: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            enable_fake_service: true,
        }
    }
}

impl Config {
    /// Load from the given file, or a discovered one, then apply the
    /// process environment
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => find_config_file(),
        };

        let mut config = match &path {
            Some(path) => load_config_file(path)?,
            None => Config::default(),
        };
        config.config_file = path;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `OSB_*` variables resolved through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("OSB_API_PORT") {
            self.api.port = parse_var("OSB_API_PORT", &v)?;
        }
        if let Some(v) = lookup("OSB_BASIC_AUTH_USERNAME") {
            self.api.basic_auth.username = v;
        }
        if let Some(v) = lookup("OSB_BASIC_AUTH_PASSWORD") {
            self.api.basic_auth.password = v;
        }
        if let Some(v) = lookup("OSB_STORAGE_BACKEND") {
            self.storage.backend = parse_var("OSB_STORAGE_BACKEND", &v)?;
        }
        if let Some(v) = lookup("OSB_REDIS_HOST") {
            self.storage.redis.host = v;
        }
        if let Some(v) = lookup("OSB_REDIS_PORT") {
            self.storage.redis.port = parse_var("OSB_REDIS_PORT", &v)?;
        }
        if let Some(v) = lookup("OSB_REDIS_PASSWORD") {
            self.storage.redis.password = v;
        }
        if let Some(v) = lookup("OSB_REDIS_DB") {
            self.storage.redis.db = parse_var("OSB_REDIS_DB", &v)?;
        }
        if let Some(v) = lookup("OSB_REDIS_ENABLE_TLS") {
            self.storage.redis.enable_tls = parse_var("OSB_REDIS_ENABLE_TLS", &v)?;
        }
        if let Some(v) = lookup("OSB_REDIS_PREFIX") {
            self.storage.redis.prefix = v;
        }
        if let Some(v) = lookup("OSB_ENCRYPTION_SCHEME") {
            self.crypto.encryption_scheme = parse_var("OSB_ENCRYPTION_SCHEME", &v)?;
        }
        if let Some(v) = lookup("OSB_AES256_KEY") {
            self.crypto.aes256.key = v;
        }
        if let Some(v) = lookup("OSB_ENGINE_QUEUE_CAPACITY") {
            self.engine.queue_capacity = parse_var("OSB_ENGINE_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("OSB_ENGINE_DRAIN_TIMEOUT_SECONDS") {
            self.engine.drain_timeout_seconds =
                parse_var("OSB_ENGINE_DRAIN_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = lookup("OSB_ENABLE_FAKE_SERVICE") {
            self.catalog.enable_fake_service = parse_var("OSB_ENABLE_FAKE_SERVICE", &v)?;
        }
        Ok(())
    }

    /// Reject combinations that cannot start a broker
    pub fn validate(&self) -> Result<()> {
        if self.crypto.encryption_scheme == EncryptionScheme::Aes256
            && self.crypto.aes256.key.len() != 32
        {
            anyhow::bail!(
                "crypto.aes256.key must be exactly 32 characters, got {}",
                self.crypto.aes256.key.len()
            );
        }
        if !self.api.basic_auth.username.is_empty() && self.api.basic_auth.password.is_empty() {
            anyhow::bail!("api.basic_auth.password is required when a username is set");
        }
        if self.storage.redis.prefix.is_empty() {
            anyhow::bail!("storage.redis.prefix must not be empty");
        }
        if self.engine.queue_capacity == 0 {
            anyhow::bail!("engine.queue_capacity must be at least 1");
        }
        Ok(())
    }

    /// Copy with secrets replaced, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for secret in [
            &mut copy.api.basic_auth.password,
            &mut copy.storage.redis.password,
            &mut copy.crypto.aes256.key,
        ] {
            if !secret.is_empty() {
                *secret = REDACTED.to_string();
            }
        }
        copy
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid value for {}: {:?} ({})", name, value, e))
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".osb").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    let user_config = dirs::config_dir()?.join("osbroker").join("config.yaml");
    user_config.exists().then_some(user_config)
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    // An empty file is a valid, all-defaults config
    if content.trim().is_empty() {
        return Ok(Config::default());
    }

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}
