//! TOML configuration with per-field defaults and environment overrides for
//! the values that vary per deployment (broker address, credentials, ports).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device id stamped onto readings from the physical ventilator.
    pub device_id: String,
    pub mqtt: MqttConfig,
    pub web: WebConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// MQTT topic prefix shared with the device firmware.
    pub topic_root: String,
    pub keep_alive_secs: u64,
    /// Base delay for the exponential reconnect backoff.
    pub reconnect_interval_ms: u64,
    /// Consecutive failures before the link gives up permanently.
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret for verifying client bearer tokens. Issuance happens
    /// in the account service; this server only verifies.
    pub token_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: "ventilab-device-001".to_string(),
            mqtt: MqttConfig::default(),
            web: WebConfig::default(),
            auth: AuthConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "ventylab-server".to_string(),
            topic_root: "ventilab/device/001".to_string(),
            keep_alive_secs: 60,
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 10,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: "dev-secret-change-me".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:ventylab.db?mode=rwc".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Load + overrides
// ---------------------------------------------------------------------------

/// Read and parse the TOML config file. A missing file yields the defaults
/// so a bare checkout runs against a local broker.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::info!(path = %path, "no config file — using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

/// Apply environment overrides through a lookup closure (injected so tests
/// don't race on process environment).
pub fn apply_overrides<F>(config: &mut Config, get: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = get("MQTT_HOST") {
        config.mqtt.host = host;
    }
    if let Some(port) = get("MQTT_PORT").and_then(|s| s.parse().ok()) {
        config.mqtt.port = port;
    }
    if let Some(user) = get("MQTT_USER") {
        config.mqtt.username = Some(user);
    }
    if let Some(pass) = get("MQTT_PASS") {
        config.mqtt.password = Some(pass);
    }
    if let Some(port) = get("WEB_PORT").and_then(|s| s.parse().ok()) {
        config.web.port = port;
    }
    if let Some(url) = get("DB_URL") {
        config.database.url = url;
    }
    if let Some(secret) = get("AUTH_TOKEN_SECRET") {
        config.auth.token_secret = secret;
    }
    if let Some(id) = get("DEVICE_ID") {
        config.device_id = id;
    }
}

/// Convenience wrapper reading the real process environment.
pub fn from_env(path: &str) -> Result<Config> {
    let mut config = load(path)?;
    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
