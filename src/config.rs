//! Configuration loading and persistence.
//!
//! Handles reading and writing the crossbar configuration file with
//! environment variable overrides (`CROSSBAR_*`). Token signing secrets
//! may live in the file — it is written with owner-only permissions — but
//! the environment wins, which is how CI and containers inject them.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::auth::{RateLimiterConfig, TokenConfig};

/// Configuration for a crossbar broker process.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// TCP endpoint the broker binds (and peers dial).
    pub endpoint: String,
    /// Cluster identity of this broker node.
    pub node_id: String,
    /// Access-token signing secret. Prefer `CROSSBAR_ACCESS_SECRET`.
    #[serde(default)]
    pub access_secret: String,
    /// Refresh-token signing secret. Prefer `CROSSBAR_REFRESH_SECRET`.
    #[serde(default)]
    pub refresh_secret: String,
    /// Sustained per-source admission rate.
    pub requests_per_minute: u32,
    /// Per-source burst capacity.
    pub burst_size: u32,
    /// Failed logins before a principal locks.
    pub max_failed_attempts: u32,
    /// Lockout window in minutes.
    pub lockout_minutes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:5555".to_string(),
            node_id: format!("broker-{}", uuid::Uuid::new_v4()),
            access_secret: String::new(),
            refresh_secret: String::new(),
            requests_per_minute: 60,
            burst_size: 10,
            max_failed_attempts: 5,
            lockout_minutes: 15,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `CROSSBAR_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("CROSSBAR_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("crossbar")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Load configuration from file, with environment overrides applied.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|_| Self::default());
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("CROSSBAR_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Ok(node_id) = std::env::var("CROSSBAR_NODE_ID") {
            self.node_id = node_id;
        }
        if let Ok(secret) = std::env::var("CROSSBAR_ACCESS_SECRET") {
            self.access_secret = secret;
        }
        if let Ok(secret) = std::env::var("CROSSBAR_REFRESH_SECRET") {
            self.refresh_secret = secret;
        }
        if let Ok(rpm) = std::env::var("CROSSBAR_REQUESTS_PER_MINUTE") {
            if let Ok(rpm) = rpm.parse() {
                self.requests_per_minute = rpm;
            }
        }
        if let Ok(burst) = std::env::var("CROSSBAR_BURST_SIZE") {
            if let Ok(burst) = burst.parse() {
                self.burst_size = burst;
            }
        }
    }

    /// Persist the current configuration with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// True once both token secrets are configured.
    pub fn has_token_secrets(&self) -> bool {
        !self.access_secret.is_empty() && !self.refresh_secret.is_empty()
    }

    /// Token-manager configuration derived from this config.
    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            access_secret: self.access_secret.clone(),
            refresh_secret: self.refresh_secret.clone(),
            issuer: self.node_id.clone(),
            ..TokenConfig::default()
        }
    }

    /// Rate-limiter configuration derived from this config.
    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            requests_per_minute: self.requests_per_minute,
            burst_size: self.burst_size,
            max_failed_attempts: self.max_failed_attempts,
            lockout_duration: Duration::from_secs(self.lockout_minutes * 60),
            ..RateLimiterConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.endpoint, "127.0.0.1:5555");
        assert!(config.node_id.starts_with("broker-"));
        assert_eq!(config.requests_per_minute, 60);
        assert_eq!(config.max_failed_attempts, 5);
        assert!(!config.has_token_secrets());
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut config = Config::default();
        config.access_secret = "a-secret".into();
        config.refresh_secret = "r-secret".into();

        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.endpoint, config.endpoint);
        assert!(loaded.has_token_secrets());
    }

    #[test]
    fn test_missing_secret_fields_default_empty() {
        let json = r#"{
            "endpoint": "0.0.0.0:7000",
            "node_id": "broker-test",
            "requests_per_minute": 120,
            "burst_size": 20,
            "max_failed_attempts": 3,
            "lockout_minutes": 5
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.endpoint, "0.0.0.0:7000");
        assert!(config.access_secret.is_empty());
        assert!(!config.has_token_secrets());
    }

    #[test]
    fn test_derived_configs() {
        let mut config = Config::default();
        config.access_secret = "a".into();
        config.refresh_secret = "r".into();
        config.lockout_minutes = 5;

        let tokens = config.token_config();
        assert_eq!(tokens.issuer, config.node_id);

        let limiter = config.rate_limiter_config();
        assert_eq!(limiter.lockout_duration, Duration::from_secs(300));
        assert_eq!(limiter.burst_size, 10);
    }
}
