//! Environment-driven server configuration.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::storage::StorageConfig;
use crate::sync::HubConfig;

/// Origins accepted for WebSocket upgrades when `ALLOWED_ORIGINS` is unset
const DEFAULT_ORIGINS: &str = "127.0.0.1,localhost,obsidian.md";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Everything the process needs to start
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Root of object storage
    pub storage_dir: String,
    /// Sled metadata database
    pub database_path: String,
    pub jwt_secret: String,
    /// WebSocket origin patterns
    pub allowed_origins: Vec<String>,
    pub hub: HubConfig,
}

impl ServerConfig {
    /// Read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = HubConfig::default();

        let jwt_secret = get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        let storage_dir = get("STORAGE_DIR").unwrap_or_else(|| "./data".to_string());
        let database_path =
            get("DATABASE_PATH").unwrap_or_else(|| format!("{}/metadata.sled", storage_dir));

        let hub = HubConfig {
            outbound_queue: parse_or(&get, "OUTBOUND_QUEUE", defaults.outbound_queue)?,
            persist_queue: parse_or(&get, "PERSIST_QUEUE", defaults.persist_queue)?,
            broadcast_interval: Duration::from_millis(parse_or(
                &get,
                "BROADCAST_INTERVAL_MS",
                defaults.broadcast_interval.as_millis() as u64,
            )?),
            broadcast_burst: parse_or(&get, "BROADCAST_BURST", defaults.broadcast_burst)?,
            write_timeout: Duration::from_millis(parse_or(
                &get,
                "WRITE_TIMEOUT_MS",
                defaults.write_timeout.as_millis() as u64,
            )?),
        };

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(&get, "PORT", 8080)?,
            storage_dir,
            database_path,
            jwt_secret,
            allowed_origins: parse_origins(
                &get("ALLOWED_ORIGINS").unwrap_or_else(|| DEFAULT_ORIGINS.to_string()),
            ),
            hub,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConfigError::Invalid {
                var: "HOST",
                value: self.host.clone(),
            })
    }

    pub fn storage(&self) -> StorageConfig {
        StorageConfig::new(self.database_path.clone(), self.storage_dir.clone())
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

/// Split a comma separated origin list
pub fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
