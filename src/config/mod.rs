//! Environment-driven configuration, built as pure parsing separated from
//! the `std::env`/`.env` reads that feed it.

use thiserror::Error;

const DEFAULT_PORT: u16 = 8080;
const ALL_SERVICES: [&str; 4] = ["chat", "presence", "cursor", "reaction"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid PORT value: {0}")]
    InvalidPort(String),
}

/// Fully resolved runtime configuration, built from environment variables
/// (optionally preloaded from a `.env` file) with CLI flags taking
/// precedence over anything set in the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub node_name: Option<String>,
    pub kvps_url: Option<String>,
    pub enabled_services: Vec<String>,
    pub log_level: String,
}

impl Config {
    /// Reads `PORT`, `KVPS_HOST`/`KVPS_PORT`/`KVPS_URL`, `ENABLED_SERVICES`,
    /// and `LOG_LEVEL` from the process environment. Does not read a `.env`
    /// file itself — call `dotenvy::dotenv()` (or `from_path`) before this
    /// if one should be loaded.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match std::env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidPort(raw))?,
            Err(_) => DEFAULT_PORT,
        };

        let kvps_url = std::env::var("KVPS_URL").ok().or_else(|| {
            let host = std::env::var("KVPS_HOST").ok()?;
            let port = std::env::var("KVPS_PORT").unwrap_or_else(|_| "6379".to_string());
            Some(format!("redis://{host}:{port}"))
        });

        let enabled_services = match std::env::var("ENABLED_SERVICES") {
            Ok(raw) => raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
            Err(_) => ALL_SERVICES.iter().map(|s| s.to_string()).collect(),
        };

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            port,
            node_name: std::env::var("NODE_NAME").ok(),
            kvps_url,
            enabled_services,
            log_level,
        })
    }

    /// Applies CLI-flag overrides on top of whatever the environment
    /// produced. A `None`/empty override leaves the environment value in
    /// place.
    pub fn with_overrides(
        mut self,
        port: Option<u16>,
        node_name: Option<String>,
        kvps_url: Option<String>,
        enabled_services: Option<Vec<String>>,
    ) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        if node_name.is_some() {
            self.node_name = node_name;
        }
        if kvps_url.is_some() {
            self.kvps_url = kvps_url;
        }
        if let Some(services) = enabled_services {
            self.enabled_services = services;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_when_env_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        for key in ["PORT", "KVPS_URL", "KVPS_HOST", "KVPS_PORT", "ENABLED_SERVICES", "LOG_LEVEL", "NODE_NAME"] {
            std::env::remove_var(key);
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.enabled_services.len(), 4);
    }

    #[test]
    fn kvps_host_and_port_combine_into_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("KVPS_URL");
        std::env::set_var("KVPS_HOST", "redis.internal");
        std::env::set_var("KVPS_PORT", "6380");
        let config = Config::from_env().unwrap();
        assert_eq!(config.kvps_url.as_deref(), Some("redis://redis.internal:6380"));
        std::env::remove_var("KVPS_HOST");
        std::env::remove_var("KVPS_PORT");
    }

    #[test]
    fn cli_overrides_win_over_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("PORT", "9000");
        let config = Config::from_env().unwrap().with_overrides(Some(9001), None, None, None);
        assert_eq!(config.port, 9001);
        std::env::remove_var("PORT");
    }

    #[test]
    fn invalid_port_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("PORT", "not-a-port");
        assert!(matches!(Config::from_env(), Err(ConfigError::InvalidPort(_))));
        std::env::remove_var("PORT");
    }
}
