use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub identity: IdentityConfig,
    pub registry: RegistryConfig,
    pub registration: RegistrationConfig,
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

/// Who this participant claims to be. The key store holds the P-256
/// secret scalar; it is created on first start if absent.
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct IdentityConfig {
    pub uid: String,
    pub endpoint: String,
    pub key_store_path: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct RegistryConfig {
    pub endpoint: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct RegistrationConfig {
    /// Abandoned sessions older than this are garbage-collected.
    pub session_ttl_hours: Option<u64>,
    pub sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ExecutionConfig {
    pub max_workers: Option<usize>,
    /// Overall bound on waiting for dispatch confirmation.
    pub confirmation_timeout_seconds: Option<u64>,
    pub poll_interval_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            identity: IdentityConfig::default(),
            registry: RegistryConfig::default(),
            registration: RegistrationConfig::default(),
            execution: ExecutionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://grid-exchange.db".to_string(),
            max_connections: Some(10),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            uid: "facility-1".to_string(),
            endpoint: "http://localhost:8080".to_string(),
            key_store_path: "identity.key".to_string(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000".to_string(),
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            session_ttl_hours: Some(24),
            sweep_interval_seconds: Some(3600),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_workers: Some(4),
            confirmation_timeout_seconds: Some(60),
            poll_interval_seconds: Some(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path).map_err(|e| {
            crate::error::ExchangeError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: AppConfig = toml::from_str(&config_str).map_err(|e| {
            crate::error::ExchangeError::Config(format!("Failed to parse config file: {}", e))
        })?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(registry) = std::env::var("REGISTRY_ENDPOINT") {
            config.registry.endpoint = registry;
        }
        if let Ok(key_store) = std::env::var("KEY_STORE_PATH") {
            config.identity.key_store_path = key_store;
        }
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.logging.level = log_level;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(crate::error::ExchangeError::Config(
                "Server port cannot be 0".to_string(),
            ));
        }
        if self.database.url.is_empty() {
            return Err(crate::error::ExchangeError::Config(
                "Database URL cannot be empty".to_string(),
            ));
        }
        if self.identity.uid.is_empty() {
            return Err(crate::error::ExchangeError::Config(
                "Identity uid cannot be empty".to_string(),
            ));
        }
        if self.registry.endpoint.is_empty() {
            return Err(crate::error::ExchangeError::Config(
                "Registry endpoint cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.registration.session_ttl_hours.unwrap_or(24) as i64)
    }

    pub fn confirmation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.execution.confirmation_timeout_seconds.unwrap_or(60))
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.execution.poll_interval_seconds.unwrap_or(5))
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config).map_err(|e| {
        crate::error::ExchangeError::Config(format!("Failed to serialize default config: {}", e))
    })?;

    std::fs::write(path, toml_str).map_err(|e| {
        crate::error::ExchangeError::Config(format!("Failed to write default config file: {}", e))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.registration.session_ttl_hours, Some(24));
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        create_default_config_file(path).unwrap();
        let loaded = AppConfig::load(path).unwrap();
        assert_eq!(loaded.server.port, 8080);
        assert_eq!(loaded.identity.uid, "facility-1");
    }
}
