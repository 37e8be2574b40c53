//! Configuration for the gateway and worker binaries.
//!
//! Supports YAML file and environment variable overrides.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::bus::MessagingConfig;
use crate::handlers::SERVED_TOPICS;
use crate::rpc::RpcConfig;
use crate::topic::Topic;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "REALTY_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker selection and connection.
    pub messaging: MessagingConfig,
    /// Client-side call settings.
    pub rpc: RpcConfig,
    /// HTTP gateway.
    pub gateway: GatewayConfig,
    /// Worker dispatchers.
    pub worker: WorkerConfig,
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Topics whose request queues this worker serves.
    pub topics: Vec<Topic>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            topics: vec![Topic::PropertyManagement],
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject worker topics this crate has no handlers for.
    fn validate(&self) -> Result<(), ConfigError> {
        match self
            .worker
            .topics
            .iter()
            .find(|t| !SERVED_TOPICS.contains(*t))
        {
            Some(topic) => Err(ConfigError::Invalid(
                "worker.topics".to_string(),
                format!("no handlers for topic '{}'", topic),
            )),
            None => Ok(()),
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(messaging_type) = std::env::var("REALTY_MESSAGING_TYPE") {
            self.messaging.messaging_type = messaging_type
                .parse()
                .map_err(|e| ConfigError::Invalid("REALTY_MESSAGING_TYPE".to_string(), e))?;
        }

        if let Ok(url) = std::env::var("AMQP_URL") {
            self.messaging.amqp.url = url;
        }

        if let Ok(secs) = std::env::var("RPC_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(s) => self.rpc.timeout_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring non-numeric RPC_TIMEOUT_SECS"),
            }
        }

        if let Ok(port) = std::env::var("GATEWAY_PORT") {
            match port.parse() {
                Ok(p) => self.gateway.port = p,
                Err(_) => warn!(value = %port, "Ignoring invalid GATEWAY_PORT"),
            }
        }

        if let Ok(topics) = std::env::var("WORKER_TOPIC") {
            self.worker.topics = topics
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| {
                    t.parse::<Topic>()
                        .map_err(|e| ConfigError::Invalid("WORKER_TOPIC".to_string(), e))
                })
                .collect::<Result<_, _>>()?;
        }

        Ok(())
    }

    /// Reply timeout for gateway calls.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc.timeout()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {0}: {1}")]
    Invalid(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessagingType;
    use serial_test::serial;

    const ENV_VARS: &[&str] = &[
        CONFIG_ENV_VAR,
        "REALTY_MESSAGING_TYPE",
        "AMQP_URL",
        "RPC_TIMEOUT_SECS",
        "GATEWAY_PORT",
        "WORKER_TOPIC",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.messaging.messaging_type, MessagingType::Channel);
        assert_eq!(config.rpc.timeout_secs, 30);
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.worker.topics, vec![Topic::PropertyManagement]);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
messaging:
  type: amqp
  amqp:
    url: amqp://rabbit:5672
    prefetch: 4

rpc:
  timeout_secs: 5

gateway:
  host: 127.0.0.1
  port: 9000

worker:
  topics:
    - auth
    - property_management
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.messaging.messaging_type, MessagingType::Amqp);
        assert_eq!(config.messaging.amqp.url, "amqp://rabbit:5672");
        assert_eq!(config.messaging.amqp.prefetch, 4);
        assert_eq!(config.messaging.amqp.pool_size, 10);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(5));
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(
            config.worker.topics,
            vec![Topic::Auth, Topic::PropertyManagement]
        );
    }

    #[test]
    fn test_parse_yaml_rejects_unknown_topic() {
        let yaml = "worker:\n  topics: [billing]\n";
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_parse_yaml_rejects_unserved_topic() {
        let yaml = "worker:\n  topics: [auth, market_data]\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::Invalid(key, msg)) if key == "worker.topics" && msg.contains("market_data")
        ));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        assert!(matches!(
            Config::from_file("/nonexistent/realty.yaml"),
            Err(ConfigError::FileRead(_, _))
        ));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var(CONFIG_ENV_VAR, "/nonexistent/realty.yaml");
        std::env::set_var("REALTY_MESSAGING_TYPE", "amqp");
        std::env::set_var("AMQP_URL", "amqp://elsewhere:5672");
        std::env::set_var("RPC_TIMEOUT_SECS", "3");
        std::env::set_var("GATEWAY_PORT", "not-a-port");
        std::env::set_var("WORKER_TOPIC", "auth, properties");

        let config = Config::load().unwrap();
        clear_env();

        assert_eq!(config.messaging.messaging_type, MessagingType::Amqp);
        assert_eq!(config.messaging.amqp.url, "amqp://elsewhere:5672");
        assert_eq!(config.rpc.timeout_secs, 3);
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(
            config.worker.topics,
            vec![Topic::Auth, Topic::PropertyManagement]
        );
    }

    #[test]
    #[serial]
    fn test_worker_topic_without_handlers_is_rejected() {
        clear_env();
        std::env::set_var(CONFIG_ENV_VAR, "/nonexistent/realty.yaml");
        std::env::set_var("WORKER_TOPIC", "auth,market");

        let result = Config::load();
        clear_env();

        assert!(matches!(result, Err(ConfigError::Invalid(key, _)) if key == "worker.topics"));
    }

    #[test]
    #[serial]
    fn test_invalid_messaging_type_env_is_an_error() {
        clear_env();
        std::env::set_var(CONFIG_ENV_VAR, "/nonexistent/realty.yaml");
        std::env::set_var("REALTY_MESSAGING_TYPE", "carrier-pigeon");

        let result = Config::load();
        clear_env();

        assert!(matches!(result, Err(ConfigError::Invalid(var, _)) if var == "REALTY_MESSAGING_TYPE"));
    }
}
