//! Server Configuration
//!
//! Layered configuration for the agreement bot server: defaults, an
//! optional config file, and `EDGEPACT__` environment overrides.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use edgepact_agbot::config::AgbotConfig;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Agreement bot core settings
    #[serde(default)]
    pub agbot: AgbotConfig,

    /// Path to the 32-byte hex Ed25519 signing key
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    /// Seconds between exchange event polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_sec: u64,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_key_file() -> PathBuf {
    PathBuf::from("/etc/edgepact/signing.key")
}

fn default_poll_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            agbot: AgbotConfig::default(),
            key_file: default_key_file(),
            poll_interval_sec: default_poll_interval(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from defaults, an optional file, and
    /// `EDGEPACT__` environment variables.
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("EDGEPACT")
                    .separator("__")
                    .try_parsing(true),
            );

        let loaded = builder.build()?;
        let server_config: ServerConfig = loaded.try_deserialize().unwrap_or_else(|_| {
            tracing::warn!("using default configuration");
            ServerConfig::default()
        });
        Ok(server_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.poll_interval_sec, 10);
        assert!(config.agbot.agreement_workers >= 1);
        assert_eq!(config.logging.level, "info");
    }
}
