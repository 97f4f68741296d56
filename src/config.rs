use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const SUBSCRIBERS_FILE: &str = "subscribers.json";
pub const CERTS_DIR: &str = "certs";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub conf_dir: PathBuf,
    pub rest_bind: String,
    pub log_level: String,
    pub mqtt_retry_interval_ms: u64,
    pub mqtt_max_retry_interval_ms: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conf_dir: PathBuf::from("./conf/transport"),
            rest_bind: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            mqtt_retry_interval_ms: 2_000,
            mqtt_max_retry_interval_ms: 30_000,
        }
    }
}

impl Config {
    /// Configuration rooted at `conf_dir`, everything else defaulted.
    pub fn with_conf_dir(conf_dir: impl Into<PathBuf>) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            ..Self::default()
        }
    }

    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        for (name, value) in [
            ("MQTT_RETRY_INTERVAL_MS", self.mqtt_retry_interval_ms),
            ("MQTT_MAX_RETRY_INTERVAL_MS", self.mqtt_max_retry_interval_ms),
        ] {
            if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&value) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    name, MIN_TIMEOUT, MAX_TIMEOUT
                )));
            }
        }

        if self.mqtt_retry_interval_ms > self.mqtt_max_retry_interval_ms {
            return Err(ConfigError::ParsingError(
                "MQTT_RETRY_INTERVAL_MS must not exceed MQTT_MAX_RETRY_INTERVAL_MS".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let defaults = Self::default();

        let parse_ms = |name: &str, default: u64| -> Result<u64, ConfigError> {
            match env::var(name) {
                Ok(raw) => raw.trim().parse::<u64>().map_err(|_| {
                    ConfigError::ParsingError(format!("{} must be a valid number", name))
                }),
                Err(env::VarError::NotPresent) => Ok(default),
                Err(env::VarError::NotUnicode(_)) => {
                    Err(ConfigError::MissingOrInvalid(name.to_string()))
                }
            }
        };

        let config = Self {
            conf_dir: env::var("TRANSPORT_CONF_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.conf_dir),
            rest_bind: env::var("TRANSPORT_REST_BIND").unwrap_or(defaults.rest_bind),
            log_level: env::var("TRANSPORT_LOG_LEVEL").unwrap_or(defaults.log_level),
            mqtt_retry_interval_ms: parse_ms(
                "MQTT_RETRY_INTERVAL_MS",
                defaults.mqtt_retry_interval_ms,
            )?,
            mqtt_max_retry_interval_ms: parse_ms(
                "MQTT_MAX_RETRY_INTERVAL_MS",
                defaults.mqtt_max_retry_interval_ms,
            )?,
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }

    pub fn subscribers_file(&self) -> PathBuf {
        self.conf_dir.join(SUBSCRIBERS_FILE)
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.conf_dir.join(CERTS_DIR)
    }

    pub fn mqtt_retry_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt_retry_interval_ms)
    }

    pub fn mqtt_max_retry_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt_max_retry_interval_ms)
    }
}
