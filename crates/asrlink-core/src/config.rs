use crate::error::ConfigError;
use crate::types::{Config, Credentials, Endpoint, SessionOptions};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub endpoint: EndpointConfig,

    #[serde(default)]
    pub recognition: Config,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub access_key: String,

    #[serde(default = "default_scope")]
    pub scope: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            access_key: String::new(),
            scope: default_scope(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            queue_capacity: default_queue_capacity(),
            grace_period_ms: default_grace_period_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TransportConfig {
    /// Recorded provider conversation to replay instead of a live endpoint.
    #[serde(default)]
    pub script: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    Endpoint::default().host
}

fn default_port() -> u16 {
    Endpoint::default().port
}

fn default_scope() -> String {
    "SALUTE_SPEECH_PERS".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    64
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_chunk_size() -> usize {
    3200
}

/// Interpolate `${VAR}` patterns with environment variable values.
fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Invalid(e.to_string()))?;
    let mut result = input.to_string();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let val = std::env::var(var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
        result = result.replace(&cap[0], &val);
    }

    Ok(result)
}

impl AppConfig {
    /// Load configuration from a TOML file, with environment variable interpolation.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(s)?;
        let config: AppConfig = toml::from_str(&interpolated)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.recognition
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.session_options()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.endpoint.access_key, &self.endpoint.scope)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            timeout: Duration::from_secs(self.session.timeout_secs),
            queue_capacity: self.session.queue_capacity,
            grace_period: Duration::from_millis(self.session.grace_period_ms),
            chunk_size: self.session.chunk_size,
        }
    }
}
