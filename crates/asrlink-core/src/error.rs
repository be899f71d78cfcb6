use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading the application config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Terminal failure of a recognition session.
///
/// Every variant ends the session. It is reported exactly once: either as the
/// `Err` of a call that has not started streaming yet, or as the cause of the
/// final [`RecognitionEvent::Failure`](crate::RecognitionEvent::Failure).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecognitionError {
    #[error("invalid recognition config: {0}")]
    InvalidConfig(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("session cancelled")]
    Cancelled,
}

impl RecognitionError {
    /// Short stable name of the variant, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::AudioDevice(_) => "audio_device",
            Self::Connection(_) => "connection",
            Self::Io(_) => "io",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::Provider(_) => "provider",
            Self::Cancelled => "cancelled",
        }
    }
}
