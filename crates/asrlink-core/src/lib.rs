pub mod config;
pub mod error;
pub mod types;
pub mod wire;

pub use config::AppConfig;
pub use error::{ConfigError, RecognitionError};
pub use types::{
    AudioChunk, AudioEncoding, Config, Credentials, Endpoint, OutboundMessage, RecognitionEvent,
    RecognitionFlags, SessionOptions, SessionState,
};
pub use wire::{Hypothesis, WireResponse};
