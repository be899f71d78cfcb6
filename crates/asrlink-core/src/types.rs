use crate::error::RecognitionError;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

const LANGUAGE_PATTERN: &str = r"^[a-z]{2,3}(-[A-Z]{2})?$";

static LANGUAGE_RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn language_re() -> Result<&'static Regex, RecognitionError> {
    LANGUAGE_RE
        .get_or_init(|| Regex::new(LANGUAGE_PATTERN))
        .as_ref()
        .map_err(|e| RecognitionError::InvalidConfig(e.to_string()))
}

// ── Config ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    PcmS16le,
    Opus,
    Mp3,
    Flac,
    Alaw,
    Mulaw,
}

impl AudioEncoding {
    pub fn is_pcm(&self) -> bool {
        matches!(self, Self::PcmS16le | Self::Alaw | Self::Mulaw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RecognitionFlags {
    #[serde(default = "default_true")]
    pub partial_results: bool,

    #[serde(default = "default_true")]
    pub multi_utterance: bool,

    #[serde(default)]
    pub long_utterances: bool,
}

impl Default for RecognitionFlags {
    fn default() -> Self {
        Self {
            partial_results: true,
            multi_utterance: true,
            long_utterances: false,
        }
    }
}

/// Recognition options sent once, as the first message of a session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    #[serde(default = "default_encoding")]
    pub audio_encoding: AudioEncoding,

    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: u32,

    #[serde(default = "default_channel_count")]
    pub channel_count: u16,

    #[serde(default = "default_language")]
    pub language_code: String,

    #[serde(default)]
    pub flags: RecognitionFlags,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio_encoding: default_encoding(),
            sample_rate_hz: default_sample_rate(),
            channel_count: default_channel_count(),
            language_code: default_language(),
            flags: RecognitionFlags::default(),
        }
    }
}

impl Config {
    pub fn new(audio_encoding: AudioEncoding, sample_rate_hz: u32, language_code: &str) -> Self {
        Self {
            audio_encoding,
            sample_rate_hz,
            language_code: language_code.to_string(),
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: RecognitionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Check the config before any I/O happens.
    pub fn validate(&self) -> Result<(), RecognitionError> {
        if !(8_000..=96_000).contains(&self.sample_rate_hz) {
            return Err(RecognitionError::InvalidConfig(format!(
                "sample rate {} Hz outside 8000..=96000",
                self.sample_rate_hz
            )));
        }
        if self.audio_encoding.is_pcm()
            && self.sample_rate_hz % 1_000 != 0
            && ![11_025, 22_050, 44_100].contains(&self.sample_rate_hz)
        {
            return Err(RecognitionError::InvalidConfig(format!(
                "unsupported PCM sample rate {} Hz",
                self.sample_rate_hz
            )));
        }
        if !(1..=8).contains(&self.channel_count) {
            return Err(RecognitionError::InvalidConfig(format!(
                "channel count {} outside 1..=8",
                self.channel_count
            )));
        }
        if !language_re()?.is_match(&self.language_code) {
            return Err(RecognitionError::InvalidConfig(format!(
                "malformed language code {:?}",
                self.language_code
            )));
        }
        Ok(())
    }
}

fn default_encoding() -> AudioEncoding {
    AudioEncoding::PcmS16le
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_channel_count() -> u16 {
    1
}

fn default_language() -> String {
    "ru-RU".to_string()
}

fn default_true() -> bool {
    true
}

// ── Outbound ───────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub bytes: Vec<u8>,
    pub sequence: u64,
    pub is_last: bool,
}

impl fmt::Debug for AudioChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioChunk")
            .field("len", &self.bytes.len())
            .field("sequence", &self.sequence)
            .field("is_last", &self.is_last)
            .finish()
    }
}

/// A message as observed on the outbound side of the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Config(Config),
    Audio(AudioChunk),
}

// ── Inbound ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// `is_final == false` is a revisable partial; `true` marks end-of-utterance.
    Transcript { text: String, is_final: bool },
    BackendInfo { model_name: String, model_version: String },
    Insight { payload: String },
    VoiceActivity { has_voice: bool },
    /// Always the last event of a stream.
    Failure { message: String, cause: RecognitionError },
}

impl RecognitionEvent {
    pub fn failure(cause: RecognitionError) -> Self {
        Self::Failure {
            message: cause.to_string(),
            cause,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }
}

// ── Session ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Configuring,
    Streaming,
    Draining,
    Closed,
    Failed(RecognitionError),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }
}

/// Per-session tuning shared by every session a client opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub timeout: Duration,
    pub queue_capacity: usize,
    pub grace_period: Duration,
    pub chunk_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            queue_capacity: 64,
            // 100 ms of 16 kHz 16-bit mono
            chunk_size: 3200,
            grace_period: Duration::from_secs(5),
        }
    }
}

impl SessionOptions {
    pub fn validate(&self) -> Result<(), RecognitionError> {
        if self.queue_capacity == 0 {
            return Err(RecognitionError::InvalidConfig(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(RecognitionError::InvalidConfig(
                "chunk size must be at least 1 byte".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(RecognitionError::InvalidConfig(
                "timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Endpoint ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: "smartspeech.sber.ru".to_string(),
            port: 443,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub scope: String,
}

impl Credentials {
    pub fn new(access_key: &str, scope: &str) -> Self {
        Self {
            access_key: access_key.to_string(),
            scope: scope.to_string(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &"<redacted>")
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_low_sample_rate() {
        let config = Config::new(AudioEncoding::PcmS16le, 4000, "ru-RU");
        match config.validate() {
            Err(RecognitionError::InvalidConfig(msg)) => assert!(msg.contains("4000")),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_config_rejects_odd_pcm_rate() {
        let config = Config::new(AudioEncoding::PcmS16le, 16001, "ru-RU");
        assert!(config.validate().is_err());
        // Compressed formats carry their own framing
        let config = Config::new(AudioEncoding::Mp3, 16001, "ru-RU");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_accepts_cd_rate() {
        let config = Config::new(AudioEncoding::PcmS16le, 44100, "en-US");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_language() {
        for lang in ["", "RU", "ru_RU", "russian"] {
            let config = Config::new(AudioEncoding::PcmS16le, 16000, lang);
            assert!(config.validate().is_err(), "accepted {lang:?}");
        }
        let config = Config::new(AudioEncoding::PcmS16le, 16000, "kk");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_language_pattern_compiled_once() {
        let first = language_re().unwrap();
        let second = language_re().unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_config_rejects_zero_channels() {
        let mut config = Config::default();
        config.channel_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_options_defaults() {
        let opts = SessionOptions::default();
        assert_eq!(opts.queue_capacity, 64);
        assert_eq!(opts.chunk_size, 3200);
        assert_eq!(opts.timeout, Duration::from_secs(30));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_session_options_reject_zero_capacity() {
        let opts = SessionOptions {
            queue_capacity: 0,
            ..SessionOptions::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_failure_event_message_matches_cause() {
        let event = RecognitionEvent::failure(RecognitionError::Provider("quota".to_string()));
        match event {
            RecognitionEvent::Failure { message, cause } => {
                assert_eq!(message, "provider error: quota");
                assert_eq!(cause, RecognitionError::Provider("quota".to_string()));
            }
            _ => panic!("expected Failure"),
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed(RecognitionError::Cancelled).is_terminal());
        assert!(!SessionState::Draining.is_terminal());
    }

    #[test]
    fn test_credentials_debug_redacts_key() {
        let creds = Credentials::new("super-secret", "SALUTE_SPEECH_PERS");
        let shown = format!("{creds:?}");
        assert!(!shown.contains("super-secret"));
        assert!(shown.contains("SALUTE_SPEECH_PERS"));
    }

    #[test]
    fn test_audio_chunk_debug_hides_payload() {
        let chunk = AudioChunk {
            bytes: vec![7; 3200],
            sequence: 4,
            is_last: false,
        };
        assert_eq!(
            format!("{chunk:?}"),
            "AudioChunk { len: 3200, sequence: 4, is_last: false }"
        );
    }
}
