//! Provider-neutral shape of the inbound messages a duplex recognition call
//! delivers. Transports decode their vendor frames into these values; the
//! byte layout itself belongs to the transport.

use serde::Deserialize;

/// One recognition hypothesis of a transcription message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Hypothesis {
    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub normalized_text: String,
}

impl Hypothesis {
    pub fn new(text: &str, normalized_text: &str) -> Self {
        Self {
            text: text.to_string(),
            normalized_text: normalized_text.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireResponse {
    Transcription {
        #[serde(default)]
        results: Vec<Hypothesis>,
        /// End-of-utterance flag.
        #[serde(default)]
        eou: bool,
    },
    BackendInfo {
        model_name: String,
        model_version: String,
    },
    Insight {
        insight_result: String,
    },
    Vad {
        #[serde(default)]
        has_voice: bool,
    },
    /// A frame kind this build does not know about.
    #[serde(other)]
    Unknown,
}

impl WireResponse {
    /// Single-segment transcription, the common case.
    pub fn transcript(text: &str, eou: bool) -> Self {
        Self::Transcription {
            results: vec![Hypothesis::new(text, "")],
            eou,
        }
    }

    pub fn backend_info(model_name: &str, model_version: &str) -> Self {
        Self::BackendInfo {
            model_name: model_name.to_string(),
            model_version: model_version.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transcription { .. } => "transcription",
            Self::BackendInfo { .. } => "backend_info",
            Self::Insight { .. } => "insight",
            Self::Vad { .. } => "vad",
            Self::Unknown => "unknown",
        }
    }
}
