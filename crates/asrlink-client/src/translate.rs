use asrlink_core::{Hypothesis, RecognitionError, RecognitionEvent, WireResponse};

/// Upper bound for a single transcript or insight payload.
pub const MAX_TEXT_BYTES: usize = 64 * 1024;

fn segment_text(hypothesis: &Hypothesis) -> &str {
    if hypothesis.normalized_text.is_empty() {
        &hypothesis.text
    } else {
        &hypothesis.normalized_text
    }
}

fn oversize(what: &str, len: usize) -> RecognitionEvent {
    RecognitionEvent::failure(RecognitionError::Provider(format!(
        "{what} of {len} bytes exceeds the {MAX_TEXT_BYTES} byte limit"
    )))
}

/// Map one inbound wire message to a recognition event.
///
/// Returns `None` for messages that carry nothing to forward: unknown kinds
/// and transcriptions without any text.
pub fn translate(response: &WireResponse) -> Option<RecognitionEvent> {
    match response {
        WireResponse::Transcription { results, eou } => {
            let segments: Vec<&str> = results
                .iter()
                .map(segment_text)
                .filter(|s| !s.is_empty())
                .collect();
            let len = segments.iter().map(|s| s.len()).sum::<usize>()
                + segments.len().saturating_sub(1);
            if len > MAX_TEXT_BYTES {
                return Some(oversize("transcript", len));
            }
            if segments.is_empty() {
                return None;
            }
            Some(RecognitionEvent::Transcript {
                text: segments.join(" "),
                is_final: *eou,
            })
        }
        WireResponse::BackendInfo {
            model_name,
            model_version,
        } => Some(RecognitionEvent::BackendInfo {
            model_name: model_name.clone(),
            model_version: model_version.clone(),
        }),
        WireResponse::Insight { insight_result } => {
            if insight_result.len() > MAX_TEXT_BYTES {
                return Some(oversize("insight", insight_result.len()));
            }
            Some(RecognitionEvent::Insight {
                payload: insight_result.clone(),
            })
        }
        WireResponse::Vad { has_voice } => Some(RecognitionEvent::VoiceActivity {
            has_voice: *has_voice,
        }),
        WireResponse::Unknown => None,
    }
}
