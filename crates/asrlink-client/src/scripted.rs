//! In-process transport that replays a fixed script of inbound frames.
//!
//! Used by the test suite and by the CLI's replay mode. Every outbound
//! message is recorded so callers can assert on what a session sent.

use crate::transport_trait::{CallObserver, DuplexCall, DuplexTransport};
use asrlink_core::{
    ConfigError, Credentials, Endpoint, OutboundMessage, RecognitionError, WireResponse,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// One step of a replay script.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Deliver one inbound frame.
    Respond { frame: WireResponse },
    /// Wait until the session has sent at least this many audio chunks.
    AwaitAudio { chunks: u64 },
    /// Wait until the session signals end of input.
    AwaitEndOfInput,
    Delay { millis: u64 },
    /// End the call normally.
    Complete,
    /// End the call with a transport-level failure.
    TransportError { message: String },
    /// End the call with an error reported by the recognition backend.
    ProviderError { message: String },
}

impl ScriptStep {
    pub fn respond(frame: WireResponse) -> Self {
        Self::Respond { frame }
    }

    pub fn delay(duration: Duration) -> Self {
        Self::Delay {
            millis: duration.as_millis() as u64,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScriptFile {
    #[serde(default)]
    step: Vec<ScriptStep>,
}

#[derive(Debug, Clone, Copy, Default)]
struct CallProgress {
    audio_chunks: u64,
    input_finished: bool,
    cancelled: bool,
}

/// Everything observed on the outbound side, across all calls.
#[derive(Debug, Default)]
pub struct CallRecord {
    opens: AtomicUsize,
    cancels: AtomicUsize,
    finishes: AtomicUsize,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl CallRecord {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn input_finished(&self) -> bool {
        self.finishes.load(Ordering::SeqCst) > 0
    }

    pub fn finishes(&self) -> usize {
        self.finishes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sequence numbers of the audio chunks sent so far, in send order.
    pub fn audio_sequences(&self) -> Vec<u64> {
        self.sent()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Audio(chunk) => Some(chunk.sequence),
                OutboundMessage::Config(_) => None,
            })
            .collect()
    }

    fn push(&self, message: OutboundMessage) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }
}

pub struct ScriptedTransport {
    steps: Vec<ScriptStep>,
    open_error: Option<RecognitionError>,
    record: Arc<CallRecord>,
}

impl ScriptedTransport {
    /// A script without a terminal step leaves the call open until it is
    /// cancelled.
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            open_error: None,
            record: Arc::new(CallRecord::default()),
        }
    }

    /// Every `open_duplex` fails with `error`.
    pub fn failing_open(error: RecognitionError) -> Self {
        Self {
            steps: Vec::new(),
            open_error: Some(error),
            record: Arc::new(CallRecord::default()),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: ScriptFile = toml::from_str(s)?;
        Ok(Self::new(file.step))
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }

    pub fn record(&self) -> Arc<CallRecord> {
        Arc::clone(&self.record)
    }
}

#[async_trait]
impl DuplexTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_duplex(
        &self,
        endpoint: &Endpoint,
        _credentials: &Credentials,
        _deadline: tokio::time::Instant,
        observer: Arc<dyn CallObserver>,
    ) -> Result<Box<dyn DuplexCall>, RecognitionError> {
        self.record.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.open_error {
            tracing::debug!(endpoint = %endpoint, "scripted open failure");
            return Err(err.clone());
        }

        let (progress_tx, progress_rx) = watch::channel(CallProgress::default());
        tokio::spawn(play(self.steps.clone(), observer, progress_rx));
        Ok(Box::new(ScriptedCall {
            record: Arc::clone(&self.record),
            progress: progress_tx,
        }))
    }
}

struct ScriptedCall {
    record: Arc<CallRecord>,
    progress: watch::Sender<CallProgress>,
}

#[async_trait]
impl DuplexCall for ScriptedCall {
    async fn send(&self, message: OutboundMessage) -> Result<(), RecognitionError> {
        let progress = *self.progress.borrow();
        if progress.cancelled {
            return Err(RecognitionError::Io("call cancelled".to_string()));
        }
        if progress.input_finished {
            return Err(RecognitionError::Io("send after end of input".to_string()));
        }
        let is_audio = matches!(message, OutboundMessage::Audio(_));
        self.record.push(message);
        if is_audio {
            self.progress.send_modify(|p| p.audio_chunks += 1);
        }
        Ok(())
    }

    async fn finish_sending(&self) -> Result<(), RecognitionError> {
        if self.progress.borrow().cancelled {
            return Err(RecognitionError::Io("call cancelled".to_string()));
        }
        self.record.finishes.fetch_add(1, Ordering::SeqCst);
        self.progress.send_modify(|p| p.input_finished = true);
        Ok(())
    }

    fn cancel(&self) {
        self.record.cancels.fetch_add(1, Ordering::SeqCst);
        self.progress.send_modify(|p| p.cancelled = true);
    }
}

/// Wait until `ready` holds. Returns false if the call is cancelled or
/// dropped first.
async fn wait_until(
    progress: &mut watch::Receiver<CallProgress>,
    ready: impl Fn(&CallProgress) -> bool,
) -> bool {
    loop {
        {
            let current = progress.borrow_and_update();
            if current.cancelled {
                return false;
            }
            if ready(&current) {
                return true;
            }
        }
        if progress.changed().await.is_err() {
            return false;
        }
    }
}

async fn play(
    steps: Vec<ScriptStep>,
    observer: Arc<dyn CallObserver>,
    mut progress: watch::Receiver<CallProgress>,
) {
    for step in steps {
        if progress.borrow().cancelled {
            return;
        }
        match step {
            ScriptStep::Respond { frame } => {
                let mut watcher = progress.clone();
                tokio::select! {
                    _ = observer.on_event(frame) => {}
                    _ = wait_until(&mut watcher, |_| false) => return,
                }
            }
            ScriptStep::AwaitAudio { chunks } => {
                if !wait_until(&mut progress, |p| p.audio_chunks >= chunks).await {
                    return;
                }
            }
            ScriptStep::AwaitEndOfInput => {
                if !wait_until(&mut progress, |p| p.input_finished).await {
                    return;
                }
            }
            ScriptStep::Delay { millis } => {
                let mut watcher = progress.clone();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(millis)) => {}
                    _ = wait_until(&mut watcher, |_| false) => return,
                }
            }
            ScriptStep::Complete => {
                observer.on_completed().await;
                return;
            }
            ScriptStep::TransportError { message } => {
                observer.on_error(RecognitionError::Io(message)).await;
                return;
            }
            ScriptStep::ProviderError { message } => {
                observer.on_error(RecognitionError::Provider(message)).await;
                return;
            }
        }
    }
    // No terminal step: hold the call open until it goes away
    wait_until(&mut progress, |_| false).await;
}
