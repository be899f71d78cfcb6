use crate::channel::ChannelAdapter;
use crate::session::{wait_for_control, Control};
use asrlink_audio::{AudioSource, ChunkRead};
use asrlink_core::{AudioChunk, OutboundMessage, RecognitionError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// An opened audio source, closed at most once no matter who gets there
/// first (the feeder on exit, or the session on teardown).
pub(crate) struct SourceSlot {
    source: Box<dyn AudioSource>,
    closed: AtomicBool,
}

impl SourceSlot {
    pub(crate) fn new(source: Box<dyn AudioSource>) -> Self {
        Self {
            source,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.source.name()
    }

    async fn read_chunk(&self, max_bytes: usize) -> Result<ChunkRead, RecognitionError> {
        self.source.read_chunk(max_bytes).await
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.source.close();
        tracing::debug!(source = self.source.name(), "audio source closed");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FeederOutcome {
    /// The source reported end-of-data and the last chunk went out.
    Exhausted { chunks: u64 },
    /// Stop was requested before the source ran dry.
    Stopped { chunks: u64 },
    Failed(RecognitionError),
}

/// Pumps audio from the source onto the channel in read order.
///
/// Sequence numbers start at 0 and have no gaps. The feeder never closes the
/// channel; it only reports how the pumping ended.
pub(crate) struct AudioFeeder {
    session_id: u64,
    source: Arc<SourceSlot>,
    channel: Arc<ChannelAdapter>,
    chunk_size: usize,
    control: watch::Receiver<Control>,
}

impl AudioFeeder {
    pub(crate) fn new(
        session_id: u64,
        source: Arc<SourceSlot>,
        channel: Arc<ChannelAdapter>,
        chunk_size: usize,
        control: watch::Receiver<Control>,
    ) -> Self {
        Self {
            session_id,
            source,
            channel,
            chunk_size,
            control,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<FeederOutcome> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> FeederOutcome {
        let outcome = self.pump().await;
        self.source.close();
        match &outcome {
            FeederOutcome::Failed(e) => tracing::debug!(
                session_id = self.session_id,
                error = %e,
                "audio feeder failed"
            ),
            other => tracing::debug!(
                session_id = self.session_id,
                outcome = ?other,
                "audio feeder finished"
            ),
        }
        outcome
    }

    async fn pump(&mut self) -> FeederOutcome {
        let mut sequence = 0u64;
        loop {
            let read = tokio::select! {
                biased;
                _ = wait_for_control(&mut self.control, Control::StopAudio) => {
                    return FeederOutcome::Stopped { chunks: sequence };
                }
                read = self.source.read_chunk(self.chunk_size) => read,
            };
            let read = match read {
                Ok(read) => read,
                Err(e) => return FeederOutcome::Failed(e),
            };

            let is_last = read.is_last;
            let chunk = AudioChunk {
                bytes: read.bytes,
                sequence,
                is_last,
            };
            if let Err(e) = self.channel.send(OutboundMessage::Audio(chunk)).await {
                return FeederOutcome::Failed(e);
            }
            sequence += 1;
            if is_last {
                return FeederOutcome::Exhausted { chunks: sequence };
            }
        }
    }
}
