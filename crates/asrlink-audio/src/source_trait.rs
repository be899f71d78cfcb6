use asrlink_core::RecognitionError;
use async_trait::async_trait;

/// Result of a single [`AudioSource::read_chunk`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRead {
    pub bytes: Vec<u8>,
    /// The source has no more data after these bytes.
    pub is_last: bool,
}

/// An ordered producer of audio bytes for one recognition session.
///
/// A source is opened at most once and then shared between the audio feeder
/// and the session teardown path, so reads and [`close`](Self::close) take
/// `&self` and may race; implementations must tolerate `close` during a read.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Short human-readable name for logs (e.g. `"file"`, `"capture"`).
    fn name(&self) -> &str;
    /// Acquire the underlying device or file.
    async fn open(&mut self) -> Result<(), RecognitionError>;
    /// Read up to `max_bytes`. Returns `is_last == true` exactly once.
    async fn read_chunk(&self, max_bytes: usize) -> Result<ChunkRead, RecognitionError>;
    /// Release the source. Idempotent and non-blocking.
    fn close(&self);
}
