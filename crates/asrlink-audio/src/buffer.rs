use crate::source_trait::{AudioSource, ChunkRead};
use asrlink_core::RecognitionError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Audio source over bytes already in memory.
pub struct BufferSource {
    data: Vec<u8>,
    cursor: Mutex<usize>,
    opened: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl BufferSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            cursor: Mutex::new(0),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire) && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Relaxed)
    }

    /// Slice the next `max_bytes` without the async wrapper; shared with `FileSource`.
    pub(crate) fn take(&self, max_bytes: usize) -> Result<ChunkRead, RecognitionError> {
        if !self.opened.load(Ordering::Acquire) {
            return Err(RecognitionError::AudioDevice("source not opened".to_string()));
        }
        if self.is_closed() {
            return Err(RecognitionError::AudioDevice("source closed".to_string()));
        }
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|_| RecognitionError::AudioDevice("source cursor poisoned".to_string()))?;
        let start = *cursor;
        let end = start.saturating_add(max_bytes).min(self.data.len());
        *cursor = end;
        Ok(ChunkRead {
            bytes: self.data[start..end].to_vec(),
            is_last: end == self.data.len(),
        })
    }

    pub(crate) fn mark_open(&self) -> Result<(), RecognitionError> {
        if self.opened.swap(true, Ordering::AcqRel) {
            return Err(RecognitionError::AudioDevice("source already opened".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AudioSource for BufferSource {
    fn name(&self) -> &str {
        "buffer"
    }

    async fn open(&mut self) -> Result<(), RecognitionError> {
        self.mark_open()
    }

    async fn read_chunk(&self, max_bytes: usize) -> Result<ChunkRead, RecognitionError> {
        self.take(max_bytes)
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::Relaxed);
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::trace!(len = self.data.len(), "buffer source closed");
        }
    }
}
