use crate::buffer::BufferSource;
use crate::source_trait::{AudioSource, ChunkRead};
use asrlink_core::RecognitionError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Audio source backed by an encoded audio file (PCM, MP3, ...).
///
/// By default the file is streamed in feeder-sized chunks. [`FileSource::whole`]
/// hands the entire payload over as a single final chunk instead.
pub struct FileSource {
    path: PathBuf,
    whole: bool,
    buffer: Option<BufferSource>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            whole: false,
            buffer: None,
        }
    }

    /// Send the whole file as one chunk.
    pub fn whole(path: impl Into<PathBuf>) -> Self {
        Self {
            whole: true,
            ..Self::new(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.as_ref().is_some_and(|b| b.is_closed())
    }

    fn buffer(&self) -> Result<&BufferSource, RecognitionError> {
        self.buffer
            .as_ref()
            .ok_or_else(|| RecognitionError::AudioDevice("source not opened".to_string()))
    }
}

#[async_trait]
impl AudioSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn open(&mut self) -> Result<(), RecognitionError> {
        if self.buffer.is_some() {
            return Err(RecognitionError::AudioDevice("source already opened".to_string()));
        }
        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            RecognitionError::AudioDevice(format!("cannot read {}: {e}", self.path.display()))
        })?;
        tracing::info!(path = %self.path.display(), bytes = data.len(), "audio file loaded");
        let buffer = BufferSource::new(data);
        buffer.mark_open()?;
        self.buffer = Some(buffer);
        Ok(())
    }

    async fn read_chunk(&self, max_bytes: usize) -> Result<ChunkRead, RecognitionError> {
        let max = if self.whole { usize::MAX } else { max_bytes };
        self.buffer()?.take(max)
    }

    fn close(&self) {
        if let Some(buffer) = &self.buffer {
            buffer.close();
        }
    }
}
