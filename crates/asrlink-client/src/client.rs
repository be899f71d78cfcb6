use crate::session::{Session, SessionDriver};
use crate::stream::{EventSink, RecognitionStream};
use crate::transport_trait::DuplexTransport;
use asrlink_audio::AudioSource;
use asrlink_core::{
    AppConfig, Config, Credentials, Endpoint, RecognitionError, RecognitionEvent, SessionOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};

/// Returned by [`RecognitionClient::recognize_to_text`] when the session
/// completed without a single final transcript. Transcripts with no text
/// are never forwarded, so this cannot collide with a real result.
pub const EMPTY_TRANSCRIPT: &str = "";

/// Entry point for recognition sessions against one endpoint.
///
/// Each call starts an independent session; nothing is shared between them
/// apart from the transport.
pub struct RecognitionClient {
    transport: Arc<dyn DuplexTransport>,
    endpoint: Endpoint,
    credentials: Credentials,
    options: SessionOptions,
}

impl RecognitionClient {
    pub fn new(
        transport: Arc<dyn DuplexTransport>,
        endpoint: Endpoint,
        credentials: Credentials,
    ) -> Self {
        Self {
            transport,
            endpoint,
            credentials,
            options: SessionOptions::default(),
        }
    }

    pub fn from_app_config(transport: Arc<dyn DuplexTransport>, config: &AppConfig) -> Self {
        Self::new(transport, config.endpoint(), config.credentials())
            .with_options(config.session_options())
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Start a streaming session.
    ///
    /// Only validation problems are returned here. Everything that goes
    /// wrong once the session runs arrives as the stream's final
    /// [`RecognitionEvent::Failure`]. The session starts when the stream is
    /// first polled.
    pub fn start_streaming_recognition(
        &self,
        source: Box<dyn AudioSource>,
        config: Config,
        timeout: Duration,
    ) -> Result<RecognitionStream, RecognitionError> {
        config.validate()?;
        let options = SessionOptions {
            timeout,
            ..self.options
        };
        options.validate()?;

        let (tx, rx) = mpsc::channel(options.queue_capacity);
        let session = Arc::new(Session::new(Arc::new(EventSink::new(tx))));
        let driver = SessionDriver::new(
            Arc::clone(&session),
            Arc::clone(&self.transport),
            self.endpoint.clone(),
            self.credentials.clone(),
            config,
            options,
            source,
        );
        Ok(RecognitionStream::new(rx, session, driver, options.grace_period))
    }

    /// Run a whole session and return the last final transcript, or
    /// [`EMPTY_TRANSCRIPT`] if there was none.
    pub async fn recognize_to_text(
        &self,
        source: Box<dyn AudioSource>,
        config: Config,
        timeout: Duration,
    ) -> Result<String, RecognitionError> {
        let stream = self.start_streaming_recognition(source, config, timeout)?;
        last_final_transcript(stream).await
    }

    /// [`recognize_to_text`](Self::recognize_to_text) on a private
    /// current-thread runtime. Must not be called from async code.
    pub fn recognize_to_text_blocking(
        &self,
        source: Box<dyn AudioSource>,
        config: Config,
        timeout: Duration,
    ) -> Result<String, RecognitionError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(RecognitionError::InvalidConfig(
                "blocking recognition called inside an async runtime".to_string(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RecognitionError::Io(format!("failed to build runtime: {e}")))?;
        runtime.block_on(self.recognize_to_text(source, config, timeout))
    }
}

/// Reduce an event stream to its last final transcript. A failure event
/// becomes the error.
pub async fn last_final_transcript<S>(events: S) -> Result<String, RecognitionError>
where
    S: Stream<Item = RecognitionEvent>,
{
    tokio::pin!(events);
    let mut last_final = None;
    while let Some(event) = events.next().await {
        match event {
            RecognitionEvent::Transcript {
                text,
                is_final: true,
            } => last_final = Some(text),
            RecognitionEvent::Failure { cause, .. } => return Err(cause),
            _ => {}
        }
    }
    Ok(last_final.unwrap_or_else(|| EMPTY_TRANSCRIPT.to_string()))
}
