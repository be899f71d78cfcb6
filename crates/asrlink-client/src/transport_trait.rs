use asrlink_core::{Credentials, Endpoint, OutboundMessage, RecognitionError, WireResponse};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;

/// Receives the inbound half of a duplex call.
///
/// Callbacks run on the transport's own task. `on_event` may await (this is
/// how backpressure reaches the network), but must not block the thread.
#[async_trait]
pub trait CallObserver: Send + Sync {
    async fn on_event(&self, response: WireResponse);
    async fn on_error(&self, cause: RecognitionError);
    async fn on_completed(&self);
}

/// The outbound half of an open duplex call.
#[async_trait]
pub trait DuplexCall: Send + Sync {
    /// Send one message. Never called concurrently with itself.
    async fn send(&self, message: OutboundMessage) -> Result<(), RecognitionError>;
    /// Signal end of input; the remote may still deliver events afterwards.
    async fn finish_sending(&self) -> Result<(), RecognitionError>;
    /// Tear the call down immediately. Must not block.
    fn cancel(&self);
}

/// Opens duplex recognition calls against a remote endpoint.
///
/// TLS and auth metadata are the implementation's concern.
#[async_trait]
pub trait DuplexTransport: Send + Sync {
    fn name(&self) -> &str;
    async fn open_duplex(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        deadline: Instant,
        observer: Arc<dyn CallObserver>,
    ) -> Result<Box<dyn DuplexCall>, RecognitionError>;
}
