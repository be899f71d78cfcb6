use crate::deadline::Deadline;
use crate::transport_trait::{CallObserver, DuplexCall, DuplexTransport};
use asrlink_core::{Credentials, Endpoint, OutboundMessage, RecognitionError, WireResponse};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Enforces the observer contract on top of whatever the transport does:
/// at most one of `on_error`/`on_completed`, and nothing after it.
struct GuardedObserver {
    inner: Arc<dyn CallObserver>,
    terminated: AtomicBool,
}

#[async_trait]
impl CallObserver for GuardedObserver {
    async fn on_event(&self, response: WireResponse) {
        if self.terminated.load(Ordering::Acquire) {
            tracing::trace!(kind = response.kind(), "event after call end ignored");
            return;
        }
        self.inner.on_event(response).await;
    }

    async fn on_error(&self, cause: RecognitionError) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            tracing::debug!(error = %cause, "second terminal callback ignored");
            return;
        }
        self.inner.on_error(cause).await;
    }

    async fn on_completed(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            tracing::debug!("second terminal callback ignored");
            return;
        }
        self.inner.on_completed().await;
    }
}

/// Session-side wrapper around one duplex call.
///
/// Sends are serialized, end-of-input is signalled at most once and
/// `close` cancels the call exactly once, whichever path gets there first.
pub struct ChannelAdapter {
    call: Box<dyn DuplexCall>,
    endpoint: String,
    send_lock: Mutex<()>,
    input_finished: AtomicBool,
    closed: AtomicBool,
}

impl ChannelAdapter {
    /// Open a call, bounded by the session deadline.
    ///
    /// Transport failures surface as [`RecognitionError::Connection`].
    pub async fn open(
        transport: &dyn DuplexTransport,
        endpoint: &Endpoint,
        credentials: &Credentials,
        deadline: Deadline,
        observer: Arc<dyn CallObserver>,
    ) -> Result<Self, RecognitionError> {
        let guarded: Arc<dyn CallObserver> = Arc::new(GuardedObserver {
            inner: observer,
            terminated: AtomicBool::new(false),
        });
        let opening = transport.open_duplex(endpoint, credentials, deadline.instant(), guarded);
        let call = match tokio::time::timeout_at(deadline.instant(), opening).await {
            Ok(Ok(call)) => call,
            Ok(Err(e @ (RecognitionError::Connection(_) | RecognitionError::DeadlineExceeded(_)))) => {
                return Err(e)
            }
            Ok(Err(other)) => return Err(RecognitionError::Connection(other.to_string())),
            Err(_) => return Err(deadline.exceeded()),
        };

        tracing::debug!(
            transport = transport.name(),
            endpoint = %endpoint,
            "duplex call opened"
        );
        Ok(Self {
            call,
            endpoint: endpoint.to_string(),
            send_lock: Mutex::new(()),
            input_finished: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub async fn send(&self, message: OutboundMessage) -> Result<(), RecognitionError> {
        let _guard = self.send_lock.lock().await;
        if self.is_closed() {
            return Err(RecognitionError::Io("channel closed".to_string()));
        }
        if self.input_finished.load(Ordering::Acquire) {
            return Err(RecognitionError::Io("send after end of input".to_string()));
        }
        self.call.send(message).await
    }

    /// Signal end of input. Repeated calls are no-ops.
    pub async fn finish_sending(&self) -> Result<(), RecognitionError> {
        let _guard = self.send_lock.lock().await;
        if self.is_closed() {
            return Err(RecognitionError::Io("channel closed".to_string()));
        }
        if self.input_finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(endpoint = %self.endpoint, "end of input");
        self.call.finish_sending().await
    }

    /// Cancel the call. Safe to call from any path, any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.call.cancel();
        tracing::debug!(endpoint = %self.endpoint, "duplex call closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptStep, ScriptedTransport};
    use asrlink_core::{AudioChunk, Config};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Collect {
        events: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CallObserver for Collect {
        async fn on_event(&self, response: WireResponse) {
            self.events.lock().unwrap().push(response.kind().to_string());
        }
        async fn on_error(&self, cause: RecognitionError) {
            self.events.lock().unwrap().push(format!("error:{}", cause.kind()));
        }
        async fn on_completed(&self) {
            self.events.lock().unwrap().push("completed".to_string());
        }
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    fn chunk(sequence: u64) -> OutboundMessage {
        OutboundMessage::Audio(AudioChunk {
            bytes: vec![0; 4],
            sequence,
            is_last: false,
        })
    }

    async fn open(transport: &ScriptedTransport) -> ChannelAdapter {
        ChannelAdapter::open(
            transport,
            &Endpoint::default(),
            &Credentials::new("key", "scope"),
            deadline(),
            Arc::new(Collect::default()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_open_failure_maps_to_connection() {
        let transport =
            ScriptedTransport::failing_open(RecognitionError::Io("refused".to_string()));
        let result = ChannelAdapter::open(
            &transport,
            &Endpoint::default(),
            &Credentials::new("key", "scope"),
            deadline(),
            Arc::new(Collect::default()),
        )
        .await;
        match result {
            Err(RecognitionError::Connection(msg)) => assert!(msg.contains("refused")),
            other => panic!("expected Connection, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_close_cancels_exactly_once() {
        let transport = ScriptedTransport::new(vec![]);
        let record = transport.record();
        let channel = open(&transport).await;
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert_eq!(record.cancels(), 1);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let transport = ScriptedTransport::new(vec![]);
        let channel = open(&transport).await;
        channel
            .send(OutboundMessage::Config(Config::default()))
            .await
            .unwrap();
        channel.close();
        assert!(matches!(
            channel.send(chunk(0)).await,
            Err(RecognitionError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_finish_sending_is_idempotent() {
        let transport = ScriptedTransport::new(vec![]);
        let record = transport.record();
        let channel = open(&transport).await;
        channel.send(chunk(0)).await.unwrap();
        channel.finish_sending().await.unwrap();
        channel.finish_sending().await.unwrap();
        assert!(record.input_finished());
        assert!(matches!(
            channel.send(chunk(1)).await,
            Err(RecognitionError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_all_delivered() {
        let transport = ScriptedTransport::new(vec![]);
        let record = transport.record();
        let channel = Arc::new(open(&transport).await);

        let mut handles = Vec::new();
        for i in 0..8 {
            let channel = Arc::clone(&channel);
            handles.push(tokio::spawn(async move { channel.send(chunk(i)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(record.sent().len(), 8);
    }

    struct SlowTransport;

    #[async_trait]
    impl DuplexTransport for SlowTransport {
        fn name(&self) -> &str {
            "slow"
        }

        async fn open_duplex(
            &self,
            _endpoint: &Endpoint,
            _credentials: &Credentials,
            _deadline: tokio::time::Instant,
            _observer: Arc<dyn CallObserver>,
        ) -> Result<Box<dyn DuplexCall>, RecognitionError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_open_bounded_by_deadline() {
        let result = ChannelAdapter::open(
            &SlowTransport,
            &Endpoint::default(),
            &Credentials::new("key", "scope"),
            Deadline::after(Duration::from_millis(50)),
            Arc::new(Collect::default()),
        )
        .await;
        assert!(matches!(
            result.err(),
            Some(RecognitionError::DeadlineExceeded(d)) if d == Duration::from_millis(50)
        ));
    }

    /// Transport that fires both terminal callbacks and a trailing event.
    struct SloppyTransport {
        fired: Arc<AtomicUsize>,
    }

    struct NoopCall;

    #[async_trait]
    impl DuplexCall for NoopCall {
        async fn send(&self, _message: OutboundMessage) -> Result<(), RecognitionError> {
            Ok(())
        }
        async fn finish_sending(&self) -> Result<(), RecognitionError> {
            Ok(())
        }
        fn cancel(&self) {}
    }

    #[async_trait]
    impl DuplexTransport for SloppyTransport {
        fn name(&self) -> &str {
            "sloppy"
        }

        async fn open_duplex(
            &self,
            _endpoint: &Endpoint,
            _credentials: &Credentials,
            _deadline: tokio::time::Instant,
            observer: Arc<dyn CallObserver>,
        ) -> Result<Box<dyn DuplexCall>, RecognitionError> {
            observer.on_event(WireResponse::transcript("a", false)).await;
            observer.on_completed().await;
            observer.on_error(RecognitionError::Io("late".to_string())).await;
            observer.on_event(WireResponse::transcript("b", true)).await;
            self.fired.fetch_add(4, Ordering::SeqCst);
            Ok(Box::new(NoopCall))
        }
    }

    #[tokio::test]
    async fn test_guard_drops_callbacks_after_terminal() {
        let collect = Arc::new(Collect::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let transport = SloppyTransport {
            fired: Arc::clone(&fired),
        };
        let observer: Arc<dyn CallObserver> = collect.clone();
        ChannelAdapter::open(
            &transport,
            &Endpoint::default(),
            &Credentials::new("key", "scope"),
            deadline(),
            observer,
        )
        .await
        .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 4);
        assert_eq!(
            *collect.events.lock().unwrap(),
            vec!["transcription".to_string(), "completed".to_string()]
        );
    }

    #[tokio::test]
    async fn test_scripted_events_reach_observer() {
        let transport = ScriptedTransport::new(vec![
            ScriptStep::respond(WireResponse::transcript("hi", true)),
            ScriptStep::Complete,
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        struct Forward(mpsc::UnboundedSender<String>);

        #[async_trait]
        impl CallObserver for Forward {
            async fn on_event(&self, response: WireResponse) {
                let _ = self.0.send(response.kind().to_string());
            }
            async fn on_error(&self, _cause: RecognitionError) {
                let _ = self.0.send("error".to_string());
            }
            async fn on_completed(&self) {
                let _ = self.0.send("completed".to_string());
            }
        }

        let _channel = ChannelAdapter::open(
            &transport,
            &Endpoint::default(),
            &Credentials::new("key", "scope"),
            deadline(),
            Arc::new(Forward(tx)),
        )
        .await
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out");
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out");
        assert_eq!(first.as_deref(), Some("transcription"));
        assert_eq!(second.as_deref(), Some("completed"));
    }
}
