use crate::channel::ChannelAdapter;
use crate::deadline::Deadline;
use crate::feeder::{AudioFeeder, FeederOutcome, SourceSlot};
use crate::stream::{EventSink, PushError};
use crate::translate::translate;
use crate::transport_trait::{CallObserver, DuplexTransport};
use asrlink_audio::AudioSource;
use asrlink_core::{
    Config, Credentials, Endpoint, OutboundMessage, RecognitionError, RecognitionEvent,
    SessionOptions, SessionState, WireResponse,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Requests from the consumer side. Only ever escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Control {
    Running,
    StopAudio,
    Cancel,
}

/// Resolve once the control level reaches `at_least`. Never resolves if
/// the sender is gone without getting there.
pub(crate) async fn wait_for_control(rx: &mut watch::Receiver<Control>, at_least: Control) {
    loop {
        if *rx.borrow_and_update() >= at_least {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// State shared between the session driver and the consumer's handles.
pub(crate) struct Session {
    id: u64,
    state: Mutex<SessionState>,
    control: watch::Sender<Control>,
    channel: OnceLock<Arc<ChannelAdapter>>,
    source: OnceLock<Arc<SourceSlot>>,
    sink: Arc<EventSink>,
}

impl Session {
    pub(crate) fn new(sink: Arc<EventSink>) -> Self {
        let (control, _) = watch::channel(Control::Running);
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SessionState::Idle),
            control,
            channel: OnceLock::new(),
            source: OnceLock::new(),
            sink,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn events_emitted(&self) -> u64 {
        self.sink.emitted()
    }

    /// Move to `next`. Terminal states are never left.
    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_terminal() {
            tracing::trace!(
                session_id = self.id,
                state = ?*state,
                ignored = ?next,
                "session already terminal"
            );
            return false;
        }
        tracing::debug!(session_id = self.id, from = ?*state, to = ?next, "session state");
        *state = next;
        true
    }

    pub(crate) fn request(&self, control: Control) {
        self.control.send_if_modified(|current| {
            if control > *current {
                *current = control;
                true
            } else {
                false
            }
        });
    }

    fn adopt_source(&self, source: Box<dyn AudioSource>) -> Arc<SourceSlot> {
        let slot = Arc::new(SourceSlot::new(source));
        let _ = self.source.set(Arc::clone(&slot));
        slot
    }

    fn adopt_channel(&self, channel: ChannelAdapter) -> Arc<ChannelAdapter> {
        let channel = Arc::new(channel);
        let _ = self.channel.set(Arc::clone(&channel));
        channel
    }

    /// Close the call and the source, if they were ever opened.
    fn release(&self) {
        if let Some(channel) = self.channel.get() {
            channel.close();
        }
        if let Some(source) = self.source.get() {
            source.close();
        }
    }

    /// Cancel from the consumer side. Synchronous so `Drop` can use it.
    pub(crate) fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.request(Control::Cancel);
        self.release();
        if self.transition(SessionState::Failed(RecognitionError::Cancelled)) {
            tracing::info!(session_id = self.id, "session cancelled");
        }
    }

    /// The driver task ended without closing the result queue. Releases
    /// what it left behind and records `cause` unless already terminal.
    pub(crate) fn abandon(&self, cause: RecognitionError) {
        self.request(Control::Cancel);
        self.release();
        if self.transition(SessionState::Failed(cause.clone())) {
            tracing::error!(
                session_id = self.id,
                kind = cause.kind(),
                error = %cause,
                "session driver stopped unexpectedly"
            );
        }
    }
}

enum Terminal {
    Completed,
    Failed(RecognitionError),
}

/// Observer handed to the transport: translates inbound frames into the
/// result queue and reports the call's end to the driver.
struct Relay {
    session_id: u64,
    sink: Arc<EventSink>,
    deadline: Deadline,
    terminal: Mutex<Option<oneshot::Sender<Terminal>>>,
    /// Set once a frame failed translation; later frames are discarded.
    rejected: AtomicBool,
}

impl Relay {
    fn new(
        session_id: u64,
        sink: Arc<EventSink>,
        deadline: Deadline,
    ) -> (Self, oneshot::Receiver<Terminal>) {
        let (tx, rx) = oneshot::channel();
        let relay = Self {
            session_id,
            sink,
            deadline,
            terminal: Mutex::new(Some(tx)),
            rejected: AtomicBool::new(false),
        };
        (relay, rx)
    }

    fn signal(&self, terminal: Terminal) {
        let tx = self
            .terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(terminal);
        }
    }
}

#[async_trait]
impl CallObserver for Relay {
    async fn on_event(&self, response: WireResponse) {
        if self.rejected.load(Ordering::Acquire) {
            tracing::trace!(
                session_id = self.session_id,
                kind = response.kind(),
                "frame after rejected frame discarded"
            );
            return;
        }
        let event = match translate(&response) {
            Some(RecognitionEvent::Failure { cause, .. }) => {
                self.rejected.store(true, Ordering::Release);
                self.signal(Terminal::Failed(cause));
                return;
            }
            Some(event) => event,
            None => {
                tracing::trace!(
                    session_id = self.session_id,
                    kind = response.kind(),
                    "nothing to forward"
                );
                return;
            }
        };
        match self.sink.push(event, self.deadline.instant()).await {
            Ok(()) => {}
            Err(PushError::Closed) => {
                tracing::trace!(session_id = self.session_id, "result queue closed");
            }
            Err(PushError::TimedOut) => {
                tracing::warn!(
                    session_id = self.session_id,
                    "consumer stalled until the deadline; event dropped"
                );
            }
        }
    }

    async fn on_error(&self, cause: RecognitionError) {
        self.signal(Terminal::Failed(cause));
    }

    async fn on_completed(&self) {
        self.signal(Terminal::Completed);
    }
}

/// Everything needed to run one session, held until the stream is first
/// polled.
pub(crate) struct SessionDriver {
    session: Arc<Session>,
    transport: Arc<dyn DuplexTransport>,
    endpoint: Endpoint,
    credentials: Credentials,
    config: Config,
    options: SessionOptions,
    source: Box<dyn AudioSource>,
}

impl SessionDriver {
    pub(crate) fn new(
        session: Arc<Session>,
        transport: Arc<dyn DuplexTransport>,
        endpoint: Endpoint,
        credentials: Credentials,
        config: Config,
        options: SessionOptions,
        source: Box<dyn AudioSource>,
    ) -> Self {
        Self {
            session,
            transport,
            endpoint,
            credentials,
            config,
            options,
            source,
        }
    }

    pub(crate) async fn run(self) {
        let SessionDriver {
            session,
            transport,
            endpoint,
            credentials,
            config,
            options,
            source,
        } = self;
        let deadline = Deadline::after(options.timeout);
        let mut control = session.control.subscribe();
        let mut feeder: Option<JoinHandle<FeederOutcome>> = None;

        tracing::info!(
            session_id = session.id,
            endpoint = %endpoint,
            source = source.name(),
            encoding = ?config.audio_encoding,
            sample_rate_hz = config.sample_rate_hz,
            timeout = ?options.timeout,
            "recognition session started"
        );

        session.transition(SessionState::Opening);
        let mut source = source;
        let opened = tokio::select! {
            biased;
            _ = wait_for_control(&mut control, Control::Cancel) => Err(RecognitionError::Cancelled),
            _ = tokio::time::sleep_until(deadline.instant()) => Err(deadline.exceeded()),
            opened = source.open() => opened,
        };
        // Registered even when open failed, so release closes it on every path
        let source = session.adopt_source(source);

        let run = Run {
            session: &session,
            transport: transport.as_ref(),
            endpoint: &endpoint,
            credentials: &credentials,
            deadline,
            chunk_size: options.chunk_size,
        };
        let result = match opened {
            Err(cause) => Err(cause),
            Ok(()) => tokio::select! {
                biased;
                _ = wait_for_control(&mut control, Control::Cancel) => Err(RecognitionError::Cancelled),
                _ = tokio::time::sleep_until(deadline.instant()) => Err(deadline.exceeded()),
                result = run.drive(source, config, &mut feeder) => result,
            },
        };

        session.request(Control::StopAudio);
        session.release();
        if let Some(mut handle) = feeder.take() {
            if tokio::time::timeout(options.grace_period, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    session_id = session.id,
                    "audio feeder did not stop within grace period; aborting"
                );
                handle.abort();
            }
        }

        match result {
            Ok(()) => {
                session.transition(SessionState::Closed);
                session.sink.finish().await;
                tracing::info!(
                    session_id = session.id,
                    events = session.events_emitted(),
                    "recognition session closed"
                );
            }
            Err(cause) => {
                tracing::warn!(
                    session_id = session.id,
                    kind = cause.kind(),
                    error = %cause,
                    "recognition session failed"
                );
                session.transition(SessionState::Failed(cause.clone()));
                if !session.sink.fail(cause, options.grace_period).await {
                    tracing::debug!(session_id = session.id, "failure not delivered");
                }
            }
        }
    }
}

/// Borrowed view of a running session, for the part of the driver that can
/// be interrupted by cancel or the deadline.
struct Run<'a> {
    session: &'a Session,
    transport: &'a dyn DuplexTransport,
    endpoint: &'a Endpoint,
    credentials: &'a Credentials,
    deadline: Deadline,
    chunk_size: usize,
}

enum Streamed {
    Feeder(FeederOutcome),
    Remote(Result<Terminal, oneshot::error::RecvError>),
}

fn remote_result(
    terminal: Result<Terminal, oneshot::error::RecvError>,
) -> Result<(), RecognitionError> {
    match terminal {
        Ok(Terminal::Completed) => Ok(()),
        Ok(Terminal::Failed(cause)) => Err(cause),
        Err(_) => Err(RecognitionError::Io(
            "call ended without completing".to_string(),
        )),
    }
}

async fn join_feeder(feeder: &mut Option<JoinHandle<FeederOutcome>>) -> FeederOutcome {
    let Some(handle) = feeder.as_mut() else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *feeder = None;
    joined.unwrap_or_else(|e| {
        FeederOutcome::Failed(RecognitionError::Io(format!("audio feeder task failed: {e}")))
    })
}

impl Run<'_> {
    async fn drive(
        &self,
        source: Arc<SourceSlot>,
        config: Config,
        feeder: &mut Option<JoinHandle<FeederOutcome>>,
    ) -> Result<(), RecognitionError> {
        let session = self.session;

        let (relay, mut terminal_rx) =
            Relay::new(session.id, Arc::clone(&session.sink), self.deadline);
        let relay = Arc::new(relay);
        let channel = ChannelAdapter::open(
            self.transport,
            self.endpoint,
            self.credentials,
            self.deadline,
            relay,
        )
        .await?;
        let channel = session.adopt_channel(channel);

        session.transition(SessionState::Configuring);
        channel.send(OutboundMessage::Config(config)).await?;

        session.transition(SessionState::Streaming);
        *feeder = Some(
            AudioFeeder::new(
                session.id,
                Arc::clone(&source),
                Arc::clone(&channel),
                self.chunk_size,
                session.control.subscribe(),
            )
            .spawn(),
        );
        tracing::debug!(session_id = session.id, source = source.name(), "streaming audio");

        let streamed = tokio::select! {
            outcome = join_feeder(feeder) => Streamed::Feeder(outcome),
            terminal = &mut terminal_rx => Streamed::Remote(terminal),
        };

        match streamed {
            Streamed::Feeder(FeederOutcome::Failed(cause)) => Err(cause),
            Streamed::Feeder(outcome) => {
                tracing::debug!(session_id = session.id, ?outcome, "audio done, draining");
                session.transition(SessionState::Draining);
                channel.finish_sending().await?;
                remote_result(terminal_rx.await)
            }
            Streamed::Remote(terminal) => {
                tracing::debug!(session_id = session.id, "remote ended before audio did");
                session.transition(SessionState::Draining);
                remote_result(terminal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session() -> Session {
        let (tx, _rx) = mpsc::channel(4);
        Session::new(Arc::new(EventSink::new(tx)))
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = session();
        let b = session();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let s = session();
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.transition(SessionState::Opening));
        assert!(s.transition(SessionState::Closed));
        assert!(!s.transition(SessionState::Failed(RecognitionError::Cancelled)));
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_cancel_marks_failed_once() {
        let s = session();
        s.transition(SessionState::Streaming);
        s.cancel();
        s.cancel();
        assert_eq!(
            s.state(),
            SessionState::Failed(RecognitionError::Cancelled)
        );
        assert_eq!(*s.control.borrow(), Control::Cancel);
    }

    #[test]
    fn test_control_only_escalates() {
        let s = session();
        s.request(Control::Cancel);
        s.request(Control::StopAudio);
        assert_eq!(*s.control.borrow(), Control::Cancel);
    }

    #[tokio::test]
    async fn test_wait_for_control_sees_earlier_request() {
        let s = session();
        let mut rx = s.control.subscribe();
        s.request(Control::StopAudio);
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            wait_for_control(&mut rx, Control::StopAudio),
        )
        .await
        .expect("stop request not observed");
    }

    #[test]
    fn test_remote_result_mapping() {
        assert!(remote_result(Ok(Terminal::Completed)).is_ok());
        assert_eq!(
            remote_result(Ok(Terminal::Failed(RecognitionError::Provider(
                "x".to_string()
            )))),
            Err(RecognitionError::Provider("x".to_string()))
        );
    }
}
