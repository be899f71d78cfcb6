use crate::session::{Control, Session, SessionDriver};
use asrlink_core::{RecognitionError, RecognitionEvent, SessionState};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushError {
    /// The consumer went away or the sink already ended.
    Closed,
    /// The queue stayed full until the deadline.
    TimedOut,
}

/// Producer half of the bounded result queue.
///
/// The sender sits behind an async mutex held across each send, so once
/// [`fail`](Self::fail) or [`finish`](Self::finish) has taken it no other
/// event can follow.
pub(crate) struct EventSink {
    tx: Mutex<Option<mpsc::Sender<RecognitionEvent>>>,
    emitted: AtomicU64,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<RecognitionEvent>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            emitted: AtomicU64::new(0),
        }
    }

    /// Enqueue one event, waiting for room until `deadline`.
    pub(crate) async fn push(
        &self,
        event: RecognitionEvent,
        deadline: Instant,
    ) -> Result<(), PushError> {
        let guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(PushError::Closed);
        };
        match tokio::time::timeout_at(deadline, tx.send(event)).await {
            Ok(Ok(())) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_)) => Err(PushError::Closed),
            Err(_) => Err(PushError::TimedOut),
        }
    }

    /// Deliver the terminal failure and end the queue. Gives up after
    /// `wait` if the consumer does not make room. Returns whether the
    /// failure was enqueued.
    pub(crate) async fn fail(&self, cause: RecognitionError, wait: Duration) -> bool {
        let Some(tx) = self.tx.lock().await.take() else {
            return false;
        };
        match tokio::time::timeout(wait, tx.send(RecognitionEvent::failure(cause))).await {
            Ok(Ok(())) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// End the queue without a failure.
    pub(crate) async fn finish(&self) {
        self.tx.lock().await.take();
    }

    pub(crate) fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

/// Requests a graceful end of audio for one session.
///
/// Audio already read is still sent, end-of-input is signalled, and results
/// keep arriving until the remote completes.
#[derive(Clone)]
pub struct StopHandle {
    session: Arc<Session>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.session.request(Control::StopAudio);
    }
}

/// The ordered events of one recognition session.
///
/// Nothing happens until the stream is first polled. The stream ends after
/// a [`RecognitionEvent::Failure`] or when the remote completes. Dropping it
/// early cancels the session and releases the audio source and the call
/// before `drop` returns.
pub struct RecognitionStream {
    rx: mpsc::Receiver<RecognitionEvent>,
    session: Arc<Session>,
    driver: Option<SessionDriver>,
    task: Option<JoinHandle<()>>,
    grace_period: Duration,
    finished: bool,
}

impl RecognitionStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<RecognitionEvent>,
        session: Arc<Session>,
        driver: SessionDriver,
        grace_period: Duration,
    ) -> Self {
        Self {
            rx,
            session,
            driver: Some(driver),
            task: None,
            grace_period,
            finished: false,
        }
    }

    fn start(&mut self) {
        if let Some(driver) = self.driver.take() {
            tracing::debug!(session_id = self.session.id(), "starting session");
            self.task = Some(tokio::spawn(driver.run()));
        }
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<RecognitionEvent> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Events enqueued so far, including a terminal failure.
    pub fn events_emitted(&self) -> u64 {
        self.session.events_emitted()
    }

    /// Stop reading audio and let the remote finish the utterance.
    pub fn stop_audio(&self) {
        self.session.request(Control::StopAudio);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            session: Arc::clone(&self.session),
        }
    }

    /// Cancel the session and wait, bounded by the grace period, for its
    /// background work to end. Returns the terminal state.
    pub async fn cancel(mut self) -> SessionState {
        self.rx.close();
        self.driver = None;
        self.session.cancel();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(self.grace_period, &mut task).await.is_err() {
                tracing::warn!(
                    session_id = self.session.id(),
                    "session did not stop within grace period; aborting"
                );
                task.abort();
            }
        }
        self.finished = true;
        self.session.state()
    }
}

impl Stream for RecognitionStream {
    type Item = RecognitionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        this.start();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_failure() {
                    this.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => this.poll_driver(cx),
        }
    }
}

impl RecognitionStream {
    /// Called while the queue is empty. A driver that returned normally has
    /// already ended the queue, so only a panicked or aborted one is
    /// reported here.
    fn poll_driver(&mut self, cx: &mut Context<'_>) -> Poll<Option<RecognitionEvent>> {
        let Some(task) = self.task.as_mut() else {
            return Poll::Pending;
        };
        let joined = match Pin::new(task).poll(cx) {
            Poll::Ready(joined) => joined,
            Poll::Pending => return Poll::Pending,
        };
        self.task = None;
        match joined {
            Ok(()) => match self.rx.poll_recv(cx) {
                Poll::Ready(Some(event)) => {
                    if event.is_failure() {
                        self.finished = true;
                    }
                    Poll::Ready(Some(event))
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
            Err(e) => {
                let cause = RecognitionError::Io(format!("session driver stopped: {e}"));
                self.session.abandon(cause.clone());
                self.rx.close();
                self.finished = true;
                Poll::Ready(Some(RecognitionEvent::failure(cause)))
            }
        }
    }
}

impl Drop for RecognitionStream {
    fn drop(&mut self) {
        self.rx.close();
        // A never-started driver still owns the unopened source; dropping it is enough
        self.driver = None;
        self.session.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(text: &str) -> RecognitionEvent {
        RecognitionEvent::Transcript {
            text: text.to_string(),
            is_final: false,
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    #[tokio::test]
    async fn test_push_blocks_when_full_until_deadline() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = EventSink::new(tx);
        sink.push(partial("a"), soon()).await.unwrap();
        let blocked = sink
            .push(partial("b"), Instant::now() + Duration::from_millis(50))
            .await;
        assert_eq!(blocked, Err(PushError::TimedOut));
        assert_eq!(sink.emitted(), 1);
        assert_eq!(rx.recv().await, Some(partial("a")));
    }

    #[tokio::test]
    async fn test_push_resumes_when_consumer_drains() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = Arc::new(EventSink::new(tx));
        sink.push(partial("a"), soon()).await.unwrap();

        let producer = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { sink.push(partial("b"), soon()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(rx.recv().await, Some(partial("a")));
        producer.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(partial("b")));
    }

    #[tokio::test]
    async fn test_fail_is_last_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = EventSink::new(tx);
        sink.push(partial("a"), soon()).await.unwrap();
        assert!(sink.fail(RecognitionError::Cancelled, Duration::from_secs(1)).await);
        assert_eq!(sink.push(partial("late"), soon()).await, Err(PushError::Closed));
        assert!(!sink.fail(RecognitionError::Cancelled, Duration::from_secs(1)).await);

        assert_eq!(rx.recv().await, Some(partial("a")));
        assert!(rx.recv().await.is_some_and(|e| e.is_failure()));
        assert_eq!(rx.recv().await, None);
        assert_eq!(sink.emitted(), 2);
    }

    #[tokio::test]
    async fn test_finish_ends_queue() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = EventSink::new(tx);
        sink.finish().await;
        assert_eq!(rx.recv().await, None);
        assert_eq!(sink.push(partial("x"), soon()).await, Err(PushError::Closed));
    }

    #[tokio::test]
    async fn test_push_after_consumer_gone_is_closed() {
        let (tx, rx) = mpsc::channel(4);
        let sink = EventSink::new(tx);
        drop(rx);
        assert_eq!(sink.push(partial("x"), soon()).await, Err(PushError::Closed));
    }
}
