//! Bidirectional streaming link to the remote voice service

mod websocket;

pub use websocket::LiveWebSocketTransport;

use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::EncodedChunk;
use crate::config::SessionConfig;

/// How long `close` waits for queued chunks to drain
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the inbound event channel
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Outbound queue full, chunk dropped")]
    Backpressure,

    #[error("Outbound queue closed")]
    QueueClosed,

    #[error("Remote error: {0}")]
    Remote(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

impl From<crate::protocol::ProtocolError> for TransportError {
    fn from(e: crate::protocol::ProtocolError) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Speaker {
    User,
    Model,
}

/// Something the remote side told us
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Incremental transcript text
    TranscriptDelta { speaker: Speaker, text: String },
    /// PCM16 LE audio
    AudioDelta {
        payload: Vec<u8>,
        sample_rate: u32,
        channels: u16,
    },
    /// The user barged in; drop everything queued for playback
    Interrupted,
    /// The remote end closed the stream
    Closed,
    /// The link failed
    Error(TransportError),
}

impl ServerEvent {
    /// No further events follow a terminal one
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerEvent::Closed | ServerEvent::Error(_))
    }
}

/// Sending half of a link. Never blocks: chunks that do not fit are dropped.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<EncodedChunk>,
    dropped: Arc<AtomicU64>,
}

impl OutboundQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<EncodedChunk>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queue a chunk in order behind those already queued
    pub fn send(&self, chunk: EncodedChunk) -> Result<(), TransportError> {
        match self.tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 50 == 0 {
                    log::warn!("📤 Outbound queue full, dropped {} chunk(s) so far", dropped);
                }
                Err(TransportError::Backpressure)
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::QueueClosed),
        }
    }

    /// Chunks dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a link.
///
/// Always ends with a terminal event: if the producer goes away without
/// sending one, a `Closed` is synthesized.
pub struct EventStream {
    rx: mpsc::Receiver<ServerEvent>,
    finished: bool,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<ServerEvent>) -> Self {
        Self {
            rx,
            finished: false,
        }
    }
}

impl Stream for EventStream {
    type Item = ServerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(Some(ServerEvent::Closed))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Tears down the tasks behind a link
pub struct LinkShutdown {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    flush_timeout: Duration,
}

impl LinkShutdown {
    pub fn new(cancel: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            cancel,
            tasks,
            flush_timeout: CLOSE_FLUSH_TIMEOUT,
        }
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// A shutdown with no tasks behind it
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), Vec::new())
    }

    /// Signal the tasks without waiting for them
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Signal the tasks and wait for them, aborting whatever outlives the flush timeout
    pub async fn close(self) {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + self.flush_timeout;

        for mut task in self.tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                log::warn!("Transport task did not finish within {:?}, aborting", self.flush_timeout);
                task.abort();
            }
        }
    }
}

/// An established connection: outbound queue, inbound events and a way to close
pub struct TransportLink {
    outbound: OutboundQueue,
    events: EventStream,
    shutdown: LinkShutdown,
}

impl TransportLink {
    pub fn new(
        outbound: OutboundQueue,
        events: mpsc::Receiver<ServerEvent>,
        shutdown: LinkShutdown,
    ) -> Self {
        Self {
            outbound,
            events: EventStream::new(events),
            shutdown,
        }
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    pub fn events(&mut self) -> &mut EventStream {
        &mut self.events
    }

    pub fn into_parts(self) -> (OutboundQueue, EventStream, LinkShutdown) {
        (self.outbound, self.events, self.shutdown)
    }

    pub async fn close(self) {
        self.shutdown.close().await;
    }
}

/// Opens links to a streaming voice service
#[async_trait]
pub trait StreamingTransport: Send + Sync {
    /// Connect and finish the service handshake. The returned link is ready for audio.
    async fn connect(&self, config: &SessionConfig) -> Result<TransportLink, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AudioFormat;
    use futures_util::StreamExt;

    fn chunk(byte: u8) -> EncodedChunk {
        EncodedChunk {
            data: vec![byte, 0],
            format: AudioFormat::pcm16(16000, 1),
        }
    }

    #[test]
    fn test_outbound_queue_drops_when_full() {
        let (queue, mut rx) = OutboundQueue::bounded(2);
        assert!(queue.send(chunk(1)).is_ok());
        assert!(queue.send(chunk(2)).is_ok());
        assert_eq!(queue.send(chunk(3)), Err(TransportError::Backpressure));
        assert_eq!(queue.dropped(), 1);

        // Order of accepted chunks is preserved
        assert_eq!(rx.try_recv().unwrap().data[0], 1);
        assert_eq!(rx.try_recv().unwrap().data[0], 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_outbound_queue_closed() {
        let (queue, rx) = OutboundQueue::bounded(2);
        drop(rx);
        assert!(queue.is_closed());
        assert_eq!(queue.send(chunk(1)), Err(TransportError::QueueClosed));
    }

    #[tokio::test]
    async fn test_event_stream_synthesizes_close() {
        let (tx, rx) = mpsc::channel(4);
        let mut events = EventStream::new(rx);
        tx.send(ServerEvent::Interrupted).await.unwrap();
        drop(tx);

        assert_eq!(events.next().await, Some(ServerEvent::Interrupted));
        assert_eq!(events.next().await, Some(ServerEvent::Closed));
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_event_stream_ends_after_error() {
        let (tx, rx) = mpsc::channel(4);
        let mut events = EventStream::new(rx);
        tx.send(ServerEvent::Error(TransportError::Remote("boom".into())))
            .await
            .unwrap();
        tx.send(ServerEvent::Interrupted).await.unwrap();

        assert!(matches!(events.next().await, Some(ServerEvent::Error(_))));
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_tasks() {
        let cancel = CancellationToken::new();
        let stuck = tokio::spawn(async {
            std::future::pending::<()>().await;
        });
        let token = cancel.clone();
        let polite = tokio::spawn(async move { token.cancelled().await });

        LinkShutdown::new(cancel.clone(), vec![stuck, polite])
            .with_flush_timeout(Duration::from_millis(50))
            .close()
            .await;
        assert!(cancel.is_cancelled());
    }
}
