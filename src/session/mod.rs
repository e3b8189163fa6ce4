//! Session lifecycle: wires capture, transport and playback together.
//!
//! Outbound: microphone frames are encoded and queued on the transport.
//! Inbound: transcripts go to the caller's callback, audio is decoded and
//! scheduled, interruptions cancel playback. A render tick keeps the
//! scheduler and the published speaking flag current.

mod state;

pub use state::{CloseReason, SessionState};

use futures_util::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::audio_capture::{AudioCaptureError, CaptureSource, FrameStream};
use crate::audio_sink::AudioSink;
use crate::codec::{AudioFormat, EncodedChunk, FrameCodec};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::playback::{Clock, PlaybackScheduler, SystemClock, RENDER_TICK};
use crate::transport::{
    EventStream, LinkShutdown, OutboundQueue, ServerEvent, Speaker, StreamingTransport,
    TransportError, TransportLink,
};

/// Receives transcript deltas as they arrive
pub type TranscriptCallback = Arc<dyn Fn(&str, Speaker) + Send + Sync>;

/// Bookkeeping for the session currently running
struct ActiveSession {
    generation: u64,
    cancel: CancellationToken,
    link: LinkShutdown,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    config: SessionConfig,
    transport: Arc<dyn StreamingTransport>,
    capture: Mutex<Box<dyn CaptureSource>>,
    scheduler: Arc<PlaybackScheduler>,
    on_transcript: TranscriptCallback,
    state_tx: watch::Sender<SessionState>,
    close_reason: Mutex<Option<CloseReason>>,
    lifecycle: tokio::sync::Mutex<Option<ActiveSession>>,
    next_generation: Mutex<u64>,
    /// Cancels the connect attempt in flight; lives outside `lifecycle` so `close` can reach it
    connecting: Mutex<Option<CancellationToken>>,
    /// Parent of every per-session token; cancelled when the controller is dropped
    shutdown: CancellationToken,
}

/// One duplex voice conversation.
///
/// `connect` moves Idle/Closed -> Connecting -> Active; `close`, a remote
/// close, a link failure or losing the microphone move Active -> Closed.
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new<F>(
        config: SessionConfig,
        capture: Box<dyn CaptureSource>,
        transport: Arc<dyn StreamingTransport>,
        sink: Arc<dyn AudioSink>,
        on_transcript: F,
    ) -> Self
    where
        F: Fn(&str, Speaker) + Send + Sync + 'static,
    {
        Self::with_clock(
            config,
            capture,
            transport,
            sink,
            on_transcript,
            Arc::new(SystemClock::new()),
        )
    }

    /// Like `new`, with an explicit playback clock
    pub fn with_clock<F>(
        config: SessionConfig,
        capture: Box<dyn CaptureSource>,
        transport: Arc<dyn StreamingTransport>,
        sink: Arc<dyn AudioSink>,
        on_transcript: F,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        F: Fn(&str, Speaker) + Send + Sync + 'static,
    {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                capture: Mutex::new(capture),
                scheduler: Arc::new(PlaybackScheduler::new(clock, sink)),
                on_transcript: Arc::new(on_transcript),
                state_tx,
                close_reason: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(None),
                next_generation: Mutex::new(0),
                connecting: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Acquire the microphone, open the transport and start streaming.
    ///
    /// On failure the microphone is released and the session returns to `Idle`.
    /// A `close` issued meanwhile aborts the attempt and leaves it `Closed`.
    pub async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        let mut lifecycle = shared.lifecycle.lock().await;

        let current = shared.state();
        if !current.can_connect() {
            return Err(SessionError::InvalidState(format!(
                "cannot connect while {}",
                current
            )));
        }
        shared.config.validate()?;

        log::info!("🔌 Session: Connecting to {}", shared.config.model);
        let attempt = shared.shutdown.child_token();
        shared.set_connecting(Some(attempt.clone()));
        shared.set_state(SessionState::Connecting);
        shared.set_close_reason(None);

        let result = shared.open_link(&attempt).await;
        shared.set_connecting(None);
        let (frames, link) = result?;
        if attempt.is_cancelled() {
            link.close().await;
            return Err(shared.abandon_connect());
        }

        let (outbound, events, link) = link.into_parts();
        let generation = shared.next_generation();
        let cancel = shared.shutdown.child_token();
        shared.scheduler.reset();

        let tasks = vec![
            tokio::spawn(run_outbound(
                Arc::clone(shared),
                frames,
                outbound,
                cancel.clone(),
                generation,
            )),
            tokio::spawn(run_inbound(
                Arc::clone(shared),
                events,
                cancel.clone(),
                generation,
            )),
            tokio::spawn(run_render_clock(Arc::clone(shared), cancel.clone())),
        ];

        *lifecycle = Some(ActiveSession {
            generation,
            cancel,
            link,
            tasks,
        });
        shared.set_state(SessionState::Active { speaking: false });
        log::info!("✅ Session: Active");
        Ok(())
    }

    /// End the session. Safe to call in any state and more than once.
    pub async fn close(&self) {
        let attempt = self
            .shared
            .connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(attempt) = attempt {
            attempt.cancel();
        }
        self.shared.teardown(CloseReason::Requested, None).await;
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state().is_active()
    }

    pub fn is_speaking(&self) -> bool {
        self.shared.scheduler.is_speaking()
    }

    pub fn subscribe_speaking(&self) -> watch::Receiver<bool> {
        self.shared.scheduler.subscribe_speaking()
    }

    /// Why the session last closed, if it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        if let Ok(mut lifecycle) = self.shared.lifecycle.try_lock() {
            if let Some(active) = lifecycle.take() {
                active.link.cancel();
            }
        }
        self.shared.stop_capture();
        self.shared.scheduler.stop();
    }
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_if_modified(|current| {
            if *current != state {
                log::debug!("Session: {} -> {}", current, state);
                *current = state;
                true
            } else {
                false
            }
        });
    }

    /// Mirror the scheduler's speaking flag into `Active { speaking }`
    fn sync_speaking(&self) {
        let speaking = self.scheduler.is_speaking();
        self.state_tx.send_if_modified(|current| match current {
            SessionState::Active { speaking: was } if *was != speaking => {
                *was = speaking;
                true
            }
            _ => false,
        });
    }

    fn set_close_reason(&self, reason: Option<CloseReason>) {
        *self
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = reason;
    }

    fn next_generation(&self) -> u64 {
        let mut next = self
            .next_generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *next += 1;
        *next
    }

    fn set_connecting(&self, attempt: Option<CancellationToken>) {
        *self
            .connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = attempt;
    }

    /// Acquire the microphone and open the transport.
    ///
    /// Leaves the session `Idle` on failure, or `Closed` when `attempt` is
    /// cancelled by `close`. The microphone is released either way.
    async fn open_link(
        self: &Arc<Self>,
        attempt: &CancellationToken,
    ) -> Result<(FrameStream, TransportLink)> {
        // Device startup is bounded and cannot be interrupted, so cancellation
        // is checked once it returns
        let frames = match self.start_capture().await {
            Ok(frames) => frames,
            Err(e) => {
                log::error!("🎤 Session: Microphone unavailable: {}", e);
                self.set_state(SessionState::Idle);
                return Err(SessionError::Device(e));
            }
        };
        if attempt.is_cancelled() {
            return Err(self.abandon_connect());
        }

        let timeout = self.config.connect_timeout;
        let connected = tokio::select! {
            biased;
            _ = attempt.cancelled() => return Err(self.abandon_connect()),
            connected = tokio::time::timeout(timeout, self.transport.connect(&self.config)) => connected,
        };

        match connected {
            Ok(Ok(link)) => Ok((frames, link)),
            Ok(Err(e)) => {
                log::error!("🔌 Session: Connection failed: {}", e);
                self.stop_capture();
                self.set_state(SessionState::Idle);
                Err(SessionError::Connect(e.to_string()))
            }
            Err(_) => {
                log::error!("🔌 Session: Connection timed out after {:?}", timeout);
                self.stop_capture();
                self.set_state(SessionState::Idle);
                Err(SessionError::Connect(format!("timed out after {:?}", timeout)))
            }
        }
    }

    fn abandon_connect(&self) -> SessionError {
        log::info!("🔌 Session: Connect cancelled by close");
        self.stop_capture();
        self.set_close_reason(Some(CloseReason::Requested));
        self.set_state(SessionState::Closed);
        SessionError::Connect("cancelled by close".to_string())
    }

    async fn start_capture(self: &Arc<Self>) -> std::result::Result<FrameStream, AudioCaptureError> {
        let shared = Arc::clone(self);
        // Device startup blocks until the audio thread reports back
        tokio::task::spawn_blocking(move || {
            shared
                .capture
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .start(shared.config.capture_sample_rate, shared.config.frame_size)
        })
        .await
        .map_err(|e| AudioCaptureError::Stream(format!("capture startup panicked: {}", e)))?
    }

    fn stop_capture(&self) {
        self.capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop();
    }

    /// Tear the running session down exactly once.
    ///
    /// `generation` limits the teardown to a specific session so a task of an
    /// already replaced session cannot close its successor. `None` always applies.
    async fn teardown(&self, reason: CloseReason, generation: Option<u64>) {
        let mut lifecycle = self.lifecycle.lock().await;

        let matches = lifecycle
            .as_ref()
            .is_some_and(|active| generation.map_or(true, |g| g == active.generation));
        if !matches {
            if generation.is_none() && self.state() == SessionState::Idle {
                self.set_close_reason(Some(reason));
                self.set_state(SessionState::Closed);
            }
            return;
        }
        let Some(active) = lifecycle.take() else {
            return;
        };

        log::info!("🔌 Session: Closing ({})", reason);
        active.cancel.cancel();
        self.stop_capture();
        self.scheduler.stop();
        active.link.close().await;

        for task in active.tasks {
            let _ = task.await;
        }

        self.set_close_reason(Some(reason));
        self.set_state(SessionState::Closed);
        log::info!("🔌 Session: Closed");
    }
}

/// Microphone -> codec -> transport
async fn run_outbound(
    shared: Arc<Shared>,
    mut frames: FrameStream,
    outbound: OutboundQueue,
    cancel: CancellationToken,
    generation: u64,
) {
    let mut sent = 0u64;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };

        let Some(frame) = frame else {
            log::error!("🎤 Session: Microphone stream ended unexpectedly");
            // Teardown joins this task, so it has to run elsewhere
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                shared
                    .teardown(
                        CloseReason::Failed("microphone lost".to_string()),
                        Some(generation),
                    )
                    .await;
            });
            break;
        };

        match outbound.send(FrameCodec::encode(&frame)) {
            Ok(()) => sent += 1,
            Err(TransportError::Backpressure) => {}
            Err(e) => {
                log::warn!("📤 Session: Outbound link is gone at frame {}: {}", frame.sequence, e);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    shared
                        .teardown(
                            CloseReason::Failed("outbound link closed".to_string()),
                            Some(generation),
                        )
                        .await;
                });
                break;
            }
        }
    }

    log::debug!(
        "📤 Session: Outbound finished after {} frames ({} dropped)",
        sent,
        outbound.dropped()
    );
}

/// Transport -> transcript callback / codec -> scheduler
async fn run_inbound(
    shared: Arc<Shared>,
    mut events: EventStream,
    cancel: CancellationToken,
    generation: u64,
) {
    let reason = loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = events.next() => event,
        };

        match event {
            Some(ServerEvent::TranscriptDelta { speaker, text }) => {
                log::debug!("📝 {}: {}", speaker, text);
                (shared.on_transcript)(&text, speaker);
            }
            Some(ServerEvent::AudioDelta {
                payload,
                sample_rate,
                channels,
            }) => {
                if shared.config.modality.plays_audio() {
                    play_audio(&shared, payload, sample_rate, channels);
                }
            }
            Some(ServerEvent::Interrupted) => {
                shared.scheduler.on_interrupt();
                shared.sync_speaking();
            }
            Some(ServerEvent::Closed) | None => break CloseReason::RemoteClosed,
            Some(ServerEvent::Error(e)) => break CloseReason::Failed(e.to_string()),
        }
    };

    tokio::spawn(async move { shared.teardown(reason, Some(generation)).await });
}

fn play_audio(shared: &Shared, payload: Vec<u8>, sample_rate: u32, channels: u16) {
    let chunk = EncodedChunk {
        data: payload,
        format: AudioFormat::pcm16(sample_rate, channels),
    };

    let buffer = match FrameCodec::decode(&chunk) {
        Ok(buffer) => buffer,
        Err(e) => {
            log::warn!("🔊 Session: Skipping undecodable audio: {}", e);
            return;
        }
    };

    if let Err(e) = shared.scheduler.enqueue(buffer) {
        log::warn!("🔊 Session: Failed to queue audio: {}", e);
    }
    shared.sync_speaking();
}

/// Retires played items and keeps the speaking flag current
async fn run_render_clock(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(RENDER_TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                shared.scheduler.poll();
                shared.sync_speaking();
            }
        }
    }
}
