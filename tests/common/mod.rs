//! Fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use live_voice::audio_capture::{AudioFrame, CaptureError, CaptureSource, FrameStream};
use live_voice::audio_sink::{AudioError, AudioSink};
use live_voice::codec::EncodedChunk;
use live_voice::config::SessionConfig;
use live_voice::transport::{
    LinkShutdown, OutboundQueue, ServerEvent, StreamingTransport, TransportError, TransportLink,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// PCM16 LE silence lasting `ms` at 24kHz mono
pub fn pcm_ms(ms: usize) -> Vec<u8> {
    vec![0u8; 24 * ms * 2]
}

pub fn audio_delta(ms: usize) -> ServerEvent {
    ServerEvent::AudioDelta {
        payload: pcm_ms(ms),
        sample_rate: 24000,
        channels: 1,
    }
}

/// Test-side handle to a `FakeCapture`
#[derive(Clone, Default)]
pub struct FakeMic {
    sender: Arc<Mutex<Option<mpsc::Sender<AudioFrame>>>>,
    active: Arc<AtomicBool>,
    starts: Arc<AtomicUsize>,
    next_sequence: Arc<Mutex<u64>>,
}

impl FakeMic {
    /// Deliver one frame as if it had been captured
    pub fn speak(&self, samples: Vec<f32>) -> bool {
        let mut sequence = self.next_sequence.lock().unwrap();
        let frame = AudioFrame {
            samples,
            sample_rate: 16000,
            sequence: *sequence,
        };
        let sent = self
            .sender
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| tx.try_send(frame).is_ok())
            .unwrap_or(false);
        if sent {
            *sequence += 1;
        }
        sent
    }

    /// Simulate the device disappearing
    pub fn unplug(&self) {
        self.sender.lock().unwrap().take();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

/// Microphone fake; fails to start when permission is denied
pub struct FakeCapture {
    mic: FakeMic,
    permission: bool,
}

impl FakeCapture {
    pub fn new() -> (Self, FakeMic) {
        let mic = FakeMic::default();
        (
            Self {
                mic: mic.clone(),
                permission: true,
            },
            mic,
        )
    }

    pub fn denied() -> (Self, FakeMic) {
        let (mut capture, mic) = Self::new();
        capture.permission = false;
        (capture, mic)
    }
}

impl CaptureSource for FakeCapture {
    fn start(&mut self, _sample_rate: u32, _frame_size: usize) -> Result<FrameStream, CaptureError> {
        if !self.permission {
            return Err(CaptureError::Device("permission denied".to_string()));
        }
        if self.mic.is_active() {
            return Err(CaptureError::AlreadyStarted);
        }
        let (tx, rx) = mpsc::channel(64);
        *self.mic.sender.lock().unwrap() = Some(tx);
        *self.mic.next_sequence.lock().unwrap() = 0;
        self.mic.active.store(true, Ordering::SeqCst);
        self.mic.starts.fetch_add(1, Ordering::SeqCst);
        Ok(FrameStream::new(rx))
    }

    fn stop(&mut self) {
        self.mic.sender.lock().unwrap().take();
        self.mic.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.mic.is_active()
    }
}

/// The remote end of a link opened by `FakeTransport`
pub struct FakeRemote {
    pub events: mpsc::Sender<ServerEvent>,
    pub outbound: mpsc::Receiver<EncodedChunk>,
}

impl FakeRemote {
    pub async fn push(&self, event: ServerEvent) {
        self.events.send(event).await.unwrap();
    }
}

/// Transport fake handing out in-memory links
#[derive(Default)]
pub struct FakeTransport {
    remotes: Mutex<Vec<FakeRemote>>,
    connects: AtomicUsize,
    reject: Option<TransportError>,
}

impl FakeTransport {
    pub fn rejecting(error: TransportError) -> Self {
        Self {
            reject: Some(error),
            ..Self::default()
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Remote end of the most recent link
    pub fn take_remote(&self) -> FakeRemote {
        self.remotes
            .lock()
            .unwrap()
            .pop()
            .expect("no link has been opened")
    }
}

#[async_trait]
impl StreamingTransport for FakeTransport {
    async fn connect(&self, config: &SessionConfig) -> Result<TransportLink, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.reject {
            return Err(error.clone());
        }

        let (outbound, outbound_rx) = OutboundQueue::bounded(config.outbound_queue_capacity);
        let (events_tx, events_rx) = mpsc::channel(64);
        self.remotes.lock().unwrap().push(FakeRemote {
            events: events_tx,
            outbound: outbound_rx,
        });

        Ok(TransportLink::new(
            outbound,
            events_rx,
            LinkShutdown::detached(),
        ))
    }
}

/// Transport whose handshake never completes
#[derive(Default)]
pub struct HangingTransport {
    connects: AtomicUsize,
}

impl HangingTransport {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamingTransport for HangingTransport {
    async fn connect(&self, _config: &SessionConfig) -> Result<TransportLink, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Sink that records what it is asked to do
#[derive(Default)]
pub struct RecordingSink {
    writes: Mutex<Vec<(usize, u32)>>,
    clears: AtomicUsize,
}

impl RecordingSink {
    /// (sample count, sample rate) per write
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl AudioSink for RecordingSink {
    fn write(&self, samples: &[f32], sample_rate: u32) -> Result<(), AudioError> {
        self.writes.lock().unwrap().push((samples.len(), sample_rate));
        Ok(())
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {}
}
