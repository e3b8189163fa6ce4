//! Microphone capture producing fixed-size mono frames

mod cpal_source;

pub use cpal_source::{list_input_devices, CpalCapture};

use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Error, Debug)]
pub enum AudioCaptureError {
    #[error("No audio input device found")]
    NoDevice,
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Resampling error: {0}")]
    Resampling(String),
    #[error("Capture already started")]
    AlreadyStarted,
}

pub type CaptureError = AudioCaptureError;

/// A buffer of mono samples in [-1.0, 1.0]
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Position in capture order, starting at 0 for each `start`
    pub sequence: u64,
}

/// Capture configuration
#[derive(Debug, Clone, Default)]
pub struct CaptureConfig {
    /// Input device name (None = default device)
    pub device_name: Option<String>,
}

/// Audio device information
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub channel_count: u32,
}

/// Frames in capture order. Ends when the source is stopped or the device goes away.
pub struct FrameStream {
    inner: ReceiverStream<AudioFrame>,
}

impl FrameStream {
    pub fn new(rx: mpsc::Receiver<AudioFrame>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
        }
    }
}

impl Stream for FrameStream {
    type Item = AudioFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// A microphone that can be started and stopped
pub trait CaptureSource: Send {
    /// Acquire the device and start producing `frame_size`-sample frames at `sample_rate`.
    fn start(&mut self, sample_rate: u32, frame_size: usize)
        -> Result<FrameStream, CaptureError>;

    /// Release the device. Safe to call when already stopped.
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Splits a sample stream into exact-size frames
pub(crate) struct FrameAssembler {
    pending: Vec<f32>,
    frame_size: usize,
    sample_rate: u32,
    next_sequence: u64,
}

impl FrameAssembler {
    pub(crate) fn new(sample_rate: u32, frame_size: usize) -> Self {
        Self {
            pending: Vec::with_capacity(frame_size * 2),
            frame_size,
            sample_rate,
            next_sequence: 0,
        }
    }

    /// Append samples and return every frame that is now complete
    pub(crate) fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let samples: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            frames.push(AudioFrame {
                samples,
                sample_rate: self.sample_rate,
                sequence: self.next_sequence,
            });
            self.next_sequence += 1;
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_assembler_emits_exact_frames_in_order() {
        let mut assembler = FrameAssembler::new(16000, 4);

        assert!(assembler.push(&[0.1, 0.2, 0.3]).is_empty());

        let frames = assembler.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(frames[1].samples, vec![0.5, 0.6, 0.7, 0.8]);
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(frames[1].sequence, 1);
        assert!(frames.iter().all(|f| f.sample_rate == 16000));

        let frames = assembler.push(&[1.0, 1.0, 1.0]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, vec![0.9, 1.0, 1.0, 1.0]);
        assert_eq!(frames[0].sequence, 2);
    }

    #[tokio::test]
    async fn test_frame_stream_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = FrameStream::new(rx);

        tx.send(AudioFrame {
            samples: vec![0.0; 4],
            sample_rate: 16000,
            sequence: 0,
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(stream.next().await.map(|f| f.sequence), Some(0));
        assert!(stream.next().await.is_none());
    }
}
