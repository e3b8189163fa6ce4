use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Failed to write audio data: {0}")]
    WriteError(String),

    #[error("Buffer full")]
    BufferFull,

    #[error("Audio device error: {0}")]
    DeviceError(String),
}

/// Real-time audio output.
///
/// `write` must not block on playback; samples are queued and rendered at
/// the device's own pace. `clear` drops everything not yet rendered.
pub trait AudioSink: Send + Sync {
    /// Queue mono samples recorded at `sample_rate` for playback
    fn write(&self, samples: &[f32], sample_rate: u32) -> Result<(), AudioError>;

    /// Drop all queued samples immediately
    fn clear(&self);

    /// Release the output device
    fn stop(&self);
}

/// Sink that discards everything, for sessions that never play replies
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&self, _samples: &[f32], _sample_rate: u32) -> Result<(), AudioError> {
        Ok(())
    }

    fn clear(&self) {}

    fn stop(&self) {}
}

pub struct CpalConfig {
    /// Buffer size in milliseconds (default 45000ms)
    pub buffer_size_ms: u32,
    /// Warning threshold for high buffer level (percentage)
    pub high_buffer_warning: u8,
    /// Output device name (None = default device)
    pub device_name: Option<String>,
}

impl Default for CpalConfig {
    fn default() -> Self {
        Self {
            buffer_size_ms: 45000,
            high_buffer_warning: 80,
            device_name: None,
        }
    }
}

/// Device parameters reported by the audio thread once the stream is running
struct OutputSpec {
    sample_rate: u32,
    channels: usize,
}

/// Output to a cpal device.
///
/// A dedicated thread owns the stream; the output callback pops samples from
/// a shared queue and writes the mono signal to every output channel,
/// rendering silence when the queue is empty.
pub struct CpalSink {
    queue: Arc<Mutex<VecDeque<f32>>>,
    output_rate: u32,
    max_buffer_samples: usize,
    high_buffer_warning: u8,
    is_stopped: AtomicBool,
    stop_sender: Mutex<Option<Sender<()>>>,
    audio_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CpalSink {
    pub fn new(config: CpalConfig) -> Result<Self, AudioError> {
        log::debug!("AudioSink: Creating new CpalSink");
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let queue_clone = Arc::clone(&queue);
        let (stop_sender, stop_receiver) = mpsc::channel::<()>();
        let (ready_sender, ready_receiver) = mpsc::sync_channel(1);
        let device_name = config.device_name.clone();

        let audio_thread = thread::Builder::new()
            .name("audio-sink".to_string())
            .spawn(move || {
                let stream = match Self::open_stream(device_name.as_deref(), queue_clone) {
                    Ok((stream, spec)) => {
                        let _ = ready_sender.send(Ok(spec));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_sender.send(Err(e));
                        return;
                    }
                };

                // Park until stopped; the stream is dropped when the thread exits
                let _ = stop_receiver.recv();
                log::debug!("AudioSink: Audio thread exiting");
                drop(stream);
            })
            .map_err(|e| AudioError::DeviceError(e.to_string()))?;

        let spec = match ready_receiver.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(spec)) => spec,
            Ok(Err(e)) => {
                let _ = audio_thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = stop_sender.send(());
                return Err(AudioError::DeviceError(
                    "Timed out waiting for the output device".to_string(),
                ));
            }
        };

        log::info!(
            "🔊 Audio output ready: {}Hz, {} channels",
            spec.sample_rate,
            spec.channels
        );

        Ok(Self {
            queue,
            output_rate: spec.sample_rate,
            max_buffer_samples: (config.buffer_size_ms as usize * spec.sample_rate as usize)
                / 1000,
            high_buffer_warning: config.high_buffer_warning,
            is_stopped: AtomicBool::new(false),
            stop_sender: Mutex::new(Some(stop_sender)),
            audio_thread: Mutex::new(Some(audio_thread)),
        })
    }

    fn open_stream(
        device_name: Option<&str>,
        queue: Arc<Mutex<VecDeque<f32>>>,
    ) -> Result<(cpal::Stream, OutputSpec), AudioError> {
        let host = cpal::default_host();
        log::debug!("AudioSink: Using audio host: {:?}", host.id());

        let device = match device_name {
            Some(name) => host
                .output_devices()
                .map_err(|e| AudioError::DeviceError(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| AudioError::DeviceError(format!("Device not found: {}", name)))?,
            None => host
                .default_output_device()
                .ok_or_else(|| AudioError::DeviceError("No output device found".to_string()))?,
        };
        log::debug!("AudioSink: Using output device: {:?}", device.name());

        let supported_config = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceError(e.to_string()))?;
        log::debug!("AudioSink: Using output config: {:?}", supported_config);

        let spec = OutputSpec {
            sample_rate: supported_config.sample_rate().0,
            channels: usize::from(supported_config.channels()),
        };
        let channels = spec.channels;

        let stream = device
            .build_output_stream(
                &supported_config.config(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let Ok(mut queue) = queue.lock() else {
                        data.fill(0.0);
                        return;
                    };
                    for frame in data.chunks_mut(channels) {
                        let sample = queue.pop_front().unwrap_or(0.0);
                        frame.fill(sample);
                    }
                },
                move |err| {
                    log::error!("AudioSink: Stream error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::DeviceError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::DeviceError(e.to_string()))?;

        Ok((stream, spec))
    }

    /// Buffer fill level as a percentage
    pub fn buffer_percentage(&self) -> u8 {
        let queued = self.queue.lock().map(|q| q.len()).unwrap_or(0);
        ((queued * 100) / self.max_buffer_samples.max(1)).min(100) as u8
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}

impl AudioSink for CpalSink {
    fn write(&self, samples: &[f32], sample_rate: u32) -> Result<(), AudioError> {
        if self.is_stopped.load(Ordering::Acquire) {
            log::warn!("AudioSink: Cannot write - sink is stopped");
            return Err(AudioError::WriteError("Sink is stopped".to_string()));
        }

        let converted = resample_linear(samples, sample_rate, self.output_rate);
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if queue.len() + converted.len() > self.max_buffer_samples {
            log::warn!("AudioSink: Buffer full!");
            return Err(AudioError::BufferFull);
        }

        queue.extend(converted);

        let percentage = (queue.len() * 100) / self.max_buffer_samples.max(1);
        if percentage > usize::from(self.high_buffer_warning) {
            log::warn!(
                "AudioSink: Buffer high warning: {}% (threshold: {}%)",
                percentage,
                self.high_buffer_warning
            );
        }

        log::debug!(
            "AudioSink: Queued {} samples ({} pending)",
            samples.len(),
            queue.len()
        );
        Ok(())
    }

    fn clear(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if !queue.is_empty() {
            log::debug!("AudioSink: Discarding {} pending samples", queue.len());
            queue.clear();
        }
    }

    fn stop(&self) {
        if self.is_stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("AudioSink: Stopping sink");
        self.clear();
        let sender = self
            .stop_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop();

        let thread = self
            .audio_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if let Err(e) = thread.join() {
                log::error!("Failed to join audio thread: {:?}", e);
            }
        }
    }
}

/// Linear-interpolation rate conversion for mono samples
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || input.is_empty() {
        return input.to_vec();
    }

    let output_len =
        ((input.len() as u64 * u64::from(to_rate)) / u64::from(from_rate)).max(1) as usize;
    let step = f64::from(from_rate) / f64::from(to_rate);
    let last = input.len() - 1;

    (0..output_len)
        .map(|i| {
            let position = i as f64 * step;
            let index = (position.floor() as usize).min(last);
            let next = (index + 1).min(last);
            let fract = (position - index as f64) as f32;
            input[index] * (1.0 - fract) + input[next] * fract
        })
        .collect()
}
