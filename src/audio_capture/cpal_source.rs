use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream as CpalStream,
};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    AudioCaptureError, AudioDeviceInfo, AudioFrame, CaptureConfig, CaptureSource, FrameAssembler,
    FrameStream,
};

/// Hardware samples fed to the resampler per call
const RESAMPLER_CHUNK: usize = 1024;
/// Frames buffered between the audio thread and the session
const FRAME_CHANNEL_CAPACITY: usize = 64;
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct CaptureThread {
    stop_sender: std_mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// Microphone capture on a dedicated cpal thread.
///
/// The thread owns the cpal stream, extracts channel 0, resamples to the
/// requested rate and hands exact-size frames to the async side without
/// ever blocking the audio callback.
pub struct CpalCapture {
    config: CaptureConfig,
    running: Option<CaptureThread>,
}

impl CpalCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }

    fn run_capture_thread(
        config: CaptureConfig,
        sample_rate: u32,
        frame_size: usize,
        sender: mpsc::Sender<AudioFrame>,
        ready: std_mpsc::SyncSender<Result<(), AudioCaptureError>>,
        stop_receiver: std_mpsc::Receiver<()>,
    ) {
        let device_lost = Arc::new(AtomicBool::new(false));
        let stream =
            match Self::open_stream(&config, sample_rate, frame_size, sender, &device_lost) {
                Ok(stream) => {
                    let _ = ready.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready.send(Err(e));
                    return;
                }
            };

        loop {
            match stop_receiver.recv_timeout(STOP_POLL_INTERVAL) {
                Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    log::info!("🎤 Audio capture thread received stop signal. Exiting.");
                    break;
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    if device_lost.load(Ordering::Acquire) {
                        log::error!("🎤 Input device lost, ending capture");
                        break;
                    }
                }
            }
        }

        // Dropping the stream drops the frame sender, which ends the FrameStream
        drop(stream);
    }

    fn open_stream(
        config: &CaptureConfig,
        sample_rate: u32,
        frame_size: usize,
        sender: mpsc::Sender<AudioFrame>,
        device_lost: &Arc<AtomicBool>,
    ) -> Result<CpalStream, AudioCaptureError> {
        let host = cpal::default_host();
        log::info!("🎤 Initializing audio capture with host: {:?}", host.id());

        let device = if let Some(name) = &config.device_name {
            host.input_devices()
                .map_err(|e| AudioCaptureError::Device(e.to_string()))?
                .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
                .ok_or_else(|| AudioCaptureError::Device(format!("Device not found: {}", name)))?
        } else {
            host.default_input_device()
                .ok_or(AudioCaptureError::NoDevice)?
        };

        log::info!("🎤 Using input device: {:?}", device.name());

        let supported_config = match Self::select_input_config(&device, sample_rate) {
            Ok(config) => config,
            Err(err) => {
                log::warn!(
                    "⚠️  Failed to select preferred input config: {}. Falling back to default input config.",
                    err
                );
                device
                    .default_input_config()
                    .map_err(|e| AudioCaptureError::Config(e.to_string()))?
            }
        };

        let stream_config = supported_config.config();
        let hardware_sample_rate = stream_config.sample_rate.0;
        let channels = usize::from(stream_config.channels);

        log::info!(
            "🎤 Hardware: {}Hz, {} channels, {:?} → Output: {}Hz mono",
            hardware_sample_rate,
            channels,
            supported_config.sample_format(),
            sample_rate
        );

        let resampler = if hardware_sample_rate != sample_rate {
            let ratio = f64::from(sample_rate) / f64::from(hardware_sample_rate);
            let params = SincInterpolationParameters {
                sinc_len: 32,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };

            let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLER_CHUNK, 1)
                .map_err(|e| AudioCaptureError::Resampling(e.to_string()))?;

            log::info!(
                "🔄 Created resampler: {}Hz → {}Hz (ratio: {:.3})",
                hardware_sample_rate,
                sample_rate,
                ratio
            );
            Some(resampler)
        } else {
            log::info!("🔄 No resampling needed (hardware is {}Hz)", sample_rate);
            None
        };

        let pipeline = CapturePipeline {
            channels,
            resampler,
            hardware_buffer: Vec::with_capacity(RESAMPLER_CHUNK * 2),
            assembler: FrameAssembler::new(sample_rate, frame_size),
            sender,
            dropped: 0,
        };

        let lost = Arc::clone(device_lost);
        let err_fn = move |err: cpal::StreamError| {
            log::error!("Audio stream error: {}", err);
            if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                lost.store(true, Ordering::Release);
            }
        };

        let stream = match supported_config.sample_format() {
            SampleFormat::I16 => {
                Self::create_input_stream::<i16>(&device, &stream_config, pipeline, err_fn)?
            }
            SampleFormat::U16 => {
                Self::create_input_stream::<u16>(&device, &stream_config, pipeline, err_fn)?
            }
            SampleFormat::F32 => {
                Self::create_input_stream::<f32>(&device, &stream_config, pipeline, err_fn)?
            }
            format => {
                return Err(AudioCaptureError::Config(format!(
                    "Unsupported sample format: {:?}",
                    format
                )))
            }
        };

        // Permission problems usually surface here
        stream
            .play()
            .map_err(|e| AudioCaptureError::Stream(e.to_string()))?;

        Ok(stream)
    }

    fn select_input_config(
        device: &Device,
        target_rate: u32,
    ) -> Result<cpal::SupportedStreamConfig, AudioCaptureError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioCaptureError::Config(e.to_string()))?;

        let mut best_config: Option<cpal::SupportedStreamConfig> = None;
        let mut best_format_rank = u8::MAX;
        let mut best_rate_diff = u32::MAX;

        for config_range in configs {
            let format_rank = match config_range.sample_format() {
                SampleFormat::I16 => 0,
                SampleFormat::F32 => 1,
                SampleFormat::U16 => 2,
                _ => continue,
            };

            let min_rate = config_range.min_sample_rate().0;
            let max_rate = config_range.max_sample_rate().0;
            let chosen_rate = target_rate.clamp(min_rate, max_rate);
            let rate_diff = chosen_rate.abs_diff(target_rate);

            if format_rank < best_format_rank
                || (format_rank == best_format_rank && rate_diff < best_rate_diff)
            {
                best_format_rank = format_rank;
                best_rate_diff = rate_diff;
                best_config = Some(config_range.with_sample_rate(cpal::SampleRate(chosen_rate)));
            }
        }

        best_config.ok_or_else(|| {
            AudioCaptureError::Config("No supported input configs found".to_string())
        })
    }

    fn create_input_stream<T>(
        device: &Device,
        config: &cpal::StreamConfig,
        mut pipeline: CapturePipeline,
        err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
    ) -> Result<CpalStream, AudioCaptureError>
    where
        T: Sample + SizedSample + Send + Sync + 'static,
        f32: FromSample<T>,
    {
        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| pipeline.process(data),
                err_fn,
                None,
            )
            .map_err(|e| AudioCaptureError::Stream(e.to_string()))
    }
}

/// State owned by the audio callback
struct CapturePipeline {
    channels: usize,
    resampler: Option<SincFixedIn<f32>>,
    hardware_buffer: Vec<f32>,
    assembler: FrameAssembler,
    sender: mpsc::Sender<AudioFrame>,
    dropped: u64,
}

impl CapturePipeline {
    fn process<T>(&mut self, data: &[T])
    where
        T: Sample,
        f32: FromSample<T>,
    {
        // Extract channel 0 and convert to f32
        let mono: Vec<f32> = data
            .chunks(self.channels)
            .filter_map(|frame| frame.first().map(|s| f32::from_sample(*s)))
            .collect();

        let samples = match self.resampler.as_mut() {
            None => mono,
            Some(resampler) => {
                self.hardware_buffer.extend_from_slice(&mono);
                let mut out = Vec::new();
                while self.hardware_buffer.len() >= RESAMPLER_CHUNK {
                    let chunk: Vec<f32> = self.hardware_buffer.drain(..RESAMPLER_CHUNK).collect();
                    match resampler.process(&[chunk], None) {
                        Ok(mut channels) => out.append(&mut channels[0]),
                        Err(e) => log::error!("Resampling error: {}", e),
                    }
                }
                out
            }
        };

        for frame in self.assembler.push(&samples) {
            // Never block the audio callback
            if let Err(mpsc::error::TrySendError::Full(frame)) = self.sender.try_send(frame) {
                self.dropped += 1;
                log::warn!(
                    "🎤 Frame channel full, dropped frame {} ({} dropped total)",
                    frame.sequence,
                    self.dropped
                );
            }
        }
    }
}

impl CaptureSource for CpalCapture {
    fn start(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
    ) -> Result<FrameStream, AudioCaptureError> {
        if self.running.is_some() {
            return Err(AudioCaptureError::AlreadyStarted);
        }
        if sample_rate == 0 || frame_size == 0 {
            return Err(AudioCaptureError::Config(format!(
                "Invalid capture parameters: {}Hz, {} samples per frame",
                sample_rate, frame_size
            )));
        }

        let (sender, receiver) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (ready_sender, ready_receiver) = std_mpsc::sync_channel(1);
        let (stop_sender, stop_receiver) = std_mpsc::channel();
        let config = self.config.clone();

        // cpal streams are not Send, so the stream lives on its own thread
        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                Self::run_capture_thread(
                    config,
                    sample_rate,
                    frame_size,
                    sender,
                    ready_sender,
                    stop_receiver,
                )
            })
            .map_err(|e| AudioCaptureError::Device(format!("Failed to spawn capture thread: {}", e)))?;

        match ready_receiver.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(())) => {
                log::info!("🎤 Audio capture started ({}Hz, {} samples per frame)", sample_rate, frame_size);
                self.running = Some(CaptureThread {
                    stop_sender,
                    handle,
                });
                Ok(FrameStream::new(receiver))
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = stop_sender.send(());
                Err(AudioCaptureError::Device(
                    "Timed out waiting for the input device".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            log::debug!("🎤 Stopping audio capture");
            let _ = running.stop_sender.send(());
            // The thread exits within one poll interval; don't wait for it here
            drop(running.handle);
        }
    }

    fn is_active(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// List available input devices
pub fn list_input_devices() -> Result<Vec<AudioDeviceInfo>, AudioCaptureError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| AudioCaptureError::Device(e.to_string()))?;

    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut device_infos = Vec::new();
    for device in devices {
        let name = device
            .name()
            .map_err(|e| AudioCaptureError::Device(e.to_string()))?;

        let channel_count = match device.default_input_config() {
            Ok(config) => u32::from(config.channels()),
            Err(e) => {
                log::debug!("Skipping input device {}: {}", name, e);
                continue;
            }
        };

        device_infos.push(AudioDeviceInfo {
            is_default: default_name.as_ref() == Some(&name),
            name,
            channel_count,
        });
    }

    Ok(device_infos)
}
