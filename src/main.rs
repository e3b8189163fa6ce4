use anyhow::Context;
use clap::Parser;
use live_voice::{
    audio_capture::{list_input_devices, CaptureConfig, CpalCapture},
    audio_sink::{AudioSink, CpalConfig, CpalSink, NullSink},
    config::{load_config, ResponseModality, SessionConfig, DEFAULT_MODEL, DEFAULT_VOICE},
    session::{SessionController, SessionState},
    transport::{LiveWebSocketTransport, Speaker},
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "live-voice")]
#[command(about = "Talk to a streaming voice model from the terminal")]
#[command(long_about = "
Runs one duplex voice session: microphone audio is streamed to the Live API,
spoken replies are played back and transcripts are printed as they arrive.

Reads GEMINI_API_KEY (or API_KEY) from the environment or a .env file.

EXAMPLES:
  # Talk with the default voice
  live-voice

  # Transcribe only, nothing is played back
  live-voice --mode transcription

  # List available microphones
  live-voice --list-devices
")]
struct Args {
    /// What the service should send back
    #[arg(long, value_enum, default_value_t = ResponseModality::AudioWithTranscripts)]
    mode: ResponseModality,

    /// Prebuilt voice for spoken replies
    #[arg(long, default_value = DEFAULT_VOICE)]
    voice: String,

    /// Model id
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// System instruction for the model
    #[arg(long)]
    instruction: Option<String>,

    /// Input device name for audio capture
    #[arg(long)]
    input_device: Option<String>,

    /// Output device name for audio playback
    #[arg(long)]
    output_device: Option<String>,

    /// Seconds to wait for the service handshake
    #[arg(long, default_value = "10")]
    connect_timeout_secs: u64,

    /// List available input devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.list_devices {
        print_input_devices()?;
        return Ok(());
    }

    let api_config = load_config()?;

    let config = SessionConfig {
        model: args.model,
        modality: args.mode,
        voice: args.mode.plays_audio().then_some(args.voice),
        system_instruction: args.instruction,
        connect_timeout: Duration::from_secs(args.connect_timeout_secs),
        ..SessionConfig::default()
    };
    config.validate()?;

    let sink: Arc<dyn AudioSink> = if config.modality.plays_audio() {
        Arc::new(
            CpalSink::new(CpalConfig {
                device_name: args.output_device,
                ..Default::default()
            })
            .context("Failed to open audio output")?,
        )
    } else {
        Arc::new(NullSink)
    };

    let capture = CpalCapture::new(CaptureConfig {
        device_name: args.input_device,
    });
    let transport = Arc::new(LiveWebSocketTransport::new(api_config));

    let session = SessionController::new(
        config,
        Box::new(capture),
        transport,
        sink,
        print_transcript,
    );

    session.connect().await?;

    println!("🎧 Listening ({} mode)", session.config().modality);
    println!("   Press Ctrl+C to exit");

    let mut state = session.subscribe_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("🛑 Ctrl+C received, closing session");
        }
        _ = state.wait_for(|s| *s == SessionState::Closed) => {}
    }

    session.close().await;
    println!();
    if let Some(reason) = session.close_reason() {
        println!("👋 Session {}", reason);
    }

    Ok(())
}

fn print_transcript(text: &str, speaker: Speaker) {
    let prefix = match speaker {
        Speaker::User => "🗣️ ",
        Speaker::Model => "🤖 ",
    };
    print!("{}{}", prefix, text);
    let _ = std::io::stdout().flush();
}

fn print_input_devices() -> anyhow::Result<()> {
    let devices = list_input_devices()?;

    println!("🎤 Available Input Devices:");
    println!("==========================");
    if devices.is_empty() {
        println!("   No input devices found");
    }
    for device in devices {
        println!(
            "  {}{} ({} channels)",
            device.name,
            if device.is_default { " [DEFAULT]" } else { "" },
            device.channel_count
        );
    }
    Ok(())
}
