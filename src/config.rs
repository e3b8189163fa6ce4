use clap::ValueEnum;
use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;

/// Default Live API endpoint (API key is appended as the `key` query parameter)
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Zephyr";

/// Microphone rate expected by the service
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Samples per captured frame (256ms at 16kHz)
pub const CAPTURE_FRAME_SIZE: usize = 4096;
/// Outbound chunks buffered before new ones are dropped
pub const OUTBOUND_QUEUE_CAPACITY: usize = 32;

const TRANSCRIBER_INSTRUCTION: &str =
    "You are a transcriber. Listen to the user's input and transcribe it. Do not reply.";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid API key: {0}")]
    InvalidKey(String),
    #[error("Invalid session config: {0}")]
    InvalidSession(String),
}

/// What the remote service should send back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, ValueEnum)]
#[strum(serialize_all = "kebab-case")]
pub enum ResponseModality {
    /// Spoken replies only
    #[value(name = "audio")]
    Audio,
    /// Transcribe the user's speech, never play replies
    #[value(name = "transcription")]
    Transcription,
    /// Spoken replies plus transcripts of both sides
    #[value(name = "both")]
    #[strum(to_string = "both")]
    AudioWithTranscripts,
}

impl ResponseModality {
    pub fn plays_audio(self) -> bool {
        !matches!(self, ResponseModality::Transcription)
    }

    pub fn transcribes_input(self) -> bool {
        !matches!(self, ResponseModality::Audio)
    }

    pub fn transcribes_output(self) -> bool {
        matches!(self, ResponseModality::AudioWithTranscripts)
    }

    /// Instruction used when the caller does not supply one
    pub fn default_instruction(self) -> Option<&'static str> {
        match self {
            ResponseModality::Transcription => Some(TRANSCRIBER_INSTRUCTION),
            _ => None,
        }
    }
}

/// Configuration for one voice session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub modality: ResponseModality,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    pub endpoint: String,
    pub capture_sample_rate: u32,
    pub frame_size: usize,
    pub outbound_queue_capacity: usize,
    /// Upper bound for opening the transport, handshake included
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            modality: ResponseModality::AudioWithTranscripts,
            voice: Some(DEFAULT_VOICE.to_string()),
            system_instruction: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            frame_size: CAPTURE_FRAME_SIZE,
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Preset for a transcription-only listener
    pub fn transcription() -> Self {
        Self {
            modality: ResponseModality::Transcription,
            voice: None,
            ..Self::default()
        }
    }

    /// The caller's instruction, or the modality's default
    pub fn effective_instruction(&self) -> Option<&str> {
        self.system_instruction
            .as_deref()
            .or_else(|| self.modality.default_instruction())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidSession("model cannot be empty".into()));
        }
        if self.capture_sample_rate == 0 {
            return Err(ConfigError::InvalidSession(
                "capture sample rate must be positive".into(),
            ));
        }
        if self.frame_size == 0 {
            return Err(ConfigError::InvalidSession(
                "frame size must be positive".into(),
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidSession(
                "outbound queue capacity must be positive".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidSession(
                "connect timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Credentials for the streaming service
#[derive(Debug)]
pub struct ApiConfig {
    api_key: SecretBox<String>,
}

impl ApiConfig {
    /// Load the API key from `GEMINI_API_KEY`, falling back to `API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let key = env::var("GEMINI_API_KEY")
            .or_else(|_| env::var("API_KEY"))
            .map_err(|_| ConfigError::MissingEnvVar("GEMINI_API_KEY".to_string()))?;

        Self::from_key(key)
    }

    pub fn from_key(key: String) -> Result<Self, ConfigError> {
        if key.trim().is_empty() {
            return Err(ConfigError::InvalidKey("API key cannot be empty".to_string()));
        }
        if key.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidKey(
                "API key cannot contain whitespace".to_string(),
            ));
        }
        Ok(Self {
            api_key: SecretBox::new(Box::new(key)),
        })
    }

    /// Get the API key (use only when opening a connection)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }
}

/// Load configuration with helpful error messages for development
pub fn load_config() -> Result<ApiConfig, ConfigError> {
    match ApiConfig::load() {
        Ok(config) => {
            log::info!("Successfully loaded API configuration");
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=your_api_key_here", var);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.modality, ResponseModality::AudioWithTranscripts);
        assert_eq!(config.voice.as_deref(), Some("Zephyr"));
        assert_eq!(config.capture_sample_rate, 16000);
        assert_eq!(config.frame_size, 4096);
        assert_eq!(config.outbound_queue_capacity, 32);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_instruction(), None);
    }

    #[test]
    fn test_transcription_preset() {
        let config = SessionConfig::transcription();
        assert!(!config.modality.plays_audio());
        assert!(config.modality.transcribes_input());
        assert!(!config.modality.transcribes_output());
        assert_eq!(config.effective_instruction(), Some(TRANSCRIBER_INSTRUCTION));
    }

    #[test]
    fn test_explicit_instruction_wins() {
        let mut config = SessionConfig::transcription();
        config.system_instruction = Some("Be brief.".to_string());
        assert_eq!(config.effective_instruction(), Some("Be brief."));
    }

    #[test]
    fn test_validation() {
        let mut config = SessionConfig::default();
        config.frame_size = 0;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.connect_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.model = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_modality_strings() {
        assert_eq!(ResponseModality::Audio.to_string(), "audio");
        assert_eq!(ResponseModality::AudioWithTranscripts.to_string(), "both");
        assert_eq!(
            <ResponseModality as FromStr>::from_str("transcription").unwrap(),
            ResponseModality::Transcription
        );
        assert!(<ResponseModality as FromStr>::from_str("video").is_err());
    }

    #[test]
    fn test_key_validation() {
        assert!(ApiConfig::from_key("AIzaSyTest".to_string()).is_ok());
        assert!(ApiConfig::from_key("".to_string()).is_err());
        assert!(ApiConfig::from_key("has space".to_string()).is_err());
        assert_eq!(
            ApiConfig::from_key("AIzaSyTest".to_string())
                .unwrap()
                .api_key(),
            "AIzaSyTest"
        );
    }
}
