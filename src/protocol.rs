//! JSON messages exchanged with the Live API over the WebSocket.
//!
//! The client sends one `setup` message, waits for `setupComplete`, then
//! streams `realtimeInput` chunks. The server pushes `serverContent`
//! messages carrying transcripts, audio and interruption notices.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::EncodedChunk;
use crate::config::SessionConfig;
use crate::transport::{ServerEvent, Speaker};

/// Output audio rate when the server does not state one
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24_000;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn setup(config: &SessionConfig) -> Self {
        let speech_config = config.voice.as_ref().map(|voice| SpeechConfig {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice.clone(),
                },
            },
        });

        ClientMessage::Setup(Setup {
            model: model_resource(&config.model),
            generation_config: GenerationConfig {
                // The service only streams AUDIO; transcription-only sessions
                // discard it locally
                response_modalities: vec!["AUDIO".to_string()],
                speech_config,
            },
            system_instruction: config.effective_instruction().map(Content::text),
            input_audio_transcription: config
                .modality
                .transcribes_input()
                .then_some(TranscriptionConfig {}),
            output_audio_transcription: config
                .modality
                .transcribes_output()
                .then_some(TranscriptionConfig {}),
        })
    }

    pub fn audio(chunk: &EncodedChunk) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: chunk.mime_type(),
                data: BASE64.encode(&chunk.data),
            }],
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn model_resource(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<TranscriptionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Serializes as `{}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionConfig {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

impl Content {
    fn text(text: &str) -> Self {
        Self {
            parts: vec![TextPart {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// Everything the server may send. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub text: Option<String>,
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Translate into session events.
    ///
    /// Transcripts come first, then audio, then the interruption notice.
    /// Audio parts with a non-PCM MIME type or broken base64 are skipped.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if let Some(go_away) = &self.go_away {
            log::warn!(
                "📴 Server will disconnect soon (time left: {})",
                go_away.time_left.as_deref().unwrap_or("unknown")
            );
        }

        let Some(content) = self.server_content else {
            return events;
        };

        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(ServerEvent::TranscriptDelta {
                    speaker: Speaker::User,
                    text,
                });
            }
        }

        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(ServerEvent::TranscriptDelta {
                    speaker: Speaker::Model,
                    text,
                });
            }
        }

        if let Some(turn) = content.model_turn {
            for blob in turn.parts.into_iter().filter_map(|part| part.inline_data) {
                let Some(format) = crate::codec::AudioFormat::from_mime(
                    &blob.mime_type,
                    DEFAULT_OUTPUT_SAMPLE_RATE,
                ) else {
                    log::debug!("Ignoring inline data of type {}", blob.mime_type);
                    continue;
                };
                match BASE64.decode(blob.data.as_bytes()) {
                    Ok(payload) => events.push(ServerEvent::AudioDelta {
                        payload,
                        sample_rate: format.sample_rate,
                        channels: format.channels,
                    }),
                    Err(e) => log::warn!("Skipping audio part with invalid base64: {}", e),
                }
            }
        }

        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }

        if content.turn_complete {
            log::debug!("Model turn complete");
        }

        events
    }
}
