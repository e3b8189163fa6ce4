use thiserror::Error;

use crate::audio_capture::CaptureError;
use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Device error: {0}")]
    Device(#[from] CaptureError),

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid session state: {0}")]
    InvalidState(String),
}
