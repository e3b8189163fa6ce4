pub mod audio_capture;
pub mod audio_sink;
pub mod codec;
pub mod config;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::{Result, SessionError};
pub use session::{CloseReason, SessionController, SessionState};
