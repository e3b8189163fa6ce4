use std::fmt;

/// Lifecycle of a voice session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active { speaking: bool },
    Closed,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active { .. })
    }

    /// States from which `connect` may start a new session
    pub fn can_connect(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Active { speaking: true } => write!(f, "active (speaking)"),
            SessionState::Active { speaking: false } => write!(f, "active"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a session reached `Closed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called
    Requested,
    /// The remote end closed the stream
    RemoteClosed,
    /// The link or the microphone failed
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => write!(f, "closed by request"),
            CloseReason::RemoteClosed => write!(f, "closed by remote"),
            CloseReason::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}
