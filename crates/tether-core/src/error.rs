//! Error types and protocol error codes.

use crate::control::Version;
use crate::frame::FrameError;
use std::fmt;

/// Tether error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TetherError {
    #[error("Framing error: {0}")]
    Framing(#[from] FrameError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A resume position outside what the cache can account for
    #[error("Invalid position {position}: {reason}")]
    InvalidPosition { position: u64, reason: String },

    #[error("Stream id space exhausted")]
    IdSpaceExhausted,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid setup: {0}")]
    InvalidSetup(String),

    #[error("Unsupported version {0}")]
    UnsupportedVersion(Version),

    #[error("Rejected: {0}")]
    Rejected(String),

    /// The session could not be resumed and has been terminated
    #[error("Resume failed: {0}")]
    ResumeFailed(String),

    #[error("Keepalive timeout after {0} missed acknowledgements")]
    KeepAliveTimeout(u32),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// ERROR frame received from the peer
    #[error("Remote error [{code}]: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TetherError {
    pub fn invalid_position(position: u64, reason: impl Into<String>) -> Self {
        Self::InvalidPosition {
            position,
            reason: reason.into(),
        }
    }

    /// Whether the error ends the session rather than a single stream or attempt
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, Self::Transport(_) | Self::Config(_) | Self::Rejected(_))
    }

    /// Error code to place in an outgoing ERROR frame describing this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidSetup(_) | Self::UnsupportedVersion(_) => ErrorCode::INVALID_SETUP,
            Self::ResumeFailed(_) | Self::InvalidPosition { .. } => ErrorCode::REJECTED_RESUME,
            Self::Rejected(_) => ErrorCode::REJECTED,
            Self::ConnectionClosed => ErrorCode::CONNECTION_CLOSE,
            Self::Remote { code, .. } => *code,
            Self::Framing(_)
            | Self::Transport(_)
            | Self::Protocol(_)
            | Self::IdSpaceExhausted
            | Self::KeepAliveTimeout(_)
            | Self::Timeout(_)
            | Self::Config(_) => ErrorCode::CONNECTION_ERROR,
        }
    }
}

/// Error code carried by ERROR frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(u32);

impl ErrorCode {
    pub const INVALID_SETUP: ErrorCode = ErrorCode(0x0000_0001);
    pub const UNSUPPORTED_SETUP: ErrorCode = ErrorCode(0x0000_0002);
    pub const REJECTED_SETUP: ErrorCode = ErrorCode(0x0000_0003);
    pub const REJECTED_RESUME: ErrorCode = ErrorCode(0x0000_0004);
    pub const CONNECTION_ERROR: ErrorCode = ErrorCode(0x0000_0101);
    pub const CONNECTION_CLOSE: ErrorCode = ErrorCode(0x0000_0102);
    pub const APPLICATION_ERROR: ErrorCode = ErrorCode(0x0000_0201);
    pub const REJECTED: ErrorCode = ErrorCode(0x0000_0202);
    pub const CANCELED: ErrorCode = ErrorCode(0x0000_0203);
    pub const INVALID: ErrorCode = ErrorCode(0x0000_0204);

    pub fn new(code: u32) -> Self {
        Self(code)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Codes that may only appear on stream 0
    pub fn is_connection_level(&self) -> bool {
        self.0 < 0x0000_0201
    }

    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::INVALID_SETUP => "INVALID_SETUP",
            Self::UNSUPPORTED_SETUP => "UNSUPPORTED_SETUP",
            Self::REJECTED_SETUP => "REJECTED_SETUP",
            Self::REJECTED_RESUME => "REJECTED_RESUME",
            Self::CONNECTION_ERROR => "CONNECTION_ERROR",
            Self::CONNECTION_CLOSE => "CONNECTION_CLOSE",
            Self::APPLICATION_ERROR => "APPLICATION_ERROR",
            Self::REJECTED => "REJECTED",
            Self::CANCELED => "CANCELED",
            Self::INVALID => "INVALID",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}
