//! Session roles and the resumable session state machine states.

use crate::stream_id::StreamId;
use std::fmt;

/// Which side of a session this endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends SETUP, issues odd stream ids
    Client,
    /// Accepts SETUP, issues even stream ids
    Server,
}

impl Role {
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }

    /// Whether `stream_id` was (or would be) issued by this side
    pub fn is_local_stream(self, stream_id: StreamId) -> bool {
        stream_id != 0 && initiator_stream(stream_id) == (self == Self::Client)
    }
}

/// Streams with odd ids are issued by the client (session initiator)
pub fn initiator_stream(stream_id: StreamId) -> bool {
    stream_id % 2 == 1
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// State of a resumable session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    New,
    SetupPending,
    Established,
    Disconnected,
    Resuming,
    Closed,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// States in which frames may flow on the physical link
    pub fn is_connected(self) -> bool {
        matches!(self, Self::SetupPending | Self::Established)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::SetupPending => "SETUP_PENDING",
            Self::Established => "ESTABLISHED",
            Self::Disconnected => "DISCONNECTED",
            Self::Resuming => "RESUMING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}
