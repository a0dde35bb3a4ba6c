//! Core types and utilities for the Tether session protocol.
//!
//! This crate provides the foundation types used across all Tether components:
//! - Frame encoding and decoding
//! - Control frames (setup, error, keepalive, resume)
//! - Error taxonomy and protocol error codes
//! - Stream id allocation
//! - Resume cache for replaying unacknowledged frames
//! - Shared configuration records

pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod resume;
pub mod state;
pub mod stream_id;

pub use config::{KeepAliveConfig, ResumeConfig};
pub use control::{
    ErrorFrame, KeepaliveFrame, ResumeFrame, ResumeOkFrame, SetupFrame, Version,
};
pub use error::{ErrorCode, TetherError};
pub use frame::{Frame, FrameError, FrameFlags, FrameType, Payload, MAX_STREAM_ID};
pub use resume::{BufferStrategy, ResumeCache, ResumeToken, MAX_RESUME_TOKEN_LEN};
pub use state::{Role, SessionState};
pub use stream_id::{StreamId, StreamIdAllocator};
