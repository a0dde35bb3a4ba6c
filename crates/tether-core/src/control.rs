//! Control frames carried on stream 0.
//!
//! SETUP:     [major u16][minor u16][keepalive ms u32][max lifetime ms u32]
//!            [token len u16][token]? [mime len u8][metadata mime][mime len u8][data mime][payload]
//! ERROR:     [code u32][utf-8 message]
//! KEEPALIVE: [last received position u64][data]
//! RESUME:    [major u16][minor u16][token len u16][token][last received server pos u64]
//!            [first available client pos u64]
//! RESUME_OK: [last received client pos u64]

use crate::error::ErrorCode;
use crate::frame::{ensure_remaining, Frame, FrameError, FrameFlags, FrameType, Payload};
use crate::resume::ResumeToken;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::time::Duration;

/// Protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const CURRENT: Version = Version { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    fn decode(body: &mut Bytes) -> Result<Self, FrameError> {
        ensure_remaining(body, 4)?;
        Ok(Self {
            major: body.get_u16(),
            minor: body.get_u16(),
        })
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.major);
        buf.put_u16(self.minor);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn expect_control(frame: &Frame, frame_type: FrameType) -> Result<Bytes, FrameError> {
    if frame.frame_type != frame_type {
        return Err(FrameError::Malformed(format!(
            "expected {} frame, got {}",
            frame_type, frame.frame_type
        )));
    }
    if frame.stream_id != 0 {
        return Err(FrameError::Malformed(format!(
            "{} frame on stream {}",
            frame_type, frame.stream_id
        )));
    }
    Ok(frame.body.clone())
}

fn duration_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn get_short_string(body: &mut Bytes) -> Result<String, FrameError> {
    ensure_remaining(body, 1)?;
    let len = body.get_u8() as usize;
    ensure_remaining(body, len)?;
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| FrameError::Malformed("mime type is not valid UTF-8".to_string()))
}

fn get_token(body: &mut Bytes) -> Result<ResumeToken, FrameError> {
    ensure_remaining(body, 2)?;
    let len = body.get_u16() as usize;
    ensure_remaining(body, len)?;
    Ok(ResumeToken::new(body.split_to(len)))
}

fn put_token(buf: &mut BytesMut, token: &ResumeToken) {
    let bytes = token.as_bytes();
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

/// First frame of every fresh session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupFrame {
    pub version: Version,
    pub keepalive_interval: Duration,
    /// Maximum time without hearing from the client before it is considered dead
    pub max_lifetime: Duration,
    pub resume_token: Option<ResumeToken>,
    pub lease: bool,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub payload: Payload,
}

impl SetupFrame {
    /// Read only the version of a SETUP frame
    pub fn peek_version(frame: &Frame) -> Result<Version, FrameError> {
        let mut body = expect_control(frame, FrameType::Setup)?;
        Version::decode(&mut body)
    }

    pub fn into_frame(self) -> Frame {
        let mut flags = FrameFlags::empty();
        if self.resume_token.is_some() {
            flags = flags.with(FrameFlags::RESUME_ENABLE);
        }
        if self.lease {
            flags = flags.with(FrameFlags::LEASE);
        }
        if self.payload.metadata.is_some() {
            flags = flags.with(FrameFlags::METADATA);
        }

        let mut buf = BytesMut::new();
        self.version.encode_into(&mut buf);
        buf.put_u32(duration_millis(self.keepalive_interval));
        buf.put_u32(duration_millis(self.max_lifetime));
        if let Some(token) = &self.resume_token {
            put_token(&mut buf, token);
        }
        buf.put_u8(self.metadata_mime_type.len() as u8);
        buf.put_slice(self.metadata_mime_type.as_bytes());
        buf.put_u8(self.data_mime_type.len() as u8);
        buf.put_slice(self.data_mime_type.as_bytes());
        self.payload.encode_into(&mut buf);

        Frame::new(0, FrameType::Setup, flags, buf.freeze())
    }

    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        let mut body = expect_control(frame, FrameType::Setup)?;
        let version = Version::decode(&mut body)?;
        ensure_remaining(&body, 8)?;
        let keepalive_interval = Duration::from_millis(u64::from(body.get_u32()));
        let max_lifetime = Duration::from_millis(u64::from(body.get_u32()));
        let resume_token = if frame.flags.contains(FrameFlags::RESUME_ENABLE) {
            Some(get_token(&mut body)?)
        } else {
            None
        };
        let metadata_mime_type = get_short_string(&mut body)?;
        let data_mime_type = get_short_string(&mut body)?;
        let payload = Payload::decode(body, frame.flags.is_metadata())?;

        Ok(Self {
            version,
            keepalive_interval,
            max_lifetime,
            resume_token,
            lease: frame.flags.contains(FrameFlags::LEASE),
            metadata_mime_type,
            data_mime_type,
            payload,
        })
    }
}

/// ERROR frame, either connection-level (stream 0) or stream-level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub stream_id: u32,
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            stream_id,
            code,
            message: message.into(),
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut buf = BytesMut::with_capacity(4 + self.message.len());
        buf.put_u32(self.code.as_u32());
        buf.put_slice(self.message.as_bytes());
        Frame::new(self.stream_id, FrameType::Error, FrameFlags::empty(), buf.freeze())
    }

    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        if frame.frame_type != FrameType::Error {
            return Err(FrameError::Malformed(format!(
                "expected ERROR frame, got {}",
                frame.frame_type
            )));
        }
        let mut body = frame.body.clone();
        ensure_remaining(&body, 4)?;
        let code = ErrorCode::new(body.get_u32());
        Ok(Self {
            stream_id: frame.stream_id,
            code,
            message: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

impl Frame {
    /// Create an ERROR frame
    pub fn error(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorFrame::new(stream_id, code, message).into_frame()
    }
}

/// KEEPALIVE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveFrame {
    pub respond: bool,
    pub last_received_position: u64,
    pub data: Bytes,
}

impl KeepaliveFrame {
    pub fn new(respond: bool, data: Bytes) -> Self {
        Self {
            respond,
            last_received_position: 0,
            data,
        }
    }

    pub fn into_frame(self) -> Frame {
        let flags = if self.respond {
            FrameFlags::new(FrameFlags::RESPOND)
        } else {
            FrameFlags::empty()
        };
        let mut buf = BytesMut::with_capacity(8 + self.data.len());
        buf.put_u64(self.last_received_position);
        buf.put_slice(&self.data);
        Frame::new(0, FrameType::Keepalive, flags, buf.freeze())
    }

    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        let mut body = expect_control(frame, FrameType::Keepalive)?;
        ensure_remaining(&body, 8)?;
        let last_received_position = body.get_u64();
        Ok(Self {
            respond: frame.flags.contains(FrameFlags::RESPOND),
            last_received_position,
            data: body,
        })
    }
}

/// RESUME frame, sent by the client as the first frame of a replacement connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeFrame {
    pub version: Version,
    pub token: ResumeToken,
    pub last_received_server_position: u64,
    pub first_available_client_position: u64,
}

impl ResumeFrame {
    pub fn into_frame(self) -> Frame {
        let mut buf = BytesMut::new();
        self.version.encode_into(&mut buf);
        put_token(&mut buf, &self.token);
        buf.put_u64(self.last_received_server_position);
        buf.put_u64(self.first_available_client_position);
        Frame::new(0, FrameType::Resume, FrameFlags::empty(), buf.freeze())
    }

    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        let mut body = expect_control(frame, FrameType::Resume)?;
        let version = Version::decode(&mut body)?;
        let token = get_token(&mut body)?;
        ensure_remaining(&body, 16)?;
        Ok(Self {
            version,
            token,
            last_received_server_position: body.get_u64(),
            first_available_client_position: body.get_u64(),
        })
    }
}

/// RESUME_OK frame, the server's acceptance of a RESUME
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeOkFrame {
    pub last_received_client_position: u64,
}

impl ResumeOkFrame {
    pub fn into_frame(self) -> Frame {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(self.last_received_client_position);
        Frame::new(0, FrameType::ResumeOk, FrameFlags::empty(), buf.freeze())
    }

    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        let mut body = expect_control(frame, FrameType::ResumeOk)?;
        ensure_remaining(&body, 8)?;
        Ok(Self {
            last_received_client_position: body.get_u64(),
        })
    }
}
