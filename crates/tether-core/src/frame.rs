//! Frame encoding for the Tether protocol.
//!
//! Frame format: [stream id u32][frame type (6 bits) | flags (10 bits)][body bytes]
//!
//! Stream transports add their own length prefix; a frame on its own is not
//! self-delimiting.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the fixed frame header (stream id + type/flags)
pub const FRAME_HEADER_SIZE: usize = 6;

/// Largest valid stream id (the top bit of the stream id field is reserved)
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Maximum encoded frame size (fits a 24-bit length prefix)
pub const MAX_FRAME_SIZE: usize = 0xFF_FFFF;

/// Frame types understood by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Setup = 0x01,
    Lease = 0x02,
    Keepalive = 0x03,
    RequestResponse = 0x04,
    RequestFnf = 0x05,
    RequestStream = 0x06,
    RequestChannel = 0x07,
    RequestN = 0x08,
    Cancel = 0x09,
    Payload = 0x0A,
    Error = 0x0B,
    MetadataPush = 0x0C,
    Resume = 0x0D,
    ResumeOk = 0x0E,
    Ext = 0x3F,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let frame_type = match value {
            0x01 => Self::Setup,
            0x02 => Self::Lease,
            0x03 => Self::Keepalive,
            0x04 => Self::RequestResponse,
            0x05 => Self::RequestFnf,
            0x06 => Self::RequestStream,
            0x07 => Self::RequestChannel,
            0x08 => Self::RequestN,
            0x09 => Self::Cancel,
            0x0A => Self::Payload,
            0x0B => Self::Error,
            0x0C => Self::MetadataPush,
            0x0D => Self::Resume,
            0x0E => Self::ResumeOk,
            0x3F => Self::Ext,
            _ => return None,
        };
        Some(frame_type)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this frame type opens a new stream
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::RequestResponse | Self::RequestFnf | Self::RequestStream | Self::RequestChannel
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Setup => "SETUP",
            Self::Lease => "LEASE",
            Self::Keepalive => "KEEPALIVE",
            Self::RequestResponse => "REQUEST_RESPONSE",
            Self::RequestFnf => "REQUEST_FNF",
            Self::RequestStream => "REQUEST_STREAM",
            Self::RequestChannel => "REQUEST_CHANNEL",
            Self::RequestN => "REQUEST_N",
            Self::Cancel => "CANCEL",
            Self::Payload => "PAYLOAD",
            Self::Error => "ERROR",
            Self::MetadataPush => "METADATA_PUSH",
            Self::Resume => "RESUME",
            Self::ResumeOk => "RESUME_OK",
            Self::Ext => "EXT",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Frame flags (low 10 bits of the type/flags field)
///
/// Several flags share a bit and are interpreted by frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u16);

impl FrameFlags {
    pub const IGNORE: u16 = 0b10_0000_0000;
    pub const METADATA: u16 = 0b01_0000_0000;
    pub const FOLLOWS: u16 = 0b00_1000_0000;
    /// SETUP: the client requests a resumable session
    pub const RESUME_ENABLE: u16 = 0b00_1000_0000;
    /// KEEPALIVE: the receiver must answer
    pub const RESPOND: u16 = 0b00_1000_0000;
    pub const COMPLETE: u16 = 0b00_0100_0000;
    pub const LEASE: u16 = 0b00_0100_0000;
    pub const NEXT: u16 = 0b00_0010_0000;

    const MASK: u16 = 0b11_1111_1111;

    pub fn new(flags: u16) -> Self {
        Self(flags & Self::MASK)
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn with(self, flag: u16) -> Self {
        Self::new(self.0 | flag)
    }

    pub fn is_metadata(&self) -> bool {
        self.contains(Self::METADATA)
    }

    pub fn is_complete(&self) -> bool {
        self.contains(Self::COMPLETE)
    }

    pub fn is_next(&self) -> bool {
        self.contains(Self::NEXT)
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

/// Application payload: optional metadata plus data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub metadata: Option<Bytes>,
    pub data: Bytes,
}

impl Payload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            metadata: None,
            data: data.into(),
        }
    }

    pub fn with_metadata(metadata: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self {
            metadata: Some(metadata.into()),
            data: data.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_none() && self.data.is_empty()
    }

    /// Encode metadata (24-bit length prefixed) followed by data
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        if let Some(metadata) = &self.metadata {
            put_u24(buf, metadata.len());
            buf.put_slice(metadata);
        }
        buf.put_slice(&self.data);
    }

    pub(crate) fn decode(mut body: Bytes, has_metadata: bool) -> Result<Self, FrameError> {
        let metadata = if has_metadata {
            let len = get_u24(&mut body)?;
            ensure_remaining(&body, len)?;
            Some(body.split_to(len))
        } else {
            None
        };
        Ok(Self {
            metadata,
            data: body,
        })
    }
}

impl From<&'static str> for Payload {
    fn from(data: &'static str) -> Self {
        Self::new(Bytes::from_static(data.as_bytes()))
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<String> for Payload {
    fn from(data: String) -> Self {
        Self::new(Bytes::from(data))
    }
}

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub body: Bytes,
}

impl Frame {
    pub fn new(stream_id: u32, frame_type: FrameType, flags: FrameFlags, body: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags,
            body,
        }
    }

    fn with_payload(
        stream_id: u32,
        frame_type: FrameType,
        mut flags: FrameFlags,
        initial_n: Option<u32>,
        payload: &Payload,
    ) -> Self {
        let mut buf = BytesMut::new();
        if let Some(n) = initial_n {
            buf.put_u32(n);
        }
        if payload.metadata.is_some() {
            flags = flags.with(FrameFlags::METADATA);
        }
        payload.encode_into(&mut buf);
        Self::new(stream_id, frame_type, flags, buf.freeze())
    }

    /// Create a request/response request frame
    pub fn request_response(stream_id: u32, payload: Payload) -> Self {
        Self::with_payload(
            stream_id,
            FrameType::RequestResponse,
            FrameFlags::empty(),
            None,
            &payload,
        )
    }

    /// Create a fire-and-forget request frame
    pub fn request_fnf(stream_id: u32, payload: Payload) -> Self {
        Self::with_payload(
            stream_id,
            FrameType::RequestFnf,
            FrameFlags::empty(),
            None,
            &payload,
        )
    }

    /// Create a request/stream request frame with initial demand
    pub fn request_stream(stream_id: u32, initial_n: u32, payload: Payload) -> Self {
        Self::with_payload(
            stream_id,
            FrameType::RequestStream,
            FrameFlags::empty(),
            Some(initial_n),
            &payload,
        )
    }

    /// Create a channel request frame with initial demand
    pub fn request_channel(stream_id: u32, initial_n: u32, payload: Payload, complete: bool) -> Self {
        let flags = if complete {
            FrameFlags::new(FrameFlags::COMPLETE)
        } else {
            FrameFlags::empty()
        };
        Self::with_payload(
            stream_id,
            FrameType::RequestChannel,
            flags,
            Some(initial_n),
            &payload,
        )
    }

    /// Create a REQUEST_N frame granting more demand
    pub fn request_n(stream_id: u32, n: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(n);
        Self::new(stream_id, FrameType::RequestN, FrameFlags::empty(), buf.freeze())
    }

    /// Create a cancel frame
    pub fn cancel(stream_id: u32) -> Self {
        Self::new(stream_id, FrameType::Cancel, FrameFlags::empty(), Bytes::new())
    }

    /// Create a payload frame
    pub fn payload(stream_id: u32, payload: Payload, next: bool, complete: bool) -> Self {
        let mut flags = FrameFlags::empty();
        if next {
            flags = flags.with(FrameFlags::NEXT);
        }
        if complete {
            flags = flags.with(FrameFlags::COMPLETE);
        }
        Self::with_payload(stream_id, FrameType::Payload, flags, None, &payload)
    }

    /// Create a completion-only payload frame
    pub fn complete(stream_id: u32) -> Self {
        Self::payload(stream_id, Payload::default(), false, true)
    }

    /// Create a metadata push frame (always stream 0)
    pub fn metadata_push(metadata: Bytes) -> Self {
        Self::new(
            0,
            FrameType::MetadataPush,
            FrameFlags::new(FrameFlags::METADATA),
            metadata,
        )
    }

    /// Number of bytes this frame occupies when encoded (excluding any length prefix)
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.body.len()
    }

    /// Whether this frame counts toward resume positions and is kept for replay
    pub fn is_resumable(&self) -> bool {
        self.stream_id != 0 || self.frame_type == FrameType::MetadataPush
    }

    /// Whether this frame ends its stream for the receiving requester
    pub fn is_terminal(&self) -> bool {
        match self.frame_type {
            FrameType::Error | FrameType::Cancel => true,
            FrameType::Payload => self.flags.is_complete(),
            _ => false,
        }
    }

    /// Initial or granted demand for frame types that carry it
    pub fn request_n_value(&self) -> Option<u32> {
        match self.frame_type {
            FrameType::RequestStream | FrameType::RequestChannel | FrameType::RequestN
                if self.body.len() >= 4 =>
            {
                Some(u32::from_be_bytes([
                    self.body[0],
                    self.body[1],
                    self.body[2],
                    self.body[3],
                ]))
            }
            _ => None,
        }
    }

    /// Decode the application payload of a request or payload frame
    pub fn payload_data(&self) -> Result<Payload, FrameError> {
        let mut body = self.body.clone();
        match self.frame_type {
            FrameType::RequestStream | FrameType::RequestChannel => {
                ensure_remaining(&body, 4)?;
                body.advance(4);
            }
            FrameType::RequestResponse | FrameType::RequestFnf | FrameType::Payload => {}
            other => {
                return Err(FrameError::Malformed(format!(
                    "{} frames carry no payload",
                    other
                )))
            }
        }
        Payload::decode(body, self.flags.is_metadata())
    }

    /// Encode this frame to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.stream_id & MAX_STREAM_ID);
        let type_and_flags = (u16::from(self.frame_type.as_u8()) << 10) | self.flags.as_u16();
        buf.put_u16(type_and_flags);
        buf.put_slice(&self.body);
    }

    /// Decode a frame from exactly one frame's worth of bytes
    pub fn decode(mut data: Bytes) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                needed: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }
        if data.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(data.len()));
        }

        let stream_id = data.get_u32() & MAX_STREAM_ID;
        let type_and_flags = data.get_u16();
        let raw_type = (type_and_flags >> 10) as u8;
        let frame_type =
            FrameType::from_u8(raw_type).ok_or(FrameError::UnknownFrameType(raw_type))?;

        Ok(Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(type_and_flags),
            body: data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Frame too short: need {needed} bytes, have {actual}")]
    TooShort { needed: usize, actual: usize },

    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

pub(crate) fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<(), FrameError> {
    if buf.remaining() < needed {
        return Err(FrameError::TooShort {
            needed,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn put_u24(buf: &mut BytesMut, value: usize) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

pub(crate) fn get_u24(buf: &mut Bytes) -> Result<usize, FrameError> {
    ensure_remaining(buf, 3)?;
    let high = buf.get_u8() as usize;
    let mid = buf.get_u8() as usize;
    let low = buf.get_u8() as usize;
    Ok((high << 16) | (mid << 8) | low)
}
