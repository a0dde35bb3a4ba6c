//! Resume support: session tokens and the cache of sent frames.
//!
//! Positions count encoded bytes of resumable frames since the session
//! started. The cache keeps every sent frame the peer has not acknowledged,
//! bounded by a [`BufferStrategy`], so it can be replayed on a replacement
//! connection.

use crate::error::TetherError;
use crate::frame::Frame;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Length of generated resume tokens in bytes
pub const RESUME_TOKEN_LEN: usize = 16;

/// Longest token the 16-bit length prefix of SETUP and RESUME can carry
pub const MAX_RESUME_TOKEN_LEN: usize = u16::MAX as usize;

/// Opaque session identifier presented when resuming
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResumeToken(Bytes);

impl ResumeToken {
    pub fn new(token: impl Into<Bytes>) -> Self {
        Self(token.into())
    }

    /// Generate a random token
    pub fn generate() -> Self {
        let bytes: [u8; RESUME_TOKEN_LEN] = rand::random();
        Self(Bytes::copy_from_slice(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// How resume cache capacity is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStrategy {
    /// Capacity is a number of frames
    #[default]
    Frames,
    /// Capacity is a number of encoded bytes
    Bytes,
}

impl BufferStrategy {
    /// Footprint of one frame in this strategy's unit
    pub fn measure(&self, frame: &Frame) -> usize {
        match self {
            Self::Frames => 1,
            Self::Bytes => frame.encoded_len(),
        }
    }
}

/// Position-indexed buffer of sent frames awaiting acknowledgment
#[derive(Debug)]
pub struct ResumeCache {
    strategy: BufferStrategy,
    capacity: usize,
    /// (position at send start, frame), contiguous and ascending
    frames: VecDeque<(u64, Frame)>,
    current_position: u64,
    remote_position: u64,
    size: usize,
}

impl ResumeCache {
    pub fn new(strategy: BufferStrategy, capacity: usize) -> Self {
        Self {
            strategy,
            capacity,
            frames: VecDeque::new(),
            current_position: 0,
            remote_position: 0,
            size: 0,
        }
    }

    pub fn strategy(&self) -> BufferStrategy {
        self.strategy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a frame as sent at the current position
    ///
    /// Evicts from the head, acknowledged or not, until the cache is back
    /// within capacity. Evicting unacknowledged frames moves the remote
    /// position up with them: those bytes can never be replayed.
    pub fn sent(&mut self, frame: Frame) {
        let start = self.current_position;
        self.current_position += frame.encoded_len() as u64;
        self.size += self.strategy.measure(&frame);
        self.frames.push_back((start, frame));

        if self.size > self.capacity {
            while self.size > self.capacity {
                if self.pop_front().is_none() {
                    break;
                }
            }
            let earliest = self.earliest_resend_position();
            if earliest > self.remote_position {
                tracing::trace!(
                    earliest,
                    remote = self.remote_position,
                    "resume cache evicted unacknowledged frames"
                );
                self.remote_position = earliest;
            }
        }
    }

    /// Record that the peer has received everything before `position`
    pub fn update_remote_position(&mut self, position: u64) -> Result<(), TetherError> {
        if position > self.current_position {
            return Err(TetherError::invalid_position(
                position,
                format!("beyond current position {}", self.current_position),
            ));
        }
        if position < self.remote_position {
            return Err(TetherError::invalid_position(
                position,
                format!("behind acknowledged position {}", self.remote_position),
            ));
        }

        let mut acknowledged = 0;
        for (start, frame) in &self.frames {
            let end = start + frame.encoded_len() as u64;
            if end <= position {
                acknowledged += 1;
            } else {
                if *start < position {
                    return Err(TetherError::invalid_position(
                        position,
                        format!("inside frame spanning [{}, {})", start, end),
                    ));
                }
                break;
            }
        }

        for _ in 0..acknowledged {
            self.pop_front();
        }
        self.remote_position = position;
        Ok(())
    }

    /// Every buffered frame starting at or after `position`, in order
    pub fn resend(&self, position: u64) -> Result<Vec<Frame>, TetherError> {
        if position > self.current_position {
            return Err(TetherError::invalid_position(
                position,
                format!("beyond current position {}", self.current_position),
            ));
        }
        let earliest = self.earliest_resend_position();
        if position < earliest {
            return Err(TetherError::invalid_position(
                position,
                format!("frames before {} have been evicted", earliest),
            ));
        }

        let skip = self
            .frames
            .iter()
            .take_while(|(start, _)| *start < position)
            .count();
        if let Some((start, _)) = self.frames.get(skip) {
            if *start != position {
                return Err(TetherError::invalid_position(
                    position,
                    "not a frame boundary".to_string(),
                ));
            }
        }

        Ok(self
            .frames
            .iter()
            .skip(skip)
            .map(|(_, frame)| frame.clone())
            .collect())
    }

    /// Position the peer has acknowledged (or that eviction forced)
    pub fn remote_position(&self) -> u64 {
        self.remote_position
    }

    /// Local-sent position
    pub fn current_position(&self) -> u64 {
        self.current_position
    }

    /// Earliest position a replay can start from
    pub fn earliest_resend_position(&self) -> u64 {
        self.frames
            .front()
            .map(|(start, _)| *start)
            .unwrap_or(self.current_position)
    }

    /// Buffered footprint in the strategy's unit
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn pop_front(&mut self) -> Option<Frame> {
        let (_, frame) = self.frames.pop_front()?;
        self.size -= self.strategy.measure(&frame);
        Some(frame)
    }
}
