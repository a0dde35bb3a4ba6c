//! Configuration records shared by clients and servers.
//!
//! Durations are expressed in milliseconds when serialized (see
//! [`duration_millis`]).

use crate::error::TetherError;
use crate::resume::BufferStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Keepalive timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Time between client keepalive ticks (zero disables ticking)
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Time allowed for an acknowledgment before a tick counts as missed
    #[serde(with = "duration_millis")]
    pub ack_timeout: Duration,
    /// Consecutive missed acknowledgments before the link is declared dead
    pub missed_acks: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            ack_timeout: Duration::from_secs(30),
            missed_acks: 3,
        }
    }
}

impl KeepAliveConfig {
    /// Maximum silent period advertised to the server in SETUP
    pub fn max_lifetime(&self) -> Duration {
        self.ack_timeout.saturating_mul(self.missed_acks)
    }

    pub fn validate(&self) -> Result<(), TetherError> {
        if self.missed_acks == 0 {
            return Err(TetherError::Config(
                "keepalive missed_acks must be at least 1".to_string(),
            ));
        }
        if self.ack_timeout.is_zero() {
            return Err(TetherError::Config(
                "keepalive ack_timeout must be non-zero".to_string(),
            ));
        }
        if self.interval.as_millis() > u128::from(u32::MAX)
            || self.max_lifetime().as_millis() > u128::from(u32::MAX)
        {
            return Err(TetherError::Config(
                "keepalive durations must fit in 32-bit milliseconds".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resume buffering and reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
    pub strategy: BufferStrategy,
    /// Cache capacity in the strategy's unit, also bounding sends while disconnected
    pub capacity: usize,
    /// Time allowed for the RESUME / RESUME_OK exchange
    #[serde(with = "duration_millis")]
    pub resume_timeout: Duration,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            strategy: BufferStrategy::Frames,
            capacity: 1024,
            resume_timeout: Duration::from_secs(10),
        }
    }
}

impl ResumeConfig {
    pub fn validate(&self) -> Result<(), TetherError> {
        if self.resume_timeout.is_zero() {
            return Err(TetherError::Config(
                "resume_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_defaults() {
        let config = KeepAliveConfig::default();
        assert_eq!(config.interval, Duration::from_secs(20));
        assert_eq!(config.max_lifetime(), Duration::from_secs(90));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_keepalive_validation() {
        let config = KeepAliveConfig {
            missed_acks: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TetherError::Config(_))));
    }

    #[test]
    fn test_resume_config_from_json() {
        let config: ResumeConfig =
            serde_json::from_str(r#"{"strategy": "bytes", "capacity": 4096}"#).unwrap();
        assert_eq!(config.strategy, BufferStrategy::Bytes);
        assert_eq!(config.capacity, 4096);
        assert_eq!(config.resume_timeout, Duration::from_secs(10));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["resume_timeout"], 10_000);
    }
}
