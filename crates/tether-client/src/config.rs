//! Client configuration.

use serde::{Deserialize, Serialize};
use tether_core::{
    KeepAliveConfig, Payload, ResumeConfig, ResumeToken, TetherError, MAX_RESUME_TOKEN_LEN,
};

pub const DEFAULT_MIME_TYPE: &str = "application/binary";

/// Everything needed to establish a client session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub keepalive: KeepAliveConfig,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    /// Enables resumption when set
    pub resume: Option<ResumeConfig>,
    /// Token to present in SETUP; generated when resumption is enabled and none is given
    #[serde(skip)]
    pub resume_token: Option<ResumeToken>,
    /// Application payload carried by SETUP
    #[serde(skip)]
    pub setup_payload: Payload,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keepalive: KeepAliveConfig::default(),
            metadata_mime_type: DEFAULT_MIME_TYPE.to_string(),
            data_mime_type: DEFAULT_MIME_TYPE.to_string(),
            resume: None,
            resume_token: None,
            setup_payload: Payload::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self, TetherError> {
        serde_json::from_str(json).map_err(|e| TetherError::Config(e.to_string()))
    }

    pub fn with_resume(mut self, resume: ResumeConfig) -> Self {
        self.resume = Some(resume);
        self
    }

    pub fn with_resume_token(mut self, token: ResumeToken) -> Self {
        self.resume_token = Some(token);
        self
    }

    pub fn with_setup_payload(mut self, payload: Payload) -> Self {
        self.setup_payload = payload;
        self
    }

    pub fn validate(&self) -> Result<(), TetherError> {
        self.keepalive.validate()?;
        if let Some(resume) = &self.resume {
            resume.validate()?;
        }
        for (name, value) in [
            ("metadata_mime_type", &self.metadata_mime_type),
            ("data_mime_type", &self.data_mime_type),
        ] {
            if value.is_empty() || value.len() > u8::MAX as usize || !value.is_ascii() {
                return Err(TetherError::Config(format!(
                    "{} must be 1 to 255 ASCII characters",
                    name
                )));
            }
        }
        if self.resume.is_none() && self.resume_token.is_some() {
            return Err(TetherError::Config(
                "resume_token requires resume to be enabled".to_string(),
            ));
        }
        if let Some(token) = &self.resume_token {
            if token.is_empty() || token.len() > MAX_RESUME_TOKEN_LEN {
                return Err(TetherError::Config(format!(
                    "resume_token must be 1 to {} bytes, got {}",
                    MAX_RESUME_TOKEN_LEN,
                    token.len()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::BufferStrategy;

    #[test]
    fn test_from_json() {
        let config = ClientConfig::from_json(
            r#"{
                "keepalive": { "interval": 5000, "missed_acks": 2 },
                "data_mime_type": "application/json",
                "resume": { "strategy": "bytes", "capacity": 65536 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.keepalive.interval, Duration::from_secs(5));
        assert_eq!(config.keepalive.ack_timeout, Duration::from_secs(30));
        assert_eq!(config.keepalive.missed_acks, 2);
        assert_eq!(config.metadata_mime_type, DEFAULT_MIME_TYPE);
        assert_eq!(config.data_mime_type, "application/json");

        let resume = config.resume.unwrap();
        assert_eq!(resume.strategy, BufferStrategy::Bytes);
        assert_eq!(resume.capacity, 65536);
        assert_eq!(resume.resume_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_validate() {
        assert!(ClientConfig::default().validate().is_ok());

        let config = ClientConfig {
            data_mime_type: String::new(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TetherError::Config(_))));

        let config = ClientConfig {
            resume_token: Some(ResumeToken::generate()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TetherError::Config(_))));
    }

    #[test]
    fn test_oversized_resume_token_rejected() {
        let config = ClientConfig::default()
            .with_resume(ResumeConfig::default())
            .with_resume_token(ResumeToken::new(vec![7u8; MAX_RESUME_TOKEN_LEN + 1]));
        assert!(matches!(config.validate(), Err(TetherError::Config(_))));

        let config = ClientConfig::default()
            .with_resume(ResumeConfig::default())
            .with_resume_token(ResumeToken::new(vec![7u8; MAX_RESUME_TOKEN_LEN]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(
            ClientConfig::from_json("{ \"keepalive\": 3 }"),
            Err(TetherError::Config(_))
        ));
    }
}
