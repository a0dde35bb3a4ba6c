//! Server configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_core::config::duration_millis;
use tether_core::{ResumeConfig, TetherError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Time a new connection has to deliver its first frame
    #[serde(with = "duration_millis")]
    pub setup_timeout: Duration,
    /// Accept resumable sessions and RESUME when set
    pub resume: Option<ResumeConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_secs(30),
            resume: None,
        }
    }
}

impl ServerConfig {
    pub fn from_json(json: &str) -> Result<Self, TetherError> {
        serde_json::from_str(json).map_err(|e| TetherError::Config(e.to_string()))
    }

    pub fn with_resume(mut self, resume: ResumeConfig) -> Self {
        self.resume = Some(resume);
        self
    }

    pub fn validate(&self) -> Result<(), TetherError> {
        if self.setup_timeout.is_zero() {
            return Err(TetherError::Config(
                "setup_timeout must be non-zero".to_string(),
            ));
        }
        if let Some(resume) = &self.resume {
            resume.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json() {
        let config =
            ServerConfig::from_json(r#"{ "setup_timeout": 1500, "resume": { "capacity": 8 } }"#)
                .unwrap();
        assert_eq!(config.setup_timeout, Duration::from_millis(1500));
        assert_eq!(config.resume.unwrap().capacity, 8);

        let config = ServerConfig::from_json("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_validate() {
        assert!(ServerConfig::default().validate().is_ok());
        let config = ServerConfig {
            setup_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TetherError::Config(_))));
    }
}
