//! Configuration for the MeshVoice client

use crate::ptt::PttConfig;
use crate::vad::VadConfig;
use meshvoice_core::{Error, Result};
use std::time::Duration;

/// Main configuration for a voice session
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket signaling server URL (ws:// or wss://)
    pub signaling_url: String,

    /// Authenticated user id, supplied by the identity collaborator
    pub user_id: String,

    /// Preferred input device name; `None` selects the system default
    pub input_device: Option<String>,

    /// Voice activity detector tuning
    pub vad: VadConfig,

    /// Push-to-talk gate tuning
    pub ptt: PttConfig,

    /// Grace period after ICE reports "disconnected" before recovery is
    /// attempted; transient losses often self-heal within it
    pub disconnect_grace: Duration,

    /// How long a negotiation may sit unfinished before it counts as failed
    pub negotiation_timeout: Duration,

    /// Capacity of the event channel handed to the embedding application
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8443".to_string(),
            user_id: String::new(),
            input_device: None,
            vad: VadConfig::default(),
            ptt: PttConfig::default(),
            disconnect_grace: Duration::from_secs(5),
            negotiation_timeout: Duration::from_secs(30),
            event_buffer: 64,
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given server and user.
    pub fn new(signaling_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a WebSocket URL
    /// - `user_id` is empty
    /// - the VAD or PTT sub-configurations are invalid
    pub fn validate(&self) -> Result<()> {
        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if self.user_id.is_empty() {
            return Err(Error::InvalidConfig("user_id must not be empty".to_string()));
        }

        if self.event_buffer == 0 {
            return Err(Error::InvalidConfig(
                "event_buffer must be non-zero".to_string(),
            ));
        }

        self.vad.validate()?;
        self.ptt.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_with_user_is_valid() {
        let config = ClientConfig::new("ws://localhost:8443", "alice");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_user_rejected() {
        let config = ClientConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_url_rejected() {
        let config = ClientConfig::new("http://localhost:8443", "alice");
        assert!(config.validate().is_err());
    }
}
