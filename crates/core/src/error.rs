//! Error types for MeshVoice

use serde::{Deserialize, Serialize};

/// Result type alias using the MeshVoice Error
pub type Result<T> = std::result::Result<T, Error>;

/// Reason a local media device could not be acquired.
///
/// Device failures are surfaced before any peer state is created, so the
/// caller can tell a permission problem from a missing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceErrorReason {
    /// The platform refused access to the device
    PermissionDenied,
    /// No matching input/output device exists or it vanished mid-acquire
    DeviceUnavailable,
    /// The device exists but supports none of the requested formats
    UnsupportedFormat,
}

impl std::fmt::Display for DeviceErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceErrorReason::PermissionDenied => write!(f, "permission denied"),
            DeviceErrorReason::DeviceUnavailable => write!(f, "device unavailable"),
            DeviceErrorReason::UnsupportedFormat => write!(f, "unsupported format"),
        }
    }
}

/// Errors that can occur in MeshVoice operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Join rejected before any state was created
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Microphone/camera could not be acquired
    #[error("Device error ({reason}): {detail}")]
    DeviceError {
        /// Why acquisition failed
        reason: DeviceErrorReason,
        /// Platform-specific detail
        detail: String,
    },

    /// Signaling connection error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// A connection record already exists for this peer
    #[error("Duplicate peer: {0}")]
    DuplicatePeer(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Negotiation with a peer failed terminally (retry exhausted)
    #[error("Negotiation failed for peer {0}")]
    NegotiationFailed(String),

    /// Membership registry error
    #[error("Registry error: {0}")]
    RegistryError(String),

    /// Audio/video codec error
    #[error("Encoding error: {0}")]
    EncodingError(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Session lifecycle error
    #[error("Session error: {0}")]
    SessionError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Convenience constructor for device errors.
    pub fn device(reason: DeviceErrorReason, detail: impl Into<String>) -> Self {
        Error::DeviceError {
            reason,
            detail: detail.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::WebSocketError(_)
                | Error::RegistryError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is a device-acquisition error
    pub fn is_device_error(&self) -> bool {
        matches!(self, Error::DeviceError { .. })
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::DuplicatePeer(_)
                | Error::PeerConnectionError(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
                | Error::NegotiationFailed(_)
        )
    }

    /// Check if this error aborts a join before any state exists
    pub fn aborts_join(&self) -> bool {
        matches!(
            self,
            Error::Unauthorized(_) | Error::DeviceError { .. } | Error::InvalidConfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");

        let err = Error::device(DeviceErrorReason::PermissionDenied, "mic blocked");
        assert_eq!(
            err.to_string(),
            "Device error (permission denied): mic blocked"
        );
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::SignalingError("test".to_string()).is_retryable());
        assert!(Error::RegistryError("test".to_string()).is_retryable());
        assert!(!Error::Unauthorized("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_peer_error() {
        assert!(Error::DuplicatePeer("p-1".to_string()).is_peer_error());
        assert!(Error::NegotiationFailed("p-1".to_string()).is_peer_error());
        assert!(!Error::InvalidConfig("test".to_string()).is_peer_error());
    }

    #[test]
    fn test_aborts_join() {
        assert!(Error::Unauthorized("not a member".to_string()).aborts_join());
        assert!(Error::device(DeviceErrorReason::DeviceUnavailable, "no mic").aborts_join());
        assert!(!Error::SignalingError("late".to_string()).aborts_join());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "socket gone");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::IoError(_)));
    }
}
