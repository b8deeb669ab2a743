//! Error types for heart-rate driver operations
//!
//! Every failure the driver can observe is one variant of [`HramError`].
//! Retry and propagation decisions are made by matching on the variant:
//!
//! - connection-lifecycle errors ([`HramError::is_reconnectable`]) are retried
//!   by the connection manager up to its budget
//! - decode errors are absorbed by the data combiner
//! - everything else ends the operation that produced it

use thiserror::Error;
use uuid::Uuid;

/// Main error type for heart-rate driver operations
#[derive(Error, Debug)]
pub enum HramError {
    // ===== Discovery Errors =====
    /// No matching advertisement was seen within the scan window
    #[error("Scan timeout after {duration_ms}ms")]
    ScanTimeout {
        /// Scan window in milliseconds
        duration_ms: u64,
    },

    // ===== Connection Errors =====
    /// Scan found nothing usable or the device refused the link
    #[error("Device not connected: {0}")]
    DeviceNotConnected(String),

    /// Link dropped or refused at the platform layer
    #[error("Peripheral not connected: {0}")]
    NotConnected(String),

    /// The user asked to stop reconnecting
    #[error("Disconnect requested")]
    DisconnectRequested,

    /// Missing capability or permission (radio absent, access denied)
    #[error("Unmet requirement: {0}")]
    UnmetRequirement(String),

    // ===== Protocol Errors =====
    /// Characteristic payload shorter than its flags dictate
    #[error("Malformed {characteristic} payload: {reason}")]
    MalformedPayload {
        /// Characteristic the payload came from
        characteristic: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// The peripheral does not expose a required characteristic
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    /// Any other failure reported by the radio stack
    #[error("Transport error: {0}")]
    Transport(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HramError {
    /// Check if the connection manager should retry after this error
    pub fn is_reconnectable(&self) -> bool {
        matches!(
            self,
            HramError::ScanTimeout { .. }
                | HramError::DeviceNotConnected(_)
                | HramError::NotConnected(_)
        )
    }

    /// Check if this error can never be fixed by trying again
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HramError::UnmetRequirement(_) | HramError::InvalidConfig(_)
        )
    }

    /// Check if this is a protocol error (bad data from device)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            HramError::MalformedPayload { .. } | HramError::CharacteristicNotFound(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            HramError::ScanTimeout { .. } => "SCAN_TIMEOUT",
            HramError::DeviceNotConnected(_) => "DEVICE_NOT_CONNECTED",
            HramError::NotConnected(_) => "NOT_CONNECTED",
            HramError::DisconnectRequested => "DISCONNECT_REQUESTED",
            HramError::UnmetRequirement(_) => "UNMET_REQUIREMENT",
            HramError::MalformedPayload { .. } => "MALFORMED_PAYLOAD",
            HramError::CharacteristicNotFound(_) => "CHARACTERISTIC_NOT_FOUND",
            HramError::Transport(_) => "TRANSPORT_ERROR",
            HramError::InvalidConfig(_) => "INVALID_CONFIG",
            HramError::ChannelClosed => "CHANNEL_CLOSED",
            HramError::Io(_) => "IO_ERROR",
            HramError::Json(_) => "JSON_ERROR",
        }
    }

    pub(crate) fn malformed(characteristic: &'static str, reason: impl Into<String>) -> Self {
        HramError::MalformedPayload {
            characteristic,
            reason: reason.into(),
        }
    }
}

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, HramError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for HramError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        HramError::ChannelClosed
    }
}

// Conversion from btleplug errors (only when the platform feature is enabled)
#[cfg(feature = "platform")]
impl From<btleplug::Error> for HramError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => {
                HramError::UnmetRequirement("bluetooth permission denied".to_string())
            }
            btleplug::Error::NotConnected => HramError::NotConnected("link closed".to_string()),
            btleplug::Error::DeviceNotFound => {
                HramError::NotConnected("device not found".to_string())
            }
            btleplug::Error::TimedOut(duration) => {
                HramError::NotConnected(format!("timed out after {:?}", duration))
            }
            btleplug::Error::NotSupported(what) => HramError::UnmetRequirement(what),
            other => HramError::Transport(other.to_string()),
        }
    }
}
