//! Error handling for the device session core
//!
//! Every fallible operation in this crate returns [`Result`], an alias over
//! [`ProtocolError`]. Errors from the standard library and `serde_json`
//! convert automatically through `From`, so `?` works everywhere.
//!
//! ## Error Categories
//!
//! ### Precondition errors
//! Returned by [`Device::send_packet`](crate::Device::send_packet) when the
//! device cannot accept the packet right now:
//! - `NotConnected`: no channel is attached
//! - `PermissionDenied`: a channel is attached but the device is unpaired
//!
//! ### Transport errors
//! Channel I/O failures (`Io`, `Transport`, `Timeout`) and `Cancelled`, which
//! is what a pending read or write yields once its channel is closed.
//!
//! ### Certificate errors
//! `Tls`, `Certificate` and `CertificateValidation` come from the encrypted
//! channel: handshake failures, OpenSSL errors while generating or loading
//! the device certificate, and peers presenting the wrong certificate.
//!
//! ### Packet errors
//! `InvalidPacket` and `PacketSizeExceeded` describe malformed input. They are
//! logged and the packet is dropped; they never tear down a device.
//!
//! ### Manager errors
//! `InvalidDeviceId`, `DeviceNotFound`, `ActionNotFound` and
//! `ResourceExhausted` come from device bookkeeping.
//!
//! ## Logging Errors
//!
//! ```rust,ignore
//! use tracing::{debug, warn};
//!
//! match device.send_packet(&packet).await {
//!     Ok(()) => {}
//!     Err(e) if e.is_cancelled() => debug!("Send cancelled: {}", e),
//!     Err(e) => warn!("Failed to send packet: {}", e),
//! }
//! ```

use thiserror::Error;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during session operations
///
/// # Examples
///
/// ```rust
/// use kdeconnect_session::ProtocolError;
///
/// let error = ProtocolError::NotConnected("Pixel".to_string());
/// assert_eq!(error.to_string(), "Not connected: Pixel");
///
/// let error = ProtocolError::InvalidPacket("missing type field".to_string());
/// assert_eq!(error.to_string(), "Invalid packet: missing type field");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No channel is attached to the device
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// The device is connected but not paired
    ///
    /// Holds the device name. Only [`Device`](crate::Device) produces this
    /// variant; I/O permission failures stay [`ProtocolError::Io`].
    #[error("Permission denied: {0} is not paired")]
    PermissionDenied(String),

    /// Operation aborted because its channel was closed or the device went away
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Channel I/O failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// TLS handshake or stream error
    ///
    /// Automatically converted from `openssl::ssl::Error`.
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate generation or management error
    ///
    /// Automatically converted from `openssl::error::ErrorStack`.
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// Peer presented a missing or unexpected certificate
    #[error("Certificate validation error: {0}")]
    CertificateValidation(String),

    /// Invalid or malformed packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Packet exceeds the maximum frame length
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),

    /// Device identifier does not match any accepted format
    #[error("Invalid device ID: {0:?}")]
    InvalidDeviceId(String),

    /// Device not known to the manager
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No action with this name is exposed by the device
    #[error("Action not found: {0}")]
    ActionNotFound(String),

    /// Plugin-specific error
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A bounded resource is full
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProtocolError {
    /// Convert an I/O error into a more specific variant
    ///
    /// # Examples
    ///
    /// ```rust
    /// use kdeconnect_session::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "read timeout");
    /// let error = ProtocolError::from_io_error(io_error, "reading identity");
    ///
    /// assert!(matches!(error, ProtocolError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::Transport(format!(
                "{}: connection interrupted ({})",
                context, error
            )),
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is transient and the operation may be retried
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotConnected(_)
                | ProtocolError::Timeout(_)
                | ProtocolError::Transport(_)
                | ProtocolError::Io(_)
        )
    }

    /// Check if this error is a cancellation rather than a failure
    ///
    /// Cancellations are expected during detach and shutdown and should not
    /// be logged as errors.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProtocolError::Cancelled(_))
    }

    /// Get a short message suitable for display to a user
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NotConnected(name) => {
                format!("{} is disconnected.", name)
            }
            ProtocolError::PermissionDenied(name) => {
                format!("Pair {} before sending to it.", name)
            }
            ProtocolError::CertificateValidation(msg) => {
                format!("Certificate validation failed: {}. You may need to re-pair.", msg)
            }
            ProtocolError::Certificate(e) => {
                format!("Certificate error: {}. You may need to re-pair.", e)
            }
            ProtocolError::InvalidDeviceId(id) => {
                format!("Device ID {:?} is not valid.", id)
            }
            ProtocolError::DeviceNotFound(id) => {
                format!("Device '{}' not found.", id)
            }
            ProtocolError::ResourceExhausted(msg) => {
                format!("{}. Remove unused devices and try again.", msg)
            }
            ProtocolError::Timeout(msg) => {
                format!("Timed out: {}. Check the network connection.", msg)
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::NotConnected("Test Phone".to_string());
        assert_eq!(error.to_string(), "Not connected: Test Phone");

        let error = ProtocolError::PermissionDenied("Test Phone".to_string());
        assert_eq!(error.to_string(), "Permission denied: Test Phone is not paired");

        let error = ProtocolError::PacketSizeExceeded(10, 5);
        assert_eq!(error.to_string(), "Packet size exceeded: 10 bytes (max: 5)");

        let error = ProtocolError::InvalidDeviceId(String::new());
        assert_eq!(error.to_string(), "Invalid device ID: \"\"");
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::NotFound, "file not found");
        let protocol_error: ProtocolError = io_error.into();

        assert!(matches!(protocol_error, ProtocolError::Io(_)));
        assert!(protocol_error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_io_error_mapping() {
        use std::io::{Error, ErrorKind};

        let error = ProtocolError::from_io_error(Error::from(ErrorKind::BrokenPipe), "writing");
        assert!(matches!(error, ProtocolError::Transport(_)));
        assert!(error.is_recoverable());

        let error = ProtocolError::from_io_error(Error::from(ErrorKind::UnexpectedEof), "reading");
        assert!(matches!(error, ProtocolError::Transport(_)));

        let error =
            ProtocolError::from_io_error(Error::from(ErrorKind::PermissionDenied), "saving");
        assert!(matches!(error, ProtocolError::Io(_)));
    }

    #[test]
    fn test_permission_denied_user_message_names_device_once() {
        let error = ProtocolError::PermissionDenied("Pixel".to_string());
        let message = error.user_message();

        assert_eq!(message, "Pair Pixel before sending to it.");
        assert_eq!(message.matches("Pixel").count(), 1);
        assert!(!message.contains("not paired is not paired"));
    }

    #[test]
    fn test_cancelled_is_not_recoverable() {
        let error = ProtocolError::Cancelled("channel closed".to_string());
        assert!(error.is_cancelled());
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_json_error_conversion() {
        let json = r#"{"invalid json"#;
        let json_error = serde_json::from_str::<serde_json::Value>(json).unwrap_err();
        let protocol_error: ProtocolError = json_error.into();

        assert!(matches!(protocol_error, ProtocolError::Json(_)));
    }
}
