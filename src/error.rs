//! # Error Types
//!
//! Custom error types for Fuse Monitor using `thiserror`.
//!
//! Faults are split by who can recover from them:
//! - [`HardwareError`]: a single GPIO/ADC access failed. The sampling loop
//!   absorbs these and substitutes a placeholder reading.
//! - [`TransportError`]: a telemetry push failed. Never leaves the sender.
//! - [`FuseMonitorError`]: everything surfaced to callers, including the
//!   configuration and initialization faults that stop the process.

use thiserror::Error;

/// Main error type for Fuse Monitor
#[derive(Debug, Error)]
pub enum FuseMonitorError {
    /// Fuse id outside 1..=64 or mux coordinates out of range
    #[error("Invalid fuse address: {0}")]
    InvalidAddress(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Hardware capability errors
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    /// CSV encoding errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Self-test did not pass, monitoring refused
    #[error("Self-test failed: {0}")]
    SelfTestFailed(String),
}

/// Errors raised by the digital-output and ADC capabilities
#[derive(Debug, Error)]
pub enum HardwareError {
    /// Pin is not one of the configured multiplexer lines
    #[error("Invalid GPIO pin {0}")]
    InvalidPin(u8),

    /// ADC channel outside 0..=3
    #[error("Invalid ADC channel {0} (must be 0-3)")]
    InvalidChannel(u8),

    /// Device has not been initialized or was shut down
    #[error("Device not initialized: {0}")]
    NotInitialized(String),

    /// Device did not respond
    #[error("Device disconnected: {0}")]
    Disconnected(String),

    /// Unparseable value read back from the device
    #[error("Invalid device reading: {0}")]
    InvalidReading(String),

    /// Underlying sysfs/IIO file access failed
    #[error("Device I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl HardwareError {
    /// Wrap an I/O error with the device path it happened on
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by a telemetry transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Request did not complete within the send timeout
    #[error("Request timed out")]
    Timeout,

    /// Connection could not be established or was dropped
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Server answered with a non-success status code
    #[error("Server returned status {0}")]
    Status(u16),

    /// Payload could not be encoded
    #[error("Failed to encode payload: {0}")]
    Encode(String),
}

/// Result type alias for Fuse Monitor
pub type Result<T> = std::result::Result<T, FuseMonitorError>;
