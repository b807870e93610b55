//! # Telemetry Module
//!
//! Forwards each sweep to a remote server over HTTP.
//!
//! This module handles:
//! - Building the JSON payload (readings + host info)
//! - Posting it with a bounded timeout
//! - Buffering undelivered sweeps and replaying them in order
//! - Evicting the oldest sweeps under sustained network failure

pub mod payload;
pub mod sender;
pub mod transport;

pub use payload::{MemoryUsage, SystemInfo, TelemetryPayload};
pub use sender::{SenderOptions, TelemetrySender, TelemetryStatus};
pub use transport::{HttpTransport, TelemetryTransport};
