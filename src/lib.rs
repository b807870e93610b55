//! # Fuse Monitor Library
//!
//! Sample 64 fuse voltages through four 16-channel multiplexers and an ADS1115.
//!
//! Each sweep reads every fuse once, is appended to a size-rotated CSV file
//! and forwarded to a telemetry server with a bounded retry buffer.

pub mod config;
pub mod error;
pub mod hardware;
pub mod monitor;
pub mod mux;
pub mod sampling;
pub mod storage;
pub mod telemetry;
