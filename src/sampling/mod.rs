//! # Sampling Module
//!
//! Round-robin sweeps over all 64 fuses.
//!
//! This module handles:
//! - Building a [`Frame`] per sweep
//! - Absorbing single-read hardware faults
//! - Holding the sweep cadence and reporting overruns
//! - Honoring stop requests between fuses

pub mod frame;
pub mod scheduler;

pub use frame::Frame;
pub use scheduler::{SamplingScheduler, SamplingStatus, SamplingTiming};
