//! # Multiplexer Module
//!
//! Addressing and selection for the four 16-channel multiplexers.
//!
//! This module handles:
//! - Translating fuse ids (1-64) to mux index and channel
//! - Driving the shared select lines and per-mux enable lines
//! - Guaranteeing only one mux drives the shared analog line

pub mod address;
pub mod selector;

pub use address::{FuseAddress, CHANNELS_PER_MUX, MUX_COUNT, TOTAL_FUSES};
pub use selector::{ChannelSelector, MuxPins, MuxStatus, SelectorTiming};
