//! # Fuse Address Translation
//!
//! Maps a fuse id (1-64) onto the multiplexer that carries it and the
//! channel within that multiplexer.
//!
//! ```text
//! mux_index   = (fuse_id - 1) / 16
//! mux_channel = (fuse_id - 1) % 16
//! ```
//!
//! | Fuses | Mux | Channels |
//! |-------|-----|----------|
//! | 1-16  | 0   | 0-15     |
//! | 17-32 | 1   | 0-15     |
//! | 33-48 | 2   | 0-15     |
//! | 49-64 | 3   | 0-15     |
//!
//! The table is generated at compile time and never changes.

use serde::Serialize;

use crate::error::{FuseMonitorError, Result};

/// Total number of monitored fuses
pub const TOTAL_FUSES: u8 = 64;

/// Number of CD74HC4067 multiplexers on the board
pub const MUX_COUNT: u8 = 4;

/// Inputs per multiplexer
pub const CHANNELS_PER_MUX: u8 = 16;

/// Hardware coordinates of a single fuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FuseAddress {
    fuse_id: u8,
    mux_index: u8,
    mux_channel: u8,
}

/// Precomputed address for every fuse, indexed by `fuse_id - 1`
const ADDRESS_TABLE: [FuseAddress; TOTAL_FUSES as usize] = generate_address_table();

/// Generate the fuse address table at compile time
const fn generate_address_table() -> [FuseAddress; TOTAL_FUSES as usize] {
    let mut table = [FuseAddress {
        fuse_id: 0,
        mux_index: 0,
        mux_channel: 0,
    }; TOTAL_FUSES as usize];
    let mut i = 0;

    while i < TOTAL_FUSES as usize {
        table[i] = FuseAddress {
            fuse_id: i as u8 + 1,
            mux_index: i as u8 / CHANNELS_PER_MUX,
            mux_channel: i as u8 % CHANNELS_PER_MUX,
        };
        i += 1;
    }

    table
}

impl FuseAddress {
    /// Translate a fuse id into its mux coordinates
    ///
    /// # Errors
    ///
    /// Returns [`FuseMonitorError::InvalidAddress`] if `fuse_id` is not in 1..=64
    ///
    /// # Examples
    ///
    /// ```
    /// use fuse_monitor::mux::address::FuseAddress;
    ///
    /// let address = FuseAddress::translate(37)?;
    /// assert_eq!(address.mux_index(), 2);
    /// assert_eq!(address.mux_channel(), 4);
    /// # Ok::<(), fuse_monitor::error::FuseMonitorError>(())
    /// ```
    pub fn translate(fuse_id: u8) -> Result<Self> {
        if !(1..=TOTAL_FUSES).contains(&fuse_id) {
            return Err(FuseMonitorError::InvalidAddress(format!(
                "fuse id {} out of range (must be 1-{})",
                fuse_id, TOTAL_FUSES
            )));
        }
        Ok(ADDRESS_TABLE[(fuse_id - 1) as usize])
    }

    /// Inverse of [`FuseAddress::translate`]
    ///
    /// # Errors
    ///
    /// Returns [`FuseMonitorError::InvalidAddress`] if either coordinate is out of range
    pub fn from_coordinates(mux_index: u8, mux_channel: u8) -> Result<Self> {
        if mux_index >= MUX_COUNT || mux_channel >= CHANNELS_PER_MUX {
            return Err(FuseMonitorError::InvalidAddress(format!(
                "mux {} channel {} out of range (mux 0-{}, channel 0-{})",
                mux_index,
                mux_channel,
                MUX_COUNT - 1,
                CHANNELS_PER_MUX - 1
            )));
        }
        Ok(ADDRESS_TABLE[(mux_index * CHANNELS_PER_MUX + mux_channel) as usize])
    }

    /// All 64 addresses in ascending fuse id order
    pub fn all() -> impl Iterator<Item = FuseAddress> {
        ADDRESS_TABLE.iter().copied()
    }

    /// First fuse wired to each multiplexer (1, 17, 33, 49)
    pub fn first_of_each_mux() -> impl Iterator<Item = FuseAddress> {
        ADDRESS_TABLE
            .iter()
            .copied()
            .filter(|address| address.mux_channel == 0)
    }

    /// Fuse id (1-64)
    #[must_use]
    pub fn fuse_id(&self) -> u8 {
        self.fuse_id
    }

    /// Multiplexer index (0-3)
    #[must_use]
    pub fn mux_index(&self) -> u8 {
        self.mux_index
    }

    /// Channel within the multiplexer (0-15)
    #[must_use]
    pub fn mux_channel(&self) -> u8 {
        self.mux_channel
    }
}

impl std::fmt::Display for FuseAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "fuse {} (mux {}, channel {})",
            self.fuse_id, self.mux_index, self.mux_channel
        )
    }
}
