//! # Hardware Module
//!
//! Capability traits for the two pieces of hardware the monitor touches:
//! digital output lines driving the multiplexers, and the ADS1115 ADC that
//! converts the shared analog line.
//!
//! The board is singular, so each capability is constructed once in `main`
//! and shared as an `Arc` between the components that need it.
//!
//! Backends:
//! - [`sysfs::SysfsGpio`]: Linux sysfs GPIO
//! - [`iio::IioAdc`]: ADS1115 through the kernel IIO driver
//! - [`simulated::SimulatedBoard`]: in-process model of the mux board

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HardwareError;

pub mod iio;
pub mod simulated;
pub mod sysfs;

/// Number of single-ended ADC inputs on the ADS1115
pub const ADC_CHANNEL_COUNT: u8 = 4;

/// Output level of a digital line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PinLevel {
    Low,
    High,
}

impl PinLevel {
    /// Level for bit `bit` of `value`
    #[must_use]
    pub fn from_bit(value: u8, bit: u8) -> Self {
        if (value >> bit) & 0x01 == 1 {
            PinLevel::High
        } else {
            PinLevel::Low
        }
    }
}

/// ADS1115 programmable gain, named by its full-scale range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gain {
    #[serde(rename = "6.144V")]
    V6_144,
    #[serde(rename = "4.096V")]
    V4_096,
    #[serde(rename = "2.048V")]
    V2_048,
    #[serde(rename = "1.024V")]
    V1_024,
    #[serde(rename = "0.512V")]
    V0_512,
    #[serde(rename = "0.256V")]
    V0_256,
}

impl Gain {
    /// Every gain setting, widest range first
    pub const ALL: [Gain; 6] = [
        Gain::V6_144,
        Gain::V4_096,
        Gain::V2_048,
        Gain::V1_024,
        Gain::V0_512,
        Gain::V0_256,
    ];

    /// Full-scale range in volts
    #[must_use]
    pub fn full_scale_volts(&self) -> f64 {
        match self {
            Gain::V6_144 => 6.144,
            Gain::V4_096 => 4.096,
            Gain::V2_048 => 2.048,
            Gain::V1_024 => 1.024,
            Gain::V0_512 => 0.512,
            Gain::V0_256 => 0.256,
        }
    }

    /// Millivolts per LSB of a 16-bit signed conversion
    #[must_use]
    pub fn millivolts_per_lsb(&self) -> f64 {
        self.full_scale_volts() * 1000.0 / 32768.0
    }

    /// Name used in configuration and status, e.g. `"6.144V"`
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Gain::V6_144 => "6.144V",
            Gain::V4_096 => "4.096V",
            Gain::V2_048 => "2.048V",
            Gain::V1_024 => "1.024V",
            Gain::V0_512 => "0.512V",
            Gain::V0_256 => "0.256V",
        }
    }
}

impl std::fmt::Display for Gain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Digital output lines (mux select S0-S3 and the four enable lines)
#[async_trait]
pub trait DigitalOutput: Send + Sync {
    /// Drive `pin` to `level`
    async fn set_output(&self, pin: u8, level: PinLevel) -> Result<(), HardwareError>;
}

/// Single-ended voltage reads from the ADC
#[async_trait]
pub trait AdcReader: Send + Sync {
    /// Read the voltage on `channel` (0-3) in volts
    async fn read_voltage(&self, channel: u8) -> Result<f64, HardwareError>;

    /// Read the signed conversion result of `channel` at the current gain
    async fn read_raw(&self, channel: u8) -> Result<i32, HardwareError>;

    /// Change the programmable gain
    async fn set_gain(&self, gain: Gain) -> Result<(), HardwareError>;

    /// Confirm the device answers
    async fn check_connection(&self) -> Result<(), HardwareError>;
}

/// Reject ADC channels the ADS1115 does not have
pub(crate) fn validate_adc_channel(channel: u8) -> Result<(), HardwareError> {
    if channel >= ADC_CHANNEL_COUNT {
        return Err(HardwareError::InvalidChannel(channel));
    }
    Ok(())
}
