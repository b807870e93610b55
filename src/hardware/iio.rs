//! # IIO ADC Backend
//!
//! Reads the ADS1115 through the kernel `ti-ads1015` IIO driver. The driver
//! exposes one directory per device with, for each input:
//!
//! - `in_voltageN_raw`: signed conversion result
//! - `in_voltageN_scale`: millivolts per LSB, writable to change gain
//!
//! Voltage in volts is `raw * scale / 1000`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{validate_adc_channel, AdcReader, Gain, ADC_CHANNEL_COUNT};
use crate::error::HardwareError;

/// Default IIO device directory for the first ADC
pub const DEFAULT_IIO_DEVICE: &str = "/sys/bus/iio/devices/iio:device0";

/// ADS1115 accessed through IIO sysfs attributes
#[derive(Debug)]
pub struct IioAdc {
    device: PathBuf,
    /// Index into [`Gain::ALL`]
    gain: AtomicU8,
}

impl IioAdc {
    /// Open the IIO device directory
    ///
    /// # Errors
    ///
    /// Returns error if the device directory or its `name` attribute is missing
    pub async fn open<P: AsRef<Path>>(device: P) -> Result<Self, HardwareError> {
        let device = device.as_ref().to_path_buf();
        let name_path = device.join("name");
        let name = tokio::fs::read_to_string(&name_path)
            .await
            .map_err(|e| HardwareError::io(name_path.display().to_string(), e))?;

        info!("Opened IIO ADC {} at {}", name.trim(), device.display());

        Ok(Self {
            device,
            gain: AtomicU8::new(gain_index(Gain::V4_096)),
        })
    }

    /// Currently configured gain
    pub fn gain(&self) -> Gain {
        Gain::ALL[self.gain.load(Ordering::Relaxed) as usize]
    }

    fn attr(&self, name: String) -> PathBuf {
        self.device.join(name)
    }
}

fn gain_index(gain: Gain) -> u8 {
    Gain::ALL.iter().position(|g| *g == gain).unwrap_or(0) as u8
}

/// Convert a raw conversion result to volts at `gain`
#[must_use]
pub fn raw_to_volts(raw: i32, gain: Gain) -> f64 {
    f64::from(raw) * gain.millivolts_per_lsb() / 1000.0
}

#[async_trait]
impl AdcReader for IioAdc {
    async fn read_voltage(&self, channel: u8) -> Result<f64, HardwareError> {
        let raw = self.read_raw(channel).await?;
        let voltage = raw_to_volts(raw, self.gain());
        debug!("Read channel {}: {:.4}V (raw {})", channel, voltage, raw);
        Ok(voltage)
    }

    async fn read_raw(&self, channel: u8) -> Result<i32, HardwareError> {
        validate_adc_channel(channel)?;
        let path = self.attr(format!("in_voltage{}_raw", channel));
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| HardwareError::io(path.display().to_string(), e))?;

        text.trim().parse::<i32>().map_err(|e| {
            HardwareError::InvalidReading(format!("{}: {:?} ({})", path.display(), text.trim(), e))
        })
    }

    async fn set_gain(&self, gain: Gain) -> Result<(), HardwareError> {
        let scale = format!("{:.9}", gain.millivolts_per_lsb());
        for channel in 0..ADC_CHANNEL_COUNT {
            let path = self.attr(format!("in_voltage{}_scale", channel));
            tokio::fs::write(&path, &scale)
                .await
                .map_err(|e| HardwareError::io(path.display().to_string(), e))?;
        }

        self.gain.store(gain_index(gain), Ordering::Relaxed);
        info!("ADC gain set to {}", gain);
        Ok(())
    }

    async fn check_connection(&self) -> Result<(), HardwareError> {
        self.read_raw(0)
            .await
            .map(|_| ())
            .map_err(|e| HardwareError::Disconnected(e.to_string()))
    }
}
