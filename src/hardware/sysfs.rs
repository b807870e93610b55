//! # Sysfs GPIO Backend
//!
//! Drives output lines through the Linux sysfs GPIO interface
//! (`/sys/class/gpio`). Each configured pin is exported and switched to
//! output mode when the backend is opened.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{DigitalOutput, PinLevel};
use crate::error::HardwareError;

/// Default sysfs GPIO root
pub const DEFAULT_GPIO_BASE: &str = "/sys/class/gpio";

/// GPIO output lines backed by sysfs
#[derive(Debug)]
pub struct SysfsGpio {
    base: PathBuf,
    pins: Vec<u8>,
}

impl SysfsGpio {
    /// Export `pins` under `base` and configure them as outputs
    ///
    /// # Errors
    ///
    /// Returns error if a pin cannot be exported or its direction cannot be set
    pub async fn open<P: AsRef<Path>>(base: P, pins: &[u8]) -> Result<Self, HardwareError> {
        let gpio = Self {
            base: base.as_ref().to_path_buf(),
            pins: pins.to_vec(),
        };

        for &pin in pins {
            gpio.export(pin).await?;
            let direction = gpio.pin_dir(pin).join("direction");
            write_attr(&direction, "out").await?;
            debug!("Configured GPIO{} as output", pin);
        }

        info!(
            "Sysfs GPIO ready at {} ({} pins)",
            gpio.base.display(),
            gpio.pins.len()
        );
        Ok(gpio)
    }

    /// Pins this backend may drive
    pub fn pins(&self) -> &[u8] {
        &self.pins
    }

    fn pin_dir(&self, pin: u8) -> PathBuf {
        self.base.join(format!("gpio{}", pin))
    }

    async fn export(&self, pin: u8) -> Result<(), HardwareError> {
        if tokio::fs::metadata(self.pin_dir(pin)).await.is_ok() {
            return Ok(());
        }
        write_attr(&self.base.join("export"), &pin.to_string()).await
    }
}

async fn write_attr(path: &Path, value: &str) -> Result<(), HardwareError> {
    tokio::fs::write(path, value)
        .await
        .map_err(|e| HardwareError::io(path.display().to_string(), e))
}

#[async_trait]
impl DigitalOutput for SysfsGpio {
    async fn set_output(&self, pin: u8, level: PinLevel) -> Result<(), HardwareError> {
        if !self.pins.contains(&pin) {
            return Err(HardwareError::InvalidPin(pin));
        }

        let value = match level {
            PinLevel::Low => "0",
            PinLevel::High => "1",
        };
        write_attr(&self.pin_dir(pin).join("value"), value).await
    }
}
