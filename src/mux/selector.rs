//! # Channel Selector
//!
//! Drives the CD74HC4067 select lines (S0-S3, shared by all four muxes) and
//! the per-mux enable lines (active low) so exactly one fuse reaches the
//! shared analog output.
//!
//! ## Selection sequence
//!
//! 1. Drive every enable line high (all muxes off)
//! 2. Put the channel number on S0-S3, wait for the select lines to settle
//! 3. Drive the target mux's enable line low, wait for the output to settle
//!
//! Step 1 always completes before step 3, so two muxes never drive the shared
//! line at once. All sequences run under one lock because the lines are
//! shared physical state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::address::FuseAddress;
use crate::error::HardwareError;
use crate::hardware::{DigitalOutput, PinLevel};

/// Marker for "no mux enabled" / "no channel selected"
const NONE: u8 = u8::MAX;

/// Level that enables a mux (CD74HC4067 /E is active low)
const ENABLED: PinLevel = PinLevel::Low;

/// Level that disables a mux
const DISABLED: PinLevel = PinLevel::High;

/// Delay between line transitions in the GPIO self-test
const LINE_TEST_DELAY: Duration = Duration::from_millis(1);

/// BCM pin numbers of the mux control lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MuxPins {
    /// S0, S1, S2, S3 (least significant bit first)
    pub select: [u8; 4],
    /// Enable line of mux 0, 1, 2, 3
    pub enable: [u8; 4],
}

impl Default for MuxPins {
    fn default() -> Self {
        Self {
            select: [27, 17, 24, 23],
            enable: [7, 8, 6, 13],
        }
    }
}

impl MuxPins {
    /// Whether `pin` is one of the eight control lines
    #[must_use]
    pub fn contains(&self, pin: u8) -> bool {
        self.select.contains(&pin) || self.enable.contains(&pin)
    }

    /// All eight control lines, select lines first
    pub fn all(&self) -> impl Iterator<Item = u8> + '_ {
        self.select.iter().chain(self.enable.iter()).copied()
    }
}

/// Settle delays applied during selection
#[derive(Debug, Clone, Copy)]
pub struct SelectorTiming {
    /// Wait after changing S0-S3
    pub channel_settle: Duration,
    /// Wait after enabling a mux
    pub enable_settle: Duration,
}

impl Default for SelectorTiming {
    fn default() -> Self {
        Self {
            channel_settle: Duration::from_millis(1),
            enable_settle: Duration::from_millis(2),
        }
    }
}

/// Current mux routing, as reported in status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MuxStatus {
    pub current_mux: Option<u8>,
    pub current_channel: Option<u8>,
}

/// Serializes all access to the multiplexer control lines
pub struct ChannelSelector {
    gpio: Arc<dyn DigitalOutput>,
    pins: MuxPins,
    timing: SelectorTiming,
    lines: Mutex<()>,
    current_mux: AtomicU8,
    current_channel: AtomicU8,
}

impl std::fmt::Debug for ChannelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSelector")
            .field("pins", &self.pins)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ChannelSelector {
    pub fn new(gpio: Arc<dyn DigitalOutput>, pins: MuxPins, timing: SelectorTiming) -> Self {
        Self {
            gpio,
            pins,
            timing,
            lines: Mutex::new(()),
            current_mux: AtomicU8::new(NONE),
            current_channel: AtomicU8::new(NONE),
        }
    }

    /// Put every line in its idle state: select lines low, all muxes disabled
    ///
    /// # Errors
    ///
    /// Returns the first line that could not be driven
    pub async fn initialize(&self) -> Result<(), HardwareError> {
        let _guard = self.lines.lock().await;

        self.disable_all_locked().await?;
        for &pin in &self.pins.select {
            self.gpio.set_output(pin, PinLevel::Low).await?;
        }
        self.current_channel.store(0, Ordering::Relaxed);

        info!(
            "Mux control lines ready (select {:?}, enable {:?})",
            self.pins.select, self.pins.enable
        );
        Ok(())
    }

    /// Route `address` to the shared analog output
    ///
    /// # Errors
    ///
    /// Returns error if any control line cannot be driven. If the failure
    /// happens after the disable step the selector is left with every mux
    /// disabled or with only the target mux enabled.
    pub async fn select(&self, address: FuseAddress) -> Result<(), HardwareError> {
        let _guard = self.lines.lock().await;

        self.disable_all_locked().await?;

        let channel = address.mux_channel();
        for (bit, &pin) in self.pins.select.iter().enumerate() {
            self.gpio
                .set_output(pin, PinLevel::from_bit(channel, bit as u8))
                .await?;
        }
        self.current_channel.store(channel, Ordering::Relaxed);
        tokio::time::sleep(self.timing.channel_settle).await;

        let mux = address.mux_index();
        self.gpio
            .set_output(self.pins.enable[mux as usize], ENABLED)
            .await?;
        self.current_mux.store(mux, Ordering::Relaxed);
        tokio::time::sleep(self.timing.enable_settle).await;

        debug!("Selected {}", address);
        Ok(())
    }

    /// Disable every mux
    ///
    /// Drives all enable lines even if one of them fails and reports the
    /// first failure.
    ///
    /// # Errors
    ///
    /// Returns the first enable line that could not be driven
    pub async fn disable_all(&self) -> Result<(), HardwareError> {
        let _guard = self.lines.lock().await;
        self.disable_all_locked().await
    }

    async fn disable_all_locked(&self) -> Result<(), HardwareError> {
        let mut first_error = None;

        for &pin in &self.pins.enable {
            if let Err(e) = self.gpio.set_output(pin, DISABLED).await {
                error!("Failed to disable mux enable line GPIO{}: {}", pin, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                self.current_mux.store(NONE, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Toggle every control line once and report which ones accepted writes
    ///
    /// Select lines pulse high then low; enable lines pulse low (enabled)
    /// then high. Only one enable line is ever pulsed at a time. All muxes
    /// are disabled afterwards.
    pub async fn test_lines(&self) -> BTreeMap<String, bool> {
        let _guard = self.lines.lock().await;
        let mut results = BTreeMap::new();

        // Enable pulses below must not overlap with a mux left on
        let disabled = self.disable_all_locked().await.is_ok();

        for (bit, &pin) in self.pins.select.iter().enumerate() {
            let ok = self.pulse(pin, PinLevel::High, PinLevel::Low).await;
            results.insert(format!("select_s{}", bit), ok);
        }

        for (mux, &pin) in self.pins.enable.iter().enumerate() {
            let ok = disabled && self.pulse(pin, ENABLED, DISABLED).await;
            results.insert(format!("enable_mux{}", mux), ok);
        }

        if let Err(e) = self.disable_all_locked().await {
            error!("Failed to restore mux lines after GPIO test: {}", e);
        }
        self.current_channel.store(0, Ordering::Relaxed);

        results
    }

    async fn pulse(&self, pin: u8, first: PinLevel, second: PinLevel) -> bool {
        let result = async {
            self.gpio.set_output(pin, first).await?;
            tokio::time::sleep(LINE_TEST_DELAY).await;
            self.gpio.set_output(pin, second).await
        }
        .await;

        if let Err(e) = &result {
            error!("GPIO{} test failed: {}", pin, e);
        }
        result.is_ok()
    }

    /// Current routing
    pub fn status(&self) -> MuxStatus {
        MuxStatus {
            current_mux: decode(self.current_mux.load(Ordering::Relaxed)),
            current_channel: decode(self.current_channel.load(Ordering::Relaxed)),
        }
    }

    /// Configured control lines
    pub fn pins(&self) -> &MuxPins {
        &self.pins
    }
}

fn decode(value: u8) -> Option<u8> {
    (value != NONE).then_some(value)
}
