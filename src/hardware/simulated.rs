//! # Simulated Board
//!
//! In-process model of the four CD74HC4067 multiplexers feeding ADS1115
//! input AIN0. Implements both [`DigitalOutput`] and [`AdcReader`] over one
//! shared state, so the ADC sees whatever fuse the select and enable lines
//! currently route to the shared output.
//!
//! The model also watches the enable lines: any instant where more than one
//! multiplexer is enabled is counted as bus contention.
//!
//! Used by `backend = "simulated"` and by tests, with failure injection for
//! individual fuses, pins, or the whole ADC.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::warn;

use super::{validate_adc_channel, AdcReader, DigitalOutput, Gain, PinLevel};
use crate::error::HardwareError;
use crate::mux::address::{CHANNELS_PER_MUX, TOTAL_FUSES};
use crate::mux::MuxPins;

/// ADC input wired to the shared multiplexer output
pub const SHARED_ADC_CHANNEL: u8 = 0;

/// Voltage of an intact fuse in the default model
pub const DEFAULT_FUSE_VOLTAGE: f64 = 4.95;

#[derive(Debug)]
struct BoardState {
    levels: HashMap<u8, PinLevel>,
    voltages: [f64; TOTAL_FUSES as usize],
    failing_fuses: HashSet<u8>,
    failing_pins: HashSet<u8>,
    adc_connected: bool,
    gain: Gain,
    contention_events: u64,
    max_enabled: usize,
    adc_reads: u64,
}

/// Shared-state model of the multiplexer board
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    pins: MuxPins,
    state: Arc<Mutex<BoardState>>,
}

impl SimulatedBoard {
    /// Board with every fuse intact, all muxes disabled and select lines low
    pub fn new(pins: MuxPins) -> Self {
        let mut levels = HashMap::new();
        for &pin in &pins.select {
            levels.insert(pin, PinLevel::Low);
        }
        for &pin in &pins.enable {
            levels.insert(pin, PinLevel::High);
        }

        Self {
            pins,
            state: Arc::new(Mutex::new(BoardState {
                levels,
                voltages: [DEFAULT_FUSE_VOLTAGE; TOTAL_FUSES as usize],
                failing_fuses: HashSet::new(),
                failing_pins: HashSet::new(),
                adc_connected: true,
                gain: Gain::V4_096,
                contention_events: 0,
                max_enabled: 0,
                adc_reads: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the voltage seen when `fuse_id` is routed to the ADC
    pub fn set_fuse_voltage(&self, fuse_id: u8, volts: f64) {
        if let Some(slot) = self.state().voltages.get_mut(fuse_id.wrapping_sub(1) as usize) {
            *slot = volts;
        }
    }

    /// Make every ADC read of `fuse_id` fail
    pub fn fail_fuse(&self, fuse_id: u8) {
        self.state().failing_fuses.insert(fuse_id);
    }

    /// Make every write to `pin` fail
    pub fn fail_pin(&self, pin: u8) {
        self.state().failing_pins.insert(pin);
    }

    /// Simulate the ADC dropping off the I2C bus
    pub fn disconnect_adc(&self) {
        self.state().adc_connected = false;
    }

    /// Bring the ADC back
    pub fn reconnect_adc(&self) {
        self.state().adc_connected = true;
    }

    /// Number of writes that left more than one mux enabled
    pub fn contention_events(&self) -> u64 {
        self.state().contention_events
    }

    /// Largest number of muxes ever enabled at once
    pub fn max_simultaneous_enabled(&self) -> usize {
        self.state().max_enabled
    }

    /// Currently enabled mux indices
    pub fn enabled_muxes(&self) -> Vec<u8> {
        enabled_muxes(&self.pins, &self.state())
    }

    /// Channel currently encoded on S0-S3
    pub fn selected_channel(&self) -> u8 {
        selected_channel(&self.pins, &self.state())
    }

    /// Current level of `pin`, if it is a board pin
    pub fn pin_level(&self, pin: u8) -> Option<PinLevel> {
        self.state().levels.get(&pin).copied()
    }

    /// Gain last applied through [`AdcReader::set_gain`]
    pub fn gain(&self) -> Gain {
        self.state().gain
    }

    /// Total ADC conversions served
    pub fn adc_reads(&self) -> u64 {
        self.state().adc_reads
    }
}

fn enabled_muxes(pins: &MuxPins, state: &BoardState) -> Vec<u8> {
    pins.enable
        .iter()
        .enumerate()
        .filter(|(_, pin)| state.levels.get(pin) == Some(&PinLevel::Low))
        .map(|(index, _)| index as u8)
        .collect()
}

fn selected_channel(pins: &MuxPins, state: &BoardState) -> u8 {
    pins.select
        .iter()
        .enumerate()
        .filter(|(_, pin)| state.levels.get(pin) == Some(&PinLevel::High))
        .fold(0u8, |acc, (bit, _)| acc | (1 << bit))
}

#[async_trait]
impl DigitalOutput for SimulatedBoard {
    async fn set_output(&self, pin: u8, level: PinLevel) -> Result<(), HardwareError> {
        if !self.pins.contains(pin) {
            return Err(HardwareError::InvalidPin(pin));
        }

        let mut state = self.state();
        if state.failing_pins.contains(&pin) {
            return Err(HardwareError::Disconnected(format!("GPIO{} stuck", pin)));
        }

        state.levels.insert(pin, level);

        let enabled = enabled_muxes(&self.pins, &state).len();
        state.max_enabled = state.max_enabled.max(enabled);
        if enabled > 1 {
            state.contention_events += 1;
            warn!("Simulated bus contention: {} muxes enabled", enabled);
        }
        Ok(())
    }
}

impl SimulatedBoard {
    /// One conversion of `channel` in volts
    fn convert(&self, channel: u8) -> Result<f64, HardwareError> {
        validate_adc_channel(channel)?;

        let mut state = self.state();
        if !state.adc_connected {
            return Err(HardwareError::Disconnected("ADS1115 not responding".into()));
        }
        state.adc_reads += 1;

        if channel != SHARED_ADC_CHANNEL {
            return Ok(0.0);
        }

        let enabled = enabled_muxes(&self.pins, &state);
        let mux = match enabled.as_slice() {
            [] => return Ok(0.0),
            [mux] => *mux,
            _ => {
                return Err(HardwareError::InvalidReading(format!(
                    "bus contention between muxes {:?}",
                    enabled
                )))
            }
        };

        let fuse_id = mux * CHANNELS_PER_MUX + selected_channel(&self.pins, &state) + 1;
        if state.failing_fuses.contains(&fuse_id) {
            return Err(HardwareError::InvalidReading(format!(
                "conversion for fuse {} did not complete",
                fuse_id
            )));
        }

        let full_scale = state.gain.full_scale_volts();
        Ok(state.voltages[(fuse_id - 1) as usize].clamp(-full_scale, full_scale))
    }
}

#[async_trait]
impl AdcReader for SimulatedBoard {
    async fn read_voltage(&self, channel: u8) -> Result<f64, HardwareError> {
        self.convert(channel)
    }

    async fn read_raw(&self, channel: u8) -> Result<i32, HardwareError> {
        let volts = self.convert(channel)?;
        let lsb = self.gain().millivolts_per_lsb() / 1000.0;
        Ok((volts / lsb).round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i32)
    }

    async fn set_gain(&self, gain: Gain) -> Result<(), HardwareError> {
        let mut state = self.state();
        if !state.adc_connected {
            return Err(HardwareError::Disconnected("ADS1115 not responding".into()));
        }
        state.gain = gain;
        Ok(())
    }

    async fn check_connection(&self) -> Result<(), HardwareError> {
        if self.state().adc_connected {
            Ok(())
        } else {
            Err(HardwareError::Disconnected("ADS1115 not responding".into()))
        }
    }
}
