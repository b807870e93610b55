//! # Sampling Scheduler
//!
//! Sweeps all 64 fuses in ascending order, one at a time:
//!
//! ```text
//! for fuse in 1..=64:
//!     select(fuse) -> settle -> read ADC
//! ```
//!
//! A failed read is logged, recorded as 0.0 and the sweep moves on. A stop
//! request is checked between fuses only, so a selection is never abandoned
//! half way. An interrupted sweep yields no frame and leaves every mux disabled.
//!
//! After a sweep the remaining part of the cycle period is waited out. An
//! overrun is logged and the next sweep starts immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::frame::Frame;
use crate::error::{HardwareError, Result};
use crate::hardware::AdcReader;
use crate::mux::{ChannelSelector, FuseAddress};

/// Delays governing a sweep
#[derive(Debug, Clone, Copy)]
pub struct SamplingTiming {
    /// Wait between selecting a fuse and reading the ADC
    pub read_settle: Duration,
    /// Target time from the start of one sweep to the start of the next
    pub cycle_period: Duration,
}

impl Default for SamplingTiming {
    fn default() -> Self {
        Self {
            read_settle: Duration::from_millis(5),
            cycle_period: Duration::from_secs(5),
        }
    }
}

/// Sweep counters, as reported in status
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SamplingStatus {
    pub sweeps_completed: u64,
    pub sweeps_cancelled: u64,
    pub overruns: u64,
    pub read_failures_total: u64,
    pub last_sweep_failed_reads: u64,
    pub last_sweep_ms: u64,
    pub cycle_period_ms: u64,
    pub adc_channel: u8,
}

/// Produces one [`Frame`] per sweep
pub struct SamplingScheduler {
    selector: Arc<ChannelSelector>,
    adc: Arc<dyn AdcReader>,
    adc_channel: u8,
    timing: SamplingTiming,
    next_sequence: AtomicU64,
    sweeps_completed: AtomicU64,
    sweeps_cancelled: AtomicU64,
    overruns: AtomicU64,
    read_failures: AtomicU64,
    last_failed_reads: AtomicU64,
    last_sweep_ms: AtomicU64,
}

impl SamplingScheduler {
    pub fn new(
        selector: Arc<ChannelSelector>,
        adc: Arc<dyn AdcReader>,
        adc_channel: u8,
        timing: SamplingTiming,
    ) -> Self {
        Self {
            selector,
            adc,
            adc_channel,
            timing,
            next_sequence: AtomicU64::new(1),
            sweeps_completed: AtomicU64::new(0),
            sweeps_cancelled: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            last_failed_reads: AtomicU64::new(0),
            last_sweep_ms: AtomicU64::new(0),
        }
    }

    /// Select and read a single fuse
    ///
    /// # Errors
    ///
    /// Returns error if `fuse_id` is out of range, selection fails, or the ADC read fails
    pub async fn sample_fuse(&self, fuse_id: u8) -> Result<f64> {
        let address = FuseAddress::translate(fuse_id)?;
        Ok(self.sample(address).await?)
    }

    async fn sample(&self, address: FuseAddress) -> std::result::Result<f64, HardwareError> {
        if let Err(e) = self.selector.select(address).await {
            // Leave the shared line undriven rather than half-selected
            if let Err(disable_err) = self.selector.disable_all().await {
                error!("Failed to disable muxes after selection error: {}", disable_err);
            }
            return Err(e);
        }

        tokio::time::sleep(self.timing.read_settle).await;
        self.adc.read_voltage(self.adc_channel).await
    }

    /// Run one full sweep
    ///
    /// Returns `None` if a stop was requested before the sweep finished.
    pub async fn run_frame(&self, stop: &watch::Receiver<bool>) -> Option<Frame> {
        let started = Instant::now();
        let mut frame = Frame::new(0, Local::now());

        for address in FuseAddress::all() {
            if *stop.borrow() {
                self.sweeps_cancelled.fetch_add(1, Ordering::Relaxed);
                info!("Sweep cancelled before {}, discarding partial data", address);
                if let Err(e) = self.selector.disable_all().await {
                    error!("Failed to disable muxes after cancelled sweep: {}", e);
                }
                return None;
            }

            match self.sample(address).await {
                Ok(volts) => frame.record(address.fuse_id(), volts),
                Err(e) => {
                    error!("Failed to read fuse {}: {}", address.fuse_id(), e);
                    frame.record_failure(address.fuse_id());
                }
            }
        }

        frame.set_sequence(self.next_sequence.fetch_add(1, Ordering::Relaxed));

        let failed = u64::from(frame.failed_count());
        let elapsed = started.elapsed();
        self.sweeps_completed.fetch_add(1, Ordering::Relaxed);
        self.read_failures.fetch_add(failed, Ordering::Relaxed);
        self.last_failed_reads.store(failed, Ordering::Relaxed);
        self.last_sweep_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);

        debug!(
            "Sweep {} completed in {:.2}s ({} failed reads)",
            frame.sequence(),
            elapsed.as_secs_f64(),
            failed
        );
        Some(frame)
    }

    /// Wait out the rest of the cycle period
    ///
    /// `elapsed` is the time since the current cycle started. Returns `false`
    /// if a stop was requested while waiting.
    pub async fn wait_for_next_cycle(
        &self,
        elapsed: Duration,
        stop: &mut watch::Receiver<bool>,
    ) -> bool {
        let period = self.timing.cycle_period;

        if elapsed >= period {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Data collection took longer than interval ({:.2}s > {:.2}s)",
                elapsed.as_secs_f64(),
                period.as_secs_f64()
            );
            return !*stop.borrow();
        }

        tokio::select! {
            _ = tokio::time::sleep(period - elapsed) => true,
            _ = stop_requested(stop) => false,
        }
    }

    /// Sweep counters
    pub fn status(&self) -> SamplingStatus {
        SamplingStatus {
            sweeps_completed: self.sweeps_completed.load(Ordering::Relaxed),
            sweeps_cancelled: self.sweeps_cancelled.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            read_failures_total: self.read_failures.load(Ordering::Relaxed),
            last_sweep_failed_reads: self.last_failed_reads.load(Ordering::Relaxed),
            last_sweep_ms: self.last_sweep_ms.load(Ordering::Relaxed),
            cycle_period_ms: self.timing.cycle_period.as_millis() as u64,
            adc_channel: self.adc_channel,
        }
    }

    /// Selector shared with this scheduler
    pub fn selector(&self) -> &Arc<ChannelSelector> {
        &self.selector
    }
}

/// Resolve once the stop flag is set or its sender is gone
pub async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}
