//! # Fuse Monitor
//!
//! Owns the monitoring lifecycle and wires the components together:
//!
//! ```text
//! initialize -> selftest -> start -> ... -> stop -> shutdown
//!
//! sweep loop (task):
//!   run_frame ──> frame ─┬─> csv queue       ──> CsvPersister::append   (task)
//!                        └─> telemetry queue ──> TelemetrySender::send  (task)
//!   wait for next cycle
//! ```
//!
//! Each component drains its own queue, one frame at a time and in sweep
//! order. Handing a frame over never waits, so a slow disk or a hung server
//! cannot stretch the sweep cadence. A queue that falls behind by more than
//! [`DELIVERY_QUEUE_CAPACITY`] frames drops its oldest frame.
//!
//! On stop the CSV queue is written out in full. Telemetry still queued, or
//! interrupted mid-send, is moved to the sender's buffer unsent.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Local;
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{FuseMonitorError, Result};
use crate::hardware::{AdcReader, DigitalOutput, Gain, ADC_CHANNEL_COUNT};
use crate::mux::{ChannelSelector, FuseAddress, MuxStatus, TOTAL_FUSES};
use crate::sampling::frame::TIMESTAMP_FORMAT;
use crate::sampling::scheduler::stop_requested;
use crate::sampling::{Frame, SamplingScheduler, SamplingStatus};
use crate::storage::{fuse_headers, CsvPersister, CsvStatus};
use crate::telemetry::{TelemetrySender, TelemetryStatus, TelemetryTransport};

const SELFTEST_NOT_RUN: u8 = 0;
const SELFTEST_PASSED: u8 = 1;
const SELFTEST_FAILED: u8 = 2;

/// Frames a component may fall behind the sweep loop before the oldest is dropped
pub const DELIVERY_QUEUE_CAPACITY: usize = 100;

/// Result of reading one fuse during the self-test
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FuseCheck {
    pub success: bool,
    pub voltage: Option<f64>,
    pub error: Option<String>,
}

/// One ADC input read during the self-test
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AdcChannelReading {
    pub voltage: Option<f64>,
    pub raw: Option<i32>,
    pub error: Option<String>,
}

/// Outcome of [`FuseMonitor::selftest`]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SelfTestReport {
    pub timestamp: String,
    pub gpio: bool,
    pub gpio_details: BTreeMap<String, bool>,
    pub adc: bool,
    pub adc_error: Option<String>,
    /// Every ADC input, informational only; empty if the ADC is unreachable
    pub adc_channels: BTreeMap<u8, AdcChannelReading>,
    pub csv: bool,
    pub csv_error: Option<String>,
    /// One fuse per mux, keyed by fuse id; empty if GPIO or ADC failed
    pub fuse_test: BTreeMap<u8, FuseCheck>,
    pub overall: bool,
}

/// Backlog of one delivery queue
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub dropped: u64,
}

/// Backlog of both consumers
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeliveryStatus {
    pub csv: QueueStatus,
    pub telemetry: Option<QueueStatus>,
}

/// Aggregated status of every component
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MonitorStatus {
    pub monitoring: bool,
    pub selftest_passed: Option<bool>,
    pub uptime_seconds: u64,
    pub total_fuses: u8,
    pub gain: Gain,
    pub mux: MuxStatus,
    pub sampling: SamplingStatus,
    pub csv: CsvStatus,
    pub telemetry: Option<TelemetryStatus>,
    pub deliveries: DeliveryStatus,
}

/// Frames waiting for one component, oldest first
struct DeliveryQueue {
    component: &'static str,
    frames: std::sync::Mutex<VecDeque<Arc<Frame>>>,
    capacity: usize,
    closed: AtomicBool,
    ready: Notify,
    dropped: AtomicU64,
}

impl DeliveryQueue {
    fn new(component: &'static str, capacity: usize) -> Self {
        Self {
            component,
            frames: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn frames(&self) -> MutexGuard<'_, VecDeque<Arc<Frame>>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `frame` without waiting; evicts the oldest frame when full
    fn push(&self, frame: Arc<Frame>) {
        let mut frames = self.frames();
        if frames.len() >= self.capacity {
            if let Some(evicted) = frames.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{} delivery falling behind, dropped frame {}",
                    self.component,
                    evicted.sequence()
                );
            }
        }
        frames.push_back(frame);
        drop(frames);
        self.ready.notify_one();
    }

    /// Next frame in order; `None` once closed and empty
    async fn next(&self) -> Option<Arc<Frame>> {
        loop {
            let next = self.frames().pop_front();
            if next.is_some() {
                return next;
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.ready.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_one();
    }

    fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.frames().len(),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Clears the monitoring flag and closes the queues when the sweep loop ends, however it ends
struct SweepLoopGuard {
    monitoring: Arc<AtomicBool>,
    queues: Vec<Arc<DeliveryQueue>>,
}

impl Drop for SweepLoopGuard {
    fn drop(&mut self) {
        self.monitoring.store(false, Ordering::Relaxed);
        for queue in &self.queues {
            queue.close();
        }
    }
}

struct RunHandle {
    stop: watch::Sender<bool>,
    sweeps: JoinHandle<()>,
    persist: JoinHandle<()>,
    telemetry: Option<JoinHandle<()>>,
}

impl RunHandle {
    /// Await every task of the run; the sweep loop must already be stopping
    async fn join(self) {
        for (task, handle) in [
            ("Monitoring loop", Some(self.sweeps)),
            ("CSV delivery", Some(self.persist)),
            ("Telemetry delivery", self.telemetry),
        ] {
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    error!("{} ended abnormally: {}", task, e);
                }
            }
        }
    }
}

/// Coordinator of selector, scheduler, persister and sender
pub struct FuseMonitor {
    scheduler: Arc<SamplingScheduler>,
    adc: Arc<dyn AdcReader>,
    gain: Gain,
    csv: Arc<CsvPersister>,
    sender: Option<Arc<TelemetrySender>>,
    csv_queue: Arc<DeliveryQueue>,
    telemetry_queue: Option<Arc<DeliveryQueue>>,
    run: Mutex<Option<RunHandle>>,
    monitoring: Arc<AtomicBool>,
    selftest: AtomicU8,
    started: Instant,
}

impl std::fmt::Debug for FuseMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseMonitor")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl FuseMonitor {
    /// Bring up every component
    ///
    /// Drives all mux lines to idle, programs the ADC gain, opens the CSV
    /// file and writes its header. `transport` is `None` when telemetry is
    /// disabled; otherwise the server is checked once (an unreachable server is not fatal).
    ///
    /// # Errors
    ///
    /// Returns error if the mux lines, the ADC or the CSV file cannot be set up
    pub async fn initialize(
        config: &Config,
        gpio: Arc<dyn DigitalOutput>,
        adc: Arc<dyn AdcReader>,
        transport: Option<Arc<dyn TelemetryTransport>>,
    ) -> Result<Self> {
        info!("Initializing Fuse Monitor...");

        let selector = Arc::new(ChannelSelector::new(
            gpio,
            config.mux_pins(),
            config.selector_timing(),
        ));
        selector.initialize().await?;
        info!("Mux control lines ready");

        let gain = config.hardware.gain;
        adc.set_gain(gain).await?;
        info!("ADC ready (gain {}, channel {})", gain, config.hardware.adc_channel);

        let csv = CsvPersister::open(&config.csv.file_path, config.csv_options())?;
        csv.write_header(fuse_headers()).await?;
        info!("CSV headers configured for {} fuses", TOTAL_FUSES);

        let scheduler = Arc::new(SamplingScheduler::new(
            selector,
            Arc::clone(&adc),
            config.hardware.adc_channel,
            config.sampling_timing(),
        ));

        let sender = match transport {
            Some(transport) => {
                let sender = Arc::new(TelemetrySender::new(transport, config.sender_options()));
                sender.check_server().await;
                Some(sender)
            }
            None => {
                info!("Telemetry disabled, sweeps are only written to CSV");
                None
            }
        };
        let telemetry_queue = sender
            .as_ref()
            .map(|_| Arc::new(DeliveryQueue::new("Telemetry", DELIVERY_QUEUE_CAPACITY)));

        info!(
            "Fuse Monitor initialized: {} fuses, {}ms interval",
            TOTAL_FUSES, config.sampling.cycle_period_ms
        );

        Ok(Self {
            scheduler,
            adc,
            gain,
            csv: Arc::new(csv),
            sender,
            csv_queue: Arc::new(DeliveryQueue::new("CSV", DELIVERY_QUEUE_CAPACITY)),
            telemetry_queue,
            run: Mutex::new(None),
            monitoring: Arc::new(AtomicBool::new(false)),
            selftest: AtomicU8::new(SELFTEST_NOT_RUN),
            started: Instant::now(),
        })
    }

    /// Check GPIO lines, ADC, CSV file and one fuse per mux
    ///
    /// The verdict gates [`FuseMonitor::start`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while monitoring is running
    pub async fn selftest(&self) -> Result<SelfTestReport> {
        let run = self.run.lock().await;
        if run.as_ref().is_some_and(|handle| !handle.sweeps.is_finished()) {
            return Err(FuseMonitorError::InvalidState(
                "cannot run self-test while monitoring".into(),
            ));
        }

        info!("Running system test...");
        let selector = self.scheduler.selector();

        let gpio_details = selector.test_lines().await;
        let gpio = gpio_details.values().all(|&ok| ok);

        let adc_result = self.adc.check_connection().await;
        let adc = adc_result.is_ok();
        let adc_channels = if adc {
            self.read_adc_channels().await
        } else {
            BTreeMap::new()
        };

        let csv_result = self.csv.check_writable().await;
        let csv = csv_result.is_ok();

        let mut fuse_test = BTreeMap::new();
        if gpio && adc {
            for address in FuseAddress::first_of_each_mux() {
                let result = match self.scheduler.sample_fuse(address.fuse_id()).await {
                    Ok(volts) => FuseCheck {
                        success: true,
                        voltage: Some(volts),
                        error: None,
                    },
                    Err(e) => {
                        error!("Fuse {} test failed: {}", address.fuse_id(), e);
                        FuseCheck {
                            success: false,
                            voltage: None,
                            error: Some(e.to_string()),
                        }
                    }
                };
                fuse_test.insert(address.fuse_id(), result);
            }
            if let Err(e) = selector.disable_all().await {
                error!("Failed to disable muxes after fuse test: {}", e);
            }
        }
        drop(run);

        let overall = gpio
            && adc
            && csv
            && !fuse_test.is_empty()
            && fuse_test.values().all(|result| result.success);

        let verdict = if overall { SELFTEST_PASSED } else { SELFTEST_FAILED };
        self.selftest.store(verdict, Ordering::Relaxed);

        if overall {
            info!("System test complete. Overall result: passed");
        } else {
            warn!(
                "System test complete. Overall result: failed (gpio: {}, adc: {}, csv: {})",
                gpio, adc, csv
            );
        }

        Ok(SelfTestReport {
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            gpio,
            gpio_details,
            adc,
            adc_error: adc_result.err().map(|e| e.to_string()),
            adc_channels,
            csv,
            csv_error: csv_result.err().map(|e| e.to_string()),
            fuse_test,
            overall,
        })
    }

    async fn read_adc_channels(&self) -> BTreeMap<u8, AdcChannelReading> {
        let mut channels = BTreeMap::new();
        for channel in 0..ADC_CHANNEL_COUNT {
            let raw = self.adc.read_raw(channel).await;
            let voltage = self.adc.read_voltage(channel).await;

            let error = match (&raw, &voltage) {
                (Err(e), _) | (_, Err(e)) => {
                    warn!("ADC channel {} test read failed: {}", channel, e);
                    Some(e.to_string())
                }
                _ => None,
            };
            if let (Ok(raw), Ok(volts)) = (&raw, &voltage) {
                debug!("ADC channel {}: {:.4}V (raw {})", channel, volts, raw);
            }

            channels.insert(
                channel,
                AdcChannelReading {
                    voltage: voltage.ok(),
                    raw: raw.ok(),
                    error,
                },
            );
        }
        channels
    }

    /// Launch the sweep loop and one delivery task per component
    ///
    /// Does nothing if monitoring is already running.
    ///
    /// # Errors
    ///
    /// Returns `SelfTestFailed` unless the most recent self-test passed
    pub async fn start(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        if run.as_ref().is_some_and(|handle| !handle.sweeps.is_finished()) {
            info!("Monitoring already started");
            return Ok(());
        }

        match self.selftest.load(Ordering::Relaxed) {
            SELFTEST_PASSED => {}
            SELFTEST_NOT_RUN => {
                return Err(FuseMonitorError::SelfTestFailed(
                    "self-test has not been run".into(),
                ))
            }
            _ => {
                return Err(FuseMonitorError::SelfTestFailed(
                    "last self-test did not pass".into(),
                ))
            }
        }

        // A loop that ended on its own still has delivery tasks to collect
        if let Some(handle) = run.take() {
            handle.join().await;
        }

        self.csv_queue.reopen();
        let persist = tokio::spawn(persist_frames(
            Arc::clone(&self.csv),
            Arc::clone(&self.csv_queue),
        ));

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut queues = vec![Arc::clone(&self.csv_queue)];
        let telemetry = match (&self.sender, &self.telemetry_queue) {
            (Some(sender), Some(queue)) => {
                queue.reopen();
                queues.push(Arc::clone(queue));
                Some(tokio::spawn(forward_frames(
                    Arc::clone(sender),
                    Arc::clone(queue),
                    stop_rx.clone(),
                )))
            }
            _ => None,
        };

        self.monitoring.store(true, Ordering::Relaxed);
        let guard = SweepLoopGuard {
            monitoring: Arc::clone(&self.monitoring),
            queues,
        };
        let sweeps = tokio::spawn(sweep_loop(Arc::clone(&self.scheduler), guard, stop_rx));

        *run = Some(RunHandle {
            stop: stop_tx,
            sweeps,
            persist,
            telemetry,
        });
        info!(
            "Fuse monitoring started (every {}ms)",
            self.scheduler.status().cycle_period_ms
        );
        Ok(())
    }

    /// Stop the sweep loop and disable every mux
    ///
    /// A sweep in progress stops at the next fuse boundary and is discarded.
    /// Queued rows are written to CSV; queued telemetry is buffered unsent.
    ///
    /// # Errors
    ///
    /// Returns error if the muxes could not be disabled afterwards
    pub async fn stop(&self) -> Result<()> {
        let mut run = self.run.lock().await;

        if let Some(handle) = run.take() {
            info!("Stopping fuse monitoring...");
            // Receivers may already be gone if the loop ended on its own
            let _ = handle.stop.send(true);
            handle.join().await;
            info!("Fuse monitoring stopped");
        }

        self.scheduler.selector().disable_all().await?;
        Ok(())
    }

    /// Stop monitoring, report unsent telemetry and close the CSV file
    ///
    /// # Errors
    ///
    /// Returns the first error from stopping or closing
    pub async fn shutdown(&self) -> Result<()> {
        info!("Cleaning up Fuse Monitor...");
        let stopped = self.stop().await;

        if let Some(sender) = &self.sender {
            sender.shutdown();
        }
        let closed = self.csv.close().await;

        info!("Fuse Monitor cleanup complete");
        stopped.and(closed)
    }

    /// Snapshot of every component; never waits on hardware or I/O
    pub fn status(&self) -> MonitorStatus {
        let selftest_passed = match self.selftest.load(Ordering::Relaxed) {
            SELFTEST_NOT_RUN => None,
            verdict => Some(verdict == SELFTEST_PASSED),
        };

        MonitorStatus {
            monitoring: self.monitoring.load(Ordering::Relaxed),
            selftest_passed,
            uptime_seconds: self.started.elapsed().as_secs(),
            total_fuses: TOTAL_FUSES,
            gain: self.gain,
            mux: self.scheduler.selector().status(),
            sampling: self.scheduler.status(),
            csv: self.csv.status(),
            telemetry: self.sender.as_ref().map(|sender| sender.status()),
            deliveries: DeliveryStatus {
                csv: self.csv_queue.status(),
                telemetry: self.telemetry_queue.as_ref().map(|queue| queue.status()),
            },
        }
    }

    /// Whether the sweep loop is running
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Relaxed)
    }
}

/// Write queued frames to CSV until the queue is closed and empty
async fn persist_frames(csv: Arc<CsvPersister>, queue: Arc<DeliveryQueue>) {
    while let Some(frame) = queue.next().await {
        // Failures are logged and counted by the persister
        let _ = csv.append(&frame).await;
    }
    debug!("CSV delivery finished");
}

/// Send queued frames until the queue is closed and empty
///
/// After a stop request nothing new is attempted: the send in flight is
/// abandoned and every remaining frame goes to the sender's buffer.
async fn forward_frames(
    sender: Arc<TelemetrySender>,
    queue: Arc<DeliveryQueue>,
    mut stop: watch::Receiver<bool>,
) {
    while let Some(frame) = queue.next().await {
        let payload = sender.payload_for(&frame).await;
        if *stop.borrow() {
            sender.defer(payload);
            continue;
        }

        let delivered = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => None,
            delivered = sender.deliver(payload.clone()) => Some(delivered),
        };

        match delivered {
            None => sender.defer(payload),
            Some(true) => {
                tokio::select! {
                    biased;
                    _ = stop_requested(&mut stop) => {}
                    _ = sender.replay() => {}
                }
            }
            Some(false) => {}
        }
    }
    debug!("Telemetry delivery finished");
}

async fn sweep_loop(
    scheduler: Arc<SamplingScheduler>,
    guard: SweepLoopGuard,
    mut stop: watch::Receiver<bool>,
) {
    info!("Starting monitoring loop...");

    loop {
        let cycle_start = Instant::now();

        let Some(frame) = scheduler.run_frame(&stop).await else {
            break;
        };
        if frame.failed_count() > 0 {
            warn!(
                "Sweep {} had {} failed reads: {:?}",
                frame.sequence(),
                frame.failed_count(),
                frame.failed_fuses()
            );
        }

        let frame = Arc::new(frame);
        for queue in &guard.queues {
            queue.push(Arc::clone(&frame));
        }

        let elapsed = cycle_start.elapsed();
        debug!("Data collection completed in {:.2}s", elapsed.as_secs_f64());
        if !scheduler.wait_for_next_cycle(elapsed, &mut stop).await {
            break;
        }
    }

    info!("Monitoring loop stopped");
    drop(guard);
}
