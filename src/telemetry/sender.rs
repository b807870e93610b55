//! # Telemetry Sender
//!
//! Best-effort delivery of each sweep with a bounded store-and-forward buffer.
//!
//! ## Send Flow
//!
//! ```text
//! send(frame)
//!   ├─ deliver ok   -> reset failures, replay up to `replay_batch` buffered (oldest first)
//!   └─ deliver err  -> count failure, buffer (evict oldest when full)
//! ```
//!
//! Sends are serialized by `sending`, so a replay never interleaves with a
//! newer frame and buffer order always matches sweep order. The buffer
//! itself sits behind a short-lived std lock that is never held across a
//! network call. Dropping a send part way through loses nothing that was
//! already buffered: a replayed payload leaves the buffer only after the
//! server accepted it. Transport errors never leave this module.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::payload::{SystemInfo, TelemetryPayload, DEFAULT_DEVICE_ID};
use super::transport::TelemetryTransport;
use crate::error::TransportError;
use crate::sampling::frame::{Frame, TIMESTAMP_FORMAT};

/// Sender settings
#[derive(Debug, Clone)]
pub struct SenderOptions {
    /// Maximum number of buffered payloads
    pub capacity: usize,
    /// Maximum buffered payloads replayed after one successful send
    pub replay_batch: usize,
    /// Upper bound on a single push
    pub send_timeout: Duration,
    pub device_id: String,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            capacity: 100,
            replay_batch: 10,
            send_timeout: Duration::from_secs(10),
            device_id: DEFAULT_DEVICE_ID.to_string(),
        }
    }
}

/// Delivery counters, as reported in status
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TelemetryStatus {
    pub buffered: usize,
    pub capacity: usize,
    pub consecutive_failures: u64,
    pub total_failures: u64,
    pub total_sent: u64,
    pub replayed: u64,
    pub dropped: u64,
    pub last_success: Option<String>,
}

pub struct TelemetrySender {
    transport: Arc<dyn TelemetryTransport>,
    options: SenderOptions,
    sending: Mutex<()>,
    buffer: std::sync::Mutex<VecDeque<TelemetryPayload>>,
    buffered: AtomicUsize,
    consecutive_failures: AtomicU64,
    total_failures: AtomicU64,
    total_sent: AtomicU64,
    replayed: AtomicU64,
    dropped: AtomicU64,
    last_success: std::sync::Mutex<Option<DateTime<Local>>>,
}

impl std::fmt::Debug for TelemetrySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetrySender")
            .field("options", &self.options)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl TelemetrySender {
    pub fn new(transport: Arc<dyn TelemetryTransport>, options: SenderOptions) -> Self {
        info!(
            "Telemetry sender ready (timeout {}s, buffer {} frames)",
            options.send_timeout.as_secs(),
            options.capacity
        );

        Self {
            transport,
            sending: Mutex::new(()),
            buffer: std::sync::Mutex::new(VecDeque::with_capacity(options.capacity)),
            options,
            buffered: AtomicUsize::new(0),
            consecutive_failures: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_sent: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_success: std::sync::Mutex::new(None),
        }
    }

    /// Check the server is reachable; a failure only means buffering until a send succeeds
    pub async fn check_server(&self) -> bool {
        let result = tokio::time::timeout(self.options.send_timeout, self.transport.health_check())
            .await
            .unwrap_or(Err(TransportError::Timeout));

        match result {
            Ok(()) => {
                info!("Telemetry server connection test successful");
                true
            }
            Err(e) => {
                warn!("Telemetry server connection test failed: {}", e);
                warn!("Running in buffer-only mode until a send succeeds");
                false
            }
        }
    }

    /// Build the payload for `frame`; the host snapshot is taken off the async workers
    pub async fn payload_for(&self, frame: &Frame) -> TelemetryPayload {
        let system_info = match tokio::task::spawn_blocking(SystemInfo::collect).await {
            Ok(info) => info,
            Err(e) => {
                warn!("Failed to collect system info: {}", e);
                SystemInfo::default()
            }
        };
        TelemetryPayload::from_frame(frame, &self.options.device_id, system_info)
    }

    /// Deliver `frame`, buffering it on failure, then replay the backlog
    pub async fn send(&self, frame: &Frame) {
        let payload = self.payload_for(frame).await;
        self.send_payload(payload).await;
    }

    /// Deliver a prepared payload, buffering it on failure, then replay the backlog
    pub async fn send_payload(&self, payload: TelemetryPayload) {
        let _sending = self.sending.lock().await;
        if self.deliver_locked(payload).await {
            self.replay_locked().await;
        }
    }

    /// Deliver a prepared payload without replaying; returns whether the server took it
    pub async fn deliver(&self, payload: TelemetryPayload) -> bool {
        let _sending = self.sending.lock().await;
        self.deliver_locked(payload).await
    }

    /// Replay up to `replay_batch` buffered payloads, oldest first
    pub async fn replay(&self) {
        let _sending = self.sending.lock().await;
        self.replay_locked().await;
    }

    /// Buffer `payload` without attempting delivery
    pub fn defer(&self, payload: TelemetryPayload) {
        debug!("Deferring frame {}", payload.sequence);
        self.enqueue(payload);
    }

    async fn deliver_locked(&self, payload: TelemetryPayload) -> bool {
        match self.push(&payload).await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                *self
                    .last_success
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Local::now());
                debug!("Sent frame {}", payload.sequence);
                true
            }
            Err(e) => {
                error!("Failed to send frame {}: {}", payload.sequence, e);
                self.enqueue(payload);
                warn!(
                    "Data buffered ({}/{}) - {} consecutive failures",
                    self.buffered.load(Ordering::Relaxed),
                    self.options.capacity,
                    self.consecutive_failures.load(Ordering::Relaxed)
                );
                false
            }
        }
    }

    async fn push(&self, payload: &TelemetryPayload) -> Result<(), TransportError> {
        let result = tokio::time::timeout(self.options.send_timeout, self.transport.post(payload))
            .await
            .unwrap_or(Err(TransportError::Timeout));

        match result {
            Ok(()) => {
                self.total_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                self.total_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn replay_locked(&self) {
        let backlog = self.buffer().len();
        if backlog == 0 {
            return;
        }
        info!("Attempting to send {} buffered frames", backlog);

        let mut sent = 0;
        while sent < self.options.replay_batch {
            let Some(payload) = self.buffer().front().cloned() else {
                break;
            };

            match self.push(&payload).await {
                Ok(()) => {
                    let mut buffer = self.buffer();
                    // Eviction may have removed it while the push was in flight
                    if buffer.front().map(|front| front.sequence) == Some(payload.sequence) {
                        buffer.pop_front();
                    }
                    self.buffered.store(buffer.len(), Ordering::Relaxed);
                    drop(buffer);
                    sent += 1;
                    self.replayed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("Replay of frame {} failed, keeping backlog: {}", payload.sequence, e);
                    break;
                }
            }
        }

        if sent > 0 {
            info!(
                "Successfully sent {} buffered frames ({} remaining)",
                sent,
                self.buffered.load(Ordering::Relaxed)
            );
        }
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<TelemetryPayload>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, payload: TelemetryPayload) {
        if self.options.capacity == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut buffer = self.buffer();
        while buffer.len() >= self.options.capacity {
            if let Some(evicted) = buffer.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Buffer full, dropped oldest frame {}", evicted.sequence);
            }
        }
        buffer.push_back(payload);
        self.buffered.store(buffer.len(), Ordering::Relaxed);

        if buffer.len() * 5 >= self.options.capacity * 4 {
            warn!("Buffer nearly full: {}/{}", buffer.len(), self.options.capacity);
        }
    }

    /// Sequence numbers of buffered frames, oldest first
    pub fn pending(&self) -> Vec<u64> {
        self.buffer().iter().map(|payload| payload.sequence).collect()
    }

    /// Delivery counters
    pub fn status(&self) -> TelemetryStatus {
        TelemetryStatus {
            buffered: self.buffered.load(Ordering::Relaxed),
            capacity: self.options.capacity,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_sent: self.total_sent.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            last_success: self
                .last_success
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string()),
        }
    }

    /// Report unsent frames; returns how many are left in the buffer
    pub fn shutdown(&self) -> usize {
        let unsent = self.buffer().len();
        if unsent > 0 {
            warn!("Shutting down with {} unsent frames in buffer", unsent);
        }
        info!("Telemetry sender shut down");
        unsent
    }
}
