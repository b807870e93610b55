//! End-to-end runs of the monitor against the simulated board

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use fuse_monitor::config::{Backend, Config};
use fuse_monitor::error::{FuseMonitorError, TransportError};
use fuse_monitor::hardware::simulated::SimulatedBoard;
use fuse_monitor::monitor::FuseMonitor;
use fuse_monitor::telemetry::{TelemetryPayload, TelemetryTransport};

/// Collects delivered payloads; refuses them while `online` is false
#[derive(Default)]
struct CollectingTransport {
    online: Mutex<bool>,
    delivered: Mutex<Vec<TelemetryPayload>>,
}

impl CollectingTransport {
    fn new(online: bool) -> Self {
        Self {
            online: Mutex::new(online),
            delivered: Mutex::new(Vec::new()),
        }
    }

    fn set_online(&self, online: bool) {
        *self.online.lock().unwrap() = online;
    }

    fn sequences(&self) -> Vec<u64> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|payload| payload.sequence)
            .collect()
    }
}

#[async_trait]
impl TelemetryTransport for CollectingTransport {
    async fn post(&self, payload: &TelemetryPayload) -> Result<(), TransportError> {
        if !*self.online.lock().unwrap() {
            return Err(TransportError::Connection("link down".into()));
        }
        self.delivered.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        if *self.online.lock().unwrap() {
            Ok(())
        } else {
            Err(TransportError::Connection("link down".into()))
        }
    }
}

/// Accepts connections but never answers
struct UnresponsiveTransport;

#[async_trait]
impl TelemetryTransport for UnresponsiveTransport {
    async fn post(&self, _payload: &TelemetryPayload) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        Err(TransportError::Timeout)
    }
}

fn config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.hardware.backend = Backend::Simulated;
    config.hardware.channel_settle_ms = 0;
    config.hardware.enable_settle_ms = 0;
    config.sampling.read_settle_ms = 0;
    config.sampling.cycle_period_ms = 10;
    config.csv.file_path = dir.path().join("data/fuse_data.csv").display().to_string();
    config.telemetry.server_url = Some("http://127.0.0.1:9/ingest".to_string());
    config
}

async fn start_monitor(
    config: &Config,
    board: &SimulatedBoard,
    transport: Arc<CollectingTransport>,
) -> FuseMonitor {
    let monitor = FuseMonitor::initialize(
        config,
        Arc::new(board.clone()),
        Arc::new(board.clone()),
        Some(transport),
    )
    .await
    .unwrap();

    let report = monitor.selftest().await.unwrap();
    assert!(report.overall, "self-test failed: {:?}", report);
    assert_ok!(monitor.start().await);
    monitor
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_sweeps_reach_csv_and_server_in_order() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let board = SimulatedBoard::new(config.mux_pins());
    board.set_fuse_voltage(12, 2.5);
    let transport = Arc::new(CollectingTransport::new(true));

    let monitor = start_monitor(&config, &board, transport.clone()).await;
    wait_until(|| transport.sequences().len() >= 3).await;
    assert_ok!(monitor.shutdown().await);

    let sequences = transport.sequences();
    let expected: Vec<u64> = (1..=sequences.len() as u64).collect();
    assert_eq!(sequences, expected);

    let first = transport.delivered.lock().unwrap()[0].clone();
    assert_eq!(first.readings.len(), 64);
    assert_eq!(first.readings[&12], 2.5);
    assert_eq!(first.device_id, "fusetester-001");

    // Every sweep reached CSV; frames still queued for the server at stop were buffered
    let status = monitor.status();
    let sweeps = status.sampling.sweeps_completed;
    let content = std::fs::read_to_string(&config.csv.file_path).unwrap();
    assert_eq!(content.lines().count() as u64, sweeps + 1);
    let telemetry = status.telemetry.unwrap();
    assert_eq!(sequences.len() as u64 + telemetry.buffered as u64, sweeps);
    assert_eq!(board.contention_events(), 0);
    assert!(board.enabled_muxes().is_empty());
}

#[tokio::test]
async fn test_outage_buffers_then_replays_oldest_first() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let board = SimulatedBoard::new(config.mux_pins());
    let transport = Arc::new(CollectingTransport::new(false));

    let monitor = start_monitor(&config, &board, transport.clone()).await;
    wait_until(|| {
        monitor
            .status()
            .telemetry
            .is_some_and(|telemetry| telemetry.buffered >= 5)
    })
    .await;

    transport.set_online(true);
    wait_until(|| {
        monitor
            .status()
            .telemetry
            .is_some_and(|telemetry| telemetry.buffered == 0)
    })
    .await;
    assert_ok!(monitor.stop().await);

    // Each success pushes the live frame first, then replays the backlog in order
    let sequences = transport.sequences();
    let mut replayed: Vec<u64> = sequences.iter().skip(1).copied().collect();
    replayed.retain(|&seq| seq < sequences[0]);
    let mut sorted = replayed.clone();
    sorted.sort_unstable();
    assert_eq!(replayed, sorted);
    assert_eq!(replayed.first(), Some(&1));

    let status = monitor.status().telemetry.unwrap();
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.dropped, 0);
    assert!(status.last_success.is_some());
}

#[tokio::test]
async fn test_disconnected_adc_blocks_monitoring() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let board = SimulatedBoard::new(config.mux_pins());
    let transport = Arc::new(CollectingTransport::new(true));

    let monitor = FuseMonitor::initialize(
        &config,
        Arc::new(board.clone()),
        Arc::new(board.clone()),
        Some(transport),
    )
    .await
    .unwrap();

    board.disconnect_adc();
    let report = monitor.selftest().await.unwrap();
    assert!(!report.adc);
    assert!(!report.overall);

    let result = assert_err!(monitor.start().await);
    assert!(matches!(result, FuseMonitorError::SelfTestFailed(_)));

    // Recovering the ADC and re-running the self-test unblocks start
    board.reconnect_adc();
    assert!(monitor.selftest().await.unwrap().overall);
    assert_ok!(monitor.start().await);
    assert_ok!(monitor.shutdown().await);
}

#[tokio::test]
async fn test_stuck_enable_line_fails_selftest() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let board = SimulatedBoard::new(config.mux_pins());
    let transport = Arc::new(CollectingTransport::new(true));

    let monitor = FuseMonitor::initialize(
        &config,
        Arc::new(board.clone()),
        Arc::new(board.clone()),
        Some(transport),
    )
    .await
    .unwrap();

    board.fail_pin(config.hardware.enable_pins[3]);
    let report = monitor.selftest().await.unwrap();

    assert!(!report.gpio);
    assert_eq!(report.gpio_details["enable_mux3"], false);
    assert!(report.fuse_test.is_empty());
    assert!(!report.overall);
    assert_err!(monitor.start().await);
}

#[tokio::test]
async fn test_hung_server_does_not_slow_sweeps_or_stop() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.sampling.cycle_period_ms = 20;
    config.telemetry.timeout_s = 1;
    let board = SimulatedBoard::new(config.mux_pins());

    let monitor = FuseMonitor::initialize(
        &config,
        Arc::new(board.clone()),
        Arc::new(board.clone()),
        Some(Arc::new(UnresponsiveTransport)),
    )
    .await
    .unwrap();
    assert!(monitor.selftest().await.unwrap().overall);
    assert_ok!(monitor.start().await);

    // Well inside the first send's one second timeout
    tokio::time::sleep(Duration::from_millis(600)).await;
    let running = monitor.status();
    assert!(
        running.sampling.sweeps_completed >= 10,
        "sweeps stalled behind telemetry: {:?}",
        running.sampling
    );
    assert!(running.sampling.overruns <= running.sampling.sweeps_completed / 4);

    let stopping = Instant::now();
    assert_ok!(monitor.stop().await);
    assert!(
        stopping.elapsed() < Duration::from_millis(500),
        "stop waited on the hung send"
    );

    let status = monitor.status();
    let sweeps = status.sampling.sweeps_completed;
    assert_eq!(status.csv.rows_written, sweeps);
    let content = std::fs::read_to_string(&config.csv.file_path).unwrap();
    assert_eq!(content.lines().count() as u64, sweeps + 1);

    // Nothing was delivered; every sweep is kept for later, oldest first
    let telemetry = status.telemetry.unwrap();
    assert_eq!(telemetry.total_sent, 0);
    assert_eq!(telemetry.buffered as u64, sweeps.min(100));
    let deliveries = status.deliveries.telemetry.unwrap();
    assert_eq!(deliveries.pending, 0);
    assert_eq!(deliveries.dropped, 0);
    assert!(!monitor.is_monitoring());
}
