//! # Fuse Monitor
//!
//! Continuously samples 64 fuse voltages and records every sweep.
//!
//! # Control Flow
//!
//! 1. **Initialization**
//!    - Load configuration, set up logging
//!    - Open the GPIO and ADC backends
//!    - Initialize the monitor (mux lines idle, ADC gain, CSV header)
//!
//! 2. **Self-test**
//!    - GPIO lines, ADC connectivity, CSV writability, one fuse per mux
//!    - With `--selftest` the report is printed as JSON and the program exits
//!    - Monitoring never starts after a failed self-test
//!
//! 3. **Main Loop**
//!    - Sweeps run in the background every cycle period
//!    - Status is logged every `status_interval_s`
//!    - Process and host memory are logged every `memory_interval_s`
//!    - Ctrl+C or SIGTERM triggers a graceful shutdown
//!
//! # Examples
//!
//! ```bash
//! fuse-monitor --config config/default.toml
//! fuse-monitor --selftest
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fuse_monitor::config::{Backend, Config, LoggingConfig};
use fuse_monitor::hardware::iio::IioAdc;
use fuse_monitor::hardware::simulated::SimulatedBoard;
use fuse_monitor::hardware::sysfs::SysfsGpio;
use fuse_monitor::hardware::{AdcReader, DigitalOutput};
use fuse_monitor::monitor::FuseMonitor;
use fuse_monitor::telemetry::{HttpTransport, MemoryUsage, TelemetryTransport};

/// Sample 64 multiplexed fuse voltages, log them to CSV and forward them over HTTP
#[derive(Parser, Debug)]
#[command(name = "fuse-monitor", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config/default.toml")]
    config: PathBuf,

    /// Run the self-test, print the report as JSON and exit
    #[arg(long)]
    selftest: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;

    // Held until exit so buffered log lines reach the file
    let _log_guard = init_logging(&config.logging)?;

    info!("Fuse Monitor v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", args.config.display());

    let (gpio, adc) = open_hardware(&config).await?;
    let transport = open_transport(&config)?;

    let monitor = FuseMonitor::initialize(&config, gpio, adc, transport)
        .await
        .context("Failed to initialize fuse monitor")?;

    let report = monitor.selftest().await?;

    if args.selftest {
        println!("{}", serde_json::to_string_pretty(&report)?);
        monitor.shutdown().await?;
        if !report.overall {
            bail!("Self-test failed");
        }
        return Ok(());
    }

    if !report.overall {
        error!(
            "Self-test failed: {}",
            serde_json::to_string(&report).unwrap_or_default()
        );
        if let Err(e) = monitor.shutdown().await {
            error!("Error during shutdown: {}", e);
        }
        bail!("Self-test failed, refusing to start monitoring");
    }

    monitor.start().await?;
    info!("Press Ctrl+C to exit");

    let mut status_interval = interval(Duration::from_secs(config.logging.status_interval_s));
    status_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    status_interval.tick().await;

    let memory_logging = config.logging.memory_interval_s > 0;
    let mut memory_interval = interval(Duration::from_secs(config.logging.memory_interval_s.max(1)));
    memory_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = status_interval.tick() => {
                match serde_json::to_string(&monitor.status()) {
                    Ok(status) => info!("Status: {}", status),
                    Err(e) => warn!("Failed to serialize status: {}", e),
                }
            }

            _ = memory_interval.tick(), if memory_logging => {
                log_memory_usage().await;
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping...");
                break;
            }
        }
    }

    monitor.shutdown().await?;
    info!("Fuse Monitor stopped");
    Ok(())
}

/// Console output plus an optional daily-rotated log file
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log filter")?;

    let (file_layer, guard) = match &logging.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "fuse-monitor.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn open_hardware(config: &Config) -> Result<(Arc<dyn DigitalOutput>, Arc<dyn AdcReader>)> {
    match config.hardware.backend {
        Backend::Sysfs => {
            let pins: Vec<u8> = config.mux_pins().all().collect();
            let gpio = SysfsGpio::open(&config.hardware.gpio_base, &pins)
                .await
                .context("Failed to set up GPIO lines")?;
            let adc = IioAdc::open(&config.hardware.iio_device)
                .await
                .context("Failed to open ADS1115")?;
            Ok((Arc::new(gpio), Arc::new(adc)))
        }
        Backend::Simulated => {
            warn!("Using simulated hardware, readings are not real");
            let board = SimulatedBoard::new(config.mux_pins());
            Ok((Arc::new(board.clone()), Arc::new(board)))
        }
    }
}

fn open_transport(config: &Config) -> Result<Option<Arc<dyn TelemetryTransport>>> {
    if !config.telemetry.enabled {
        return Ok(None);
    }

    let Some(server_url) = config.telemetry.server_url.clone() else {
        bail!("telemetry server_url is required when enabled");
    };
    info!("Telemetry server: {}", server_url);

    let transport = HttpTransport::new(
        server_url,
        config.telemetry.api_key.clone(),
        Duration::from_secs(config.telemetry.timeout_s),
    )
    .context("Failed to create HTTP client")?;
    Ok(Some(Arc::new(transport)))
}

async fn log_memory_usage() {
    match tokio::task::spawn_blocking(MemoryUsage::collect).await {
        Ok(usage) => info!(
            "Memory: process {:.1}MB, system {:.1}% ({:.0}/{:.0}MB)",
            usage.process_rss_bytes.unwrap_or(0) as f64 / 1024.0 / 1024.0,
            usage.system_percent,
            usage.system_used_bytes as f64 / 1024.0 / 1024.0,
            usage.system_total_bytes as f64 / 1024.0 / 1024.0
        ),
        Err(e) => warn!("Failed to collect memory usage: {}", e),
    }
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
