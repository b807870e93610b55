//! # Telemetry Payload
//!
//! JSON body pushed to the telemetry server for each sweep:
//!
//! ```json
//! {
//!   "timestamp": "2024-03-01T12:30:05.000000",
//!   "device_id": "fusetester-001",
//!   "readings": { "1": 4.95, "2": 4.95, "64": 0.0 },
//!   "system_info": { "memory_percent": 41.2, "cpu_temp": 48.3, "uptime_seconds": 86400 }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use sysinfo::{get_current_pid, System};

use crate::sampling::Frame;

/// Default device identifier
pub const DEFAULT_DEVICE_ID: &str = "fusetester-001";

/// Thermal zone reporting the SoC temperature in millidegrees
pub const CPU_TEMP_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Host health snapshot attached to each payload
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SystemInfo {
    pub memory_percent: f64,
    pub cpu_temp: Option<f64>,
    pub uptime_seconds: u64,
}

impl SystemInfo {
    /// Snapshot of the running host
    pub fn collect() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 * 100.0 / total as f64
        };

        Self {
            memory_percent,
            cpu_temp: read_cpu_temp(CPU_TEMP_PATH),
            uptime_seconds: System::uptime(),
        }
    }
}

/// Memory footprint of this process and the host, logged periodically
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MemoryUsage {
    pub process_rss_bytes: Option<u64>,
    pub system_used_bytes: u64,
    pub system_total_bytes: u64,
    pub system_percent: f64,
}

impl MemoryUsage {
    /// Current figures; blocks on procfs, so call it from a blocking task
    pub fn collect() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        let process_rss_bytes = get_current_pid().ok().and_then(|pid| {
            system.refresh_process(pid);
            system.process(pid).map(|process| process.memory())
        });

        let total = system.total_memory();
        let used = system.used_memory();
        Self {
            process_rss_bytes,
            system_used_bytes: used,
            system_total_bytes: total,
            system_percent: if total == 0 {
                0.0
            } else {
                used as f64 * 100.0 / total as f64
            },
        }
    }
}

/// Temperature in °C from a thermal zone file, `None` if unavailable
pub fn read_cpu_temp<P: AsRef<Path>>(path: P) -> Option<f64> {
    let raw = std::fs::read_to_string(path).ok()?;
    let millidegrees: f64 = raw.trim().parse().ok()?;
    Some(millidegrees / 1000.0)
}

/// One sweep as sent over the wire
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TelemetryPayload {
    #[serde(skip)]
    pub sequence: u64,
    pub timestamp: String,
    pub device_id: String,
    pub readings: BTreeMap<u8, f64>,
    pub system_info: SystemInfo,
}

impl TelemetryPayload {
    /// Build the payload for `frame` with the given host snapshot
    pub fn from_frame(frame: &Frame, device_id: &str, system_info: SystemInfo) -> Self {
        Self {
            sequence: frame.sequence(),
            timestamp: frame.timestamp_string(),
            device_id: device_id.to_string(),
            readings: frame.readings().collect(),
            system_info,
        }
    }
}
