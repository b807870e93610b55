//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{FuseMonitorError, Result};
use crate::hardware::{Gain, ADC_CHANNEL_COUNT};
use crate::mux::{MuxPins, SelectorTiming};
use crate::sampling::SamplingTiming;
use crate::storage::CsvOptions;
use crate::telemetry::SenderOptions;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub csv: CsvConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which hardware implementation to drive
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Linux sysfs GPIO + IIO ADC
    #[default]
    Sysfs,
    /// In-process board model
    Simulated,
}

/// Hardware configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HardwareConfig {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default = "default_gpio_base")]
    pub gpio_base: String,

    #[serde(default = "default_iio_device")]
    pub iio_device: String,

    #[serde(default)]
    pub adc_channel: u8,

    #[serde(default = "default_gain")]
    pub gain: Gain,

    #[serde(default = "default_select_pins")]
    pub select_pins: [u8; 4],

    #[serde(default = "default_enable_pins")]
    pub enable_pins: [u8; 4],

    #[serde(default = "default_channel_settle_ms")]
    pub channel_settle_ms: u64,

    #[serde(default = "default_enable_settle_ms")]
    pub enable_settle_ms: u64,
}

/// Sweep timing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SamplingConfig {
    #[serde(default = "default_cycle_period_ms")]
    pub cycle_period_ms: u64,

    #[serde(default = "default_read_settle_ms")]
    pub read_settle_ms: u64,
}

/// CSV persistence configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CsvConfig {
    #[serde(default = "default_csv_file_path")]
    pub file_path: String,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_flush_interval_bytes")]
    pub flush_interval_bytes: u64,
}

/// Telemetry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub server_url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,

    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    #[serde(default = "default_replay_batch_size")]
    pub replay_batch_size: usize,
}

/// Diagnostic logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Daily-rotated log files are written here when set
    #[serde(default)]
    pub directory: Option<String>,

    #[serde(default = "default_status_interval_s")]
    pub status_interval_s: u64,

    /// Process and host memory are logged this often; 0 disables it
    #[serde(default = "default_memory_interval_s")]
    pub memory_interval_s: u64,
}

// Default value functions
fn default_gpio_base() -> String { crate::hardware::sysfs::DEFAULT_GPIO_BASE.to_string() }
fn default_iio_device() -> String { crate::hardware::iio::DEFAULT_IIO_DEVICE.to_string() }
fn default_gain() -> Gain { Gain::V6_144 }
fn default_select_pins() -> [u8; 4] { MuxPins::default().select }
fn default_enable_pins() -> [u8; 4] { MuxPins::default().enable }
fn default_channel_settle_ms() -> u64 { 1 }
fn default_enable_settle_ms() -> u64 { 2 }

fn default_cycle_period_ms() -> u64 { 5000 }
fn default_read_settle_ms() -> u64 { 5 }

fn default_csv_file_path() -> String { "data/fuse_data.csv".to_string() }
fn default_max_file_size() -> u64 { crate::storage::csv_persister::DEFAULT_MAX_FILE_SIZE }
fn default_flush_interval_bytes() -> u64 { crate::storage::csv_persister::DEFAULT_FLUSH_INTERVAL }

fn default_telemetry_enabled() -> bool { true }
fn default_device_id() -> String { crate::telemetry::payload::DEFAULT_DEVICE_ID.to_string() }
fn default_timeout_s() -> u64 { 10 }
fn default_buffer_capacity() -> usize { 100 }
fn default_replay_batch_size() -> usize { 10 }

fn default_log_level() -> String { "info".to_string() }
fn default_status_interval_s() -> u64 { 600 }
fn default_memory_interval_s() -> u64 { 300 }

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            gpio_base: default_gpio_base(),
            iio_device: default_iio_device(),
            adc_channel: 0,
            gain: default_gain(),
            select_pins: default_select_pins(),
            enable_pins: default_enable_pins(),
            channel_settle_ms: default_channel_settle_ms(),
            enable_settle_ms: default_enable_settle_ms(),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            cycle_period_ms: default_cycle_period_ms(),
            read_settle_ms: default_read_settle_ms(),
        }
    }
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            file_path: default_csv_file_path(),
            max_file_size: default_max_file_size(),
            flush_interval_bytes: default_flush_interval_bytes(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            server_url: None,
            api_key: None,
            device_id: default_device_id(),
            timeout_s: default_timeout_s(),
            buffer_capacity: default_buffer_capacity(),
            replay_batch_size: default_replay_batch_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
            status_interval_s: default_status_interval_s(),
            memory_interval_s: default_memory_interval_s(),
        }
    }
}

fn invalid(message: impl std::fmt::Display) -> FuseMonitorError {
    FuseMonitorError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fuse_monitor::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns error if parsing or validation fails
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range or a
    /// required startup parameter is missing
    pub fn validate(&self) -> Result<()> {
        // Validate hardware configuration
        if self.hardware.adc_channel >= ADC_CHANNEL_COUNT {
            return Err(invalid("adc_channel must be between 0 and 3"));
        }

        let mut seen = HashSet::new();
        for pin in self.mux_pins().all() {
            if !seen.insert(pin) {
                return Err(invalid(format!("GPIO pin {} is assigned more than once", pin)));
            }
        }

        if self.hardware.channel_settle_ms > 1000 || self.hardware.enable_settle_ms > 1000 {
            return Err(invalid("mux settle delays must be at most 1000ms"));
        }

        if self.hardware.backend == Backend::Sysfs
            && (self.hardware.gpio_base.is_empty() || self.hardware.iio_device.is_empty())
        {
            return Err(invalid("gpio_base and iio_device cannot be empty for the sysfs backend"));
        }

        // Validate sampling timing
        if self.sampling.cycle_period_ms == 0 || self.sampling.cycle_period_ms > 3_600_000 {
            return Err(invalid("cycle_period_ms must be between 1 and 3600000"));
        }

        if self.sampling.read_settle_ms > 1000 {
            return Err(invalid("read_settle_ms must be at most 1000"));
        }

        // Validate CSV persistence
        if self.csv.file_path.is_empty() {
            return Err(invalid("csv file_path cannot be empty"));
        }

        if self.csv.max_file_size == 0 {
            return Err(invalid("max_file_size must be greater than 0"));
        }

        if self.csv.flush_interval_bytes == 0 {
            return Err(invalid("flush_interval_bytes must be greater than 0"));
        }

        // Validate telemetry configuration
        if self.telemetry.enabled {
            match self.telemetry.server_url.as_deref() {
                None | Some("") => {
                    return Err(invalid("telemetry server_url is required when enabled"));
                }
                Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                    return Err(invalid("telemetry server_url must start with http:// or https://"));
                }
                Some(_) => {}
            }

            if self.telemetry.device_id.is_empty() {
                return Err(invalid("telemetry device_id cannot be empty"));
            }
        }

        if self.telemetry.timeout_s == 0 || self.telemetry.timeout_s > 300 {
            return Err(invalid("timeout_s must be between 1 and 300"));
        }

        if self.telemetry.buffer_capacity == 0 {
            return Err(invalid("buffer_capacity must be greater than 0"));
        }

        if self.telemetry.replay_batch_size == 0 {
            return Err(invalid("replay_batch_size must be greater than 0"));
        }

        // Validate logging configuration
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid(format!("unknown log level '{}'", self.logging.level)));
        }

        if self.logging.status_interval_s == 0 {
            return Err(invalid("status_interval_s must be greater than 0"));
        }

        Ok(())
    }

    /// Mux control line assignment
    pub fn mux_pins(&self) -> MuxPins {
        MuxPins {
            select: self.hardware.select_pins,
            enable: self.hardware.enable_pins,
        }
    }

    /// Selection settle delays
    pub fn selector_timing(&self) -> SelectorTiming {
        SelectorTiming {
            channel_settle: Duration::from_millis(self.hardware.channel_settle_ms),
            enable_settle: Duration::from_millis(self.hardware.enable_settle_ms),
        }
    }

    /// Sweep timing
    pub fn sampling_timing(&self) -> SamplingTiming {
        SamplingTiming {
            read_settle: Duration::from_millis(self.sampling.read_settle_ms),
            cycle_period: Duration::from_millis(self.sampling.cycle_period_ms),
        }
    }

    /// CSV persister settings
    pub fn csv_options(&self) -> CsvOptions {
        CsvOptions {
            max_file_size: self.csv.max_file_size,
            flush_interval: self.csv.flush_interval_bytes,
        }
    }

    /// Telemetry sender settings
    pub fn sender_options(&self) -> SenderOptions {
        SenderOptions {
            capacity: self.telemetry.buffer_capacity,
            replay_batch: self.telemetry.replay_batch_size,
            send_timeout: Duration::from_secs(self.telemetry.timeout_s),
            device_id: self.telemetry.device_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_valid_config() -> Config {
        let mut config = Config::default();
        config.hardware.backend = Backend::Simulated;
        config.telemetry.server_url = Some("https://telemetry.example.com/api/fuses".to_string());
        config
    }

    #[test]
    fn test_valid_config() {
        assert!(create_valid_config().validate().is_ok());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[hardware]
backend = "simulated"
adc_channel = 2
gain = "4.096V"
enable_pins = [5, 8, 6, 13]

[sampling]
cycle_period_ms = 2000

[csv]
file_path = "/tmp/fuses.csv"

[telemetry]
server_url = "http://10.0.0.5:8080/ingest"
api_key = "secret"
device_id = "bench-7"

[logging]
level = "debug"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.hardware.backend, Backend::Simulated);
        assert_eq!(config.hardware.adc_channel, 2);
        assert_eq!(config.hardware.gain, Gain::V4_096);
        assert_eq!(config.mux_pins().enable, [5, 8, 6, 13]);
        assert_eq!(config.mux_pins().select, [27, 17, 24, 23]);
        assert_eq!(config.sampling_timing().cycle_period, Duration::from_secs(2));
        assert_eq!(config.sampling_timing().read_settle, Duration::from_millis(5));
        assert_eq!(config.csv.file_path, "/tmp/fuses.csv");
        assert_eq!(config.csv.max_file_size, 50 * 1024 * 1024);
        assert_eq!(config.sender_options().device_id, "bench-7");
        assert_eq!(config.sender_options().capacity, 100);
        assert_eq!(config.sender_options().send_timeout, Duration::from_secs(10));
        assert_eq!(config.logging.status_interval_s, 600);
        assert_eq!(config.logging.memory_interval_s, 300);
    }

    #[test]
    fn test_memory_logging_can_be_disabled() {
        let config = Config::from_toml("[telemetry]\nenabled = false\n\n[logging]\nmemory_interval_s = 0\n").unwrap();
        assert_eq!(config.logging.memory_interval_s, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/fuse-monitor.toml"),
            Err(FuseMonitorError::Io(_))
        ));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = Config::from_toml("[hardware]\nbackend = \"spi\"\n");
        assert!(matches!(result, Err(FuseMonitorError::Config(_))));
    }

    #[test]
    fn test_unknown_gain_rejected() {
        let result = Config::from_toml("[hardware]\ngain = \"3.3V\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_server_url_when_enabled() {
        let mut config = create_valid_config();
        config.telemetry.server_url = None;
        assert!(config.validate().is_err());

        config.telemetry.server_url = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_server_url_when_disabled() {
        let mut config = create_valid_config();
        config.telemetry.enabled = false;
        config.telemetry.server_url = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_url_scheme() {
        let mut config = create_valid_config();
        config.telemetry.server_url = Some("ftp://example.com".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_adc_channel_out_of_range() {
        let mut config = create_valid_config();
        config.hardware.adc_channel = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_pins() {
        let mut config = create_valid_config();
        config.hardware.enable_pins = [7, 8, 6, 27];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cycle_period_zero() {
        let mut config = create_valid_config();
        config.sampling.cycle_period_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_read_settle_too_high() {
        let mut config = create_valid_config();
        config.sampling.read_settle_ms = 1001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_csv_path() {
        let mut config = create_valid_config();
        config.csv.file_path = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_file_size_zero() {
        let mut config = create_valid_config();
        config.csv.max_file_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_out_of_range() {
        let mut config = create_valid_config();
        config.telemetry.timeout_s = 0;
        assert!(config.validate().is_err());

        config.telemetry.timeout_s = 301;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_capacity_zero() {
        let mut config = create_valid_config();
        config.telemetry.buffer_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replay_batch_zero() {
        let mut config = create_valid_config();
        config.telemetry.replay_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_level() {
        let mut config = create_valid_config();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_sysfs_paths() {
        let mut config = create_valid_config();
        config.hardware.gpio_base = String::new();
        assert!(config.validate().is_ok(), "simulated backend ignores sysfs paths");

        config.hardware.backend = Backend::Sysfs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_config_file_parses() {
        let contents = include_str!("../config/default.toml");
        let config: Config = toml::from_str(contents).unwrap();
        assert_eq!(config.hardware.select_pins, [27, 17, 24, 23]);
        assert_eq!(config.hardware.enable_pins, [7, 8, 6, 13]);
    }
}
