//! # Frame
//!
//! One complete 64-fuse sweep.
//!
//! A fuse whose read failed holds `0.0` so the CSV and JSON layouts stay
//! fixed, and is also flagged invalid so consumers that care can tell a
//! failed read from a real 0V reading.

use chrono::{DateTime, Local};

use crate::mux::address::TOTAL_FUSES;

/// Timestamp layout used in CSV rows and telemetry payloads
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Voltage recorded for a fuse whose read failed
pub const FAILED_READING: f64 = 0.0;

/// Voltages for all 64 fuses from one sweep
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    sequence: u64,
    timestamp: DateTime<Local>,
    voltages: [f64; TOTAL_FUSES as usize],
    /// Bit `fuse_id - 1` set when that read failed
    failed: u64,
}

impl Frame {
    /// Empty frame with every fuse at 0.0 and valid
    #[must_use]
    pub fn new(sequence: u64, timestamp: DateTime<Local>) -> Self {
        Self {
            sequence,
            timestamp,
            voltages: [FAILED_READING; TOTAL_FUSES as usize],
            failed: 0,
        }
    }

    /// Frame with every fuse at `volts`, handy for tests and fixtures
    #[must_use]
    pub fn uniform(sequence: u64, timestamp: DateTime<Local>, volts: f64) -> Self {
        let mut frame = Self::new(sequence, timestamp);
        frame.voltages = [volts; TOTAL_FUSES as usize];
        frame
    }

    /// Store a successful reading for `fuse_id` (1-64); out-of-range ids are ignored
    pub fn record(&mut self, fuse_id: u8, volts: f64) {
        if let Some(index) = index(fuse_id) {
            self.voltages[index] = volts;
            self.failed &= !(1u64 << index);
        }
    }

    /// Mark `fuse_id` (1-64) as failed and store the placeholder value
    pub fn record_failure(&mut self, fuse_id: u8) {
        if let Some(index) = index(fuse_id) {
            self.voltages[index] = FAILED_READING;
            self.failed |= 1u64 << index;
        }
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Monotonic sweep number
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When the sweep started
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Timestamp formatted as in CSV rows and payloads
    #[must_use]
    pub fn timestamp_string(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Voltage for `fuse_id`, `None` if the id is out of range
    #[must_use]
    pub fn voltage(&self, fuse_id: u8) -> Option<f64> {
        index(fuse_id).map(|i| self.voltages[i])
    }

    /// Whether the read of `fuse_id` succeeded
    #[must_use]
    pub fn is_valid(&self, fuse_id: u8) -> bool {
        index(fuse_id).is_some_and(|i| self.failed & (1u64 << i) == 0)
    }

    /// Number of failed reads in this sweep
    #[must_use]
    pub fn failed_count(&self) -> u32 {
        self.failed.count_ones()
    }

    /// Fuse ids whose read failed, ascending
    pub fn failed_fuses(&self) -> Vec<u8> {
        (1..=TOTAL_FUSES).filter(|&id| !self.is_valid(id)).collect()
    }

    /// `(fuse_id, volts)` for all 64 fuses in ascending order
    pub fn readings(&self) -> impl Iterator<Item = (u8, f64)> + '_ {
        self.voltages
            .iter()
            .enumerate()
            .map(|(i, &volts)| (i as u8 + 1, volts))
    }
}

fn index(fuse_id: u8) -> Option<usize> {
    (1..=TOTAL_FUSES)
        .contains(&fuse_id)
        .then(|| (fuse_id - 1) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn timestamp() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap()
    }

    #[test]
    fn test_new_frame_covers_all_fuses() {
        let frame = Frame::new(1, timestamp());
        assert_eq!(frame.readings().count(), 64);
        assert_eq!(frame.failed_count(), 0);
        assert!(frame.is_valid(1));
        assert!(frame.is_valid(64));
    }

    #[test]
    fn test_failed_reading_is_flagged() {
        let mut frame = Frame::uniform(1, timestamp(), 4.9);
        frame.record_failure(37);

        assert_eq!(frame.voltage(37), Some(0.0));
        assert!(!frame.is_valid(37));
        assert!(frame.is_valid(36));
        assert_eq!(frame.failed_count(), 1);
        assert_eq!(frame.failed_fuses(), vec![37]);

        // A later good read clears the flag
        frame.record(37, 4.8);
        assert!(frame.is_valid(37));
        assert_eq!(frame.voltage(37), Some(4.8));
    }

    #[test]
    fn test_true_zero_stays_valid() {
        let mut frame = Frame::new(1, timestamp());
        frame.record(5, 0.0);
        assert!(frame.is_valid(5));
        assert_eq!(frame.failed_count(), 0);
    }

    #[test]
    fn test_out_of_range_ids() {
        let mut frame = Frame::new(1, timestamp());
        frame.record(0, 1.0);
        frame.record_failure(65);

        assert_eq!(frame.voltage(0), None);
        assert_eq!(frame.voltage(65), None);
        assert!(!frame.is_valid(65));
        assert_eq!(frame.failed_count(), 0);
    }

    #[test]
    fn test_timestamp_format() {
        let frame = Frame::new(1, timestamp());
        assert_eq!(frame.timestamp_string(), "2024-03-01T12:30:05.000000");
    }
}
