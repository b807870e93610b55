//! # Storage Module
//!
//! Local persistence of sweeps as size-rotated CSV files.

pub mod csv_persister;

pub use csv_persister::{fuse_headers, CsvOptions, CsvPersister, CsvStatus, DiskUsage};
