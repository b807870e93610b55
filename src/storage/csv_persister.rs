//! # CSV Persister
//!
//! Appends one row per [`Frame`] to a CSV file and rotates the file by size.
//!
//! ## File layout
//!
//! ```text
//! timestamp,fuse 1,fuse 2,...,fuse 64
//! 2024-03-01T12:30:05.000000,4.9500,4.9500,...,0.0000
//! ```
//!
//! ## Rotation
//!
//! Once the running size estimate reaches `max_file_size` the current file is
//! flushed, renamed to `<base>.<N>.csv` and a fresh file with the header is
//! opened. `N` starts at 1 and continues from the highest rotated file found
//! on disk, so rotated files are never overwritten.
//!
//! All file operations run on the blocking pool behind one lock: a row is
//! either fully in the old file or fully in the new one.
//!
//! ## Faults
//!
//! Each row is encoded in memory and written with a single `write_all`
//! straight to the file. A failed write is cut back with `set_len`, so a
//! torn row never reaches disk and the size estimate stays exact. If the
//! handle itself is lost (failed truncate, or a rotation that could not
//! reopen the file) the next write reopens the file and, if it is empty,
//! writes the header first. Only `close()` makes later writes fail.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::Disks;
use tracing::{debug, error, info, warn};

use crate::error::{FuseMonitorError, Result};
use crate::mux::address::TOTAL_FUSES;
use crate::sampling::Frame;

/// Default rotation threshold (50MB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Default bytes written between forced flushes to disk
pub const DEFAULT_FLUSH_INTERVAL: u64 = 1024;

/// How often free disk space is looked up again
const DISK_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Timestamp column name
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Column name for a fuse, e.g. `"fuse 12"`
#[must_use]
pub fn fuse_column(fuse_id: u8) -> String {
    format!("fuse {}", fuse_id)
}

/// Header row for a 64-fuse file
#[must_use]
pub fn fuse_headers() -> Vec<String> {
    std::iter::once(TIMESTAMP_COLUMN.to_string())
        .chain((1..=TOTAL_FUSES).map(fuse_column))
        .collect()
}

/// Path of rotated file number `n` for `base`: `data/fuse_data.csv` -> `data/fuse_data.<n>.csv`
#[must_use]
pub fn rotated_path(base: &Path, n: u64) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{}.{}.csv", stem, n))
}

/// Persister settings
#[derive(Debug, Clone, Copy)]
pub struct CsvOptions {
    pub max_file_size: u64,
    pub flush_interval: u64,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// File statistics, as reported in status
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CsvStatus {
    pub path: String,
    pub open: bool,
    pub size_bytes: u64,
    pub max_file_size: u64,
    pub rotation_count: u64,
    pub rows_written: u64,
    pub write_errors: u64,
    pub last_error: Option<String>,
    /// Filesystem holding the file; `None` until the first successful lookup
    pub disk_total_bytes: Option<u64>,
    pub disk_free_bytes: Option<u64>,
    pub disk_used_percent: Option<f64>,
}

/// Lock-free mirror of the file state so status never waits on disk I/O
#[derive(Debug, Default)]
struct Counters {
    open: AtomicBool,
    size: AtomicU64,
    rotations: AtomicU64,
    rows: AtomicU64,
    write_errors: AtomicU64,
    last_error: Mutex<Option<String>>,
    disk: Mutex<Option<DiskUsage>>,
}

/// Capacity of the filesystem holding the CSV file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskUsage {
    /// Percentage of the filesystem in use
    #[must_use]
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.total_bytes - self.free_bytes.min(self.total_bytes)) as f64 * 100.0
            / self.total_bytes as f64
    }
}

/// Space on the filesystem holding `path`, matched by the longest mount point
pub fn disk_usage(path: &Path) -> Option<DiskUsage> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let dir = dir.canonicalize().ok()?;

    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| dir.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| DiskUsage {
            total_bytes: disk.total_space(),
            free_bytes: disk.available_space(),
        })
}

/// The file itself; only touched while holding the write lock
struct CsvFile {
    path: PathBuf,
    /// `None` after `close()`, or after a failure lost the handle
    file: Option<File>,
    closed: bool,
    headers: Vec<String>,
    size: u64,
    unflushed: u64,
    rotation_count: u64,
    options: CsvOptions,
    disk: Option<DiskUsage>,
    disk_checked: Option<Instant>,
}

fn open_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// One CSV record as it lands on disk
fn encode_record(fields: &[String]) -> Result<Vec<u8>> {
    let mut encoder = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    encoder.write_record(fields)?;
    encoder
        .into_inner()
        .map_err(|e| FuseMonitorError::Io(e.into_error()))
}

/// Highest `N` among existing `<base>.<N>.csv` files
fn last_rotation(base: &Path) -> u64 {
    let Some(stem) = base.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
        return 0;
    };
    let dir = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return 0;
    };

    let prefix = format!("{}.", stem);
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_prefix(&prefix)?
                .strip_suffix(".csv")?
                .parse::<u64>()
                .ok()
        })
        .max()
        .unwrap_or(0)
}

impl CsvFile {
    fn open(path: PathBuf, options: CsvOptions) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
            debug!("Ensured directory exists: {}", parent.display());
        }

        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let file = open_file(&path)?;
        let rotation_count = last_rotation(&path);

        let mut csv_file = Self {
            path,
            file: Some(file),
            closed: false,
            headers: Vec::new(),
            size,
            unflushed: 0,
            rotation_count,
            options,
            disk: None,
            disk_checked: None,
        };
        csv_file.refresh_disk();
        Ok(csv_file)
    }

    /// The open handle, reopening the file if a failure dropped it
    fn file(&mut self) -> Result<&mut File> {
        if self.closed {
            return Err(FuseMonitorError::InvalidState("CSV file is not open".into()));
        }
        if self.file.is_none() {
            self.reopen()?;
        }
        self.file
            .as_mut()
            .ok_or_else(|| FuseMonitorError::InvalidState("CSV file is not open".into()))
    }

    fn reopen(&mut self) -> Result<()> {
        let file = open_file(&self.path)?;
        self.size = file.metadata()?.len();
        self.unflushed = 0;
        self.file = Some(file);
        info!("Reopened CSV file {}", self.path.display());

        if self.size == 0 && !self.headers.is_empty() {
            self.write_header_row()?;
        }
        Ok(())
    }

    fn stored_headers(&self) -> Result<Vec<String>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&self.path)?;
        let mut record = csv::StringRecord::new();
        reader.read_record(&mut record)?;
        Ok(record.iter().map(|field| field.trim().to_string()).collect())
    }

    fn write_header(&mut self, headers: &[String]) -> Result<()> {
        if self.size > 0 {
            let stored = self.stored_headers().unwrap_or_default();
            if headers.iter().all(|h| stored.contains(h)) {
                info!(
                    "Reusing header of existing CSV file {} ({:.1}KB)",
                    self.path.display(),
                    self.size as f64 / 1024.0
                );
                self.headers = stored;
                return Ok(());
            }

            warn!(
                "Existing CSV file {} has an incompatible header, rotating it aside",
                self.path.display()
            );
            self.headers = headers.to_vec();
            return self.rotate();
        }

        self.headers = headers.to_vec();
        self.write_header_row()
    }

    fn write_header_row(&mut self) -> Result<()> {
        let bytes = encode_record(&self.headers)?;
        self.write_bytes(&bytes)?;
        self.sync()?;
        debug!("CSV header written ({} columns)", self.headers.len());
        Ok(())
    }

    /// Write one whole record; on failure the file is cut back to its previous length
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self.file()?;
        let before = file.metadata()?.len();

        if let Err(e) = file.write_all(bytes) {
            self.discard_partial(before);
            return Err(e.into());
        }

        self.size = before + bytes.len() as u64;
        self.unflushed += bytes.len() as u64;
        Ok(())
    }

    fn discard_partial(&mut self, len: u64) {
        let truncated = self.file.as_ref().map(|file| file.set_len(len));
        match truncated {
            Some(Ok(())) => {
                self.size = len;
                debug!("Discarded partial CSV row");
            }
            Some(Err(e)) => {
                error!("Failed to discard partial CSV row, reopening on next write: {}", e);
                self.file = None;
            }
            None => {}
        }
    }

    fn row_for(&self, frame: &Frame) -> Vec<String> {
        self.headers
            .iter()
            .map(|column| {
                if column == TIMESTAMP_COLUMN {
                    return frame.timestamp_string();
                }
                column
                    .strip_prefix("fuse ")
                    .and_then(|id| id.parse::<u8>().ok())
                    .and_then(|id| frame.voltage(id))
                    .map(|volts| format!("{:.4}", volts))
                    .unwrap_or_default()
            })
            .collect()
    }

    fn append(&mut self, frame: &Frame) -> Result<()> {
        if self.headers.is_empty() {
            return Err(FuseMonitorError::InvalidState("CSV headers not set".into()));
        }

        let row = encode_record(&self.row_for(frame))?;
        self.write_bytes(&row)?;

        if self.unflushed >= self.options.flush_interval {
            self.sync()?;
        }

        if self.size >= self.options.max_file_size {
            self.rotate()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file()?.sync_data()?;
        self.unflushed = 0;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        info!(
            "Rotating CSV file (size: {:.1}MB)",
            self.size as f64 / 1024.0 / 1024.0
        );

        if let Some(file) = &self.file {
            file.sync_all()?;
        }

        let next = self.rotation_count + 1;
        let rotated = rotated_path(&self.path, next);
        if let Err(e) = std::fs::rename(&self.path, &rotated) {
            // Keep appending to the oversized file rather than losing rows
            error!("Failed to rotate CSV file to {}: {}", rotated.display(), e);
            return Err(e.into());
        }
        self.rotation_count = next;
        info!("Rotated file to: {}", rotated.display());

        // The handle now points at the rotated file
        self.file = None;
        self.size = 0;
        self.unflushed = 0;
        self.refresh_disk();
        self.reopen()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let synced = match &self.file {
            Some(file) => file.sync_data(),
            None => Ok(()),
        };
        self.file = None;
        self.closed = true;
        info!("Closed CSV file {}", self.path.display());
        synced.map_err(Into::into)
    }

    fn refresh_disk(&mut self) {
        if let Some(usage) = disk_usage(&self.path) {
            self.disk = Some(usage);
        }
        self.disk_checked = Some(Instant::now());
    }

    fn refresh_disk_if_stale(&mut self) {
        let stale = self
            .disk_checked
            .map_or(true, |checked| checked.elapsed() >= DISK_REFRESH_INTERVAL);
        if stale {
            self.refresh_disk();
        }
    }

    fn publish(&self, counters: &Counters) {
        counters.open.store(self.file.is_some(), Ordering::Relaxed);
        counters.size.store(self.size, Ordering::Relaxed);
        counters
            .rotations
            .store(self.rotation_count, Ordering::Relaxed);
        *counters.disk.lock().unwrap_or_else(PoisonError::into_inner) = self.disk;
    }
}

/// Size-rotated CSV log of sweeps
pub struct CsvPersister {
    file: Arc<Mutex<CsvFile>>,
    counters: Arc<Counters>,
    path: PathBuf,
    max_file_size: u64,
}

impl std::fmt::Debug for CsvPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvPersister")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl CsvPersister {
    /// Create parent directories and open `path` for appending
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or the file cannot be opened
    pub fn open<P: AsRef<Path>>(path: P, options: CsvOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!(
            "Initializing CSV logger: {} (max {:.1}MB)",
            path.display(),
            options.max_file_size as f64 / 1024.0 / 1024.0
        );

        let file = CsvFile::open(path.clone(), options)?;
        if file.size > 0 {
            info!("Existing CSV file size: {:.1}KB", file.size as f64 / 1024.0);
        }

        let counters = Arc::new(Counters::default());
        file.publish(&counters);

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            counters,
            path,
            max_file_size: options.max_file_size,
        })
    }

    /// Run `op` on the file under the write lock on the blocking pool
    async fn with_file<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut CsvFile) -> Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        let counters = Arc::clone(&self.counters);

        let joined = tokio::task::spawn_blocking(move || {
            let mut guard: MutexGuard<'_, CsvFile> =
                file.lock().unwrap_or_else(PoisonError::into_inner);
            let result = op(&mut *guard);
            guard.refresh_disk_if_stale();
            guard.publish(&counters);
            result
        })
        .await;

        let result = joined.unwrap_or_else(|e| {
            Err(FuseMonitorError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("CSV task failed: {}", e),
            )))
        });

        if let Err(e) = &result {
            self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
            *self
                .counters
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
        }
        result
    }

    /// Set the column layout
    ///
    /// Writes `headers` if the file is empty. A non-empty file keeps its
    /// stored column order as long as it contains every requested column;
    /// otherwise it is rotated aside and a fresh file is started.
    ///
    /// # Errors
    ///
    /// Returns error if the header cannot be written or the file rotated
    pub async fn write_header(&self, headers: Vec<String>) -> Result<()> {
        self.with_file(move |file| file.write_header(&headers)).await
    }

    /// Append one row for `frame`, rotating afterwards if the size limit is reached
    ///
    /// # Errors
    ///
    /// Returns error if the write, flush or rotation fails. The lock is
    /// released either way, so later appends are attempted normally.
    pub async fn append(&self, frame: &Frame) -> Result<()> {
        let frame = frame.clone();
        let result = self.with_file(move |file| file.append(&frame)).await;

        match &result {
            Ok(()) => {
                self.counters.rows.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => error!("Failed to log fuse readings to CSV: {}", e),
        }
        result
    }

    /// Confirm the file is open and accepts a flush to disk
    ///
    /// # Errors
    ///
    /// Returns error if the file is closed, read-only, or cannot be synced
    pub async fn check_writable(&self) -> Result<()> {
        self.with_file(|file| {
            let metadata = std::fs::metadata(&file.path)?;
            if metadata.permissions().readonly() {
                return Err(FuseMonitorError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!("{} is read-only", file.path.display()),
                )));
            }
            file.sync()
        })
        .await
    }

    /// Flush and close the file; later appends fail
    ///
    /// # Errors
    ///
    /// Returns error if the final flush fails
    pub async fn close(&self) -> Result<()> {
        self.with_file(CsvFile::close).await
    }

    /// Current file statistics
    pub fn status(&self) -> CsvStatus {
        let disk = *self
            .counters
            .disk
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        CsvStatus {
            path: self.path.display().to_string(),
            open: self.counters.open.load(Ordering::Relaxed),
            size_bytes: self.counters.size.load(Ordering::Relaxed),
            max_file_size: self.max_file_size,
            rotation_count: self.counters.rotations.load(Ordering::Relaxed),
            rows_written: self.counters.rows.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
            last_error: self
                .counters
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            disk_total_bytes: disk.map(|usage| usage.total_bytes),
            disk_free_bytes: disk.map(|usage| usage.free_bytes),
            disk_used_percent: disk.map(|usage| usage.used_percent()),
        }
    }

    /// Path of the active file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use tempfile::TempDir;

    fn frame(sequence: u64, volts: f64) -> Frame {
        let timestamp = Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        Frame::uniform(sequence, timestamp, volts)
    }

    fn lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    async fn persister(dir: &TempDir, options: CsvOptions) -> CsvPersister {
        let persister = CsvPersister::open(dir.path().join("data/fuse_data.csv"), options).unwrap();
        persister.write_header(fuse_headers()).await.unwrap();
        persister
    }

    #[test]
    fn test_fuse_headers() {
        let headers = fuse_headers();
        assert_eq!(headers.len(), 65);
        assert_eq!(headers[0], "timestamp");
        assert_eq!(headers[1], "fuse 1");
        assert_eq!(headers[64], "fuse 64");
    }

    #[test]
    fn test_rotated_path() {
        let base = Path::new("/data/fuse_data.csv");
        assert_eq!(rotated_path(base, 1), PathBuf::from("/data/fuse_data.1.csv"));
        assert_eq!(rotated_path(base, 12), PathBuf::from("/data/fuse_data.12.csv"));
    }

    #[tokio::test]
    async fn test_open_creates_directories_and_header() {
        let dir = TempDir::new().unwrap();
        let persister = persister(&dir, CsvOptions::default()).await;

        let path = dir.path().join("data/fuse_data.csv");
        assert!(path.exists());
        let content = lines(&path);
        assert_eq!(content.len(), 1);
        assert!(content[0].starts_with("timestamp,fuse 1,fuse 2,"));
        assert!(content[0].ends_with(",fuse 64"));

        let status = persister.status();
        assert!(status.open);
        assert_eq!(status.size_bytes, std::fs::metadata(&path).unwrap().len());
    }

    #[tokio::test]
    async fn test_append_formats_row() {
        let dir = TempDir::new().unwrap();
        let persister = persister(&dir, CsvOptions::default()).await;

        let mut frame = frame(1, 4.95);
        frame.record(2, 0.123456);
        frame.record_failure(3);
        persister.append(&frame).await.unwrap();
        persister.close().await.unwrap();

        let content = lines(&dir.path().join("data/fuse_data.csv"));
        assert_eq!(content.len(), 2);
        let fields: Vec<&str> = content[1].split(',').collect();
        assert_eq!(fields.len(), 65);
        assert_eq!(fields[0], "2024-03-01T12:30:05.000000");
        assert_eq!(fields[1], "4.9500");
        assert_eq!(fields[2], "0.1235");
        assert_eq!(fields[3], "0.0000");

        // Size estimate matches the bytes on disk
        assert_eq!(
            persister.status().size_bytes,
            std::fs::metadata(dir.path().join("data/fuse_data.csv")).unwrap().len()
        );
    }

    #[tokio::test]
    async fn test_existing_file_keeps_header_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data/fuse_data.csv");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        // Stored order puts fuse 64 first
        let mut stored = fuse_headers();
        stored.swap(1, 64);
        std::fs::write(&path, format!("{}\n", stored.join(","))).unwrap();

        let persister = CsvPersister::open(&path, CsvOptions::default()).unwrap();
        persister.write_header(fuse_headers()).await.unwrap();

        let mut frame = frame(1, 1.0);
        frame.record(64, 2.5);
        persister.append(&frame).await.unwrap();
        persister.close().await.unwrap();

        let content = lines(&path);
        assert_eq!(content.len(), 2, "header must not be rewritten");
        assert_eq!(content[0], stored.join(","));
        let fields: Vec<&str> = content[1].split(',').collect();
        assert_eq!(fields[1], "2.5000");
        assert_eq!(fields[64], "1.0000");
    }

    #[tokio::test]
    async fn test_incompatible_existing_file_is_rotated_aside() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fuse_data.csv");
        std::fs::write(&path, "time,value\n1,2\n").unwrap();

        let persister = CsvPersister::open(&path, CsvOptions::default()).unwrap();
        persister.write_header(fuse_headers()).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("fuse_data.1.csv")).unwrap(),
            "time,value\n1,2\n"
        );
        assert_eq!(lines(&path), vec![fuse_headers().join(",")]);
        assert_eq!(persister.status().rotation_count, 1);
    }

    #[tokio::test]
    async fn test_rotation_at_size_limit() {
        let dir = TempDir::new().unwrap();
        let options = CsvOptions {
            max_file_size: 1024,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        };
        let persister = persister(&dir, options).await;

        let mut written = 0u64;
        while persister.status().rotation_count == 0 {
            written += 1;
            assert!(written < 100, "rotation never happened");
            persister.append(&frame(written, written as f64)).await.unwrap();
        }
        persister.close().await.unwrap();

        assert_eq!(persister.status().rotation_count, 1);

        let header = fuse_headers().join(",");
        let rotated = lines(&dir.path().join("data/fuse_data.1.csv"));
        let current = lines(&dir.path().join("data/fuse_data.csv"));

        // Old file: header + every row written before the crossing
        assert_eq!(rotated[0], header);
        assert_eq!(rotated.len() as u64, written + 1);
        for (i, row) in rotated[1..].iter().enumerate() {
            let expected = format!("{:.4}", (i + 1) as f64);
            assert_eq!(row.split(',').nth(1), Some(expected.as_str()));
        }

        // New file: fresh header only
        assert_eq!(current, vec![header]);
        assert!(!dir.path().join("data/fuse_data.2.csv").exists());
    }

    #[tokio::test]
    async fn test_rotation_counter_resumes_from_disk() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/fuse_data.1.csv"), "old\n").unwrap();
        std::fs::write(dir.path().join("data/fuse_data.3.csv"), "older\n").unwrap();

        let options = CsvOptions {
            max_file_size: 1024,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        };
        let persister = persister(&dir, options).await;
        assert_eq!(persister.status().rotation_count, 3);

        while persister.status().rotation_count == 3 {
            persister.append(&frame(1, 1.0)).await.unwrap();
        }

        assert!(dir.path().join("data/fuse_data.4.csv").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("data/fuse_data.3.csv")).unwrap(),
            "older\n"
        );
    }

    #[tokio::test]
    async fn test_append_without_header_fails() {
        let dir = TempDir::new().unwrap();
        let persister =
            CsvPersister::open(dir.path().join("fuse_data.csv"), CsvOptions::default()).unwrap();

        let result = persister.append(&frame(1, 1.0)).await;
        assert!(matches!(result, Err(FuseMonitorError::InvalidState(_))));
        assert_eq!(persister.status().write_errors, 1);
        assert!(persister.status().last_error.is_some());
    }

    #[tokio::test]
    async fn test_append_after_close_fails_without_blocking() {
        let dir = TempDir::new().unwrap();
        let persister = persister(&dir, CsvOptions::default()).await;
        persister.close().await.unwrap();
        assert!(!persister.status().open);

        assert!(persister.append(&frame(1, 1.0)).await.is_err());
        // The lock was released: a second attempt gets the same answer
        assert!(persister.append(&frame(2, 1.0)).await.is_err());
        assert_eq!(persister.status().write_errors, 2);
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_tear_rows() {
        let dir = TempDir::new().unwrap();
        let options = CsvOptions {
            max_file_size: 4096,
            flush_interval: 512,
        };
        let persister = Arc::new(persister(&dir, options).await);

        let mut handles = Vec::new();
        for task in 0..4u64 {
            let persister = Arc::clone(&persister);
            handles.push(tokio::spawn(async move {
                for i in 0..10u64 {
                    persister.append(&frame(task * 10 + i, 1.0)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        persister.close().await.unwrap();

        let mut rows = 0;
        let mut files = vec![dir.path().join("data/fuse_data.csv")];
        for n in 1..=persister.status().rotation_count {
            files.push(rotated_path(&dir.path().join("data/fuse_data.csv"), n));
        }
        for file in files {
            let content = lines(&file);
            assert_eq!(content[0], fuse_headers().join(","));
            for row in &content[1..] {
                assert_eq!(row.split(',').count(), 65);
                rows += 1;
            }
        }
        assert_eq!(rows, 40);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_partial_row() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data/fuse_data.csv");
        let persister = persister(&dir, CsvOptions::default()).await;
        persister.append(&frame(1, 1.0)).await.unwrap();

        // A read-only handle refuses the write and the truncate
        persister.file.lock().unwrap().file = Some(File::open(&path).unwrap());
        assert!(persister.append(&frame(2, 2.0)).await.is_err());
        assert_eq!(persister.status().write_errors, 1);

        persister.append(&frame(3, 3.0)).await.unwrap();
        persister.close().await.unwrap();

        let content = lines(&path);
        assert_eq!(content.len(), 3);
        assert_eq!(content[1].split(',').nth(1), Some("1.0000"));
        assert_eq!(content[2].split(',').nth(1), Some("3.0000"));
        assert_eq!(
            persister.status().size_bytes,
            std::fs::metadata(&path).unwrap().len()
        );
        assert_eq!(persister.status().rows_written, 2);
    }

    #[tokio::test]
    async fn test_lost_handle_is_reopened_with_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data/fuse_data.csv");
        let persister = persister(&dir, CsvOptions::default()).await;

        {
            let mut file = persister.file.lock().unwrap();
            file.file = None;
        }
        std::fs::remove_file(&path).unwrap();

        persister.append(&frame(1, 1.5)).await.unwrap();
        assert!(persister.status().open);

        let content = lines(&path);
        assert_eq!(content.len(), 2);
        assert_eq!(content[0], fuse_headers().join(","));
        assert_eq!(content[1].split(',').nth(1), Some("1.5000"));
    }

    #[tokio::test]
    async fn test_failed_rotation_keeps_rows_and_retries() {
        let dir = TempDir::new().unwrap();
        let options = CsvOptions {
            max_file_size: 1024,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        };
        let persister = persister(&dir, options).await;

        // Something already occupies the first rotation target
        let blocker = dir.path().join("data/fuse_data.1.csv");
        std::fs::create_dir_all(blocker.join("keep")).unwrap();

        // Header 513 bytes + two 475-byte rows crosses 1024
        persister.append(&frame(1, 1.0)).await.unwrap();
        assert!(persister.append(&frame(2, 2.0)).await.is_err());

        let status = persister.status();
        assert_eq!(status.rotation_count, 0);
        assert_eq!(status.write_errors, 1);
        assert!(status.open);
        assert_eq!(lines(&dir.path().join("data/fuse_data.csv")).len(), 3);

        std::fs::remove_dir_all(&blocker).unwrap();
        persister.append(&frame(3, 3.0)).await.unwrap();
        persister.close().await.unwrap();

        assert_eq!(persister.status().rotation_count, 1);
        let rotated = lines(&blocker);
        assert_eq!(rotated.len(), 4);
        assert_eq!(rotated[3].split(',').nth(1), Some("3.0000"));
        assert_eq!(
            lines(&dir.path().join("data/fuse_data.csv")),
            vec![fuse_headers().join(",")]
        );
    }

    #[test]
    fn test_disk_used_percent() {
        let usage = DiskUsage {
            total_bytes: 1000,
            free_bytes: 250,
        };
        assert!((usage.used_percent() - 75.0).abs() < 1e-9);

        let empty = DiskUsage {
            total_bytes: 0,
            free_bytes: 0,
        };
        assert_eq!(empty.used_percent(), 0.0);
    }

    #[tokio::test]
    async fn test_status_reports_disk_space() {
        let dir = TempDir::new().unwrap();
        let persister = persister(&dir, CsvOptions::default()).await;
        let status = persister.status();

        // Containers may not expose any mount, in which case nothing is reported
        match disk_usage(persister.path()) {
            Some(_) => {
                let total = status.disk_total_bytes.unwrap();
                let free = status.disk_free_bytes.unwrap();
                assert!(free <= total);
                assert!((0.0..=100.0).contains(&status.disk_used_percent.unwrap()));
            }
            None => assert!(status.disk_total_bytes.is_none()),
        }
    }

    #[tokio::test]
    async fn test_check_writable() {
        let dir = TempDir::new().unwrap();
        let persister = persister(&dir, CsvOptions::default()).await;
        assert!(persister.check_writable().await.is_ok());

        persister.close().await.unwrap();
        assert!(persister.check_writable().await.is_err());
    }
}
