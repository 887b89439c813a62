//! Durable storage for attendance records.
//!
//! The ledger owns all record mutation; a store only loads and saves full
//! snapshots. [`CsvStore`] is the on-disk table, [`MemoryStore`] keeps the
//! snapshot in memory.

use crate::ledger::AttendanceRecord;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Calendar date column format.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Timestamp column format: ISO-8601 local wall-clock time, second precision.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("CSV error on {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("malformed attendance row at {path}:{line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: u64,
        reason: String,
    },
}

/// Load/save interface for the attendance table.
pub trait LedgerStore {
    /// Read every persisted record. A missing table is an empty table.
    fn load(&mut self) -> Result<Vec<AttendanceRecord>, StoreError>;

    /// Replace the persisted table with `records`.
    fn save(&mut self, records: &[AttendanceRecord]) -> Result<(), StoreError>;
}

impl<S: LedgerStore + ?Sized> LedgerStore for Box<S> {
    fn load(&mut self) -> Result<Vec<AttendanceRecord>, StoreError> {
        (**self).load()
    }

    fn save(&mut self, records: &[AttendanceRecord]) -> Result<(), StoreError> {
        (**self).save(records)
    }
}

/// One CSV row. Tables written by older tooling name the identity column
/// `name`; it is accepted on read.
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    #[serde(alias = "name")]
    identity: String,
    date: String,
    first_seen: String,
    last_seen: String,
}

impl From<&AttendanceRecord> for CsvRow {
    fn from(record: &AttendanceRecord) -> Self {
        Self {
            identity: record.identity.clone(),
            date: record.date.format(DATE_FORMAT).to_string(),
            first_seen: record.first_seen.format(TIME_FORMAT).to_string(),
            last_seen: record.last_seen.format(TIME_FORMAT).to_string(),
        }
    }
}

impl CsvRow {
    fn into_record(self) -> Result<AttendanceRecord, String> {
        let identity = self.identity.trim().to_string();
        if identity.is_empty() {
            return Err("empty identity".into());
        }
        let date = NaiveDate::parse_from_str(self.date.trim(), DATE_FORMAT)
            .map_err(|e| format!("date {:?}: {e}", self.date))?;
        let first_seen = parse_time(&self.first_seen)?;
        let last_seen = parse_time(&self.last_seen)?;
        if first_seen.date() != date || last_seen.date() != date {
            return Err(format!("timestamps do not fall on {date}"));
        }
        Ok(AttendanceRecord {
            identity,
            date,
            first_seen,
            last_seen,
        })
    }
}

/// Parse a timestamp column, tolerating fractional seconds.
fn parse_time(value: &str) -> Result<NaiveDateTime, String> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|e| format!("timestamp {value:?}: {e}"))
}

/// Attendance table stored as a CSV file with columns
/// `identity,date,first_seen,last_seen`.
///
/// Saves write a sibling temporary file and rename it over the target, so a
/// reader never observes a half-written table.
#[derive(Debug, Clone)]
pub struct CsvStore {
    path: PathBuf,
}

impl CsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "attendance.csv".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn csv_err(&self, source: csv::Error) -> StoreError {
        StoreError::Csv {
            path: self.path.clone(),
            source,
        }
    }
}

impl LedgerStore for CsvStore {
    fn load(&mut self) -> Result<Vec<AttendanceRecord>, StoreError> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no attendance table yet");
            return Ok(Vec::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|e| self.csv_err(e))?;

        let headers = reader.headers().map_err(|e| self.csv_err(e))?.clone();
        let mut raw = csv::StringRecord::new();
        let mut records = Vec::new();

        while reader.read_record(&mut raw).map_err(|e| self.csv_err(e))? {
            let line = raw.position().map(|p| p.line()).unwrap_or_default();
            let malformed = |reason: String| StoreError::Malformed {
                path: self.path.clone(),
                line,
                reason,
            };
            let row: CsvRow = raw
                .deserialize(Some(&headers))
                .map_err(|e| malformed(e.to_string()))?;
            records.push(row.into_record().map_err(malformed)?);
        }

        tracing::debug!(path = %self.path.display(), rows = records.len(), "attendance table loaded");
        Ok(records)
    }

    fn save(&mut self, records: &[AttendanceRecord]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        let tmp = self.temp_path();
        let mut writer = csv::Writer::from_path(&tmp).map_err(|e| self.csv_err(e))?;
        if records.is_empty() {
            writer
                .write_record(["identity", "date", "first_seen", "last_seen"])
                .map_err(|e| self.csv_err(e))?;
        }
        for record in records {
            writer
                .serialize(CsvRow::from(record))
                .map_err(|e| self.csv_err(e))?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| self.io_err(e.into_error()))?;
        file.sync_all().map_err(|e| self.io_err(e))?;
        drop(file);

        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }
}

/// Store that keeps the last saved snapshot in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    rows: Vec<AttendanceRecord>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `rows` already persisted.
    pub fn with_rows(rows: Vec<AttendanceRecord>) -> Self {
        Self { rows, saves: 0 }
    }

    pub fn rows(&self) -> &[AttendanceRecord] {
        &self.rows
    }

    /// Number of successful saves.
    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl LedgerStore for MemoryStore {
    fn load(&mut self) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self.rows.clone())
    }

    fn save(&mut self, records: &[AttendanceRecord]) -> Result<(), StoreError> {
        self.rows = records.to_vec();
        self.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIME_FORMAT).unwrap()
    }

    fn record(identity: &str, first: &str, last: &str) -> AttendanceRecord {
        let first_seen = at(first);
        AttendanceRecord {
            identity: identity.into(),
            date: first_seen.date(),
            first_seen,
            last_seen: at(last),
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvStore::new(dir.path().join("attendance.csv"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_writes_header_and_iso_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/attendance.csv");
        let mut store = CsvStore::new(&path);
        store
            .save(&[record("alice", "2024-03-01T08:59:03", "2024-03-01T17:02:44")])
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "identity,date,first_seen,last_seen\n\
             alice,2024-03-01,2024-03-01T08:59:03,2024-03-01T17:02:44\n"
        );
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_save_empty_table_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        let mut store = CsvStore::new(&path);
        store.save(&[]).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "identity,date,first_seen,last_seen\n"
        );
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvStore::new(dir.path().join("attendance.csv"));
        let records = vec![
            record("alice", "2024-03-01T08:59:03", "2024-03-01T17:02:44"),
            record("O'Brien, Pat", "2024-03-01T09:10:00", "2024-03-01T09:10:00"),
        ];
        store.save(&records).unwrap();
        assert_eq!(store.load().unwrap(), records);
    }

    #[test]
    fn test_load_accepts_legacy_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        std::fs::write(
            &path,
            "date,name,first_seen,last_seen\n2024-03-01,bob,2024-03-01T10:00:00,2024-03-01T11:30:00\n",
        )
        .unwrap();

        let records = CsvStore::new(&path).load().unwrap();
        assert_eq!(
            records,
            vec![record("bob", "2024-03-01T10:00:00", "2024-03-01T11:30:00")]
        );
    }

    #[test]
    fn test_load_rejects_malformed_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        std::fs::write(
            &path,
            "identity,date,first_seen,last_seen\n\
             alice,2024-03-01,2024-03-01T08:00:00,2024-03-01T09:00:00\n\
             bob,2024-03-01,yesterday,2024-03-01T09:00:00\n",
        )
        .unwrap();

        match CsvStore::new(&path).load() {
            Err(StoreError::Malformed { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected malformed row error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_rejects_row_spanning_dates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        std::fs::write(
            &path,
            "identity,date,first_seen,last_seen\n\
             alice,2024-03-01,2024-03-01T23:59:00,2024-03-02T00:01:00\n",
        )
        .unwrap();
        assert!(matches!(
            CsvStore::new(&path).load(),
            Err(StoreError::Malformed { .. })
        ));
    }

    #[test]
    fn test_memory_store_counts_saves() {
        let mut store = MemoryStore::new();
        store
            .save(&[record("alice", "2024-03-01T08:00:00", "2024-03-01T08:00:00")])
            .unwrap();
        assert_eq!(store.saves(), 1);
        assert_eq!(store.load().unwrap().len(), 1);
    }
}
