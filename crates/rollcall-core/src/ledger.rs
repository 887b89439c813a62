//! Attendance ledger: one record per (identity, calendar date).
//!
//! The ledger is the only writer of attendance records. Every sighting is
//! written through to the store before `record_sighting` returns; when the
//! store fails, memory keeps the update and the next write or `flush`
//! persists the whole snapshot.

use crate::store::{LedgerStore, StoreError};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to load attendance: {0}")]
    Load(#[source] StoreError),
    #[error("failed to persist sighting of {identity} on {date}: {source}")]
    Persist {
        identity: String,
        date: NaiveDate,
        source: StoreError,
    },
    #[error("failed to flush attendance: {0}")]
    Flush(#[source] StoreError),
    #[error("identity must not be empty")]
    EmptyIdentity,
}

/// Per-identity-per-day summary of first and last sighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub identity: String,
    pub date: NaiveDate,
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
}

/// Outcome of one `record_sighting` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    /// True if this sighting opened the record for the day.
    pub created: bool,
    pub record: AttendanceRecord,
}

type RecordKey = (NaiveDate, String);

/// In-memory attendance table backed by a [`LedgerStore`].
pub struct Ledger<S> {
    store: S,
    records: BTreeMap<RecordKey, AttendanceRecord>,
    dirty: bool,
}

impl<S: LedgerStore> Ledger<S> {
    /// Load persisted records and reconcile duplicates.
    ///
    /// Duplicate `(identity, date)` rows are merged into one record spanning
    /// the earliest first sighting and the latest last sighting; the merged
    /// table is rewritten on the next write or flush.
    pub fn open(mut store: S) -> Result<Self, LedgerError> {
        let rows = store.load().map_err(LedgerError::Load)?;
        let row_count = rows.len();
        let mut records: BTreeMap<RecordKey, AttendanceRecord> = BTreeMap::new();
        let mut dirty = false;

        for mut row in rows {
            if row.last_seen < row.first_seen {
                tracing::warn!(identity = %row.identity, date = %row.date, "last_seen precedes first_seen; clamping");
                row.last_seen = row.first_seen;
                dirty = true;
            }
            let key = (row.date, row.identity.clone());
            match records.get_mut(&key) {
                Some(existing) => {
                    tracing::warn!(identity = %row.identity, date = %row.date, "merging duplicate attendance row");
                    existing.first_seen = existing.first_seen.min(row.first_seen);
                    existing.last_seen = existing.last_seen.max(row.last_seen);
                    dirty = true;
                }
                None => {
                    records.insert(key, row);
                }
            }
        }

        tracing::info!(rows = row_count, records = records.len(), "attendance ledger opened");
        Ok(Self {
            store,
            records,
            dirty,
        })
    }

    /// Record that `identity` was seen at `at`.
    ///
    /// Creates the day's record on the first sighting; afterwards only
    /// `last_seen` moves. An out-of-order timestamp earlier than the stored
    /// `last_seen` is clamped: the record is left as it was. Timestamps are
    /// kept at second precision.
    pub fn record_sighting(
        &mut self,
        identity: &str,
        at: NaiveDateTime,
    ) -> Result<Sighting, LedgerError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(LedgerError::EmptyIdentity);
        }

        let at = at.with_nanosecond(0).unwrap_or(at);
        let date = at.date();
        let key = (date, identity.to_string());

        let (created, changed) = match self.records.get_mut(&key) {
            Some(record) if at > record.last_seen => {
                record.last_seen = at;
                (false, true)
            }
            Some(record) => {
                if at < record.last_seen {
                    tracing::debug!(
                        identity,
                        %at,
                        last_seen = %record.last_seen,
                        "out-of-order sighting clamped"
                    );
                }
                (false, false)
            }
            None => {
                self.records.insert(
                    key.clone(),
                    AttendanceRecord {
                        identity: identity.to_string(),
                        date,
                        first_seen: at,
                        last_seen: at,
                    },
                );
                (true, true)
            }
        };

        if changed {
            self.dirty = true;
        }
        if self.dirty {
            self.persist().map_err(|source| LedgerError::Persist {
                identity: identity.to_string(),
                date,
                source,
            })?;
        }

        let record = self.records[&key].clone();
        if created {
            tracing::info!(identity, %date, first_seen = %record.first_seen, "attendance recorded");
        } else {
            tracing::debug!(identity, %date, last_seen = %record.last_seen, "attendance updated");
        }
        Ok(Sighting { created, record })
    }

    /// Write the snapshot if anything is unsaved.
    pub fn flush(&mut self) -> Result<(), LedgerError> {
        if self.dirty {
            self.persist().map_err(LedgerError::Flush)?;
        }
        Ok(())
    }

    /// Flush and hand back the store.
    pub fn close(mut self) -> Result<S, LedgerError> {
        self.flush()?;
        Ok(self.store)
    }

    fn persist(&mut self) -> Result<(), StoreError> {
        let snapshot: Vec<AttendanceRecord> = self.records.values().cloned().collect();
        self.store.save(&snapshot)?;
        self.dirty = false;
        Ok(())
    }

    pub fn get(&self, identity: &str, date: NaiveDate) -> Option<&AttendanceRecord> {
        self.records.get(&(date, identity.to_string()))
    }

    /// All records ordered by date, then identity.
    pub fn records(&self) -> impl Iterator<Item = &AttendanceRecord> {
        self.records.values()
    }

    /// Records for one calendar date, ordered by identity.
    pub fn records_on(&self, date: NaiveDate) -> impl Iterator<Item = &AttendanceRecord> {
        self.records
            .range((date, String::new())..)
            .take_while(move |((d, _), _)| *d == date)
            .map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True if memory holds changes the store has not accepted yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CsvStore, MemoryStore, TIME_FORMAT};
    use std::path::PathBuf;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIME_FORMAT).unwrap()
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    /// Store whose saves fail while `failing` is set.
    #[derive(Default)]
    struct FlakyStore {
        failing: bool,
        inner: MemoryStore,
    }

    impl LedgerStore for FlakyStore {
        fn load(&mut self) -> Result<Vec<AttendanceRecord>, StoreError> {
            self.inner.load()
        }

        fn save(&mut self, records: &[AttendanceRecord]) -> Result<(), StoreError> {
            if self.failing {
                return Err(StoreError::Io {
                    path: PathBuf::from("attendance.csv"),
                    source: std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full"),
                });
            }
            self.inner.save(records)
        }
    }

    #[test]
    fn test_first_sighting_creates_record() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        let sighting = ledger.record_sighting("alice", at("2024-03-01T09:00:00")).unwrap();

        assert!(sighting.created);
        assert_eq!(sighting.record.first_seen, at("2024-03-01T09:00:00"));
        assert_eq!(sighting.record.last_seen, at("2024-03-01T09:00:00"));
        assert_eq!(ledger.store().rows().len(), 1);
    }

    #[test]
    fn test_first_seen_stays_fixed() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        ledger.record_sighting("alice", at("2024-03-01T09:00:00")).unwrap();
        let sighting = ledger.record_sighting("alice", at("2024-03-01T12:30:00")).unwrap();

        assert!(!sighting.created);
        assert_eq!(sighting.record.first_seen, at("2024-03-01T09:00:00"));
        assert_eq!(sighting.record.last_seen, at("2024-03-01T12:30:00"));
        assert_eq!(ledger.store().rows(), &[sighting.record]);
    }

    #[test]
    fn test_repeated_identical_sighting_is_idempotent() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        let t = at("2024-03-01T09:00:00");
        let created: Vec<bool> = (0..5)
            .map(|_| ledger.record_sighting("alice", t).unwrap().created)
            .collect();

        assert_eq!(created, vec![true, false, false, false, false]);
        assert_eq!(ledger.len(), 1);
        let record = ledger.get("alice", t.date()).unwrap();
        assert_eq!(record.first_seen, t);
        assert_eq!(record.last_seen, t);
        // Unchanged sightings do not rewrite the table.
        assert_eq!(ledger.store().saves(), 1);
    }

    #[test]
    fn test_many_sightings_one_record_per_identity_and_day() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        for minute in 0..30 {
            let t = at("2024-03-01T09:00:00") + chrono::Duration::minutes(minute);
            ledger.record_sighting("alice", t).unwrap();
            ledger.record_sighting("bob", t).unwrap();
        }
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.store().rows().len(), 2);
        let alice = ledger.get("alice", day("2024-03-01")).unwrap();
        assert_eq!(alice.first_seen, at("2024-03-01T09:00:00"));
        assert_eq!(alice.last_seen, at("2024-03-01T09:29:00"));
    }

    #[test]
    fn test_day_boundary_opens_new_record() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        let late = ledger.record_sighting("alice", at("2024-03-01T23:59:59")).unwrap();
        let early = ledger.record_sighting("alice", at("2024-03-02T00:00:01")).unwrap();

        assert!(late.created);
        assert!(early.created);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.get("alice", day("2024-03-01")).unwrap().last_seen, at("2024-03-01T23:59:59"));
        assert_eq!(ledger.get("alice", day("2024-03-02")).unwrap().first_seen, at("2024-03-02T00:00:01"));
    }

    #[test]
    fn test_out_of_order_sighting_is_clamped() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        ledger.record_sighting("alice", at("2024-03-01T09:00:00")).unwrap();
        ledger.record_sighting("alice", at("2024-03-01T10:00:00")).unwrap();
        let sighting = ledger.record_sighting("alice", at("2024-03-01T08:00:00")).unwrap();

        assert!(!sighting.created);
        assert_eq!(sighting.record.first_seen, at("2024-03-01T09:00:00"));
        assert_eq!(sighting.record.last_seen, at("2024-03-01T10:00:00"));
    }

    #[test]
    fn test_sub_second_precision_is_dropped() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        let t = at("2024-03-01T09:00:00") + chrono::Duration::milliseconds(750);
        let sighting = ledger.record_sighting("alice", t).unwrap();
        assert_eq!(sighting.record.first_seen, at("2024-03-01T09:00:00"));
    }

    #[test]
    fn test_empty_identity_rejected() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        assert!(matches!(
            ledger.record_sighting("  ", at("2024-03-01T09:00:00")),
            Err(LedgerError::EmptyIdentity)
        ));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_reopen_same_day_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");

        let mut ledger = Ledger::open(CsvStore::new(&path)).unwrap();
        ledger.record_sighting("alice", at("2024-03-01T09:00:00")).unwrap();
        ledger.close().unwrap();

        let mut ledger = Ledger::open(CsvStore::new(&path)).unwrap();
        let sighting = ledger.record_sighting("alice", at("2024-03-01T11:00:00")).unwrap();
        assert!(!sighting.created);
        assert_eq!(sighting.record.first_seen, at("2024-03-01T09:00:00"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2, "header plus one row: {text}");
    }

    #[test]
    fn test_open_merges_duplicate_rows() {
        let rows = vec![
            AttendanceRecord {
                identity: "alice".into(),
                date: day("2024-03-01"),
                first_seen: at("2024-03-01T10:00:00"),
                last_seen: at("2024-03-01T11:00:00"),
            },
            AttendanceRecord {
                identity: "alice".into(),
                date: day("2024-03-01"),
                first_seen: at("2024-03-01T08:00:00"),
                last_seen: at("2024-03-01T09:00:00"),
            },
        ];
        let mut ledger = Ledger::open(MemoryStore::with_rows(rows)).unwrap();

        assert_eq!(ledger.len(), 1);
        assert!(ledger.is_dirty());
        let record = ledger.get("alice", day("2024-03-01")).unwrap();
        assert_eq!(record.first_seen, at("2024-03-01T08:00:00"));
        assert_eq!(record.last_seen, at("2024-03-01T11:00:00"));

        ledger.flush().unwrap();
        assert_eq!(ledger.store().rows().len(), 1);
    }

    #[test]
    fn test_persist_failure_keeps_memory_and_retries() {
        let mut ledger = Ledger::open(FlakyStore::default()).unwrap();
        ledger.record_sighting("alice", at("2024-03-01T09:00:00")).unwrap();

        ledger.store.failing = true;
        let err = ledger
            .record_sighting("bob", at("2024-03-01T09:05:00"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Persist { .. }));
        assert!(ledger.is_dirty());
        assert!(ledger.get("bob", day("2024-03-01")).is_some());
        assert_eq!(ledger.store.inner.rows().len(), 1);

        // Bob seen again while the store is still down: no second record.
        assert!(ledger.record_sighting("bob", at("2024-03-01T09:06:00")).is_err());
        assert_eq!(ledger.len(), 2);

        ledger.store.failing = false;
        ledger.flush().unwrap();
        assert!(!ledger.is_dirty());
        let rows = ledger.store.inner.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].identity, "bob");
        assert_eq!(rows[1].first_seen, at("2024-03-01T09:05:00"));
        assert_eq!(rows[1].last_seen, at("2024-03-01T09:06:00"));
    }

    #[test]
    fn test_records_on_filters_by_date() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        ledger.record_sighting("carol", at("2024-03-02T09:00:00")).unwrap();
        ledger.record_sighting("bob", at("2024-03-01T09:00:00")).unwrap();
        ledger.record_sighting("alice", at("2024-03-02T10:00:00")).unwrap();

        let names: Vec<_> = ledger
            .records_on(day("2024-03-02"))
            .map(|r| r.identity.as_str())
            .collect();
        assert_eq!(names, vec!["alice", "carol"]);
        assert_eq!(ledger.records().count(), 3);
    }
}
