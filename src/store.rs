//! SQLite candle store keyed by `(instrument, granularity, epoch)`.
//!
//! Writes go through a single writer connection, one transaction per batch. Reads open their
//! own read-only connection so they never wait on the writer lock.
//!
//! The store also hands out per-series sync locks, so every orchestrator sharing one store
//! sees the same lock for a series.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::candle::{Candle, SeriesKey};

const MAX_REPORTED_GAP_RANGES: usize = 256;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store writer lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapReport {
    pub expected_slots: u64,
    pub stored: u64,
    pub missing_slots: u64,
    /// Stored epochs that do not sit on the `start + k * step` grid. They fill no slot.
    pub off_grid: u64,
    pub total_gap_ranges: u64,
    /// Inclusive `(first_missing, last_missing)` epochs, capped.
    pub gap_ranges: Vec<(i64, i64)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub key: SeriesKey,
    pub count: u64,
    pub first_epoch: i64,
    pub last_epoch: i64,
}

pub struct CandleStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    series_locks: Mutex<HashMap<SeriesKey, Arc<AsyncMutex<()>>>>,
}

impl CandleStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            PRAGMA busy_timeout=5000;
            ",
        )?;
        ensure_schema(&conn)?;

        info!(
            component = "store",
            event = "store.open",
            path = %path.display()
        );

        Ok(Self {
            path,
            writer: Mutex::new(conn),
            series_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits until no other holder syncs `key`, then holds it until the guard drops.
    ///
    /// Idle entries are pruned on every call, so the map only holds series that are locked or
    /// awaited (plus the one being acquired).
    pub async fn series_lock(&self, key: &SeriesKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .series_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|held, lock| held == key || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Inserts every candle whose key is not stored yet; existing rows are left untouched.
    /// Returns the number of rows actually inserted.
    pub fn upsert_batch(&self, candles: &[Candle]) -> Result<u64, StorageError> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let mut inserted = 0u64;
        {
            let mut stmt = tx.prepare_cached(
                "
                INSERT OR IGNORE INTO candles (
                    instrument,
                    granularity,
                    epoch,
                    open,
                    high,
                    low,
                    close
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
            )?;

            for candle in candles {
                inserted += stmt.execute(params![
                    candle.instrument,
                    candle.granularity,
                    candle.epoch,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                ])? as u64;
            }
        }
        tx.commit()?;

        debug!(
            component = "store",
            event = "store.batch.commit",
            attempted = candles.len(),
            inserted
        );
        Ok(inserted)
    }

    /// Number of stored candles with epoch in `[start, end]`.
    pub fn count_in_range(
        &self,
        key: &SeriesKey,
        start: i64,
        end: i64,
    ) -> Result<u64, StorageError> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row(
            "
            SELECT COUNT(*)
            FROM candles
            WHERE instrument = ?1
              AND granularity = ?2
              AND epoch >= ?3
              AND epoch <= ?4
            ",
            params![key.instrument, key.granularity, start, end],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn max_epoch(&self, key: &SeriesKey) -> Result<Option<i64>, StorageError> {
        let conn = self.reader()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(epoch) FROM candles WHERE instrument = ?1 AND granularity = ?2",
            params![key.instrument, key.granularity],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    pub fn min_epoch(&self, key: &SeriesKey) -> Result<Option<i64>, StorageError> {
        let conn = self.reader()?;
        let min: Option<i64> = conn.query_row(
            "SELECT MIN(epoch) FROM candles WHERE instrument = ?1 AND granularity = ?2",
            params![key.instrument, key.granularity],
            |row| row.get(0),
        )?;
        Ok(min)
    }

    /// Candles of one series ascending by epoch; a missing bound leaves that side open.
    pub fn load_range(
        &self,
        key: &SeriesKey,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Candle>, StorageError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "
            SELECT epoch, open, high, low, close
            FROM candles
            WHERE instrument = ?1
              AND granularity = ?2
              AND epoch >= ?3
              AND epoch <= ?4
            ORDER BY epoch ASC
            ",
        )?;

        let rows = stmt.query_map(
            params![
                key.instrument,
                key.granularity,
                start.unwrap_or(i64::MIN),
                end.unwrap_or(i64::MAX)
            ],
            |row| {
                Ok(Candle {
                    instrument: key.instrument.clone(),
                    granularity: key.granularity,
                    epoch: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                })
            },
        )?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn series(&self) -> Result<Vec<SeriesSummary>, StorageError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "
            SELECT instrument, granularity, COUNT(*), MIN(epoch), MAX(epoch)
            FROM candles
            GROUP BY instrument, granularity
            ORDER BY instrument, granularity
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SeriesSummary {
                key: SeriesKey::new(row.get::<_, String>(0)?, row.get(1)?),
                count: row.get::<_, i64>(2)? as u64,
                first_epoch: row.get(3)?,
                last_epoch: row.get(4)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Missing granularity slots in `[start, end]`, assuming one candle per slot aligned on
    /// `start`. Legitimate market closures show up here too. Epochs off that grid are counted
    /// in `off_grid` and ignored for slot accounting.
    pub fn find_gaps(
        &self,
        key: &SeriesKey,
        start: i64,
        end: i64,
    ) -> Result<GapReport, StorageError> {
        let epochs: Vec<i64> = self
            .load_range(key, Some(start), Some(end))?
            .into_iter()
            .map(|candle| candle.epoch)
            .collect();
        Ok(gap_report(&epochs, key.step_secs(), start, end))
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.writer.lock().map_err(|_| StorageError::Poisoned)
    }

    fn reader(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_millis(5_000))?;
        Ok(conn)
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StorageError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='candles' LIMIT 1",
            [],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if exists {
        return Ok(());
    }

    conn.execute_batch(
        "
        CREATE TABLE candles (
            instrument TEXT NOT NULL,
            granularity INTEGER NOT NULL,
            epoch INTEGER NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            PRIMARY KEY(instrument, granularity, epoch)
        ) WITHOUT ROWID;
        ",
    )?;
    info!(component = "store", event = "store.schema.created");
    Ok(())
}

fn gap_report(epochs: &[i64], step: i64, start: i64, end: i64) -> GapReport {
    if end < start || step <= 0 {
        return GapReport {
            expected_slots: 0,
            stored: epochs.len() as u64,
            missing_slots: 0,
            off_grid: 0,
            total_gap_ranges: 0,
            gap_ranges: Vec::new(),
        };
    }

    let mut full = Vec::new();
    let mut off_grid = 0u64;
    let mut cursor = start;
    for &epoch in epochs {
        if (epoch - start).rem_euclid(step) != 0 {
            off_grid += 1;
            continue;
        }
        if epoch > cursor {
            full.push((cursor, epoch - step));
        }
        cursor = epoch.saturating_add(step);
    }
    if cursor <= end {
        let last_slot = start + ((end - start) / step) * step;
        if last_slot >= cursor {
            full.push((cursor, last_slot));
        }
    }

    let missing_slots = full
        .iter()
        .map(|(first, last)| ((last - first) / step + 1) as u64)
        .sum();
    let total = full.len();

    GapReport {
        expected_slots: ((end - start) / step + 1) as u64,
        stored: epochs.len() as u64,
        missing_slots,
        off_grid,
        total_gap_ranges: total as u64,
        gap_ranges: full.into_iter().take(MAX_REPORTED_GAP_RANGES).collect(),
    }
}
