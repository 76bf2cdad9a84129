//! Sync orchestration: retries, backoff, rate limiting, progress and per-series exclusion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::candle::{Direction, SeriesKey, SyncRequest, ValidationError};
use crate::config::SyncConfig;
use crate::connection::{ConnectionError, ConnectionManager, Connector};
use crate::cursor::{PageCursor, PageError, PageOutcome};
use crate::progress::ProgressReporter;
use crate::protocol::RemoteError;
use crate::store::{CandleStore, StorageError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid sync request: {0}")]
    Validation(#[from] ValidationError),
    #[error("gave up after {attempts} consecutive connection failures: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: ConnectionError,
    },
    #[error("remote protocol error: {0}")]
    Remote(RemoteError),
    #[error("remote returned a page that did not advance the cursor past epoch {pointer}")]
    Stalled { pointer: i64 },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub key: SeriesKey,
    pub direction: Direction,
    pub status: SyncStatus,
    /// In-range candles received and handed to the store, duplicates included.
    pub candles_fetched: u64,
    /// Rows that were new to the store.
    pub inserted: u64,
    /// Stored candles in the requested range after the run.
    pub period_count: u64,
    pub pages: u64,
    pub gap_skips: u64,
    pub reconnects: u32,
    pub final_progress: f64,
}

/// Cooperative cancellation, observed between pages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub fn utc_now_epoch() -> i64 {
    Utc::now().timestamp()
}

pub struct SyncOrchestrator<C: Connector> {
    connections: ConnectionManager<C>,
    store: Arc<CandleStore>,
    cfg: SyncConfig,
    cancel: CancelToken,
    clock: fn() -> i64,
}

impl<C: Connector> SyncOrchestrator<C> {
    pub fn new(connector: C, store: Arc<CandleStore>, cfg: SyncConfig) -> Self {
        Self {
            connections: ConnectionManager::new(connector),
            store,
            cfg,
            cancel: CancelToken::new(),
            clock: utc_now_epoch,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &Arc<CandleStore> {
        &self.store
    }

    pub fn connections(&self) -> &ConnectionManager<C> {
        &self.connections
    }

    pub async fn run<R>(
        &mut self,
        request: &SyncRequest,
        reporter: &R,
    ) -> Result<SyncReport, SyncError>
    where
        R: ProgressReporter + ?Sized,
    {
        request.validate()?;
        let key = request.key();
        // Held for the whole run; every orchestrator sharing this store waits on the same lock.
        let _series_guard = self.store.series_lock(&key).await;

        let mut cursor = PageCursor::new(request.clone(), self.cfg.pagination.clone())?;
        let mut consecutive_failures: u32 = 0;
        let mut reconnects: u32 = 0;
        let mut reported = 0.0_f64;

        info!(
            component = "sync",
            event = "sync.start",
            series = %key,
            direction = request.direction.as_str(),
            range_start = request.range_start,
            range_end = request.range_end,
            page_size = self.cfg.pagination.page_size
        );
        reporter.report(0.0, &format!("syncing {key} ({})", request.direction.as_str()));

        let status = loop {
            if self.cancel.is_cancelled() {
                break SyncStatus::Cancelled;
            }

            let pointer_before = cursor.state().pointer;
            let page = match self.connections.ensure().await {
                Ok(transport) => {
                    let now = (self.clock)();
                    cursor.next_page(transport, &self.store, now).await
                }
                Err(err) => Err(PageError::Connection(err)),
            };

            match page {
                Ok(outcome) => {
                    if cursor.state().pointer != pointer_before {
                        consecutive_failures = 0;
                    }
                    self.log_page(&key, &cursor, &outcome);

                    reported = reported.max(cursor.progress());
                    reporter.report(reported, &status_line(&cursor));

                    if cursor.is_done() {
                        break SyncStatus::Completed;
                    }
                }
                Err(PageError::Connection(err)) => {
                    consecutive_failures += 1;
                    self.connections.invalidate().await;
                    if consecutive_failures > self.cfg.max_retries {
                        error!(
                            component = "sync",
                            event = "sync.retries_exhausted",
                            series = %key,
                            attempts = consecutive_failures,
                            pointer = cursor.state().pointer,
                            error = %err
                        );
                        return Err(SyncError::RetriesExhausted {
                            attempts: consecutive_failures,
                            last_error: err,
                        });
                    }

                    warn!(
                        component = "sync",
                        event = "sync.retry",
                        series = %key,
                        attempt = consecutive_failures,
                        max_retries = self.cfg.max_retries,
                        backoff_ms = self.cfg.retry_backoff_ms,
                        pointer = cursor.state().pointer,
                        error = %err
                    );
                    reconnects += 1;
                    cursor.resume();
                    sleep(self.cfg.retry_backoff()).await;
                    continue;
                }
                Err(PageError::Remote(err)) => {
                    error!(
                        component = "sync",
                        event = "sync.remote_error",
                        series = %key,
                        code = %err.code,
                        message = %err.message,
                        pointer = cursor.state().pointer
                    );
                    return Err(SyncError::Remote(err));
                }
                Err(PageError::Stalled { pointer }) => {
                    error!(
                        component = "sync",
                        event = "sync.stalled",
                        series = %key,
                        pointer
                    );
                    return Err(SyncError::Stalled { pointer });
                }
                Err(PageError::Storage(err)) => {
                    error!(
                        component = "sync",
                        event = "sync.storage_error",
                        series = %key,
                        error = %err
                    );
                    return Err(SyncError::Storage(err));
                }
                Err(PageError::Terminal { .. }) => break SyncStatus::Completed,
            }

            sleep(self.cfg.rate_limit()).await;
        };

        let period_count =
            self.store
                .count_in_range(&key, request.range_start, request.range_end)?;
        let report = SyncReport {
            key: key.clone(),
            direction: request.direction,
            status,
            candles_fetched: cursor.state().candles_fetched,
            inserted: cursor.inserted(),
            period_count,
            pages: cursor.pages(),
            gap_skips: cursor.gap_skips(),
            reconnects,
            final_progress: if status == SyncStatus::Completed {
                1.0
            } else {
                reported
            },
        };

        match status {
            SyncStatus::Completed => {
                reporter.report(
                    1.0,
                    &format!(
                        "done: {} candles fetched, {} stored in range",
                        report.candles_fetched, report.period_count
                    ),
                );
                info!(
                    component = "sync",
                    event = "sync.finish",
                    series = %key,
                    candles_fetched = report.candles_fetched,
                    inserted = report.inserted,
                    period_count = report.period_count,
                    pages = report.pages,
                    gap_skips = report.gap_skips,
                    reconnects = report.reconnects
                );
            }
            SyncStatus::Cancelled => {
                reporter.report(
                    reported,
                    &format!(
                        "cancelled: {} candles fetched before stopping",
                        report.candles_fetched
                    ),
                );
                info!(
                    component = "sync",
                    event = "sync.cancelled",
                    series = %key,
                    candles_fetched = report.candles_fetched,
                    pointer = cursor.state().pointer
                );
            }
        }

        Ok(report)
    }

    /// Forward sync from just after the newest stored candle up to `now`. Starts at
    /// `default_start` for an empty series. Returns `None` when the series is already current.
    pub async fn catch_up<R>(
        &mut self,
        instrument: &str,
        granularity: u32,
        default_start: i64,
        now: i64,
        reporter: &R,
    ) -> Result<Option<SyncReport>, SyncError>
    where
        R: ProgressReporter + ?Sized,
    {
        let key = SeriesKey::new(instrument, granularity);
        let start = match self.store.max_epoch(&key)? {
            Some(newest) => newest.saturating_add(key.step_secs()),
            None => default_start,
        };
        if start >= now {
            debug!(
                component = "sync",
                event = "sync.up_to_date",
                series = %key,
                newest_start = start
            );
            return Ok(None);
        }

        let request = SyncRequest::new(instrument, granularity, start, now, Direction::Forward);
        self.run(&request, reporter).await.map(Some)
    }

    pub async fn shutdown(&mut self) {
        self.connections.shutdown().await;
    }

    fn log_page(&self, key: &SeriesKey, cursor: &PageCursor, outcome: &PageOutcome) {
        match outcome {
            PageOutcome::Stored {
                received,
                kept,
                inserted,
                first_epoch,
                last_epoch,
            } => info!(
                component = "sync",
                event = "sync.page",
                series = %key,
                page = cursor.pages(),
                received,
                kept,
                inserted,
                first_epoch,
                last_epoch,
                pointer = cursor.state().pointer
            ),
            PageOutcome::GapSkipped { from, to } => info!(
                component = "sync",
                event = "sync.gap_skip",
                series = %key,
                from,
                to
            ),
            PageOutcome::Exhausted => debug!(
                component = "sync",
                event = "sync.exhausted",
                series = %key,
                pointer = cursor.state().pointer
            ),
        }
    }
}

/// Sync API entry point for callers that do not keep an orchestrator around.
pub async fn start_sync<C, R>(
    connector: C,
    store: Arc<CandleStore>,
    cfg: SyncConfig,
    request: SyncRequest,
    reporter: &R,
) -> Result<SyncReport, SyncError>
where
    C: Connector,
    R: ProgressReporter + ?Sized,
{
    let mut orchestrator = SyncOrchestrator::new(connector, store, cfg);
    let result = orchestrator.run(&request, reporter).await;
    orchestrator.shutdown().await;
    result
}

fn status_line(cursor: &PageCursor) -> String {
    let at = Utc
        .timestamp_opt(cursor.state().pointer, 0)
        .single()
        .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| cursor.state().pointer.to_string());
    format!(
        "{} candles | at {}",
        cursor.state().candles_fetched,
        at
    )
}
