//! Pagination cursor: walks one sync request page by page toward its boundary.
//!
//! The pointer only ever moves toward the boundary. It advances after a page has been
//! committed to the store, so a cursor that failed on the connection can resume from the
//! same pointer without losing or re-counting anything.

use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::candle::{Candle, Direction, SyncRequest, ValidationError};
use crate::config::PaginationConfig;
use crate::connection::{ConnectionError, QuoteTransport};
use crate::protocol::{HistoryResponse, RemoteError, TicksHistoryRequest, WireCandle};
use crate::store::{CandleStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Connection,
    Remote,
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPhase {
    Idle,
    RequestingPage,
    AdvancingCursor,
    SkippingGap,
    Done,
    Failed(FailureCause),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub pointer: i64,
    pub boundary: i64,
    pub candles_fetched: u64,
    pub last_page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Stored {
        received: usize,
        kept: usize,
        inserted: u64,
        first_epoch: i64,
        last_epoch: i64,
    },
    GapSkipped {
        from: i64,
        to: i64,
    },
    /// The service reported the remaining sub-range as empty.
    Exhausted,
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("remote rejected page request: {0}")]
    Remote(RemoteError),
    #[error("page did not move the cursor past epoch {pointer}")]
    Stalled { pointer: i64 },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("cursor is already {phase:?}")]
    Terminal { phase: CursorPhase },
}

#[derive(Debug, Clone)]
pub struct PageCursor {
    request: SyncRequest,
    cfg: PaginationConfig,
    state: CursorState,
    phase: CursorPhase,
    pages: u64,
    gap_skips: u64,
    inserted: u64,
}

impl PageCursor {
    pub fn new(request: SyncRequest, cfg: PaginationConfig) -> Result<Self, ValidationError> {
        request.validate()?;
        let (pointer, boundary) = match request.direction {
            Direction::Forward => (request.range_start, request.range_end),
            Direction::Backward => (request.range_end, request.range_start),
        };

        Ok(Self {
            request,
            cfg,
            state: CursorState {
                pointer,
                boundary,
                candles_fetched: 0,
                last_page_size: 0,
            },
            phase: CursorPhase::Idle,
            pages: 0,
            gap_skips: 0,
            inserted: 0,
        })
    }

    pub fn request(&self) -> &SyncRequest {
        &self.request
    }

    pub fn state(&self) -> &CursorState {
        &self.state
    }

    pub fn phase(&self) -> CursorPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == CursorPhase::Done
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, CursorPhase::Done | CursorPhase::Failed(_))
    }

    pub fn pages(&self) -> u64 {
        self.pages
    }

    pub fn gap_skips(&self) -> u64 {
        self.gap_skips
    }

    /// Rows the store reported as newly inserted across all pages.
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// Clears a connection-caused failure so the next page retries from the same pointer.
    /// Remote and storage failures stay terminal.
    pub fn resume(&mut self) -> bool {
        if self.phase == CursorPhase::Failed(FailureCause::Connection) {
            self.phase = CursorPhase::Idle;
            true
        } else {
            false
        }
    }

    /// Fraction of the requested time span already walked, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.is_done() {
            return 1.0;
        }
        let span = self.request.span_secs();
        if span <= 0 {
            return 1.0;
        }
        let covered = match self.request.direction {
            Direction::Forward => self.state.pointer - self.request.range_start,
            Direction::Backward => self.request.range_end - self.state.pointer,
        };
        (covered as f64 / span as f64).clamp(0.0, 1.0)
    }

    /// The request the next page will issue. Forward pages are bounded on both sides so they
    /// never reach into candles past the boundary; backward pages only carry the upper anchor.
    pub fn page_request(&self) -> TicksHistoryRequest {
        let instrument = self.request.instrument.as_str();
        let granularity = self.request.granularity;
        match self.request.direction {
            Direction::Forward => TicksHistoryRequest::bounded(
                instrument,
                granularity,
                self.cfg.page_size,
                self.state.pointer,
                self.state.boundary,
            ),
            Direction::Backward => TicksHistoryRequest::ending_at(
                instrument,
                granularity,
                self.cfg.page_size,
                self.state.pointer,
            ),
        }
    }

    /// Requests one page, commits its in-range candles and advances the pointer.
    ///
    /// `now` is the wall clock in epoch seconds, used only by the forward "caught up to live"
    /// check.
    pub async fn next_page<T>(
        &mut self,
        transport: &mut T,
        store: &CandleStore,
        now: i64,
    ) -> Result<PageOutcome, PageError>
    where
        T: QuoteTransport + ?Sized,
    {
        if self.is_terminal() {
            return Err(PageError::Terminal { phase: self.phase });
        }

        self.phase = CursorPhase::RequestingPage;
        let page_request = self.page_request();
        self.pages += 1;

        let response = match timeout(self.cfg.request_timeout(), transport.request(&page_request))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                self.phase = CursorPhase::Failed(FailureCause::Connection);
                return Err(err.into());
            }
            Err(_) => {
                self.phase = CursorPhase::Failed(FailureCause::Connection);
                return Err(ConnectionError::Timeout {
                    after_ms: self.cfg.request_timeout_ms,
                }
                .into());
            }
        };

        match response {
            HistoryResponse::Error(err) if err.is_range_exhausted() => {
                debug!(
                    component = "cursor",
                    event = "cursor.exhausted",
                    pointer = self.state.pointer,
                    boundary = self.state.boundary
                );
                self.phase = CursorPhase::Done;
                Ok(PageOutcome::Exhausted)
            }
            HistoryResponse::Error(err) => {
                self.phase = CursorPhase::Failed(FailureCause::Remote);
                Err(PageError::Remote(err))
            }
            HistoryResponse::Candles(candles) if candles.is_empty() => Ok(self.skip_gap()),
            HistoryResponse::Candles(candles) => self.commit_page(candles, store, now),
        }
    }

    fn skip_gap(&mut self) -> PageOutcome {
        self.phase = CursorPhase::SkippingGap;
        self.gap_skips += 1;
        self.state.last_page_size = 0;

        let from = self.state.pointer;
        let to = match self.request.direction {
            Direction::Forward => from
                .saturating_add(self.cfg.forward_gap_jump_secs)
                .min(self.state.boundary),
            Direction::Backward => from
                .saturating_sub(self.cfg.backward_gap_jump_secs)
                .max(self.state.boundary),
        };
        self.state.pointer = to;

        if to == self.state.boundary {
            self.phase = CursorPhase::Done;
        }
        PageOutcome::GapSkipped { from, to }
    }

    fn commit_page(
        &mut self,
        mut page: Vec<WireCandle>,
        store: &CandleStore,
        now: i64,
    ) -> Result<PageOutcome, PageError> {
        page.sort_by_key(|candle| candle.epoch);
        let received = page.len();
        let (first_epoch, last_epoch) = match (page.first(), page.last()) {
            (Some(first), Some(last)) => (first.epoch, last.epoch),
            _ => return Ok(self.skip_gap()),
        };

        let step = i64::from(self.request.granularity);
        let pointer = self.state.pointer;
        let next_pointer = match self.request.direction {
            Direction::Forward => last_epoch.saturating_add(step),
            Direction::Backward => first_epoch.saturating_sub(1),
        };
        let advances = match self.request.direction {
            Direction::Forward => next_pointer > pointer,
            Direction::Backward => next_pointer < pointer,
        };
        if !advances {
            self.phase = CursorPhase::Failed(FailureCause::Remote);
            return Err(PageError::Stalled { pointer });
        }

        let batch: Vec<Candle> = page
            .into_iter()
            .filter(|candle| self.request.contains(candle.epoch))
            .map(|candle| candle.into_candle(&self.request.instrument, self.request.granularity))
            .collect();
        let inserted = match store.upsert_batch(&batch) {
            Ok(inserted) => inserted,
            Err(err) => {
                self.phase = CursorPhase::Failed(FailureCause::Storage);
                return Err(err.into());
            }
        };

        self.phase = CursorPhase::AdvancingCursor;
        self.state.candles_fetched += batch.len() as u64;
        self.state.last_page_size = received;
        self.inserted += inserted;

        let boundary = self.state.boundary;
        let done = match self.request.direction {
            Direction::Forward => {
                let short_page = received < self.cfg.page_size as usize;
                let near_now =
                    last_epoch >= now.saturating_sub(self.cfg.near_now_granularities * step);
                last_epoch >= boundary || (short_page && near_now) || next_pointer > boundary
            }
            Direction::Backward => first_epoch <= boundary,
        };
        self.state.pointer = next_pointer;
        if done {
            self.phase = CursorPhase::Done;
        }

        Ok(PageOutcome::Stored {
            received,
            kept: batch.len(),
            inserted,
            first_epoch,
            last_epoch,
        })
    }
}
