//! Historical candle synchronization.
//!
//! Fills a local SQLite candle store from a paginated, gappy remote quote service:
//! - `cursor`: page-by-page walk toward the range boundary, gap skipping, termination
//! - `sync`: retries with backoff, rate limiting, progress, per-series exclusion
//! - `store`: idempotent candle persistence and range queries
//! - `connection` / `ws`: ownership of the single websocket handle

mod candle;
mod config;
mod connection;
mod cursor;
mod observability;
mod progress;
mod protocol;
mod store;
mod sync;
mod ws;

pub use candle::{Candle, Direction, SeriesKey, SyncRequest, ValidationError};
pub use config::{
    audit_config_from_env, connection_config_from_env, instrument_by_name, instrument_symbols,
    is_supported_granularity, run_config_from_env, sync_config_from_env, timeframe_label,
    AuditConfig, ConfigError, ConnectionConfig, InstrumentEntry, PaginationConfig, RunConfig,
    SyncConfig, Timeframe, DAY_SECS, DEFAULT_DB_PATH, INSTRUMENTS, TIMEFRAMES, WEEK_SECS,
};
pub use connection::{ConnectionError, ConnectionManager, Connector, QuoteTransport};
pub use cursor::{CursorPhase, CursorState, FailureCause, PageCursor, PageError, PageOutcome};
pub use observability::{
    init_logging, log_app_finish, log_app_start, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use progress::{LogProgress, NoProgress, ProgressReporter};
pub use protocol::{
    decode_response, HistoryEnd, HistoryResponse, RemoteError, ResponseFrame,
    TicksHistoryRequest, WireCandle, MAX_PAGE_SIZE,
};
pub use store::{CandleStore, GapReport, SeriesSummary, StorageError};
pub use sync::{
    start_sync, utc_now_epoch, CancelToken, SyncError, SyncOrchestrator, SyncReport, SyncStatus,
};
pub use ws::{WsConnector, WsTransport};
