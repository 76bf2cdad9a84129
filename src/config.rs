//! Sync, pagination, connection and run settings with `CANDLESYNC_*` environment overrides,
//! plus the instrument and timeframe catalog.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use thiserror::Error;

use crate::candle::Direction;
use crate::protocol::MAX_PAGE_SIZE;

pub const DAY_SECS: i64 = 86_400;
pub const WEEK_SECS: i64 = 7 * DAY_SECS;

/// Tradable instrument as `(display name, service symbol)`.
pub type InstrumentEntry = (&'static str, &'static str);

/// Candle period as `(label, seconds)`.
pub type Timeframe = (&'static str, u32);

pub const INSTRUMENTS: [InstrumentEntry; 12] = [
    ("Volatility 10", "R_10"),
    ("Volatility 25", "R_25"),
    ("Volatility 50", "R_50"),
    ("Volatility 75", "R_75"),
    ("Volatility 100", "R_100"),
    ("Volatility 10 (1s)", "1HZ10V"),
    ("Volatility 25 (1s)", "1HZ25V"),
    ("Volatility 50 (1s)", "1HZ50V"),
    ("Volatility 75 (1s)", "1HZ75V"),
    ("Volatility 100 (1s)", "1HZ100V"),
    ("Step Index", "STEP"),
    ("Gold (USD)", "frxXAUUSD"),
];

pub const TIMEFRAMES: [Timeframe; 7] = [
    ("1 minute", 60),
    ("2 minutes", 120),
    ("5 minutes", 300),
    ("15 minutes", 900),
    ("30 minutes", 1_800),
    ("45 minutes", 2_700),
    ("1 hour", 3_600),
];

pub fn instrument_symbols() -> Vec<&'static str> {
    INSTRUMENTS.iter().map(|(_, symbol)| *symbol).collect()
}

pub fn instrument_by_name(name: &str) -> Option<&'static str> {
    INSTRUMENTS
        .iter()
        .find(|(display, _)| display.eq_ignore_ascii_case(name.trim()))
        .map(|(_, symbol)| *symbol)
}

pub fn is_supported_granularity(granularity: u32) -> bool {
    TIMEFRAMES.iter().any(|(_, secs)| *secs == granularity)
}

pub fn timeframe_label(granularity: u32) -> Option<&'static str> {
    TIMEFRAMES
        .iter()
        .find(|(_, secs)| *secs == granularity)
        .map(|(label, _)| *label)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub ws_url: String,
    pub app_id: u32,
    /// Skip certificate and hostname verification. Only for deployments whose endpoint
    /// presents a certificate the local trust store rejects.
    pub accept_invalid_certs: bool,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws.derivws.com/websockets/v3".to_string(),
            app_id: 1089,
            accept_invalid_certs: false,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    pub fn endpoint(&self) -> String {
        let sep = if self.ws_url.contains('?') { '&' } else { '?' };
        format!("{}{sep}app_id={}", self.ws_url, self.app_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationConfig {
    pub page_size: u32,
    /// Pointer jump after an empty page while walking forward.
    pub forward_gap_jump_secs: i64,
    /// Pointer jump after an empty page while walking backward.
    pub backward_gap_jump_secs: i64,
    /// A short forward page whose last candle is within this many granularities of the
    /// wall clock ends the sync.
    pub near_now_granularities: i64,
    pub request_timeout_ms: u64,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            forward_gap_jump_secs: DAY_SECS,
            backward_gap_jump_secs: WEEK_SECS,
            near_now_granularities: 2,
            request_timeout_ms: 30_000,
        }
    }
}

impl PaginationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub pagination: PaginationConfig,
    /// Pause after every page, successful or not.
    pub rate_limit_ms: u64,
    /// Consecutive connection failures tolerated without forward progress.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pagination: PaginationConfig::default(),
            rate_limit_ms: 150,
            max_retries: 5,
            retry_backoff_ms: 2_000,
        }
    }
}

impl SyncConfig {
    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

/// What the `history_sync` binary syncs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub db_path: PathBuf,
    pub instruments: Vec<String>,
    pub granularity: u32,
    pub direction: Direction,
    /// `None` extends each stored series up to now instead of syncing a fixed range.
    pub start: Option<i64>,
    /// `None` means now.
    pub end: Option<i64>,
    /// Look-back for a series that has nothing stored yet.
    pub catch_up_days: i64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            instruments: instrument_symbols().into_iter().map(str::to_string).collect(),
            granularity: TIMEFRAMES[0].1,
            direction: Direction::Forward,
            start: None,
            end: None,
            catch_up_days: 30,
        }
    }
}

/// Series selection for `history_gap_audit`; unset filters match everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    pub db_path: PathBuf,
    pub instrument: Option<String>,
    pub granularity: Option<u32>,
}

pub const DEFAULT_DB_PATH: &str = "data/candles.sqlite";

pub fn run_config_from_env() -> Result<RunConfig, ConfigError> {
    let mut cfg = RunConfig {
        db_path: db_path_from_env(),
        ..RunConfig::default()
    };

    if let Some(raw) =
        env_string("CANDLESYNC_INSTRUMENTS").or_else(|| env_string("CANDLESYNC_INSTRUMENT"))
    {
        let instruments = parse_instrument_list(&raw);
        if instruments.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "CANDLESYNC_INSTRUMENTS",
                value: raw,
            });
        }
        cfg.instruments = instruments;
    }
    if let Some(granularity) = env_granularity("CANDLESYNC_GRANULARITY")? {
        cfg.granularity = granularity;
    }
    if let Some(raw) = env_string("CANDLESYNC_DIRECTION") {
        cfg.direction = Direction::parse(&raw).ok_or(ConfigError::InvalidValue {
            var: "CANDLESYNC_DIRECTION",
            value: raw,
        })?;
    }
    cfg.start = env_time("CANDLESYNC_START")?;
    cfg.end = env_time("CANDLESYNC_END")?;
    if let Some(days) = env_parse::<i64>("CANDLESYNC_CATCH_UP_DAYS")? {
        cfg.catch_up_days = positive("CANDLESYNC_CATCH_UP_DAYS", days)?;
    }

    Ok(cfg)
}

pub fn audit_config_from_env() -> Result<AuditConfig, ConfigError> {
    Ok(AuditConfig {
        db_path: db_path_from_env(),
        instrument: env_string("CANDLESYNC_INSTRUMENT"),
        granularity: env_granularity("CANDLESYNC_GRANULARITY")?,
    })
}

pub fn sync_config_from_env() -> Result<SyncConfig, ConfigError> {
    let mut cfg = SyncConfig::default();

    if let Some(page_size) = env_parse::<u32>("CANDLESYNC_PAGE_SIZE")? {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::InvalidValue {
                var: "CANDLESYNC_PAGE_SIZE",
                value: page_size.to_string(),
            });
        }
        cfg.pagination.page_size = page_size;
    }
    if let Some(secs) = env_parse::<i64>("CANDLESYNC_FORWARD_GAP_JUMP_SECS")? {
        cfg.pagination.forward_gap_jump_secs = positive("CANDLESYNC_FORWARD_GAP_JUMP_SECS", secs)?;
    }
    if let Some(secs) = env_parse::<i64>("CANDLESYNC_BACKWARD_GAP_JUMP_SECS")? {
        cfg.pagination.backward_gap_jump_secs =
            positive("CANDLESYNC_BACKWARD_GAP_JUMP_SECS", secs)?;
    }
    if let Some(n) = env_parse::<i64>("CANDLESYNC_NEAR_NOW_GRANULARITIES")? {
        cfg.pagination.near_now_granularities = n.max(0);
    }
    if let Some(ms) = env_parse::<u64>("CANDLESYNC_REQUEST_TIMEOUT_MS")? {
        cfg.pagination.request_timeout_ms = ms;
    }
    if let Some(ms) = env_parse::<u64>("CANDLESYNC_RATE_LIMIT_MS")? {
        cfg.rate_limit_ms = ms;
    }
    if let Some(n) = env_parse::<u32>("CANDLESYNC_MAX_RETRIES")? {
        cfg.max_retries = n;
    }
    if let Some(ms) = env_parse::<u64>("CANDLESYNC_RETRY_BACKOFF_MS")? {
        cfg.retry_backoff_ms = ms;
    }

    Ok(cfg)
}

pub fn connection_config_from_env() -> Result<ConnectionConfig, ConfigError> {
    let mut cfg = ConnectionConfig::default();

    if let Some(url) = env_string("CANDLESYNC_WS_URL") {
        cfg.ws_url = url;
    }
    if let Some(app_id) = env_parse::<u32>("CANDLESYNC_APP_ID")? {
        cfg.app_id = app_id;
    }
    if let Some(raw) = env_string("CANDLESYNC_TLS_ACCEPT_INVALID") {
        cfg.accept_invalid_certs = parse_bool(&raw).ok_or(ConfigError::InvalidValue {
            var: "CANDLESYNC_TLS_ACCEPT_INVALID",
            value: raw,
        })?;
    }
    if let Some(ms) = env_parse::<u64>("CANDLESYNC_CONNECT_TIMEOUT_MS")? {
        cfg.connect_timeout_ms = ms;
    }

    Ok(cfg)
}

fn db_path_from_env() -> PathBuf {
    env_string("CANDLESYNC_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
}

/// Symbols or catalog display names, comma separated.
fn parse_instrument_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| instrument_by_name(item).unwrap_or(item).to_string())
        .collect()
}

fn env_granularity(var: &'static str) -> Result<Option<u32>, ConfigError> {
    match env_parse::<u32>(var)? {
        Some(secs) if !is_supported_granularity(secs) => Err(ConfigError::InvalidValue {
            var,
            value: secs.to_string(),
        }),
        other => Ok(other),
    }
}

fn env_time(var: &'static str) -> Result<Option<i64>, ConfigError> {
    match env_string(var) {
        Some(raw) => parse_time(&raw)
            .map(Some)
            .ok_or(ConfigError::InvalidValue { var, value: raw }),
        None => Ok(None),
    }
}

/// `YYYY-MM-DD` (UTC midnight) or raw epoch seconds.
fn parse_time(raw: &str) -> Option<i64> {
    if let Ok(epoch) = raw.parse::<i64>() {
        return Some(epoch);
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&midnight).timestamp())
}

pub(crate) fn env_string(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

pub(crate) fn env_parse<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env_string(var) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
        None => Ok(None),
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn positive(var: &'static str, value: i64) -> Result<i64, ConfigError> {
    if value > 0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_env::with_env_vars;
    use super::*;

    const SYNC_VARS: [&str; 8] = [
        "CANDLESYNC_PAGE_SIZE",
        "CANDLESYNC_FORWARD_GAP_JUMP_SECS",
        "CANDLESYNC_BACKWARD_GAP_JUMP_SECS",
        "CANDLESYNC_NEAR_NOW_GRANULARITIES",
        "CANDLESYNC_REQUEST_TIMEOUT_MS",
        "CANDLESYNC_RATE_LIMIT_MS",
        "CANDLESYNC_MAX_RETRIES",
        "CANDLESYNC_RETRY_BACKOFF_MS",
    ];

    fn cleared_sync_vars() -> Vec<(&'static str, Option<&'static str>)> {
        SYNC_VARS.iter().map(|var| (*var, None)).collect()
    }

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(&cleared_sync_vars(), sync_config_from_env).unwrap();
        assert_eq!(cfg, SyncConfig::default());
        assert_eq!(cfg.pagination.page_size, 5_000);
        assert_eq!(cfg.pagination.forward_gap_jump_secs, DAY_SECS);
        assert_eq!(cfg.pagination.backward_gap_jump_secs, WEEK_SECS);
    }

    #[test]
    fn overrides_are_applied() {
        let mut vars = cleared_sync_vars();
        vars.push(("CANDLESYNC_PAGE_SIZE", Some("1000")));
        vars.push(("CANDLESYNC_RATE_LIMIT_MS", Some("250")));
        vars.push(("CANDLESYNC_BACKWARD_GAP_JUMP_SECS", Some("3600")));

        let cfg = with_env_vars(&vars, sync_config_from_env).unwrap();
        assert_eq!(cfg.pagination.page_size, 1_000);
        assert_eq!(cfg.rate_limit_ms, 250);
        assert_eq!(cfg.pagination.backward_gap_jump_secs, 3_600);
    }

    #[test]
    fn invalid_numbers_name_the_variable() {
        let mut vars = cleared_sync_vars();
        vars.push(("CANDLESYNC_MAX_RETRIES", Some("many")));
        let err = with_env_vars(&vars, sync_config_from_env).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                var: "CANDLESYNC_MAX_RETRIES",
                value: "many".to_string()
            }
        );

        let mut vars = cleared_sync_vars();
        vars.push(("CANDLESYNC_PAGE_SIZE", Some("6000")));
        assert!(with_env_vars(&vars, sync_config_from_env).is_err());
    }

    #[test]
    fn connection_overrides_and_endpoint() {
        let cfg = with_env_vars(
            &[
                ("CANDLESYNC_WS_URL", Some("wss://ws.example.test/websockets/v3")),
                ("CANDLESYNC_APP_ID", Some("122241")),
                ("CANDLESYNC_TLS_ACCEPT_INVALID", Some("yes")),
                ("CANDLESYNC_CONNECT_TIMEOUT_MS", None),
            ],
            connection_config_from_env,
        )
        .unwrap();

        assert!(cfg.accept_invalid_certs);
        assert_eq!(
            cfg.endpoint(),
            "wss://ws.example.test/websockets/v3?app_id=122241"
        );
    }

    #[test]
    fn relaxed_tls_is_off_by_default() {
        let cfg = with_env_vars(
            &[
                ("CANDLESYNC_WS_URL", None),
                ("CANDLESYNC_APP_ID", None),
                ("CANDLESYNC_TLS_ACCEPT_INVALID", None),
                ("CANDLESYNC_CONNECT_TIMEOUT_MS", None),
            ],
            connection_config_from_env,
        )
        .unwrap();
        assert!(!cfg.accept_invalid_certs);
        assert!(cfg.endpoint().ends_with("?app_id=1089"));
    }

    const RUN_VARS: [&str; 8] = [
        "CANDLESYNC_DB_PATH",
        "CANDLESYNC_INSTRUMENTS",
        "CANDLESYNC_INSTRUMENT",
        "CANDLESYNC_GRANULARITY",
        "CANDLESYNC_DIRECTION",
        "CANDLESYNC_START",
        "CANDLESYNC_END",
        "CANDLESYNC_CATCH_UP_DAYS",
    ];

    fn run_vars(
        overrides: &[(&'static str, &'static str)],
    ) -> Vec<(&'static str, Option<&'static str>)> {
        RUN_VARS
            .iter()
            .map(|var| {
                let value = overrides
                    .iter()
                    .find(|(key, _)| key == var)
                    .map(|(_, value)| *value);
                (*var, value)
            })
            .collect()
    }

    #[test]
    fn catalog_covers_every_timeframe_and_symbol() {
        let seconds: Vec<u32> = TIMEFRAMES.iter().map(|(_, secs)| *secs).collect();
        assert_eq!(seconds, vec![60, 120, 300, 900, 1_800, 2_700, 3_600]);
        assert!(is_supported_granularity(2_700));
        assert!(!is_supported_granularity(86_400));
        assert_eq!(timeframe_label(900), Some("15 minutes"));

        assert_eq!(instrument_symbols().len(), 12);
        assert_eq!(instrument_by_name("step index"), Some("STEP"));
        assert_eq!(instrument_by_name("Gold (USD)"), Some("frxXAUUSD"));
        assert_eq!(instrument_by_name("Crash 500"), None);
    }

    #[test]
    fn run_defaults_cover_the_catalog() {
        let cfg = with_env_vars(&run_vars(&[]), run_config_from_env).unwrap();
        assert_eq!(cfg, RunConfig::default());
        assert_eq!(cfg.db_path, PathBuf::from("data/candles.sqlite"));
        assert_eq!(cfg.instruments.len(), INSTRUMENTS.len());
        assert_eq!(cfg.instruments[0], "R_10");
        assert_eq!(cfg.granularity, 60);
        assert_eq!((cfg.start, cfg.end), (None, None));
    }

    #[test]
    fn run_overrides_accept_names_dates_and_epochs() {
        let cfg = with_env_vars(
            &run_vars(&[
                ("CANDLESYNC_DB_PATH", "/tmp/history.sqlite"),
                ("CANDLESYNC_INSTRUMENTS", "R_100, Volatility 25 (1s),"),
                ("CANDLESYNC_GRANULARITY", "2700"),
                ("CANDLESYNC_DIRECTION", "backward"),
                ("CANDLESYNC_START", "2024-01-01"),
                ("CANDLESYNC_END", "1704153600"),
            ]),
            run_config_from_env,
        )
        .unwrap();

        assert_eq!(cfg.db_path, PathBuf::from("/tmp/history.sqlite"));
        assert_eq!(cfg.instruments, vec!["R_100", "1HZ25V"]);
        assert_eq!(cfg.granularity, 2_700);
        assert_eq!(cfg.direction, Direction::Backward);
        assert_eq!(cfg.start, Some(1_704_067_200));
        assert_eq!(cfg.end, Some(1_704_153_600));
    }

    #[test]
    fn run_rejects_granularity_outside_the_catalog() {
        let err = with_env_vars(
            &run_vars(&[("CANDLESYNC_GRANULARITY", "86400")]),
            run_config_from_env,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                var: "CANDLESYNC_GRANULARITY",
                value: "86400".to_string()
            }
        );

        let err = with_env_vars(
            &run_vars(&[("CANDLESYNC_START", "01/02/2024")]),
            run_config_from_env,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: "CANDLESYNC_START",
                ..
            }
        ));
    }

    #[test]
    fn audit_filters_stay_open_when_unset() {
        let cfg = with_env_vars(&run_vars(&[]), audit_config_from_env).unwrap();
        assert_eq!(cfg.instrument, None);
        assert_eq!(cfg.granularity, None);

        let cfg = with_env_vars(
            &run_vars(&[
                ("CANDLESYNC_INSTRUMENT", "R_50"),
                ("CANDLESYNC_GRANULARITY", "300"),
            ]),
            audit_config_from_env,
        )
        .unwrap();
        assert_eq!(cfg.instrument.as_deref(), Some("R_50"));
        assert_eq!(cfg.granularity, Some(300));
    }
}
