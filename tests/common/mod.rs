//! Simulated quote service for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use candle_sync::{
    decode_response, CandleStore, ConnectionError, Connector, HistoryEnd, HistoryResponse,
    PaginationConfig, QuoteTransport, RemoteError, SyncConfig, TicksHistoryRequest, WireCandle,
};
use tempfile::TempDir;

pub const T0: i64 = 1_704_067_200; // 2024-01-01T00:00:00Z
pub const DAY: i64 = 86_400;
pub const MINUTE: u32 = 60;

/// What the simulated service does with one specific request (1-based, counted across all
/// connections).
#[derive(Debug, Clone)]
pub enum Fault {
    /// Drops the connection instead of answering.
    Drop,
    /// Never answers.
    Hang,
    Remote(RemoteError),
    /// Answers with this raw text frame, decoded the way the websocket transport does.
    Frame(String),
}

pub struct SimFeed {
    series: Mutex<HashMap<String, BTreeSet<i64>>>,
    anchored_closures: Mutex<Vec<(i64, i64)>>,
    faults: Mutex<HashMap<u64, Fault>>,
    failing_connects: AtomicU64,
    latency: Mutex<Duration>,
    requests: AtomicU64,
    connects: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    log: Mutex<Vec<TicksHistoryRequest>>,
}

impl SimFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            series: Mutex::new(HashMap::new()),
            anchored_closures: Mutex::new(Vec::new()),
            faults: Mutex::new(HashMap::new()),
            failing_connects: AtomicU64::new(0),
            latency: Mutex::new(Duration::ZERO),
            requests: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        })
    }

    /// One candle every `step` seconds in `[start, end)`, except inside `closures`
    /// (inclusive epoch ranges).
    pub fn fill(
        &self,
        instrument: &str,
        start: i64,
        end: i64,
        step: i64,
        closures: &[(i64, i64)],
    ) {
        let mut series = self.series.lock().unwrap();
        let epochs = series.entry(instrument.to_string()).or_default();
        let mut epoch = start;
        while epoch < end {
            if !closures.iter().any(|(a, b)| epoch >= *a && epoch <= *b) {
                epochs.insert(epoch);
            }
            epoch += step;
        }
    }

    /// Makes bounded requests whose start anchor lies inside `[from, to]` come back empty, the
    /// way the live service answers for a start inside a market closure.
    pub fn anchor_closure(&self, from: i64, to: i64) {
        self.anchored_closures.lock().unwrap().push((from, to));
    }

    pub fn fault_at(&self, request_no: u64, fault: Fault) {
        self.faults.lock().unwrap().insert(request_no, fault);
    }

    pub fn fail_next_connects(&self, n: u64) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn available(&self, instrument: &str, start: i64, end: i64) -> u64 {
        self.series
            .lock()
            .unwrap()
            .get(instrument)
            .map(|epochs| epochs.range(start..=end).count() as u64)
            .unwrap_or(0)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<TicksHistoryRequest> {
        self.log.lock().unwrap().clone()
    }

    fn answer(&self, request: &TicksHistoryRequest) -> HistoryResponse {
        let end = match request.end {
            HistoryEnd::Epoch(end) => end,
            HistoryEnd::Latest => i64::MAX,
        };
        if let Some(start) = request.start {
            if start > end {
                return HistoryResponse::Error(RemoteError::new(
                    "InputValidationFailed",
                    "Start time is after end time.",
                ));
            }
            let anchored = self.anchored_closures.lock().unwrap();
            if anchored.iter().any(|(a, b)| start >= *a && start <= *b) {
                return HistoryResponse::Candles(Vec::new());
            }
        }

        let series = self.series.lock().unwrap();
        let Some(epochs) = series.get(&request.ticks_history) else {
            return HistoryResponse::Error(RemoteError::new(
                "InvalidSymbol",
                format!("Symbol {} is invalid.", request.ticks_history),
            ));
        };

        let count = request.count as usize;
        let picked: Vec<i64> = match request.start {
            Some(start) => epochs.range(start..=end).take(count).copied().collect(),
            None => {
                let mut newest: Vec<i64> =
                    epochs.range(..=end).rev().take(count).copied().collect();
                newest.reverse();
                newest
            }
        };
        HistoryResponse::Candles(picked.into_iter().map(wire).collect())
    }
}

pub fn wire(epoch: i64) -> WireCandle {
    let base = 1_000.0 + (epoch % 997) as f64 / 10.0;
    WireCandle {
        epoch,
        open: base,
        high: base + 0.5,
        low: base - 0.5,
        close: base + 0.1,
    }
}

struct InFlight<'a>(&'a SimFeed);

impl<'a> InFlight<'a> {
    fn enter(feed: &'a SimFeed) -> Self {
        let now = feed.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        feed.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(feed)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SimConnector {
    feed: Arc<SimFeed>,
}

impl SimConnector {
    pub fn new(feed: &Arc<SimFeed>) -> Self {
        Self {
            feed: Arc::clone(feed),
        }
    }
}

#[async_trait]
impl Connector for SimConnector {
    type Transport = SimTransport;

    async fn connect(&self) -> Result<SimTransport, ConnectionError> {
        let pending = self.feed.failing_connects.load(Ordering::SeqCst);
        if pending > 0 {
            self.feed.failing_connects.store(pending - 1, Ordering::SeqCst);
            return Err(ConnectionError::Connect {
                url: "sim://quotes".to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.feed.connects.fetch_add(1, Ordering::SeqCst);
        Ok(SimTransport {
            feed: Arc::clone(&self.feed),
            alive: true,
        })
    }

    fn describe(&self) -> String {
        "sim://quotes".to_string()
    }
}

pub struct SimTransport {
    feed: Arc<SimFeed>,
    alive: bool,
}

#[async_trait]
impl QuoteTransport for SimTransport {
    async fn request(
        &mut self,
        request: &TicksHistoryRequest,
    ) -> Result<HistoryResponse, ConnectionError> {
        if !self.alive {
            return Err(ConnectionError::Closed);
        }
        let feed = Arc::clone(&self.feed);
        let _in_flight = InFlight::enter(&feed);
        let request_no = feed.requests.fetch_add(1, Ordering::SeqCst) + 1;
        feed.log.lock().unwrap().push(request.clone());

        let latency = *feed.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let fault = feed.faults.lock().unwrap().remove(&request_no);
        match fault {
            Some(Fault::Drop) => {
                self.alive = false;
                Err(ConnectionError::Receive("connection reset by peer".to_string()))
            }
            Some(Fault::Hang) => {
                tokio::time::sleep(Duration::from_secs(24 * 3_600)).await;
                Err(ConnectionError::Closed)
            }
            Some(Fault::Remote(err)) => Ok(HistoryResponse::Error(err)),
            Some(Fault::Frame(text)) => match decode_response(&text) {
                Ok(frame) => Ok(frame.response),
                Err(err) => {
                    self.alive = false;
                    Err(ConnectionError::Decode(err.to_string()))
                }
            },
            None => Ok(feed.answer(request)),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn close(&mut self) {
        self.alive = false;
    }
}

/// Quiet pacing suitable for paused-clock tests.
pub fn test_config(page_size: u32) -> SyncConfig {
    SyncConfig {
        pagination: PaginationConfig {
            page_size,
            ..PaginationConfig::default()
        },
        rate_limit_ms: 150,
        max_retries: 3,
        retry_backoff_ms: 1_000,
    }
}

pub fn temp_store() -> (TempDir, Arc<CandleStore>) {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = CandleStore::open(dir.path().join("candles.sqlite"))
        .expect("candle store should open");
    (dir, Arc::new(store))
}

/// Records every progress report.
#[derive(Default)]
pub struct ProgressLog {
    pub events: Mutex<Vec<(f64, String)>>,
}

impl candle_sync::ProgressReporter for ProgressLog {
    fn report(&self, fraction: f64, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((fraction, message.to_string()));
    }
}

impl ProgressLog {
    pub fn fractions(&self) -> Vec<f64> {
        self.events.lock().unwrap().iter().map(|(f, _)| *f).collect()
    }
}
