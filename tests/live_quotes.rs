#![cfg(feature = "live-quote-tests")]

use std::sync::Arc;

use candle_sync::{
    utc_now_epoch, CandleStore, ConnectionConfig, ConnectionManager, Direction, HistoryResponse,
    NoProgress, QuoteTransport, SeriesKey, SyncConfig, SyncOrchestrator, SyncRequest,
    TicksHistoryRequest, WsConnector,
};
use tokio::time::{sleep, Duration};

#[tokio::test]
async fn live_service_answers_latest_and_unknown_symbols() {
    let mut connections = ConnectionManager::new(WsConnector::new(ConnectionConfig::default()));
    let mut attempts = 0;

    while attempts < 3 {
        attempts += 1;

        let transport = match connections.ensure().await {
            Ok(transport) => transport,
            Err(_) => {
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };
        let latest = transport
            .request(&TicksHistoryRequest::latest("R_100", 60, 10))
            .await;
        let unknown = transport
            .request(&TicksHistoryRequest::latest("NOT_A_SYMBOL_000", 60, 10))
            .await;

        if let (Ok(HistoryResponse::Candles(candles)), Ok(HistoryResponse::Error(err))) =
            (latest, unknown)
        {
            assert!(!candles.is_empty() && candles.len() <= 10);
            assert!(candles.windows(2).all(|pair| pair[0].epoch < pair[1].epoch));
            assert!(!err.code.is_empty());
            connections.shutdown().await;
            return;
        }

        connections.invalidate().await;
        sleep(Duration::from_secs(2)).await;
    }

    panic!("live service did not answer both requests after {attempts} attempts");
}

#[tokio::test]
async fn live_forward_sync_fills_the_last_hours() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = Arc::new(CandleStore::open(dir.path().join("live.sqlite")).expect("store"));
    let mut sync = SyncOrchestrator::new(
        WsConnector::new(ConnectionConfig::default()),
        Arc::clone(&store),
        SyncConfig::default(),
    );

    let now = utc_now_epoch();
    let start = now - now.rem_euclid(60) - 6 * 3_600;
    let request = SyncRequest::new("R_100", 60, start, now, Direction::Forward);
    let report = sync
        .run(&request, &NoProgress)
        .await
        .expect("live sync should succeed");
    sync.shutdown().await;

    // Synthetic indices trade around the clock, so six hours should be nearly complete.
    assert!(report.period_count >= 350, "period_count = {}", report.period_count);
    let gaps = store
        .find_gaps(&SeriesKey::new("R_100", 60), start, start + 5 * 3_600)
        .expect("gap report");
    assert!(gaps.missing_slots <= 5, "missing = {}", gaps.missing_slots);
}
