//! Connectivity check: asks the quote service for the latest few candles of each instrument.

use candle_sync::{
    connection_config_from_env, init_logging, log_app_finish, log_app_start,
    logging_config_from_env, run_config_from_env, ConnectionManager, HistoryResponse,
    QuoteTransport, TicksHistoryRequest, WsConnector,
};
use chrono::{TimeZone, Utc};
use tracing::warn;

const APP: &str = "quote_check";
const LATEST_COUNT: u32 = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(APP, &logging);

    let conn_cfg = connection_config_from_env()?;
    // Same selection as history_sync: the whole catalog unless CANDLESYNC_INSTRUMENTS is set.
    let run = run_config_from_env()?;
    let instruments = run.instruments;
    let granularity = run.granularity;

    println!(
        "Quote check | endpoint={} granularity={granularity}s",
        conn_cfg.endpoint()
    );
    let mut connections = ConnectionManager::new(WsConnector::new(conn_cfg));

    let mut ok = 0usize;
    for instrument in &instruments {
        let request = TicksHistoryRequest::latest(instrument, granularity, LATEST_COUNT);
        let outcome = match connections.ensure().await {
            Ok(transport) => transport.request(&request).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(HistoryResponse::Candles(candles)) => match candles.last() {
                Some(last) => {
                    ok += 1;
                    println!(
                        "{instrument:<12} OK    {} candles, last {} close={}",
                        candles.len(),
                        fmt_epoch(last.epoch),
                        last.close
                    );
                }
                None => println!("{instrument:<12} EMPTY no candles returned"),
            },
            Ok(HistoryResponse::Error(err)) => println!("{instrument:<12} API   {err}"),
            Err(err) => {
                warn!(
                    component = APP,
                    event = "quote_check.transport_error",
                    instrument = %instrument,
                    error = %err
                );
                println!("{instrument:<12} FAIL  {err}");
                connections.invalidate().await;
            }
        }
    }

    connections.shutdown().await;
    println!("\n{ok}/{} instruments answered with candles", instruments.len());
    log_app_finish(APP, if ok == instruments.len() { "ok" } else { "partial" });
    Ok(())
}

fn fmt_epoch(epoch: i64) -> String {
    Utc.timestamp_opt(epoch, 0)
        .single()
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| epoch.to_string())
}
