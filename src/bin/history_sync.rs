use std::sync::Arc;

use candle_sync::{
    connection_config_from_env, init_logging, log_app_finish, log_app_start,
    logging_config_from_env, run_config_from_env, sync_config_from_env, timeframe_label,
    utc_now_epoch, CandleStore, LogProgress, SyncOrchestrator, SyncReport, SyncRequest,
    SyncStatus, WsConnector, DAY_SECS,
};
use tracing::{error, info, warn};

const APP: &str = "history_sync";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(APP, &logging);

    let sync_cfg = sync_config_from_env()?;
    let conn_cfg = connection_config_from_env()?;

    let run = run_config_from_env()?;
    let now = utc_now_epoch();
    let end = run.end.unwrap_or(now);
    let granularity = run.granularity;
    let instruments = run.instruments;

    let store = Arc::new(CandleStore::open(&run.db_path)?);
    let mut orchestrator =
        SyncOrchestrator::new(WsConnector::new(conn_cfg), Arc::clone(&store), sync_cfg);

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(component = APP, event = "app.interrupt");
            cancel.cancel();
        }
    });

    println!(
        "History sync | store={} instruments={} granularity={}s ({}) direction={}",
        run.db_path.display(),
        instruments.join(","),
        granularity,
        timeframe_label(granularity).unwrap_or("custom"),
        run.direction.as_str()
    );

    let mut failures = 0usize;
    for instrument in &instruments {
        let outcome = match run.start {
            Some(start) => {
                let request =
                    SyncRequest::new(instrument, granularity, start, end, run.direction);
                orchestrator.run(&request, &LogProgress).await.map(Some)
            }
            // Without an explicit start, extend the stored series up to now.
            None => {
                orchestrator
                    .catch_up(
                        instrument,
                        granularity,
                        now - run.catch_up_days * DAY_SECS,
                        end,
                        &LogProgress,
                    )
                    .await
            }
        };

        match outcome {
            Ok(Some(report)) => {
                print_report(&report);
                if report.status == SyncStatus::Cancelled {
                    break;
                }
            }
            Ok(None) => println!("{instrument}@{granularity}s | already up to date"),
            Err(err) => {
                failures += 1;
                error!(
                    component = APP,
                    event = "app.sync_failed",
                    instrument = %instrument,
                    error = %err
                );
                println!("{instrument}@{granularity}s | FAILED: {err}");
            }
        }
    }

    orchestrator.shutdown().await;

    for summary in store.series()? {
        info!(
            component = APP,
            event = "app.series",
            series = %summary.key,
            count = summary.count,
            first_epoch = summary.first_epoch,
            last_epoch = summary.last_epoch
        );
    }

    if failures > 0 {
        log_app_finish(APP, "failed");
        return Err(format!("{failures} of {} instrument syncs failed", instruments.len()).into());
    }
    log_app_finish(APP, "ok");
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!(
        "{} | {:?} fetched={} inserted={} stored_in_range={} pages={} gap_skips={} reconnects={}",
        report.key,
        report.status,
        report.candles_fetched,
        report.inserted,
        report.period_count,
        report.pages,
        report.gap_skips,
        report.reconnects
    );
}
