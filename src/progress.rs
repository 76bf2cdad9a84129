//! Progress callbacks for a running sync.

use tracing::info;

/// Receives `fraction` in `[0, 1]` and a human-readable status line.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, fraction: f64, message: &str);
}

impl<F> ProgressReporter for F
where
    F: Fn(f64, &str) + Send + Sync,
{
    fn report(&self, fraction: f64, message: &str) {
        self(fraction, message)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _fraction: f64, _message: &str) {}
}

/// Forwards progress to the log at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn report(&self, fraction: f64, message: &str) {
        info!(
            component = "sync",
            event = "sync.progress",
            percent = (fraction * 1_000.0).round() / 10.0,
            message
        );
    }
}
