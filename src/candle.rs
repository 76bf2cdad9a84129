//! Candle data model and sync request validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::is_supported_granularity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    pub granularity: u32,
    pub epoch: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.instrument.clone(), self.granularity)
    }
}

/// Identifies one stored series: all candles of an instrument at one granularity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub instrument: String,
    pub granularity: u32,
}

impl SeriesKey {
    pub fn new(instrument: impl Into<String>, granularity: u32) -> Self {
        Self {
            instrument: instrument.into(),
            granularity,
        }
    }

    pub fn step_secs(&self) -> i64 {
        i64::from(self.granularity)
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}s", self.instrument, self.granularity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Walk from `range_start` toward `range_end`.
    Forward,
    /// Walk from `range_end` back toward `range_start`.
    Backward,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "forward" | "fwd" => Some(Self::Forward),
            "backward" | "back" | "reverse" => Some(Self::Backward),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub instrument: String,
    pub granularity: u32,
    pub range_start: i64,
    pub range_end: i64,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("instrument must not be blank")]
    BlankInstrument,
    #[error("granularity must be a positive number of seconds")]
    ZeroGranularity,
    #[error("granularity {0}s is not one of the supported timeframes")]
    UnsupportedGranularity(u32),
    #[error("range start {start} must be before range end {end}")]
    EmptyRange { start: i64, end: i64 },
}

impl SyncRequest {
    pub fn new(
        instrument: impl Into<String>,
        granularity: u32,
        range_start: i64,
        range_end: i64,
        direction: Direction,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            granularity,
            range_start,
            range_end,
            direction,
        }
    }

    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.instrument.clone(), self.granularity)
    }

    pub fn span_secs(&self) -> i64 {
        self.range_end.saturating_sub(self.range_start)
    }

    pub fn contains(&self, epoch: i64) -> bool {
        epoch >= self.range_start && epoch <= self.range_end
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.instrument.trim().is_empty() {
            return Err(ValidationError::BlankInstrument);
        }
        if self.granularity == 0 {
            return Err(ValidationError::ZeroGranularity);
        }
        if !is_supported_granularity(self.granularity) {
            return Err(ValidationError::UnsupportedGranularity(self.granularity));
        }
        if self.range_start >= self.range_end {
            return Err(ValidationError::EmptyRange {
                start: self.range_start,
                end: self.range_end,
            });
        }
        Ok(())
    }
}
