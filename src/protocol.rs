//! Wire messages for the remote `ticks_history` candle endpoint.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::candle::Candle;

/// Largest page the remote service returns for one request.
pub const MAX_PAGE_SIZE: u32 = 5_000;

const RANGE_EXHAUSTED_MARKERS: [&str; 2] = [
    "start time is after end time",
    "starttime is after endtime",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEnd {
    Epoch(i64),
    Latest,
}

impl Serialize for HistoryEnd {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Epoch(epoch) => serializer.serialize_i64(*epoch),
            Self::Latest => serializer.serialize_str("latest"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicksHistoryRequest {
    pub ticks_history: String,
    pub adjust_start_time: u8,
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    pub end: HistoryEnd,
    pub style: &'static str,
    pub granularity: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<u64>,
}

impl TicksHistoryRequest {
    /// Page anchored on both sides: `[start, end]`.
    pub fn bounded(instrument: &str, granularity: u32, count: u32, start: i64, end: i64) -> Self {
        Self::build(instrument, granularity, count, Some(start), HistoryEnd::Epoch(end))
    }

    /// Page anchored on its upper side only; the service returns the newest `count` candles at
    /// or before `end`.
    pub fn ending_at(instrument: &str, granularity: u32, count: u32, end: i64) -> Self {
        Self::build(instrument, granularity, count, None, HistoryEnd::Epoch(end))
    }

    pub fn latest(instrument: &str, granularity: u32, count: u32) -> Self {
        Self::build(instrument, granularity, count, None, HistoryEnd::Latest)
    }

    fn build(
        instrument: &str,
        granularity: u32,
        count: u32,
        start: Option<i64>,
        end: HistoryEnd,
    ) -> Self {
        Self {
            ticks_history: instrument.to_string(),
            adjust_start_time: 1,
            count: count.clamp(1, MAX_PAGE_SIZE),
            start,
            end,
            style: "candles",
            granularity,
            req_id: None,
        }
    }

    pub fn with_req_id(mut self, req_id: u64) -> Self {
        self.req_id = Some(req_id);
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WireCandle {
    pub epoch: i64,
    #[serde(deserialize_with = "de_f64")]
    pub open: f64,
    #[serde(deserialize_with = "de_f64")]
    pub high: f64,
    #[serde(deserialize_with = "de_f64")]
    pub low: f64,
    #[serde(deserialize_with = "de_f64")]
    pub close: f64,
}

impl WireCandle {
    pub fn into_candle(self, instrument: &str, granularity: u32) -> Candle {
        Candle {
            instrument: instrument.to_string(),
            granularity,
            epoch: self.epoch,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The service reports a request whose start anchor already lies past its end anchor. For a
    /// cursor walking toward its boundary this means the remaining sub-range is empty.
    pub fn is_range_exhausted(&self) -> bool {
        let message = self.message.to_ascii_lowercase();
        RANGE_EXHAUSTED_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryResponse {
    Candles(Vec<WireCandle>),
    Error(RemoteError),
}

#[derive(Debug, Deserialize)]
struct RawHistoryResponse {
    #[serde(default)]
    candles: Option<Vec<WireCandle>>,
    #[serde(default)]
    error: Option<RemoteError>,
    #[serde(default)]
    req_id: Option<u64>,
}

/// A decoded frame together with the request id it answers, if the service echoed one.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub req_id: Option<u64>,
    pub response: HistoryResponse,
}

/// Decodes one `ticks_history` reply. A frame carrying neither `candles` nor `error` is not a
/// candle reply at all and fails to decode; only an explicit empty `candles` array is an
/// empty page.
pub fn decode_response(text: &str) -> Result<ResponseFrame, serde_json::Error> {
    let raw: RawHistoryResponse = serde_json::from_str(text)?;
    let response = match (raw.error, raw.candles) {
        (Some(error), _) => HistoryResponse::Error(error),
        (None, Some(candles)) => HistoryResponse::Candles(candles),
        (None, None) => {
            return Err(de::Error::custom("frame carries neither `candles` nor `error`"));
        }
    };
    Ok(ResponseFrame {
        req_id: raw.req_id,
        response,
    })
}

fn de_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    if let Some(v) = value.as_f64() {
        return Ok(v);
    }
    let text = value
        .as_str()
        .ok_or_else(|| de::Error::custom("expected f64-compatible value"))?;
    text.trim().parse().map_err(de::Error::custom)
}
