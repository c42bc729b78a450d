//! Combined-Stream Codec
//!
//! Binance futures combined streams wrap every event in an envelope:
//!
//! ```json
//! {"stream":"btcusdt@kline_1m","data":{"e":"kline","k":{"x":true, ...}}}
//! ```
//!
//! Replies to `SUBSCRIBE`/`UNSUBSCRIBE` commands arrive on the same socket
//! as `{"result":null,"id":1}` or `{"error":{"code":..,"msg":..},"id":1}`.
//!
//! Only the stream name, the event tag and the kline `x` flag are read;
//! the rest of the payload is forwarded untouched.

use serde::{Deserialize, Serialize};

use crate::domain::event::StreamEvent;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Not valid JSON, or a field had the wrong type.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// A kline event without its `k` object.
    #[error("kline event on {0} has no kline body")]
    MissingKline(String),

    /// Valid JSON that is neither an event nor a command reply.
    #[error("unrecognized frame")]
    Unrecognized,
}

/// One decoded text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Market event on `stream`.
    Event {
        /// Combined-stream name, e.g. `btcusdt@kline_1m`.
        stream: String,
        /// Decoded event shape.
        event: StreamEvent,
    },
    /// Command accepted.
    Ack {
        /// Command id.
        id: u64,
    },
    /// Command rejected.
    Rejected {
        /// Command id, when echoed.
        id: Option<u64>,
        /// Exchange error code.
        code: i64,
        /// Exchange error message.
        msg: String,
    },
}

#[derive(Deserialize)]
struct Envelope {
    stream: Option<String>,
    data: Option<EventBody>,
    id: Option<u64>,
    error: Option<CommandError>,
}

#[derive(Deserialize)]
struct EventBody {
    #[serde(rename = "e")]
    event_type: Option<String>,
    #[serde(rename = "k")]
    kline: Option<KlineBody>,
}

#[derive(Deserialize)]
struct KlineBody {
    #[serde(rename = "x", default)]
    closed: bool,
}

#[derive(Deserialize)]
struct CommandError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

const KLINE: &str = "kline";

/// Decode one text frame.
///
/// # Errors
///
/// Returns an error for malformed JSON, a kline event with no body, or a
/// frame of an unknown shape.
pub fn decode(text: &str) -> Result<Frame, CodecError> {
    let envelope: Envelope = serde_json::from_str(text)?;

    if let Some(stream) = envelope.stream {
        let body = envelope.data.unwrap_or(EventBody {
            event_type: None,
            kline: None,
        });
        let event = match body.event_type.as_deref() {
            Some(KLINE) => {
                let kline = body.kline.ok_or_else(|| CodecError::MissingKline(stream.clone()))?;
                StreamEvent::Kline {
                    closed: kline.closed,
                }
            }
            Some(other) => StreamEvent::Other(other.to_string()),
            None => StreamEvent::Other("unknown".to_string()),
        };
        return Ok(Frame::Event { stream, event });
    }

    if let Some(error) = envelope.error {
        return Ok(Frame::Rejected {
            id: envelope.id,
            code: error.code,
            msg: error.msg,
        });
    }

    envelope
        .id
        .map(|id| Frame::Ack { id })
        .ok_or(CodecError::Unrecognized)
}

/// `SUBSCRIBE` / `UNSUBSCRIBE` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command<'a> {
    /// `SUBSCRIBE` or `UNSUBSCRIBE`.
    pub method: &'static str,
    /// Stream names.
    pub params: Vec<&'a str>,
    /// Correlation id echoed in the reply.
    pub id: u64,
}

impl<'a> Command<'a> {
    /// Subscribe to `streams`.
    #[must_use]
    pub fn subscribe(streams: impl IntoIterator<Item = &'a str>, id: u64) -> Self {
        Self {
            method: "SUBSCRIBE",
            params: streams.into_iter().collect(),
            id,
        }
    }

    /// Unsubscribe from `streams`.
    #[must_use]
    pub fn unsubscribe(streams: impl IntoIterator<Item = &'a str>, id: u64) -> Self {
        Self {
            method: "UNSUBSCRIBE",
            params: streams.into_iter().collect(),
            id,
        }
    }

    /// Serialize to the wire format.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}
