//! `text/event-stream` framing for the frames the relay itself authors.
//!
//! Backend chunks never pass through here; they are written to the client
//! exactly as received.

use bytes::Bytes;
use chat_relay_error::StreamErrorEvent;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

pub const CONTENT_TYPE: &str = "text/event-stream";
pub const CACHE_CONTROL: &str = "no-cache, no-transform";

pub fn connected_frame(at: DateTime<Utc>) -> Bytes {
    comment_frame("connected", at)
}

pub fn keep_alive_frame(at: DateTime<Utc>) -> Bytes {
    comment_frame("keep-alive", at)
}

fn comment_frame(label: &str, at: DateTime<Utc>) -> Bytes {
    Bytes::from(format!(
        ": {label} {}\n\n",
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    ))
}

/// Serializes `payload` as a single `data:` event. JSON never contains a raw
/// newline, so the result is always exactly one line plus the terminator.
pub fn data_frame<T: Serialize>(payload: &T) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(payload)?;
    Ok(Bytes::from(format!("data: {json}\n\n")))
}

pub fn error_frame(event: &StreamErrorEvent) -> Bytes {
    data_frame(event).unwrap_or_else(|_| {
        Bytes::from_static(b"data: {\"type\":\"error\",\"content\":\"stream failed\"}\n\n")
    })
}
