//! Wire protocol for realtime change notifications.
//!
//! Frames are JSON objects tagged by `action`:
//!
//! ```json
//! {"action": "created", "record": {"id": 7, "name": "circle"}}
//! {"action": "updated", "record": {"id": 7, "name": "oval"}}
//! {"action": "deleted", "record_id": 7}
//! ```
//!
//! The record may also arrive under the resource-named key `shape`, and the
//! identifier under `recordId` or `shape_id`.

use livecrud_core::{ChangeNotification, Record, RecordId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error decoding a realtime frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    action: String,
    #[serde(default, alias = "shape")]
    record: Option<Record>,
    #[serde(default, alias = "recordId", alias = "shape_id")]
    record_id: Option<RecordId>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum OutboundFrame<'a> {
    Created { record: &'a Record },
    Updated { record: &'a Record },
    Deleted { record_id: &'a RecordId },
}

/// Decode one text frame.
///
/// # Errors
/// Returns `Malformed` for non-JSON input, unknown actions, and frames
/// missing the record or identifier their action needs.
pub fn decode(text: &str) -> Result<ChangeNotification, ProtocolError> {
    let frame: InboundFrame =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let action = frame.action.to_ascii_lowercase();
    match action.as_str() {
        "created" => frame
            .record
            .map(ChangeNotification::Created)
            .ok_or_else(|| ProtocolError::Malformed("created without record".to_string())),
        "updated" => frame
            .record
            .map(ChangeNotification::Updated)
            .ok_or_else(|| ProtocolError::Malformed("updated without record".to_string())),
        "deleted" => frame
            .record_id
            .or_else(|| frame.record.map(|r| r.id))
            .map(ChangeNotification::Deleted)
            .ok_or_else(|| ProtocolError::Malformed("deleted without record id".to_string())),
        other => Err(ProtocolError::Malformed(format!("unknown action {other:?}"))),
    }
}

/// Decode a binary frame carrying UTF-8 JSON.
///
/// # Errors
/// Returns `Malformed` if the bytes are not UTF-8 or do not decode.
pub fn decode_bytes(data: &[u8]) -> Result<ChangeNotification, ProtocolError> {
    let text = std::str::from_utf8(data).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    decode(text)
}

/// Encode a notification in canonical form.
#[must_use]
pub fn encode(notification: &ChangeNotification) -> String {
    let frame = match notification {
        ChangeNotification::Created(record) => OutboundFrame::Created { record },
        ChangeNotification::Updated(record) => OutboundFrame::Updated { record },
        ChangeNotification::Deleted(record_id) => OutboundFrame::Deleted { record_id },
    };
    // Records are JSON maps keyed by strings; serialization cannot fail.
    serde_json::to_string(&frame).unwrap_or_default()
}
