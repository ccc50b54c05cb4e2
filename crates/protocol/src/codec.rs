//! Push-stream frame encoding
//!
//! The stream endpoint speaks the `text/event-stream` format. Two frame
//! kinds are ever written:
//!
//! ```text
//! data: <json snapshot>\n\n     device list update
//! : heartbeat\n\n               keep-alive comment, ignored by browsers
//! ```
//!
//! A JSON payload never contains a raw newline (serde_json escapes them), so
//! a snapshot always fits in a single `data:` line.

use crate::{DeviceRecord, error::ProtocolError, error::Result};

/// Maximum size of one encoded frame (64 KiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Keep-alive comment frame
pub const HEARTBEAT_FRAME: &str = ": heartbeat\n\n";

/// Serialize a snapshot as a JSON array
///
/// # Example
/// ```
/// use protocol::encode_snapshot;
///
/// assert_eq!(encode_snapshot(&[]).unwrap(), "[]");
/// ```
pub fn encode_snapshot(records: &[DeviceRecord]) -> Result<String> {
    serde_json::to_string(records).map_err(ProtocolError::from)
}

/// Wrap a JSON payload into a `data:` frame
pub fn encode_data_frame(json: &str) -> Result<String> {
    let size = json.len() + "data: ".len() + 2;
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = String::with_capacity(size);
    frame.push_str("data: ");
    frame.push_str(json);
    frame.push_str("\n\n");
    Ok(frame)
}

/// Serialize a snapshot straight into a `data:` frame
pub fn encode_snapshot_frame(records: &[DeviceRecord]) -> Result<String> {
    encode_data_frame(&encode_snapshot(records)?)
}
