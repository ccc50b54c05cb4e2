//! Wire types for usbctl
//!
//! This crate defines what travels between the server and a browser: the
//! validated bus identifier, the device record, the bind/unbind request and
//! response bodies, and the push-stream frame encoding.
//!
//! # Example
//!
//! ```
//! use protocol::{BusId, DeviceRecord, encode_snapshot_frame};
//!
//! let busid = BusId::parse("1-1.2").unwrap();
//! let records = vec![DeviceRecord::new(busid, "Foo Corp Widget", false)];
//!
//! let frame = encode_snapshot_frame(&records).unwrap();
//! assert!(frame.starts_with("data: ["));
//! assert!(frame.ends_with("\n\n"));
//! ```
//!
//! Any string that does not match `[0-9.\-]{1,63}` is rejected by
//! [`BusId::parse`], so a `BusId` can be handed to a process spawner as-is.

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{
    HEARTBEAT_FRAME, MAX_FRAME_SIZE, encode_data_frame, encode_snapshot, encode_snapshot_frame,
};
pub use error::{ProtocolError, Result};
pub use messages::{BindRequest, OperationResponse, OperationStatus};
pub use types::{BusId, DeviceRecord, MAX_BUSID_LEN, MAX_INFO_LEN, sanitize_info};
