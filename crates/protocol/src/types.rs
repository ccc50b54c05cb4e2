//! Device type definitions
//!
//! A [`BusId`] is the only way a bus identifier enters the system. It is
//! checked once, at construction, and every other component relies on that.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a bus identifier
pub const MAX_BUSID_LEN: usize = 63;

/// Maximum length of the `info` field in bytes
pub const MAX_INFO_LEN: usize = 255;

/// Validated bus identifier (e.g. `1-1.2`)
///
/// Only ASCII digits, `.` and `-` are accepted, between 1 and
/// [`MAX_BUSID_LEN`] characters. Nothing in that alphabet has meaning to a
/// shell or to an argument parser beyond a leading `-`, which is rejected
/// as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BusId(String);

impl BusId {
    /// Validate and wrap a bus identifier
    ///
    /// # Example
    /// ```
    /// use protocol::BusId;
    ///
    /// assert!(BusId::parse("1-1.2").is_ok());
    /// assert!(BusId::parse("; rm -rf /").is_err());
    /// assert!(BusId::parse("").is_err());
    /// ```
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(ProtocolError::InvalidBusId { reason: "empty" });
        }
        if raw.len() > MAX_BUSID_LEN {
            return Err(ProtocolError::InvalidBusId {
                reason: "longer than 63 characters",
            });
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_digit() || b == b'.' || b == b'-')
        {
            return Err(ProtocolError::InvalidBusId {
                reason: "contains characters outside [0-9.-]",
            });
        }
        // A leading dash would be read as an option by the bind tool
        if raw.starts_with('-') {
            return Err(ProtocolError::InvalidBusId {
                reason: "starts with '-'",
            });
        }
        Ok(Self(raw.to_string()))
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BusId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BusId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<BusId> for String {
    fn from(value: BusId) -> Self {
        value.0
    }
}

/// One device as seen by the inventory tool
///
/// Serialized as `{"busid":"1-1","info":"...","bound":false}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Bus position, primary key within a snapshot
    pub busid: BusId,
    /// Free-text description, sanitized and length-capped
    pub info: String,
    /// Whether the sharing driver currently claims this device
    pub bound: bool,
}

impl DeviceRecord {
    /// Create a record, sanitizing `info` on the way in
    pub fn new(busid: BusId, info: &str, bound: bool) -> Self {
        Self {
            busid,
            info: sanitize_info(info),
            bound,
        }
    }

    /// The part of a record that participates in change detection
    pub fn change_key(&self) -> (&BusId, bool) {
        (&self.busid, self.bound)
    }
}

/// Strip control characters and cap at [`MAX_INFO_LEN`] bytes
///
/// Truncation always lands on a character boundary.
pub fn sanitize_info(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_INFO_LEN));
    for c in raw.chars().filter(|c| !c.is_control()) {
        if out.len() + c.len_utf8() > MAX_INFO_LEN {
            break;
        }
        out.push(c);
    }
    out
}
