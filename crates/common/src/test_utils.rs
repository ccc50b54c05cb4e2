//! Test utilities for usbctl
//!
//! Canned tool output and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_record;
//!
//! let record = create_mock_record("1-1", "Foo Corp Widget", true);
//! assert_eq!(record.busid.as_str(), "1-1");
//! assert!(record.bound);
//! ```

use protocol::{BusId, DeviceRecord};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// `usbip list -l` output for two devices, one with an unresolved vendor
pub const USBIP_LIST_OUTPUT: &str = "\
 - busid 1-1.2 (046d:c52b)
   Logitech, Inc. : Unifying Receiver (046d:c52b)

 - busid 1-1.3 (1a86:7523)
   unknown vendor : unknown product (1a86:7523)

";

/// `lsusb` output covering the unresolved device above
pub const LSUSB_OUTPUT: &str = "\
Bus 001 Device 001: ID 1d6b:0002 Linux Foundation 2.0 root hub
Bus 001 Device 004: ID 046d:c52b Logitech, Inc. Unifying Receiver
Bus 001 Device 005: ID 1a86:7523 QinHeng Electronics CH340 serial converter
";

/// Create a record with a known-good busid
///
/// # Panics
/// Panics if `busid` does not pass validation.
pub fn create_mock_record(busid: &str, info: &str, bound: bool) -> DeviceRecord {
    let busid = BusId::parse(busid).expect("mock busid must be valid");
    DeviceRecord::new(busid, info, bound)
}

/// Build `usbip list -l` style output for the given busids
///
/// Each entry gets a single continuation line with `info`, or none when
/// `info` is empty.
pub fn create_mock_inventory(entries: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (busid, info) in entries {
        out.push_str(&format!(" - busid {} (dead:beef)\n", busid));
        if !info.is_empty() {
            out.push_str(&format!("   {}\n", info));
        }
        out.push('\n');
    }
    out
}

/// Run a future with a timeout
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_inventory_shape() {
        let out = create_mock_inventory(&[("1-1", "Foo Corp Widget"), ("1-2", "")]);
        assert_eq!(
            out,
            " - busid 1-1 (dead:beef)\n   Foo Corp Widget\n\n - busid 1-2 (dead:beef)\n\n"
        );
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        assert!(result.is_err());
    }
}
