//! Bound-state detection
//!
//! A device is bound when the usbip-host driver has claimed it, which shows
//! up as an entry named after the busid in the driver's sysfs directory.

use protocol::BusId;
use std::path::{Path, PathBuf};

/// Default usbip-host driver directory
pub const DEFAULT_DRIVER_DIR: &str = "/sys/bus/usb/drivers/usbip-host";

/// Answers "is this busid currently claimed by the sharing driver?"
pub trait BoundProbe: Send + Sync {
    fn is_bound(&self, busid: &BusId) -> bool;
}

impl<F> BoundProbe for F
where
    F: Fn(&BusId) -> bool + Send + Sync,
{
    fn is_bound(&self, busid: &BusId) -> bool {
        self(busid)
    }
}

/// Probe backed by the sysfs driver directory
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    driver_dir: PathBuf,
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self::new(DEFAULT_DRIVER_DIR)
    }
}

impl SysfsProbe {
    pub fn new(driver_dir: impl Into<PathBuf>) -> Self {
        Self {
            driver_dir: driver_dir.into(),
        }
    }

    pub fn driver_dir(&self) -> &Path {
        &self.driver_dir
    }

    /// Whether the driver is loaded at all
    pub fn driver_present(&self) -> bool {
        self.driver_dir.is_dir()
    }
}

impl BoundProbe for SysfsProbe {
    fn is_bound(&self, busid: &BusId) -> bool {
        // BusId cannot contain '/', so this stays inside driver_dir
        self.driver_dir.join(busid.as_str()).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysfs_probe_checks_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("1-1.2")).unwrap();

        let probe = SysfsProbe::new(dir.path());
        assert!(probe.driver_present());
        assert!(probe.is_bound(&BusId::parse("1-1.2").unwrap()));
        assert!(!probe.is_bound(&BusId::parse("1-1.3").unwrap()));
    }

    #[test]
    fn test_missing_driver_dir() {
        let probe = SysfsProbe::new("/nonexistent/usbip-host");
        assert!(!probe.driver_present());
        assert!(!probe.is_bound(&BusId::parse("1-1").unwrap()));
    }

    #[test]
    fn test_closure_probe() {
        let probe = |b: &BusId| b.as_str().ends_with(".1");
        assert!(probe.is_bound(&BusId::parse("2-1.1").unwrap()));
    }
}
