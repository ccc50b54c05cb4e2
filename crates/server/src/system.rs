//! Host compatibility checks
//!
//! Run once at startup. Nothing here is fatal: the server can still show an
//! empty device list and serve its page, so problems are only reported.

use crate::exec::USBIP;
use crate::usb::SysfsProbe;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Findings of [`check_host`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReport {
    /// Where `usbip` was found on `PATH`
    pub usbip: Option<PathBuf>,
    pub driver_loaded: bool,
    pub is_root: bool,
}

impl HostReport {
    pub fn is_ready(&self) -> bool {
        self.usbip.is_some() && self.driver_loaded && self.is_root
    }
}

/// Inspect the host and log anything that will stop bind/unbind from working
pub fn check_host(probe: &SysfsProbe) -> HostReport {
    let report = HostReport {
        usbip: find_in_path(USBIP, env::var_os("PATH").as_deref()),
        driver_loaded: probe.driver_present(),
        is_root: nix::unistd::geteuid().is_root(),
    };

    info!("Running on {} ({})", env::consts::OS, env::consts::ARCH);

    match &report.usbip {
        Some(path) => info!("Using {}", path.display()),
        None => warn!("usbip command not found. Install: sudo apt install linux-tools-generic"),
    }
    if !report.driver_loaded {
        warn!(
            "usbip-host driver not found at {}. Run: sudo modprobe usbip-host",
            probe.driver_dir().display()
        );
    }
    if !report.is_root {
        warn!("Not running as root. Bind and unbind will likely fail");
    }

    report
}

/// Locate an executable named `program` in a `PATH`-style list
pub fn find_in_path(program: &str, path: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    env::split_paths(path?)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
