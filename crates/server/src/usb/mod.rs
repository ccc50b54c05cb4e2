//! USB subsystem
//!
//! Device inventory and bind state, all driven through the external `usbip`
//! tool:
//! - `parser` turns inventory text into device records
//! - `sysfs` answers whether a busid is claimed by the sharing driver
//! - `desired` persists the operator's bound set across restarts
//! - `registry` owns the current snapshot and the bind/unbind operations
//!
//! External commands block, so the registry runs them on Tokio's blocking
//! pool and only takes its locks to install results.

pub mod desired;
pub mod parser;
pub mod registry;
pub mod sysfs;

// Re-export public types
pub use desired::{DesiredBoundStore, MemoryBoundStore};
pub use parser::{enrich, parse_inventory, parse_lsusb};
pub use registry::{
    DEFAULT_MAX_DEVICES, DeviceRegistry, Operation, RegistryError, RegistryOptions, Snapshot,
    snapshot_changed,
};
pub use sysfs::{BoundProbe, DEFAULT_DRIVER_DIR, SysfsProbe};
