//! Device registry
//!
//! Owns the current device snapshot and the desired bound set. Both the poll
//! loop and HTTP handlers call in here; nothing else touches device state.
//!
//! The snapshot is an `Arc<Vec<DeviceRecord>>` swapped under a write lock.
//! Readers clone the `Arc`, so they hold either the old list or the new one
//! in full and never see a mix. External commands run on the blocking pool
//! while no registry lock is held.

use crate::exec::{CommandExecutor, CommandOutput, ExecError, LSUSB, USBIP};
use crate::usb::desired::DesiredBoundStore;
use crate::usb::parser::{enrich, parse_inventory, parse_lsusb};
use crate::usb::sysfs::BoundProbe;
use protocol::{BusId, DeviceRecord, ProtocolError, sanitize_info};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Default registry capacity
pub const DEFAULT_MAX_DEVICES: usize = 32;

/// Longest error message handed back to a client
const MAX_ERROR_MESSAGE_LEN: usize = 160;

/// Immutable point-in-time device list
pub type Snapshot = Arc<Vec<DeviceRecord>>;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Rejected before any process was spawned
    #[error(transparent)]
    Validation(#[from] ProtocolError),

    /// The external tool could not run or reported failure
    ///
    /// `message` is already sanitized for display to a client.
    #[error("{message}")]
    Execution { message: String },
}

impl RegistryError {
    fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }
}

impl From<ExecError> for RegistryError {
    fn from(e: ExecError) -> Self {
        let message = match e {
            ExecError::NotAllowed(_) => "command not permitted".to_string(),
            ExecError::Spawn { program, .. } => {
                format!("{} is not installed or not executable", program)
            }
            ExecError::TimedOut { program, .. } => format!("{} timed out", program),
            ExecError::Io { program, .. } => format!("failed to run {}", program),
        };
        Self::Execution { message }
    }
}

/// State-changing operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Bind,
    Unbind,
}

impl Operation {
    fn subcommand(self) -> &'static str {
        match self {
            Operation::Bind => "bind",
            Operation::Unbind => "unbind",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subcommand())
    }
}

/// Registry tuning
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Maximum number of records in a snapshot
    pub capacity: usize,
    /// Resolve `unknown vendor` entries with `lsusb`
    pub enrich: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MAX_DEVICES,
            enrich: true,
        }
    }
}

pub struct DeviceRegistry {
    executor: Arc<dyn CommandExecutor>,
    probe: Arc<dyn BoundProbe>,
    store: Arc<dyn DesiredBoundStore>,
    options: RegistryOptions,
    snapshot: RwLock<Snapshot>,
    desired: Mutex<BTreeSet<BusId>>,
    /// Serializes refreshes so snapshots are installed in the order they were taken
    refresh_gate: Mutex<()>,
}

impl DeviceRegistry {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        probe: Arc<dyn BoundProbe>,
        store: Arc<dyn DesiredBoundStore>,
        options: RegistryOptions,
    ) -> Self {
        let desired = store.load();
        Self {
            executor,
            probe,
            store,
            options,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            desired: Mutex::new(desired),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Current device list
    pub async fn snapshot(&self) -> Snapshot {
        Arc::clone(&*self.snapshot.read().await)
    }

    /// Busids the operator wants bound
    pub async fn desired(&self) -> BTreeSet<BusId> {
        self.desired.lock().await.clone()
    }

    /// Re-run the inventory tool and install the result
    ///
    /// Returns whether the new list differs from the previous one. On error
    /// the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<bool, RegistryError> {
        let _gate = self.refresh_gate.lock().await;

        let records = self.fetch_inventory().await?;
        let fresh = Arc::new(records);

        let mut current = self.snapshot.write().await;
        let changed = snapshot_changed(&current, &fresh);
        *current = fresh;
        drop(current);

        if changed {
            debug!("Device list changed");
        }
        Ok(changed)
    }

    /// Bind a device to the sharing driver
    pub async fn bind(&self, busid: &str) -> Result<Snapshot, RegistryError> {
        self.mutate(Operation::Bind, busid).await
    }

    /// Release a device from the sharing driver
    pub async fn unbind(&self, busid: &str) -> Result<Snapshot, RegistryError> {
        self.mutate(Operation::Unbind, busid).await
    }

    /// Re-bind every desired device that is present but not bound
    ///
    /// Returns the number of devices bound. The desired set itself is not
    /// rewritten.
    pub async fn reconcile(&self) -> usize {
        let desired = self.desired().await;
        if desired.is_empty() {
            return 0;
        }

        let snapshot = self.snapshot().await;
        let mut rebound = 0;

        for busid in &desired {
            match snapshot.iter().find(|r| &r.busid == busid) {
                Some(record) if record.bound => {
                    debug!("Desired device {} already bound", busid);
                }
                Some(_) => match self.execute(Operation::Bind, busid).await {
                    Ok(()) => {
                        info!("Restored binding for {}", busid);
                        rebound += 1;
                    }
                    Err(e) => warn!("Could not restore binding for {}: {}", busid, e),
                },
                None => warn!("Desired device {} is not present, keeping it in config", busid),
            }
        }

        if rebound > 0 {
            if let Err(e) = self.refresh().await {
                warn!("Refresh after reconcile failed: {}", e);
            }
        }
        rebound
    }

    async fn mutate(&self, op: Operation, raw: &str) -> Result<Snapshot, RegistryError> {
        // Validation gate: nothing below runs for a malformed busid
        let busid = BusId::parse(raw).inspect_err(|e| {
            warn!("Rejected {} request: {}", op, e);
        })?;

        info!("Attempting to {} device {}", op, busid);
        self.execute(op, &busid).await.inspect_err(|e| {
            error!("Failed to {} device {}: {}", op, busid, e);
        })?;
        info!("Device {}: {} succeeded", busid, op);

        if let Err(e) = self.refresh().await {
            warn!("Refresh after {} failed: {}", op, e);
        }
        self.record_desired(op, busid).await;

        Ok(self.snapshot().await)
    }

    async fn execute(&self, op: Operation, busid: &BusId) -> Result<(), RegistryError> {
        let args = vec![
            op.subcommand().to_string(),
            "-b".to_string(),
            busid.to_string(),
        ];
        let output = self.run(USBIP, args).await?;
        if output.success() {
            Ok(())
        } else {
            Err(RegistryError::execution(failure_message(&output)))
        }
    }

    async fn record_desired(&self, op: Operation, busid: BusId) {
        let mut desired = self.desired.lock().await;
        let changed = match op {
            Operation::Bind => desired.insert(busid),
            Operation::Unbind => desired.remove(&busid),
        };
        if !changed {
            return;
        }

        // The guard is held across the write so saves land in mutation order
        let store = Arc::clone(&self.store);
        let set = desired.clone();
        match tokio::task::spawn_blocking(move || store.persist(&set)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to persist desired bound set: {:#}", e),
            Err(e) => error!("Persist task for desired bound set failed: {}", e),
        }
    }

    async fn fetch_inventory(&self) -> Result<Vec<DeviceRecord>, RegistryError> {
        let output = self
            .run(USBIP, vec!["list".to_string(), "-l".to_string()])
            .await?;
        if !output.success() {
            return Err(RegistryError::execution(failure_message(&output)));
        }

        let mut records = parse_inventory(&output.output, self.options.capacity, self.probe.as_ref());

        if self.options.enrich && records.iter().any(|r| needs_lookup(&r.info)) {
            match self.run(LSUSB, Vec::new()).await {
                Ok(lookup) if lookup.success() => enrich(&mut records, &parse_lsusb(&lookup.output)),
                Ok(lookup) => debug!("lsusb exited with {:?}, skipping lookup", lookup.exit_code),
                Err(e) => debug!("lsusb unavailable: {}", e),
            }
        }

        Ok(records)
    }

    /// Run a command on the blocking pool
    async fn run(
        &self,
        program: &'static str,
        args: Vec<String>,
    ) -> Result<CommandOutput, RegistryError> {
        let executor = Arc::clone(&self.executor);
        let output = tokio::task::spawn_blocking(move || {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            executor.execute(program, &args)
        })
        .await
        .map_err(|e| {
            error!("Command task for {} failed: {}", program, e);
            RegistryError::execution(format!("failed to run {}", program))
        })??;
        Ok(output)
    }
}

/// Positional comparison of two snapshots
///
/// A different length, or a different `(busid, bound)` at any index, counts
/// as a change. `info` is ignored. Reordered output from the inventory tool
/// is reported as a change.
pub fn snapshot_changed(old: &[DeviceRecord], new: &[DeviceRecord]) -> bool {
    old.len() != new.len()
        || old
            .iter()
            .zip(new)
            .any(|(a, b)| a.change_key() != b.change_key())
}

fn needs_lookup(info: &str) -> bool {
    info.to_ascii_lowercase().contains("unknown vendor")
}

/// First meaningful line of a failed command's output, safe to show a client
fn failure_message(output: &CommandOutput) -> String {
    let line = output
        .output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let line = line
        .strip_prefix("usbip: error: ")
        .or_else(|| line.strip_prefix("usbip: "))
        .unwrap_or(line);

    let mut message = sanitize_info(line);
    if message.len() > MAX_ERROR_MESSAGE_LEN {
        let cut = (0..=MAX_ERROR_MESSAGE_LEN)
            .rev()
            .find(|i| message.is_char_boundary(*i))
            .unwrap_or(0);
        message.truncate(cut);
    }
    if message.is_empty() {
        match output.exit_code {
            Some(code) => format!("command failed with exit code {}", code),
            None => "Unknown error".to_string(),
        }
    } else {
        message
    }
}
