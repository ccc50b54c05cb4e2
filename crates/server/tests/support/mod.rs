//! Shared test fixtures
//!
//! `FakeHost` stands in for the machine: it answers `usbip` invocations the
//! way the real tool does, tracks which devices are bound, and records every
//! command it was asked to run so tests can assert on spawn counts.

#![allow(dead_code)]

use protocol::BusId;
use server::exec::{
    ALLOWED_PROGRAMS, CommandExecutor, CommandOutput, ExecError, USBIP, check_allowed,
};
use server::usb::{BoundProbe, DeviceRegistry, MemoryBoundStore, RegistryOptions};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct HostState {
    devices: Vec<(String, String)>,
    bound: BTreeSet<String>,
    calls: Vec<Vec<String>>,
    fail_list: bool,
}

#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new(devices: &[(&str, &str)]) -> Self {
        let host = Self::default();
        host.state.lock().unwrap().devices = devices
            .iter()
            .map(|(b, i)| (b.to_string(), i.to_string()))
            .collect();
        host
    }

    pub fn plug(&self, busid: &str, info: &str) {
        self.state
            .lock()
            .unwrap()
            .devices
            .push((busid.to_string(), info.to_string()));
    }

    pub fn set_bound(&self, busid: &str) {
        self.state.lock().unwrap().bound.insert(busid.to_string());
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.lock().unwrap().fail_list = fail;
    }

    /// Every command run so far, program first
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Commands other than the inventory listing
    pub fn mutations(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.get(1).map(String::as_str) != Some("list"))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn inventory(state: &HostState) -> String {
        let mut out = String::from("Local USB devices\n=================\n");
        for (busid, info) in &state.devices {
            out.push_str(&format!(" - busid {} (dead:beef)\n", busid));
            if !info.is_empty() {
                out.push_str(&format!("   {}\n", info));
            }
            out.push('\n');
        }
        out
    }
}

fn exited(code: i32, output: impl Into<String>) -> Result<CommandOutput, ExecError> {
    Ok(CommandOutput {
        exit_code: Some(code),
        output: output.into(),
        truncated: false,
    })
}

impl CommandExecutor for FakeHost {
    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ExecError> {
        let program = check_allowed(program, ALLOWED_PROGRAMS)?;
        let mut state = self.state.lock().unwrap();

        let mut call = vec![program.to_string()];
        call.extend(args.iter().map(|a| a.to_string()));
        state.calls.push(call);

        if program != USBIP {
            return exited(1, "lsusb: not available in tests");
        }

        match args {
            ["list", "-l"] if state.fail_list => exited(1, "usbip: error: failed to open usb id database"),
            ["list", "-l"] => exited(0, Self::inventory(&state)),
            ["bind", "-b", busid] => {
                if !state.devices.iter().any(|(b, _)| b == busid) {
                    exited(1, "usbip: error: device with the specified bus ID does not exist\n")
                } else if !state.bound.insert(busid.to_string()) {
                    exited(
                        1,
                        format!("usbip: error: device on busid {} is already bound to usbip-host\n", busid),
                    )
                } else {
                    exited(0, format!("usbip: info: bind device on busid {}: complete\n", busid))
                }
            }
            ["unbind", "-b", busid] => {
                if state.bound.remove(*busid) {
                    exited(0, format!("usbip: info: unbind device on busid {}: complete\n", busid))
                } else {
                    exited(1, "usbip: error: device is not bound to usbip-host driver\n")
                }
            }
            _ => exited(2, "usbip: error: unexpected arguments"),
        }
    }
}

impl BoundProbe for FakeHost {
    fn is_bound(&self, busid: &BusId) -> bool {
        self.state.lock().unwrap().bound.contains(busid.as_str())
    }
}

/// A registry wired to `host`, plus the store it persists to
pub fn registry_for(host: &FakeHost) -> (Arc<DeviceRegistry>, Arc<MemoryBoundStore>) {
    registry_with_store(host, MemoryBoundStore::default())
}

pub fn registry_with_store(
    host: &FakeHost,
    store: MemoryBoundStore,
) -> (Arc<DeviceRegistry>, Arc<MemoryBoundStore>) {
    let store = Arc::new(store);
    let registry = DeviceRegistry::new(
        Arc::new(host.clone()),
        Arc::new(host.clone()),
        store.clone(),
        RegistryOptions::default(),
    );
    (Arc::new(registry), store)
}

/// Inputs that must never reach the external tool
pub const HOSTILE_BUSIDS: &[&str] = &[
    "; rm -rf /",
    "1-1; reboot",
    "1-1 && id",
    "$(id)",
    "`id`",
    "1-1\n2-1",
    "../../etc/passwd",
    "-h",
    "-1",
    "--help",
    "",
    "1-1 ",
    "a-1",
    "１-1",
];

pub fn too_long_busid() -> String {
    "1".repeat(64)
}
