//! Desired bound set persistence
//!
//! The operator's intent ("these busids should be shared") outlives the
//! process. The registry owns the in-memory set; a [`DesiredBoundStore`]
//! loads it at startup and writes it back after every successful mutation.

use protocol::BusId;
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Storage for the set of busids that should stay bound across restarts
pub trait DesiredBoundStore: Send + Sync {
    /// Read the persisted set
    fn load(&self) -> BTreeSet<BusId>;

    /// Replace the persisted set
    fn persist(&self, desired: &BTreeSet<BusId>) -> anyhow::Result<()>;
}

/// Store that keeps the set in memory only
///
/// Used when no configuration file is in play, and by tests to observe
/// what the registry asked to persist.
#[derive(Debug, Default)]
pub struct MemoryBoundStore {
    set: Mutex<BTreeSet<BusId>>,
}

impl MemoryBoundStore {
    pub fn new(initial: BTreeSet<BusId>) -> Self {
        Self {
            set: Mutex::new(initial),
        }
    }

    pub fn contains(&self, busid: &str) -> bool {
        self.set
            .lock()
            .map(|set| set.iter().any(|b| b.as_str() == busid))
            .unwrap_or(false)
    }
}

impl DesiredBoundStore for MemoryBoundStore {
    fn load(&self) -> BTreeSet<BusId> {
        self.set.lock().map(|set| set.clone()).unwrap_or_default()
    }

    fn persist(&self, desired: &BTreeSet<BusId>) -> anyhow::Result<()> {
        let mut set = self
            .set
            .lock()
            .map_err(|_| anyhow::anyhow!("desired set lock poisoned"))?;
        *set = desired.clone();
        Ok(())
    }
}
