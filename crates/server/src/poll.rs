//! Background poll loop
//!
//! Refreshes the registry on a fixed period and broadcasts the new snapshot
//! whenever it changed. The registry runs the inventory command without
//! holding its lock, so a slow command never blocks readers.

use crate::network::SubscriberHub;
use crate::usb::DeviceRegistry;
use common::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

/// Default refresh period
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

pub struct PollLoop {
    registry: Arc<DeviceRegistry>,
    hub: Arc<SubscriberHub>,
    shutdown: Shutdown,
    period: Duration,
    /// Whether the previous refresh failed, to keep repeats out of the error log
    failing: bool,
}

impl PollLoop {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        hub: Arc<SubscriberHub>,
        shutdown: Shutdown,
        period: Duration,
    ) -> Self {
        Self {
            registry,
            hub,
            shutdown,
            period,
            failing: false,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Polling devices every {:?}", self.period);
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            if self.shutdown.is_triggered() {
                break;
            }
            self.tick().await;
        }

        info!("Poll loop stopped");
    }

    /// One refresh, broadcasting if the list changed
    ///
    /// Returns the number of subscribers the update was queued for.
    pub async fn tick(&mut self) -> usize {
        let changed = match self.registry.refresh().await {
            Ok(changed) => {
                if self.failing {
                    info!("Device inventory available again");
                    self.failing = false;
                }
                changed
            }
            Err(e) => {
                if self.failing {
                    debug!("Device refresh still failing: {}", e);
                } else {
                    error!("Device refresh failed: {}", e);
                    self.failing = true;
                }
                return 0;
            }
        };

        if !changed || self.shutdown.is_triggered() {
            return 0;
        }

        let snapshot = self.registry.snapshot().await;
        let delivered = self.hub.broadcast_snapshot(&snapshot).await;
        debug!(
            "Device list changed ({} devices), notified {} subscriber(s)",
            snapshot.len(),
            delivered
        );
        delivered
    }
}
