//! usbctl server
//!
//! Live view and control of USB/IP device sharing. The registry keeps the
//! device list current by polling `usbip`, browsers follow it over a push
//! stream, and bind/unbind requests go through a single validated path to
//! the external tool.

pub mod config;
pub mod exec;
pub mod network;
pub mod poll;
pub mod system;
pub mod usb;

use anyhow::{Context, Result};
use common::Shutdown;
use config::ServerConfig;
use exec::SystemExecutor;
use network::{HttpServer, Router, ServerOptions, StreamOptions, SubscriberHub};
use poll::PollLoop;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use usb::{DesiredBoundStore, DeviceRegistry, RegistryOptions, SysfsProbe};

/// Build a registry backed by the real `usbip` tool and sysfs
pub fn registry_from_config(
    config: &ServerConfig,
    store: Arc<dyn DesiredBoundStore>,
) -> DeviceRegistry {
    DeviceRegistry::new(
        Arc::new(SystemExecutor::new(config.command_timeout())),
        Arc::new(SysfsProbe::new(&config.devices.driver_dir)),
        store,
        RegistryOptions {
            capacity: config.devices.max_devices,
            enrich: config.devices.enrich_with_lsusb,
        },
    )
}

/// The assembled server: listener, poll loop and the state they share
pub struct App {
    registry: Arc<DeviceRegistry>,
    hub: Arc<SubscriberHub>,
    server: HttpServer,
    poll: PollLoop,
    shutdown: Shutdown,
}

impl App {
    /// Scan devices, restore desired bindings and bind the listener
    pub async fn build(
        config: &ServerConfig,
        registry: Arc<DeviceRegistry>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        match registry.refresh().await {
            Ok(_) => info!("Found {} device(s)", registry.snapshot().await.len()),
            Err(e) => warn!("Initial device scan failed: {}", e),
        }

        let restored = registry.reconcile().await;
        if restored > 0 {
            info!("Restored {} binding(s) from configuration", restored);
        }

        let hub = Arc::new(SubscriberHub::new(config.server.max_subscribers));
        let router = Arc::new(Router::new(Arc::clone(&registry), Arc::clone(&hub)));
        let options = ServerOptions {
            request_timeout: config.request_timeout(),
            stream: StreamOptions {
                heartbeat: config.heartbeat(),
                write_timeout: config.write_timeout(),
            },
        };

        let addr = config.bind_addr()?;
        let server = HttpServer::bind(addr, router, shutdown.clone(), options).await?;
        let poll = PollLoop::new(
            Arc::clone(&registry),
            Arc::clone(&hub),
            shutdown.clone(),
            config.poll_interval(),
        );

        Ok(Self {
            registry,
            hub,
            server,
            poll,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<SubscriberHub> {
        &self.hub
    }

    /// Serve until the shutdown signal fires
    pub async fn run(self) -> Result<()> {
        let poll = self.poll.spawn();

        let result = self.server.run().await;
        // Stop polling even if the listener failed on its own
        self.shutdown.trigger();

        if let Err(e) = poll.await {
            error!("Poll loop task failed: {}", e);
        }
        result.context("HTTP server failed")
    }
}
