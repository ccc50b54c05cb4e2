//! usbctl
//!
//! USB/IP device web manager. Serves a page listing the host's USB devices,
//! pushes live updates to open browsers and binds or unbinds devices for
//! sharing on request.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{LogTarget, Shutdown, setup_logging};
use server::config::{LoadedConfig, ServerConfig, TomlBoundStore, load_config};
use server::usb::{DesiredBoundStore, DeviceRegistry, MemoryBoundStore, SysfsProbe};
use server::{App, registry_from_config, system};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usbctl")]
#[command(author, version, about = "usbctl - USB/IP device web manager")]
#[command(long_about = "
Web interface for sharing USB devices over USB/IP. Lists the host's devices,
shows which are bound to usbip-host and binds or unbinds them with one click.
Open browsers receive updates as soon as the device list changes.

EXAMPLES:
    # Start the web server with defaults (0.0.0.0:11980)
    usbctl

    # Start on port 8080 with debug logging
    usbctl -p 8080 -v

    # List devices as JSON and exit
    usbctl --list-devices

    # Bind a device and exit
    usbctl --bind-device 1-1.2

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbctl/config.toml
    3. /etc/usbctl/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Server port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Listen address
    #[arg(short = 'b', long = "bind-addr", value_name = "ADDRESS")]
    bind_addr: Option<String>,

    /// Polling interval in seconds
    #[arg(short, long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Errors only
    #[arg(short, long)]
    quiet: bool,

    /// List USB devices as JSON and exit
    #[arg(long)]
    list_devices: bool,

    /// Bind a USB device and exit
    #[arg(long, value_name = "BUSID", conflicts_with_all = ["list_devices", "unbind_device"])]
    bind_device: Option<String>,

    /// Unbind a USB device and exit
    #[arg(long, value_name = "BUSID", conflicts_with = "list_devices")]
    unbind_device: Option<String>,

    /// Save the effective configuration and exit
    #[arg(long)]
    save_config: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    /// `--log-level` is already folded into `config` by [`Args::apply`]
    fn log_level<'a>(&self, config: &'a ServerConfig) -> &'a str {
        if self.log_level.is_some() {
            &config.server.log_level
        } else if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            &config.server.log_level
        }
    }

    /// Apply command-line overrides on top of the loaded file
    fn apply(&self, config: &mut ServerConfig) -> Result<()> {
        if let Some(host) = &self.bind_addr {
            config.set_host(host)?;
        }
        if let Some(port) = self.port {
            config.set_port(port)?;
        }
        if let Some(secs) = self.interval {
            config.server.poll_interval_secs = secs;
        }
        if let Some(level) = &self.log_level {
            config.set_log_level(level)?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let LoadedConfig {
        config: file_config,
        path,
        from_file,
    } = load_config(args.config.as_deref()).context("Failed to load configuration")?;

    let mut config = file_config.clone();
    args.apply(&mut config)?;
    config.validate().context("Invalid configuration")?;

    if args.save_config {
        let path = path.ok_or_else(|| anyhow!("No configuration path available, use --config"))?;
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    if args.print_config {
        match (&path, from_file) {
            (Some(p), true) => println!("# Loaded from {}", p.display()),
            (Some(p), false) => println!("# Built-in defaults (would be saved to {})", p.display()),
            (None, _) => println!("# Built-in defaults"),
        }
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(ExitCode::SUCCESS);
    }

    let log_target = match &config.server.log_file {
        Some(file) => LogTarget::File(file.clone()),
        None => LogTarget::Stderr,
    };
    setup_logging(args.log_level(&config), &log_target).context("Failed to setup logging")?;

    info!("usbctl v{}", env!("CARGO_PKG_VERSION"));
    system::check_host(&SysfsProbe::new(&config.devices.driver_dir));

    // Only what came from the file is persisted; CLI overrides stay in memory
    let store: Arc<dyn DesiredBoundStore> = match path {
        Some(path) => Arc::new(TomlBoundStore::new(path, file_config)),
        None => Arc::new(MemoryBoundStore::new(config.desired_bound()?)),
    };
    let registry = Arc::new(registry_from_config(&config, store));

    if args.list_devices {
        return list_devices(&registry).await;
    }
    if let Some(busid) = &args.bind_device {
        return one_shot(registry.bind(busid).await.map(|_| ()), "bound");
    }
    if let Some(busid) = &args.unbind_device {
        return one_shot(registry.unbind(busid).await.map(|_| ()), "unbound");
    }

    run_server(&config, registry).await?;
    Ok(ExitCode::SUCCESS)
}

async fn list_devices(registry: &DeviceRegistry) -> Result<ExitCode> {
    registry
        .refresh()
        .await
        .context("Failed to list USB devices")?;
    let snapshot = registry.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&*snapshot)?);
    Ok(ExitCode::SUCCESS)
}

fn one_shot(result: Result<(), server::usb::RegistryError>, verb: &str) -> Result<ExitCode> {
    match result {
        Ok(()) => {
            println!("Device {} successfully", verb);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Failed: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_server(config: &ServerConfig, registry: Arc<DeviceRegistry>) -> Result<()> {
    let shutdown = Shutdown::new();
    let app = App::build(config, registry, shutdown.clone())
        .await
        .context("Failed to start server")?;

    let addr = app.local_addr()?;
    info!("Web interface available at http://{}", addr);
    if addr.ip().is_unspecified() {
        info!("Local access: http://localhost:{}", addr.port());
    }
    info!("Press Ctrl+C to shutdown");

    let mut server = tokio::spawn(app.run());

    tokio::select! {
        result = wait_for_signal() => {
            result?;
            info!("Shutting down gracefully...");
            shutdown.trigger();
        }
        finished = &mut server => {
            // Listener stopped without a signal
            return finished.context("Server task panicked")?;
        }
    }

    match server.await {
        Ok(result) => result?,
        Err(e) => error!("Server task failed: {}", e),
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to wait for Ctrl+C")?,
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}
