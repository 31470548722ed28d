//! `nvr-hotplugd` command line.

use crate::client::{event_from_udev_env, send_event};
use crate::config::HotplugConfig;
use crate::event::{Action, DeviceEvent, Subsystem};
use crate::server::DEFAULT_SOCKET_PATH;
use crate::service::HotplugService;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line interface of `nvr-hotplugd`.
#[derive(Parser)]
#[command(name = "nvr-hotplugd")]
#[command(about = "NVR storage hotplug daemon", long_about = None)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// `nvr-hotplugd` subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon.
    Serve {
        /// Configuration file (`.toml` or `.json`); defaults apply when absent.
        #[arg(
            short,
            long,
            env = "NVR_HOTPLUG_CONFIG",
            default_value = "/etc/nvrstore/hotplug.toml"
        )]
        config: PathBuf,
    },
    /// Send one device event to a running daemon. Without flags the event
    /// is read from the udev environment.
    Notify {
        /// Daemon socket.
        #[arg(short, long, default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
        /// Kernel subsystem (`block`, `input`, ...).
        #[arg(long, requires_all = ["action", "devpath"])]
        subsystem: Option<String>,
        /// `add`, `change` or `remove`.
        #[arg(long, requires = "subsystem")]
        action: Option<String>,
        /// Kernel device path.
        #[arg(long, requires = "subsystem")]
        devpath: Option<String>,
        /// Device serial number.
        #[arg(long, default_value = "")]
        serial: String,
        /// Block device base name, e.g. `sda`.
        #[arg(long, default_value = "")]
        base_node: String,
        /// Delivery timeout in milliseconds.
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,
    },
    /// Print the effective configuration as JSON.
    ShowConfig {
        /// Configuration file (`.toml` or `.json`); defaults apply when absent.
        #[arg(
            short,
            long,
            env = "NVR_HOTPLUG_CONFIG",
            default_value = "/etc/nvrstore/hotplug.toml"
        )]
        config: PathBuf,
    },
}

impl Cli {
    /// Execute the parsed subcommand.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Serve { ref config } => serve(config).await,
            Command::Notify {
                ref socket,
                ref subsystem,
                ref action,
                ref devpath,
                ref serial,
                ref base_node,
                timeout_ms,
            } => {
                let event = match (subsystem, action, devpath) {
                    (Some(subsystem), Some(action), Some(devpath)) => Some(event_from_flags(
                        subsystem, action, devpath, serial, base_node,
                    )?),
                    _ => event_from_udev_env(|key| std::env::var(key).ok()),
                };
                match event {
                    Some(event) => notify(socket, &event, Duration::from_millis(timeout_ms)).await,
                    None => {
                        // udev also runs us for bind/unbind/move; those are not ours.
                        tracing::debug!("no handled device event in environment");
                        Ok(())
                    }
                }
            }
            Command::ShowConfig { ref config } => {
                let config = HotplugConfig::load_or_default(config)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
        }
    }
}

fn event_from_flags(
    subsystem: &str,
    action: &str,
    devpath: &str,
    serial: &str,
    base_node: &str,
) -> Result<DeviceEvent> {
    let action = Action::from_wire(action)
        .with_context(|| format!("unsupported action {:?}", action))?;
    Ok(DeviceEvent::new(
        Subsystem::from_wire(subsystem),
        action,
        devpath,
        serial,
        base_node,
    ))
}

async fn notify(socket: &Path, event: &DeviceEvent, timeout: Duration) -> Result<()> {
    send_event(socket, event, timeout)
        .await
        .with_context(|| format!("notifying {}", socket.display()))
}

async fn serve(config_path: &Path) -> Result<()> {
    let config = HotplugConfig::load_or_default(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let service = HotplugService::from_config(&config)?;
    let status = service.status();

    wait_for_termination().await?;
    tracing::info!("shutdown requested");

    let registry = service.shutdown().await?;
    tracing::info!(
        connected = ?status.snapshot().connected_labels(),
        board = %registry.table().layout().name,
        "hotplug daemon exiting"
    );
    Ok(())
}

async fn wait_for_termination() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}
