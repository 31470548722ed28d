//! Startup udev resynchronization.
//!
//! Devices plugged in before the daemon started never produced a
//! notification. Writing `add` into every device's `uevent` attribute makes
//! the kernel replay them through udev, so the notifier reports them to the
//! freshly bound socket.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ResyncConfig;

const UEVENT: &str = "uevent";
const TRIGGER: &[u8] = b"add";

/// Resync failures.
#[derive(Debug, Error)]
pub enum ResyncError {
    /// The sysfs devices root could not be walked.
    #[error("cannot enumerate devices under {path}: {source}")]
    Enumerate {
        /// Devices root.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Stopping, starting or probing the daemon failed.
    #[error("udev daemon control failed: {0}")]
    Daemon(#[source] io::Error),

    /// The daemon did not exit within the poll budget.
    #[error("udev daemon still running after {polls} polls")]
    StopTimeout {
        /// Polls made.
        polls: u32,
    },

    /// The daemon did not appear within the poll budget.
    #[error("udev daemon not running after {polls} polls")]
    StartTimeout {
        /// Polls made.
        polls: u32,
    },
}

/// Source of device directories to re-trigger.
pub trait DeviceEnumerator {
    /// Every device directory that carries a `uevent` attribute.
    fn enumerate(&self) -> Result<Vec<PathBuf>, ResyncError>;
}

/// Walks `<sysfs_root>/devices` without following symlinks.
#[derive(Debug, Clone)]
pub struct SysfsEnumerator {
    devices_root: PathBuf,
}

impl SysfsEnumerator {
    /// Enumerator for the sysfs tree mounted at `sysfs_root`.
    pub fn new(sysfs_root: impl AsRef<Path>) -> Self {
        Self {
            devices_root: sysfs_root.as_ref().join("devices"),
        }
    }

    /// Directory walked by [`DeviceEnumerator::enumerate`].
    pub fn devices_root(&self) -> &Path {
        &self.devices_root
    }
}

impl DeviceEnumerator for SysfsEnumerator {
    fn enumerate(&self) -> Result<Vec<PathBuf>, ResyncError> {
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.devices_root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("devices root not walkable"));
                    return Err(ResyncError::Enumerate {
                        path: self.devices_root.display().to_string(),
                        source,
                    });
                }
                Err(e) => {
                    debug!("skipping unreadable sysfs entry: {}", e);
                    continue;
                }
            };
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                continue;
            }
            if entry.path().join(UEVENT).is_file() {
                found.push(entry.into_path());
            }
        }
        found.sort();
        Ok(found)
    }
}

/// Control over the udev daemon process.
pub trait DaemonControl {
    /// Whether a daemon process exists.
    fn is_running(&self) -> io::Result<bool>;
    /// Ask the daemon to exit.
    fn stop(&self) -> io::Result<()>;
    /// Launch the daemon.
    fn start(&self) -> io::Result<()>;
}

/// Finds the daemon through `<proc_root>/<pid>/comm` and drives it with
/// the configured commands.
#[derive(Debug, Clone)]
pub struct UdevDaemon {
    proc_root: PathBuf,
    names: Vec<String>,
    stop_command: Vec<String>,
    start_command: Vec<String>,
}

impl UdevDaemon {
    /// Daemon control using the names and commands in `config`.
    pub fn from_config(config: &ResyncConfig) -> Self {
        Self {
            proc_root: config.proc_root.clone(),
            names: config.daemon_names.clone(),
            stop_command: config.stop_command.clone(),
            start_command: config.start_command.clone(),
        }
    }
}

fn run_command(argv: &[String]) -> io::Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
    let status = Command::new(program).args(args).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("{} exited with {}", program, status)))
    }
}

impl DaemonControl for UdevDaemon {
    fn is_running(&self) -> io::Result<bool> {
        for entry in fs::read_dir(&self.proc_root)?.flatten() {
            let is_pid = entry
                .file_name()
                .to_str()
                .is_some_and(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()));
            if !is_pid {
                continue;
            }
            // Processes exit while we scan.
            let Ok(comm) = fs::read_to_string(entry.path().join("comm")) else {
                continue;
            };
            if self.names.iter().any(|n| n == comm.trim_end()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn stop(&self) -> io::Result<()> {
        run_command(&self.stop_command)
    }

    fn start(&self) -> io::Result<()> {
        run_command(&self.start_command)
    }
}

/// What a resynchronization pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Devices whose `uevent` accepted the trigger.
    pub triggered: usize,
    /// Devices whose `uevent` write failed.
    pub failed: usize,
    /// Enumeration needed a daemon restart.
    pub restarted_daemon: bool,
}

/// Write `add` into the `uevent` attribute of every device directory.
pub fn trigger_all(devices: &[PathBuf]) -> ResyncReport {
    let mut report = ResyncReport::default();
    for dev in devices {
        let uevent = dev.join(UEVENT);
        let written = OpenOptions::new()
            .write(true)
            .open(&uevent)
            .and_then(|mut f| f.write_all(TRIGGER));
        match written {
            Ok(()) => report.triggered += 1,
            Err(e) => {
                report.failed += 1;
                debug!(path = %uevent.display(), "uevent trigger failed: {}", e);
            }
        }
    }
    report
}

fn wait_for<D: DaemonControl>(
    daemon: &D,
    running: bool,
    interval: Duration,
    max_polls: u32,
) -> Result<bool, ResyncError> {
    for _ in 0..max_polls {
        if daemon.is_running().map_err(ResyncError::Daemon)? == running {
            return Ok(true);
        }
        std::thread::sleep(interval);
    }
    Ok(false)
}

/// Stop the daemon, wait for it to exit, start it and wait for it to appear.
pub fn restart_daemon<D: DaemonControl>(
    daemon: &D,
    interval: Duration,
    max_polls: u32,
) -> Result<(), ResyncError> {
    info!("restarting udev daemon");
    daemon.stop().map_err(ResyncError::Daemon)?;
    if !wait_for(daemon, false, interval, max_polls)? {
        return Err(ResyncError::StopTimeout { polls: max_polls });
    }
    daemon.start().map_err(ResyncError::Daemon)?;
    if !wait_for(daemon, true, interval, max_polls)? {
        return Err(ResyncError::StartTimeout { polls: max_polls });
    }
    Ok(())
}

/// Re-trigger every device. If enumeration cannot start, restart the udev
/// daemon and try once more.
pub fn resynchronize<E, D>(
    enumerator: &E,
    daemon: &D,
    interval: Duration,
    max_polls: u32,
) -> Result<ResyncReport, ResyncError>
where
    E: DeviceEnumerator,
    D: DaemonControl,
{
    let (devices, restarted) = match enumerator.enumerate() {
        Ok(devices) => (devices, false),
        Err(e) => {
            warn!("device enumeration failed, restarting udev: {}", e);
            restart_daemon(daemon, interval, max_polls)?;
            (enumerator.enumerate()?, true)
        }
    };

    let mut report = trigger_all(&devices);
    report.restarted_daemon = restarted;
    if report.failed > 0 {
        warn!(failed = report.failed, "some uevent triggers failed");
    }
    info!(
        triggered = report.triggered,
        restarted = report.restarted_daemon,
        "udev resynchronization done"
    );
    Ok(report)
}

/// Resynchronize with the sysfs tree and daemon named in `config`.
pub fn resync_from_config(config: &ResyncConfig) -> Result<ResyncReport, ResyncError> {
    resynchronize(
        &SysfsEnumerator::new(&config.sysfs_root),
        &UdevDaemon::from_config(config),
        config.poll_interval(),
        config.max_polls,
    )
}
