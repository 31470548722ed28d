//! Daemon configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HotplugError, Result};
use crate::slot::{builtin_layouts, BoardLayout, SlotPathTable, HDD_SLOTS, USB_SLOTS};

/// Settings for the startup udev resynchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResyncConfig {
    /// Run the resync once at startup.
    pub enabled: bool,
    /// sysfs mount; devices are enumerated under `<sysfs_root>/devices`.
    pub sysfs_root: PathBuf,
    /// procfs mount, scanned for the udev daemon.
    pub proc_root: PathBuf,
    /// Process names that count as a running udev daemon.
    pub daemon_names: Vec<String>,
    /// Command (argv) that stops the udev daemon.
    pub stop_command: Vec<String>,
    /// Command (argv) that starts the udev daemon.
    pub start_command: Vec<String>,
    /// Delay between process-table polls.
    pub poll_interval_ms: u64,
    /// Poll budget for each of the stop and start phases.
    pub max_polls: u32,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sysfs_root: PathBuf::from("/sys"),
            proc_root: PathBuf::from("/proc"),
            daemon_names: vec!["udevd".to_string(), "systemd-udevd".to_string()],
            stop_command: vec![
                "udevadm".to_string(),
                "control".to_string(),
                "--exit".to_string(),
            ],
            start_command: vec!["/sbin/udevd".to_string(), "--daemon".to_string()],
            poll_interval_ms: 100,
            max_polls: 50,
        }
    }
}

impl ResyncConfig {
    /// [`Self::poll_interval_ms`] as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotplugConfig {
    /// Notifier socket path.
    pub socket_path: PathBuf,
    /// Directory holding the per-slot mount points.
    pub media_root: PathBuf,
    /// Directory holding device nodes.
    pub dev_root: PathBuf,
    /// Per-message receive budget; 0 means a short grace period, not "forever".
    pub recv_timeout_ms: u64,
    /// Listen backlog.
    pub backlog: i32,
    /// Parsed events buffered between the accept loop and the dispatcher.
    pub event_queue: usize,
    /// Index into `boards`, decided by board-revision probing.
    pub board_variant: usize,
    /// Populated HDD bays on this board.
    pub hdd_slots: usize,
    /// Populated USB roles on this board.
    pub usb_slots: usize,
    /// Board layouts, indexed by `board_variant`.
    pub boards: Vec<BoardLayout>,
    /// Startup udev resync.
    pub resync: ResyncConfig,
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(crate::server::DEFAULT_SOCKET_PATH),
            media_root: PathBuf::from("/media/USB"),
            dev_root: PathBuf::from("/dev"),
            recv_timeout_ms: 1000,
            backlog: crate::server::DEFAULT_BACKLOG,
            event_queue: 32,
            board_variant: 0,
            hdd_slots: HDD_SLOTS,
            usb_slots: USB_SLOTS,
            boards: builtin_layouts(),
            resync: ResyncConfig::default(),
        }
    }
}

impl HotplugConfig {
    /// Load and validate a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: HotplugConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| HotplugError::config(format!("{}: {}", path.display(), e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| HotplugError::config(format!("{}: {}", path.display(), e)))?,
            _ => {
                return Err(HotplugError::config(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        validate_config(&config)?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            Ok(Self::default())
        }
    }

    /// [`Self::recv_timeout_ms`] as a `Duration`.
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    /// Path table for the configured board variant.
    pub fn slot_table(&self) -> Result<SlotPathTable> {
        let layout = self.boards.get(self.board_variant).ok_or_else(|| {
            HotplugError::config(format!(
                "board_variant {} out of range ({} layouts)",
                self.board_variant,
                self.boards.len()
            ))
        })?;
        Ok(SlotPathTable::new(
            layout.clone(),
            self.hdd_slots,
            self.usb_slots,
        ))
    }
}

/// Reject values the service cannot run with.
pub fn validate_config(config: &HotplugConfig) -> Result<()> {
    if config.socket_path.as_os_str().is_empty() {
        return Err(HotplugError::config("socket_path is empty"));
    }
    if config.media_root.as_os_str().is_empty() {
        return Err(HotplugError::config("media_root is empty"));
    }
    if config.backlog <= 0 {
        return Err(HotplugError::config("backlog must be > 0"));
    }
    if config.event_queue == 0 {
        return Err(HotplugError::config("event_queue must be > 0"));
    }
    if config.hdd_slots > HDD_SLOTS {
        return Err(HotplugError::config(format!(
            "hdd_slots {} exceeds capacity {}",
            config.hdd_slots, HDD_SLOTS
        )));
    }
    if config.usb_slots > USB_SLOTS {
        return Err(HotplugError::config(format!(
            "usb_slots {} exceeds capacity {}",
            config.usb_slots, USB_SLOTS
        )));
    }
    for board in &config.boards {
        if board.hdd.len() > HDD_SLOTS || board.usb.len() > USB_SLOTS {
            return Err(HotplugError::config(format!(
                "board layout {} has too many slots",
                board.name
            )));
        }
    }
    config.slot_table()?;
    if config.resync.enabled && config.resync.max_polls == 0 {
        return Err(HotplugError::config("resync.max_polls must be > 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = HotplugConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/IntSocket"));
        assert_eq!(config.media_root, PathBuf::from("/media/USB"));
        assert_eq!(config.recv_timeout(), Duration::from_secs(1));
        assert_eq!(config.backlog, 20);
        assert_eq!(config.board_variant, 0);
        assert_eq!(config.boards.len(), 2);
        assert!(config.resync.enabled);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
socket_path = "/run/nvr/hotplug.sock"
media_root = "/mnt/media"
recv_timeout_ms = 0
board_variant = 1
hdd_slots = 4

[resync]
enabled = false
"#
        )
        .unwrap();

        let config = HotplugConfig::from_file(file.path()).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/nvr/hotplug.sock"));
        assert_eq!(config.media_root, PathBuf::from("/mnt/media"));
        assert_eq!(config.recv_timeout_ms, 0);
        assert_eq!(config.board_variant, 1);
        assert_eq!(config.hdd_slots, 4);
        assert!(!config.resync.enabled);
        assert_eq!(config.resync.sysfs_root, PathBuf::from("/sys"));
        assert_eq!(config.backlog, 20);
    }

    #[test]
    fn test_from_file_json_with_custom_board() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "board_variant": 0,
                "boards": [{{
                    "name": "custom",
                    "hdd": ["/sata0/ata1/"],
                    "usb": ["/ehci/usb1/1-1/", "", "/ohci/usb2/"],
                    "input_device_path": "/ohci/usb2/"
                }}]
            }}"#
        )
        .unwrap();

        let config = HotplugConfig::from_file(file.path()).unwrap();
        let table = config.slot_table().unwrap();
        assert_eq!(table.layout().name, "custom");
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = HotplugConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, HotplugError::Config { .. }));
    }

    #[test]
    fn test_board_variant_out_of_range() {
        let config = HotplugConfig {
            board_variant: 9,
            ..Default::default()
        };
        assert!(config.slot_table().is_err());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            HotplugConfig {
                backlog: 0,
                ..Default::default()
            },
            HotplugConfig {
                hdd_slots: 9,
                ..Default::default()
            },
            HotplugConfig {
                event_queue: 0,
                ..Default::default()
            },
            HotplugConfig {
                socket_path: PathBuf::new(),
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(validate_config(&config).is_err());
        }
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = HotplugConfig::load_or_default(Path::new("/nonexistent/hotplug.toml")).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/IntSocket"));
    }
}
