//! Device events delivered by the udev notifier.
//!
//! A [`DeviceEvent`] lives for exactly one dispatch: it is decoded from a
//! frame by [`crate::frame::parse`], handed to the registry and dropped.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kernel action carried by a hotplug notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Device appeared.
    Add,
    /// Device properties changed (media inserted, partition table re-read).
    Change,
    /// Device went away.
    Remove,
}

impl Action {
    /// Wire spelling of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Change => "change",
            Action::Remove => "remove",
        }
    }

    /// Decode the wire spelling. Matching is exact, as udev emits lowercase.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Action::Add),
            "change" => Some(Action::Change),
            "remove" => Some(Action::Remove),
            _ => None,
        }
    }

    /// True for `add` and `change`, the actions that bring a slot online.
    pub fn is_attach(&self) -> bool {
        matches!(self, Action::Add | Action::Change)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kernel subsystem that raised the event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subsystem {
    /// Block devices (disks and their partitions).
    Block,
    /// Input devices (keyboards, mice, touch panels).
    Input,
    /// Anything else, kept verbatim.
    Other(String),
}

impl Subsystem {
    /// Wire spelling of the subsystem.
    pub fn as_str(&self) -> &str {
        match self {
            Subsystem::Block => "block",
            Subsystem::Input => "input",
            Subsystem::Other(s) => s.as_str(),
        }
    }

    /// Decode the wire spelling; unknown names become [`Subsystem::Other`].
    pub fn from_wire(s: &str) -> Self {
        match s {
            "block" => Subsystem::Block,
            "input" => Subsystem::Input,
            other => Subsystem::Other(other.to_string()),
        }
    }

    /// Whether this is the input subsystem.
    pub fn is_input(&self) -> bool {
        matches!(self, Subsystem::Input)
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded hotplug notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// Raising subsystem.
    pub subsystem: Subsystem,
    /// What happened to the device.
    pub action: Action,
    /// Full kernel topology path, e.g. `/devices/platform/ahci.0/ata1/host0/...`.
    pub devpath: String,
    /// Device serial, informational only.
    pub serial: String,
    /// Block device base name without partition suffix, e.g. `sda`.
    pub base_node: String,
}

impl DeviceEvent {
    /// Create a new event.
    pub fn new(
        subsystem: Subsystem,
        action: Action,
        devpath: impl Into<String>,
        serial: impl Into<String>,
        base_node: impl Into<String>,
    ) -> Self {
        Self {
            subsystem,
            action,
            devpath: devpath.into(),
            serial: serial.into(),
            base_node: base_node.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wire_names() {
        for action in [Action::Add, Action::Change, Action::Remove] {
            assert_eq!(Action::from_wire(action.as_str()), Some(action));
        }
        assert_eq!(Action::from_wire("ADD"), None);
        assert_eq!(Action::from_wire("bind"), None);
    }

    #[test]
    fn test_action_is_attach() {
        assert!(Action::Add.is_attach());
        assert!(Action::Change.is_attach());
        assert!(!Action::Remove.is_attach());
    }

    #[test]
    fn test_subsystem_from_wire() {
        assert_eq!(Subsystem::from_wire("block"), Subsystem::Block);
        assert_eq!(Subsystem::from_wire("input"), Subsystem::Input);
        assert_eq!(
            Subsystem::from_wire("scsi_generic"),
            Subsystem::Other("scsi_generic".to_string())
        );
        assert_eq!(Subsystem::from_wire("usb").as_str(), "usb");
    }

    #[test]
    fn test_subsystem_is_input() {
        assert!(Subsystem::Input.is_input());
        assert!(!Subsystem::Block.is_input());
        assert!(!Subsystem::Other("input2".into()).is_input());
    }
}
