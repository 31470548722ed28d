//! Logical storage slots and the board-specific path table.
//!
//! A slot is a stable name (HDD1..HDD8, or one of three USB roles) that the
//! rest of the appliance uses regardless of which bus path the kernel
//! assigns. Each board variant maps slots to devpath fragments; an event's
//! devpath containing the fragment belongs to that slot.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::Subsystem;

/// Capacity of the HDD slot table.
pub const HDD_SLOTS: usize = 8;
/// Capacity of the USB role table.
pub const USB_SLOTS: usize = 3;

/// Role of a front-panel USB port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsbRole {
    /// Port used for operator-initiated backup.
    ManualBackup,
    /// Port used by the backup scheduler.
    ScheduledBackup,
    /// Port reserved for keyboard/mouse.
    InputDevice,
}

impl UsbRole {
    /// All roles, in table order.
    pub const ALL: [UsbRole; USB_SLOTS] = [
        UsbRole::ManualBackup,
        UsbRole::ScheduledBackup,
        UsbRole::InputDevice,
    ];

    /// Position in the USB connection table.
    pub fn index(&self) -> usize {
        match self {
            UsbRole::ManualBackup => 0,
            UsbRole::ScheduledBackup => 1,
            UsbRole::InputDevice => 2,
        }
    }

    /// Role at a table position.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Index of an HDD bay, always below [`HDD_SLOTS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HddBay(u8);

impl HddBay {
    /// Zero-based bay index, `None` when out of range.
    pub fn new(index: usize) -> Option<Self> {
        (index < HDD_SLOTS).then_some(HddBay(index as u8))
    }

    /// Zero-based bay index.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// A logical slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    /// Internal disk bay.
    Hdd(HddBay),
    /// USB port by role.
    Usb(UsbRole),
}

impl SlotId {
    /// HDD slot by zero-based index.
    pub fn hdd(index: usize) -> Option<Self> {
        HddBay::new(index).map(SlotId::Hdd)
    }

    /// Every slot in resolution order: HDD1..HDD8, then USB roles.
    pub fn all() -> impl Iterator<Item = SlotId> {
        (0..HDD_SLOTS)
            .filter_map(SlotId::hdd)
            .chain(UsbRole::ALL.into_iter().map(SlotId::Usb))
    }

    /// Label used for the mount point and in logs, e.g. `HDD3` or `USB1`.
    pub fn label(&self) -> String {
        match self {
            SlotId::Hdd(bay) => format!("HDD{}", bay.index() + 1),
            SlotId::Usb(role) => format!("USB{}", role.index() + 1),
        }
    }

    /// Whether this is a disk bay.
    pub fn is_hdd(&self) -> bool {
        matches!(self, SlotId::Hdd(_))
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Devpath fragments for one board variant.
///
/// An empty string marks a slot the board does not have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardLayout {
    /// Human-readable variant name.
    pub name: String,
    /// Fragments for HDD1..HDD8.
    pub hdd: Vec<String>,
    /// Fragments for the USB roles, in [`UsbRole::ALL`] order.
    pub usb: Vec<String>,
    /// Topology path of the input-device port; input events under it
    /// always resolve to [`UsbRole::InputDevice`].
    pub input_device_path: String,
}

impl BoardLayout {
    fn fragment(&self, slot: SlotId) -> &str {
        let entry = match slot {
            SlotId::Hdd(bay) => self.hdd.get(bay.index()),
            SlotId::Usb(role) => self.usb.get(role.index()),
        };
        entry.map(String::as_str).unwrap_or("")
    }
}

fn paths(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Layouts compiled in for the boards shipped so far. Index is the board variant.
pub fn builtin_layouts() -> Vec<BoardLayout> {
    vec![
        BoardLayout {
            name: "ahci-4bay".to_string(),
            hdd: paths(&[
                "/ahci.0/ata1/host0/target0:0:0/",
                "/ahci.0/ata2/host1/target1:0:0/",
                "/ahci.0/ata3/host2/target2:0:0/",
                "/ahci.0/ata4/host3/target3:0:0/",
                "",
                "",
                "",
                "",
            ]),
            usb: paths(&[
                "/hiusb-ehci.0/usb1/1-1/1-1.1/",
                "/hiusb-ehci.0/usb1/1-1/1-1.2/",
                "/hiusb-ohci.0/usb2/2-1/",
            ]),
            input_device_path: "/hiusb-ohci.0/usb2/".to_string(),
        },
        BoardLayout {
            name: "fc400000-8bay".to_string(),
            hdd: paths(&[
                "/fc400000.sata/ata1/host0/target0:0:0/",
                "/fc400000.sata/ata2/host1/target1:0:0/",
                "/fc400000.sata/ata3/host2/target2:0:0/",
                "/fc400000.sata/ata4/host3/target3:0:0/",
                "/fc800000.sata/ata5/host4/target4:0:0/",
                "/fc800000.sata/ata6/host5/target5:0:0/",
                "/fc800000.sata/ata7/host6/target6:0:0/",
                "/fc800000.sata/ata8/host7/target7:0:0/",
            ]),
            usb: paths(&[
                "/fd800000.usb/usb1/1-1/",
                "/fd840000.usb/usb2/2-1/",
                "/fd800000.usb/usb1/1-1/1-1:1.0/",
            ]),
            input_device_path: "/fd800000.usb/usb1/1-1/1-1:1.0/".to_string(),
        },
    ]
}

/// The active board's table, fixed after startup.
#[derive(Debug, Clone)]
pub struct SlotPathTable {
    layout: BoardLayout,
    hdd_populated: usize,
    usb_populated: usize,
}

impl SlotPathTable {
    /// Build a table from a layout and the board's populated slot counts.
    pub fn new(layout: BoardLayout, hdd_populated: usize, usb_populated: usize) -> Self {
        Self {
            layout,
            hdd_populated: hdd_populated.min(HDD_SLOTS),
            usb_populated: usb_populated.min(USB_SLOTS),
        }
    }

    /// Active layout.
    pub fn layout(&self) -> &BoardLayout {
        &self.layout
    }

    /// Devpath fragment for a slot; `None` when the slot is absent or unpopulated.
    pub fn prefix(&self, slot: SlotId) -> Option<&str> {
        let populated = match slot {
            SlotId::Hdd(bay) => bay.index() < self.hdd_populated,
            SlotId::Usb(role) => role.index() < self.usb_populated,
        };
        if !populated {
            return None;
        }
        let fragment = self.layout.fragment(slot);
        (!fragment.is_empty()).then_some(fragment)
    }

    /// Map an event's devpath to a slot.
    ///
    /// Input events under the board's input-device path are forced to the
    /// input role, since that port can share a controller with a backup port.
    pub fn resolve_slot(&self, devpath: &str, subsystem: &Subsystem) -> Option<SlotId> {
        let input_path = self.layout.input_device_path.as_str();
        if subsystem.is_input() && !input_path.is_empty() && devpath.contains(input_path) {
            return Some(SlotId::Usb(UsbRole::InputDevice));
        }
        SlotId::all().find(|slot| {
            self.prefix(*slot)
                .is_some_and(|fragment| devpath.contains(fragment))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(variant: usize) -> SlotPathTable {
        SlotPathTable::new(builtin_layouts()[variant].clone(), HDD_SLOTS, USB_SLOTS)
    }

    #[test]
    fn test_labels() {
        assert_eq!(SlotId::hdd(0).unwrap().label(), "HDD1");
        assert_eq!(SlotId::hdd(7).unwrap().label(), "HDD8");
        assert_eq!(SlotId::Usb(UsbRole::ManualBackup).label(), "USB1");
        assert_eq!(SlotId::Usb(UsbRole::InputDevice).to_string(), "USB3");
    }

    #[test]
    fn test_hdd_index_bounds() {
        assert!(SlotId::hdd(7).is_some());
        assert!(SlotId::hdd(8).is_none());
    }

    #[test]
    fn test_all_order() {
        let labels: Vec<String> = SlotId::all().map(|s| s.label()).collect();
        assert_eq!(labels.len(), HDD_SLOTS + USB_SLOTS);
        assert_eq!(labels[0], "HDD1");
        assert_eq!(labels[8], "USB1");
        assert_eq!(labels[10], "USB3");
    }

    #[test]
    fn test_resolve_first_hdd() {
        let t = table(0);
        let slot = t.resolve_slot(
            "/devices/platform/ahci.0/ata1/host0/target0:0:0/0:0:0:0/block/sda",
            &Subsystem::Block,
        );
        assert_eq!(slot, SlotId::hdd(0));
    }

    #[test]
    fn test_resolve_second_variant() {
        let t = table(1);
        let slot = t.resolve_slot(
            "/devices/platform/fc800000.sata/ata6/host5/target5:0:0/5:0:0:0/block/sdf",
            &Subsystem::Block,
        );
        assert_eq!(slot, SlotId::hdd(5));
    }

    #[test]
    fn test_resolve_usb_roles() {
        let t = table(0);
        assert_eq!(
            t.resolve_slot(
                "/devices/platform/hiusb-ehci.0/usb1/1-1/1-1.2/1-1.2:1.0/host9",
                &Subsystem::Block
            ),
            Some(SlotId::Usb(UsbRole::ScheduledBackup))
        );
    }

    #[test]
    fn test_unknown_path_is_unresolved() {
        let t = table(0);
        assert_eq!(t.resolve_slot("/devices/virtual/block/loop0", &Subsystem::Block), None);
    }

    #[test]
    fn test_input_forced_to_input_role() {
        // On this board the input port sits under the manual-backup fragment.
        let t = table(1);
        let devpath = "/devices/platform/fd800000.usb/usb1/1-1/1-1:1.0/0003:046D:C077.0001/input/input3";
        assert_eq!(
            t.resolve_slot(devpath, &Subsystem::Block),
            Some(SlotId::Usb(UsbRole::ManualBackup))
        );
        assert_eq!(
            t.resolve_slot(devpath, &Subsystem::Input),
            Some(SlotId::Usb(UsbRole::InputDevice))
        );
    }

    #[test]
    fn test_unpopulated_slots_not_consulted() {
        let t = SlotPathTable::new(builtin_layouts()[1].clone(), 2, USB_SLOTS);
        assert!(t.prefix(SlotId::hdd(1).unwrap()).is_some());
        assert!(t.prefix(SlotId::hdd(2).unwrap()).is_none());
        assert_eq!(
            t.resolve_slot(
                "/devices/platform/fc400000.sata/ata3/host2/target2:0:0/2:0:0:0/",
                &Subsystem::Block
            ),
            None
        );
    }

    #[test]
    fn test_empty_fragment_never_matches() {
        let t = table(0);
        assert!(t.prefix(SlotId::hdd(4).unwrap()).is_none());
    }

    #[test]
    fn test_short_layout_reads_as_absent() {
        let layout = BoardLayout {
            name: "tiny".into(),
            hdd: vec!["/sata/ata1/".into()],
            usb: vec![],
            input_device_path: String::new(),
        };
        let t = SlotPathTable::new(layout, HDD_SLOTS, USB_SLOTS);
        assert!(t.prefix(SlotId::hdd(3).unwrap()).is_none());
        assert!(t.prefix(SlotId::Usb(UsbRole::ManualBackup)).is_none());
        assert_eq!(t.resolve_slot("/x/sata/ata1/host0", &Subsystem::Input), SlotId::hdd(0));
    }
}
