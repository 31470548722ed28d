//! Slot connection flags.
//!
//! Only the registry's dispatcher writes these; any number of readers (the
//! hardware-test screens, status logging) hold a [`SlotStatus`] clone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::slot::{SlotId, UsbRole, HDD_SLOTS, USB_SLOTS};

#[derive(Debug, Default)]
struct ConnectionTable {
    hdd: [AtomicBool; HDD_SLOTS],
    usb: [AtomicBool; USB_SLOTS],
}

impl ConnectionTable {
    fn flag(&self, slot: SlotId) -> &AtomicBool {
        match slot {
            SlotId::Hdd(bay) => &self.hdd[bay.index()],
            SlotId::Usb(role) => &self.usb[role.index()],
        }
    }
}

/// Read handle on the connection flags. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct SlotStatus {
    table: Arc<ConnectionTable>,
}

impl SlotStatus {
    /// Fresh table with every slot disconnected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether HDD bay `index` (zero-based) holds a mounted disk.
    /// Out-of-range indices read as disconnected.
    pub fn is_hdd_connected(&self, index: usize) -> bool {
        self.table
            .hdd
            .get(index)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Whether USB role `index` (see [`UsbRole::index`]) is connected.
    /// Out-of-range indices read as disconnected.
    pub fn is_usb_connected(&self, index: usize) -> bool {
        self.table
            .usb
            .get(index)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Flag for any slot.
    pub fn is_connected(&self, slot: SlotId) -> bool {
        self.table.flag(slot).load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, slot: SlotId, connected: bool) {
        self.table.flag(slot).store(connected, Ordering::Release);
    }

    /// Point-in-time copy of every flag.
    pub fn snapshot(&self) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot::default();
        for (i, flag) in self.table.hdd.iter().enumerate() {
            snapshot.hdd[i] = flag.load(Ordering::Acquire);
        }
        for role in UsbRole::ALL {
            snapshot.usb[role.index()] = self.is_connected(SlotId::Usb(role));
        }
        snapshot
    }
}

/// Plain copy of the connection flags, for logging and status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// HDD1..HDD8.
    pub hdd: [bool; HDD_SLOTS],
    /// Manual-backup, scheduled-backup and input USB roles.
    pub usb: [bool; USB_SLOTS],
}

impl StatusSnapshot {
    /// Labels of the connected slots, in table order.
    pub fn connected_labels(&self) -> Vec<String> {
        SlotId::all()
            .filter(|slot| match slot {
                SlotId::Hdd(bay) => self.hdd[bay.index()],
                SlotId::Usb(role) => self.usb[role.index()],
            })
            .map(|slot| slot.label())
            .collect()
    }
}
