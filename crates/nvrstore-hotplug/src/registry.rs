//! Slot registry: resolves events to slots and drives the mount engine.
//!
//! The registry is the only writer of the connection flags. Dispatch is
//! idempotent: an `add` for a connected slot or a `remove` for a
//! disconnected one does nothing, so duplicate or reordered notifications
//! are harmless.

use tracing::{debug, info, warn};

use crate::event::{Action, DeviceEvent};
use crate::mount::{LinuxMountOps, MountEngine, MountError, MountOps};
use crate::slot::{SlotId, SlotPathTable};
use crate::state::SlotStatus;

/// What a dispatch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The devpath matched no slot on this board.
    Unresolved,
    /// Slot already in the requested state; nothing done.
    Unchanged(SlotId),
    /// Slot is now connected.
    Connected(SlotId),
    /// Slot is now disconnected.
    Disconnected(SlotId),
    /// Mount or unmount failed; the flag was left as it was.
    Failed {
        /// Slot concerned.
        slot: SlotId,
        /// Engine error.
        error: MountError,
    },
}

/// Owns the path table, the connection flags and the mount engine.
#[derive(Debug)]
pub struct SlotRegistry<O: MountOps = LinuxMountOps> {
    table: SlotPathTable,
    status: SlotStatus,
    engine: MountEngine<O>,
}

impl<O: MountOps> SlotRegistry<O> {
    /// Registry with every slot disconnected.
    pub fn new(table: SlotPathTable, engine: MountEngine<O>) -> Self {
        Self {
            table,
            status: SlotStatus::new(),
            engine,
        }
    }

    /// Read handle on the connection flags.
    pub fn status(&self) -> SlotStatus {
        self.status.clone()
    }

    /// Active path table.
    pub fn table(&self) -> &SlotPathTable {
        &self.table
    }

    /// Mount engine.
    pub fn engine(&self) -> &MountEngine<O> {
        &self.engine
    }

    /// See [`SlotStatus::is_hdd_connected`].
    pub fn is_hdd_connected(&self, index: usize) -> bool {
        self.status.is_hdd_connected(index)
    }

    /// See [`SlotStatus::is_usb_connected`].
    pub fn is_usb_connected(&self, index: usize) -> bool {
        self.status.is_usb_connected(index)
    }

    /// Apply one event.
    pub fn dispatch(&mut self, event: &DeviceEvent) -> DispatchOutcome {
        let Some(slot) = self.table.resolve_slot(&event.devpath, &event.subsystem) else {
            debug!(devpath = %event.devpath, subsystem = %event.subsystem, "no slot for devpath");
            return DispatchOutcome::Unresolved;
        };

        let connected = self.status.is_connected(slot);
        let outcome = match (event.action, connected) {
            (action, false) if action.is_attach() => self.attach(slot, event),
            (Action::Remove, true) => self.detach(slot, event),
            _ => DispatchOutcome::Unchanged(slot),
        };

        match &outcome {
            DispatchOutcome::Connected(slot) => {
                info!(%slot, node = %event.base_node, serial = %event.serial, "slot connected")
            }
            DispatchOutcome::Disconnected(slot) => info!(%slot, "slot disconnected"),
            DispatchOutcome::Failed { slot, error } => {
                warn!(%slot, action = %event.action, "slot update failed: {}", error)
            }
            DispatchOutcome::Unchanged(slot) => {
                debug!(%slot, action = %event.action, connected, "slot unchanged")
            }
            DispatchOutcome::Unresolved => {}
        }
        outcome
    }

    fn attach(&mut self, slot: SlotId, event: &DeviceEvent) -> DispatchOutcome {
        // Input devices have nothing to mount.
        if !slot.is_hdd() && event.subsystem.is_input() {
            self.status.set(slot, true);
            return DispatchOutcome::Connected(slot);
        }
        match self.engine.mount(&slot.label(), &event.base_node) {
            Ok(()) => {
                self.status.set(slot, true);
                DispatchOutcome::Connected(slot)
            }
            Err(error) => DispatchOutcome::Failed { slot, error },
        }
    }

    fn detach(&mut self, slot: SlotId, event: &DeviceEvent) -> DispatchOutcome {
        if !slot.is_hdd() && event.subsystem.is_input() {
            self.status.set(slot, false);
            return DispatchOutcome::Disconnected(slot);
        }
        match self.engine.unmount(&slot.label()) {
            Ok(()) => {
                self.status.set(slot, false);
                DispatchOutcome::Disconnected(slot)
            }
            Err(error) => DispatchOutcome::Failed { slot, error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Subsystem;
    use crate::mount::{MockMountOps, MountCall, UnmountStage, DEFAULT_UNMOUNT_STAGES};
    use crate::slot::{builtin_layouts, UsbRole, HDD_SLOTS, USB_SLOTS};
    use tempfile::TempDir;

    const HDD1_PATH: &str = "/devices/platform/ahci.0/ata1/host0/target0:0:0/0:0:0:0/";
    const USB1_PATH: &str = "/devices/platform/hiusb-ehci.0/usb1/1-1/1-1.1/1-1.1:1.0/host4/";
    const INPUT_PATH: &str = "/devices/platform/hiusb-ohci.0/usb2/2-1/2-1:1.0/input/input0";

    fn registry() -> (TempDir, MockMountOps, SlotRegistry<MockMountOps>) {
        let dir = TempDir::new().unwrap();
        let ops = MockMountOps::new();
        let table = SlotPathTable::new(builtin_layouts()[0].clone(), HDD_SLOTS, USB_SLOTS);
        let engine = MountEngine::new(ops.clone(), dir.path());
        (dir, ops, SlotRegistry::new(table, engine))
    }

    fn event(subsystem: Subsystem, action: Action, devpath: &str, node: &str) -> DeviceEvent {
        DeviceEvent::new(subsystem, action, devpath, "SER123", node)
    }

    #[test]
    fn test_hdd_add_mounts_and_connects() {
        let (dir, ops, mut reg) = registry();
        let outcome = reg.dispatch(&event(Subsystem::Block, Action::Add, HDD1_PATH, "sda"));
        assert_eq!(outcome, DispatchOutcome::Connected(SlotId::hdd(0).unwrap()));
        assert!(reg.is_hdd_connected(0));
        match &ops.calls()[0] {
            MountCall::Mount(req) => {
                assert_eq!(req.target, dir.path().join("HDD1"));
                assert_eq!(req.source, std::path::PathBuf::from("/dev/sda1"));
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_add_mounts_once() {
        let (_dir, ops, mut reg) = registry();
        let ev = event(Subsystem::Block, Action::Add, HDD1_PATH, "sda");
        reg.dispatch(&ev);
        let second = reg.dispatch(&ev);
        assert_eq!(second, DispatchOutcome::Unchanged(SlotId::hdd(0).unwrap()));
        assert_eq!(ops.mount_count(), 1);
    }

    #[test]
    fn test_change_counts_as_attach() {
        let (_dir, ops, mut reg) = registry();
        reg.dispatch(&event(Subsystem::Block, Action::Change, USB1_PATH, "sdb"));
        assert!(reg.is_usb_connected(0));
        assert_eq!(ops.mount_count(), 1);
    }

    #[test]
    fn test_remove_when_disconnected_is_noop() {
        let (_dir, ops, mut reg) = registry();
        let outcome = reg.dispatch(&event(Subsystem::Block, Action::Remove, USB1_PATH, "sdb"));
        assert_eq!(
            outcome,
            DispatchOutcome::Unchanged(SlotId::Usb(UsbRole::ManualBackup))
        );
        assert!(ops.calls().is_empty());
    }

    #[test]
    fn test_usb_add_then_remove() {
        let (dir, ops, mut reg) = registry();
        reg.dispatch(&event(Subsystem::Block, Action::Add, USB1_PATH, "sdb"));
        assert!(reg.is_usb_connected(0));
        let outcome = reg.dispatch(&event(Subsystem::Block, Action::Remove, USB1_PATH, "sdb"));
        assert_eq!(
            outcome,
            DispatchOutcome::Disconnected(SlotId::Usb(UsbRole::ManualBackup))
        );
        assert!(!reg.is_usb_connected(0));
        assert_eq!(ops.unmount_count(), 1);
        assert!(!dir.path().join("USB1").exists());
    }

    #[test]
    fn test_input_add_connects_without_mount() {
        let (_dir, ops, mut reg) = registry();
        let outcome = reg.dispatch(&event(Subsystem::Input, Action::Add, INPUT_PATH, ""));
        assert_eq!(
            outcome,
            DispatchOutcome::Connected(SlotId::Usb(UsbRole::InputDevice))
        );
        assert!(reg.is_usb_connected(UsbRole::InputDevice.index()));
        assert!(ops.calls().is_empty());

        reg.dispatch(&event(Subsystem::Input, Action::Remove, INPUT_PATH, ""));
        assert!(!reg.is_usb_connected(UsbRole::InputDevice.index()));
        assert!(ops.calls().is_empty());
    }

    #[test]
    fn test_mount_failure_leaves_flag_clear() {
        let (_dir, ops, mut reg) = registry();
        ops.set_fail_mount(true);
        let ev = event(Subsystem::Block, Action::Add, HDD1_PATH, "sda");
        assert!(matches!(
            reg.dispatch(&ev),
            DispatchOutcome::Failed {
                error: MountError::MountFailed { .. },
                ..
            }
        ));
        assert!(!reg.is_hdd_connected(0));

        // A retry notification gets another attempt.
        ops.set_fail_mount(false);
        assert!(matches!(reg.dispatch(&ev), DispatchOutcome::Connected(_)));
        assert_eq!(ops.mount_count(), 2);
    }

    #[test]
    fn test_hdd_remove_all_stages_fail_keeps_connected() {
        let (_dir, ops, mut reg) = registry();
        reg.dispatch(&event(Subsystem::Block, Action::Add, HDD1_PATH, "sda"));
        ops.set_failing_stages(&DEFAULT_UNMOUNT_STAGES);
        let outcome = reg.dispatch(&event(Subsystem::Block, Action::Remove, HDD1_PATH, "sda"));
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed {
                error: MountError::UnmountFailed { .. },
                ..
            }
        ));
        assert!(reg.is_hdd_connected(0));
    }

    #[test]
    fn test_graceful_failure_forced_success_disconnects() {
        let (dir, ops, mut reg) = registry();
        reg.dispatch(&event(Subsystem::Block, Action::Add, USB1_PATH, "sdb"));
        ops.set_failing_stages(&[UnmountStage::Graceful]);
        let outcome = reg.dispatch(&event(Subsystem::Block, Action::Remove, USB1_PATH, "sdb"));
        assert!(matches!(outcome, DispatchOutcome::Disconnected(_)));
        assert!(!reg.is_usb_connected(0));
        assert!(!dir.path().join("USB1").exists());
    }

    #[test]
    fn test_unresolved_devpath() {
        let (_dir, ops, mut reg) = registry();
        let outcome = reg.dispatch(&event(
            Subsystem::Block,
            Action::Add,
            "/devices/virtual/block/ram0",
            "ram0",
        ));
        assert_eq!(outcome, DispatchOutcome::Unresolved);
        assert!(ops.calls().is_empty());
    }

    #[test]
    fn test_status_handle_tracks_registry() {
        let (_dir, _ops, mut reg) = registry();
        let status = reg.status();
        reg.dispatch(&event(Subsystem::Block, Action::Add, HDD1_PATH, "sda"));
        assert!(status.is_hdd_connected(0));
        assert_eq!(status.snapshot().connected_labels(), vec!["HDD1"]);
    }
}
