#![warn(missing_docs)]

//! NVR storage subsystem: udev hotplug IPC, slot registry, safe mount/unmount engine
//!
//! A udev rule runs the notifier, which sends one framed message per device
//! event over a Unix socket. The daemon decodes it, resolves the device's
//! bus path to a logical slot (HDD bay or USB role) and mounts or unmounts
//! the slot's filesystem, publishing per-slot connection flags.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod mount;
pub mod registry;
pub mod resync;
pub mod server;
pub mod service;
pub mod slot;
pub mod state;

pub use config::{validate_config, HotplugConfig, ResyncConfig};
pub use error::{HotplugError, Result};
pub use event::{Action, DeviceEvent, Subsystem};
pub use frame::{encode, parse, Field, FrameError, SyntaxFault, MAX_MESSAGE_SIZE};
pub use mount::{FsFamily, LinuxMountOps, MockMountOps, MountEngine, MountError, MountOps, UnmountStage};
pub use registry::{DispatchOutcome, SlotRegistry};
pub use resync::{ResyncError, ResyncReport};
pub use server::{IpcServer, IpcServerConfig, RecvError, ServerState};
pub use service::HotplugService;
pub use slot::{builtin_layouts, BoardLayout, SlotId, SlotPathTable, UsbRole};
pub use state::{SlotStatus, StatusSnapshot};
