//! Mount point management for hotplugged storage.
//!
//! A slot label maps to a fixed mount point (`<media_root>/<label>/`) and
//! a filesystem family. Mounts are only reported successful once the
//! kernel confirms the filesystem is writable; unmount escalates through
//! an ordered list of [`UnmountStage`]s.
//!
//! The syscalls sit behind [`MountOps`] so the engine can run against
//! [`MockMountOps`] in tests.

use std::ffi::CString;
use std::fs::DirBuilder;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Magic value historically required in the upper flag bits by `mount(2)`.
pub const MS_MGC_VAL: libc::c_ulong = 0xC0ED_0000;

/// Flags used for every hotplug mount.
pub const MOUNT_FLAGS: libc::c_ulong = MS_MGC_VAL | libc::MS_NOATIME | libc::MS_NODIRATIME;

/// Mode of created mount-point directories.
pub const MOUNT_DIR_MODE: u32 = 0o755;

/// Filesystem family, selected from the slot label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsFamily {
    /// Internal disks: ext4 with writeback journaling.
    FixedDisk,
    /// USB sticks: FAT.
    RemovableFat,
    /// NTFS. Present in the option table; nothing selects it.
    Ntfs,
}

/// Filesystem type and data string passed to `mount(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsOptions {
    /// Filesystem type name.
    pub fstype: &'static str,
    /// Filesystem-specific option string.
    pub data: &'static str,
}

impl FsFamily {
    /// Family for a slot label: labels containing `HDD` are fixed disks.
    pub fn for_label(label: &str) -> Self {
        if label.contains("HDD") {
            FsFamily::FixedDisk
        } else {
            FsFamily::RemovableFat
        }
    }

    /// Option table entry.
    pub fn options(&self) -> FsOptions {
        match self {
            FsFamily::FixedDisk => FsOptions {
                fstype: "ext4",
                data: "data=writeback",
            },
            FsFamily::RemovableFat => FsOptions {
                fstype: "vfat",
                data: "shortname=mixed,iocharset=utf8,errors=continue",
            },
            FsFamily::Ntfs => FsOptions {
                fstype: "ntfs",
                data: "nls=utf8,umask=0022",
            },
        }
    }
}

/// One step of the unmount escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountStage {
    /// Plain `umount(2)`.
    Graceful,
    /// `umount2(MNT_FORCE)`.
    Forced,
    /// `umount2(MNT_DETACH)`: detach now, release when no longer busy.
    Lazy,
}

impl UnmountStage {
    /// Flags for `umount2(2)`.
    pub fn flags(&self) -> libc::c_int {
        match self {
            UnmountStage::Graceful => 0,
            UnmountStage::Forced => libc::MNT_FORCE,
            UnmountStage::Lazy => libc::MNT_DETACH,
        }
    }
}

/// Default escalation order.
pub const DEFAULT_UNMOUNT_STAGES: [UnmountStage; 3] = [
    UnmountStage::Graceful,
    UnmountStage::Forced,
    UnmountStage::Lazy,
];

/// Errors that can occur during mount operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MountError {
    /// The mount syscall failed or the result was not writable.
    #[error("mount of {device} on {mountpoint} failed: {reason}")]
    MountFailed {
        /// Device node.
        device: String,
        /// Mount point.
        mountpoint: String,
        /// What went wrong.
        reason: String,
    },

    /// Every unmount stage failed; the mount point is left in place.
    #[error("unmount of {mountpoint} failed after {stages} stages: {reason}")]
    UnmountFailed {
        /// Mount point.
        mountpoint: String,
        /// Number of stages attempted.
        stages: usize,
        /// Error from the last stage.
        reason: String,
    },

    /// Label or node name that cannot form a safe path.
    #[error("invalid mount request: {0}")]
    InvalidRequest(String),
}

/// Arguments for one `mount(2)` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Device node, e.g. `/dev/sda1`.
    pub source: PathBuf,
    /// Mount point directory.
    pub target: PathBuf,
    /// Filesystem type.
    pub fstype: String,
    /// Mount flags.
    pub flags: libc::c_ulong,
    /// Filesystem option string.
    pub data: String,
}

/// Syscall surface used by [`MountEngine`].
pub trait MountOps: Send {
    /// Mount `request.source` on `request.target`.
    fn mount(&self, request: &MountRequest) -> io::Result<()>;

    /// Unmount `target` using one escalation stage.
    fn unmount(&self, target: &Path, stage: UnmountStage) -> io::Result<()>;

    /// Whether the filesystem mounted at `target` is read-only.
    fn is_read_only(&self, target: &Path) -> io::Result<bool>;
}

fn path_to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))
}

fn str_to_cstring(s: &str) -> io::Result<CString> {
    CString::new(s).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string contains NUL byte"))
}

/// Real syscalls through libc.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxMountOps;

impl MountOps for LinuxMountOps {
    fn mount(&self, request: &MountRequest) -> io::Result<()> {
        let src = path_to_cstring(&request.source)?;
        let tgt = path_to_cstring(&request.target)?;
        let fstype = str_to_cstring(&request.fstype)?;
        let data = str_to_cstring(&request.data)?;

        let rc = unsafe {
            libc::mount(
                src.as_ptr(),
                tgt.as_ptr(),
                fstype.as_ptr(),
                request.flags,
                data.as_ptr() as *const libc::c_void,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn unmount(&self, target: &Path, stage: UnmountStage) -> io::Result<()> {
        let tgt = path_to_cstring(target)?;
        let rc = match stage {
            UnmountStage::Graceful => unsafe { libc::umount(tgt.as_ptr()) },
            _ => unsafe { libc::umount2(tgt.as_ptr(), stage.flags()) },
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn is_read_only(&self, target: &Path) -> io::Result<bool> {
        let tgt = path_to_cstring(target)?;
        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(tgt.as_ptr(), &mut stats) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(stats.f_flag & libc::ST_RDONLY != 0)
    }
}

/// Mounts and unmounts slots under a media root.
#[derive(Debug)]
pub struct MountEngine<O: MountOps = LinuxMountOps> {
    ops: O,
    media_root: PathBuf,
    dev_root: PathBuf,
    stages: Vec<UnmountStage>,
}

impl<O: MountOps> MountEngine<O> {
    /// Engine mounting under `media_root`, device nodes under `/dev`.
    pub fn new(ops: O, media_root: impl Into<PathBuf>) -> Self {
        Self {
            ops,
            media_root: media_root.into(),
            dev_root: PathBuf::from("/dev"),
            stages: DEFAULT_UNMOUNT_STAGES.to_vec(),
        }
    }

    /// Look up device nodes under another directory.
    pub fn with_dev_root(mut self, dev_root: impl Into<PathBuf>) -> Self {
        self.dev_root = dev_root.into();
        self
    }

    /// Replace the unmount escalation order.
    pub fn with_unmount_stages(mut self, stages: Vec<UnmountStage>) -> Self {
        self.stages = stages;
        self
    }

    /// Syscall backend.
    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Escalation order in use.
    pub fn unmount_stages(&self) -> &[UnmountStage] {
        &self.stages
    }

    /// Mount point for a label.
    pub fn mount_point(&self, label: &str) -> PathBuf {
        self.media_root.join(label)
    }

    /// Device node for a base name: always partition 1.
    pub fn device_node(&self, base_node: &str) -> PathBuf {
        self.dev_root.join(format!("{}1", base_node))
    }

    /// Mount `/dev/<base_node>1` on the label's mount point.
    pub fn mount(&self, label: &str, base_node: &str) -> Result<(), MountError> {
        validate_component("label", label)?;
        validate_component("device node", base_node)?;

        let target = self.mount_point(label);
        let source = self.device_node(base_node);
        let family = FsFamily::for_label(label);
        let options = family.options();

        let mount_failed = |reason: String| MountError::MountFailed {
            device: source.display().to_string(),
            mountpoint: target.display().to_string(),
            reason,
        };

        let created = if target.is_dir() {
            false
        } else {
            DirBuilder::new()
                .recursive(true)
                .mode(MOUNT_DIR_MODE)
                .create(&target)
                .map_err(|e| mount_failed(format!("cannot create mount point: {}", e)))?;
            true
        };

        let request = MountRequest {
            source: source.clone(),
            target: target.clone(),
            fstype: options.fstype.to_string(),
            flags: MOUNT_FLAGS,
            data: options.data.to_string(),
        };

        debug!(
            device = %source.display(),
            mountpoint = %target.display(),
            fstype = options.fstype,
            "mounting"
        );

        if let Err(e) = self.ops.mount(&request) {
            if created {
                if let Err(rm) = std::fs::remove_dir(&target) {
                    warn!(mountpoint = %target.display(), "failed to remove mount point: {}", rm);
                }
            }
            return Err(mount_failed(e.to_string()));
        }

        let reason = match self.ops.is_read_only(&target) {
            Ok(false) => {
                info!(device = %source.display(), mountpoint = %target.display(), "mounted read-write");
                return Ok(());
            }
            Ok(true) => "filesystem mounted read-only".to_string(),
            Err(e) => format!("cannot stat mounted filesystem: {}", e),
        };

        warn!(mountpoint = %target.display(), "{}, unmounting", reason);
        if let Err(e) = self.unmount(label) {
            warn!("unwinding read-only mount failed: {}", e);
        }
        Err(mount_failed(reason))
    }

    /// Unmount a label's mount point and remove the directory.
    ///
    /// Nothing to do when the mount point does not exist.
    pub fn unmount(&self, label: &str) -> Result<(), MountError> {
        validate_component("label", label)?;
        let target = self.mount_point(label);
        if !target.exists() {
            debug!(mountpoint = %target.display(), "no mount point, nothing to unmount");
            return Ok(());
        }

        let mut last_error = None;
        for stage in &self.stages {
            match self.ops.unmount(&target, *stage) {
                Ok(()) => {
                    info!(mountpoint = %target.display(), ?stage, "unmounted");
                    if let Err(e) = std::fs::remove_dir(&target) {
                        warn!(mountpoint = %target.display(), "failed to remove mount point: {}", e);
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(mountpoint = %target.display(), ?stage, "unmount stage failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(MountError::UnmountFailed {
            mountpoint: target.display().to_string(),
            stages: self.stages.len(),
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no unmount stages configured".to_string()),
        })
    }
}

fn validate_component(what: &str, value: &str) -> Result<(), MountError> {
    if value.is_empty() || value == "." || value == ".." || value.contains('/') || value.contains('\0') {
        return Err(MountError::InvalidRequest(format!("{} {:?}", what, value)));
    }
    Ok(())
}

/// Call recorded by [`MockMountOps`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    /// `mount(2)`.
    Mount(MountRequest),
    /// An unmount stage.
    Unmount(PathBuf, UnmountStage),
    /// Read-only probe.
    StatVfs(PathBuf),
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MountCall>,
    fail_mount: bool,
    read_only: bool,
    failing_stages: Vec<UnmountStage>,
}

/// In-memory [`MountOps`] for tests. Clones share state, so a test can keep
/// one clone while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct MockMountOps {
    state: Arc<Mutex<MockState>>,
}

impl MockMountOps {
    /// Mock where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Make `mount(2)` fail.
    pub fn set_fail_mount(&self, fail: bool) {
        self.with_state(|s| s.fail_mount = fail);
    }

    /// Make mounted filesystems report read-only.
    pub fn set_read_only(&self, read_only: bool) {
        self.with_state(|s| s.read_only = read_only);
    }

    /// Make the given unmount stages fail.
    pub fn set_failing_stages(&self, stages: &[UnmountStage]) {
        self.with_state(|s| s.failing_stages = stages.to_vec());
    }

    /// Everything called so far.
    pub fn calls(&self) -> Vec<MountCall> {
        self.with_state(|s| s.calls.clone())
    }

    /// Number of `mount(2)` calls.
    pub fn mount_count(&self) -> usize {
        self.with_state(|s| s.calls.iter().filter(|c| matches!(c, MountCall::Mount(_))).count())
    }

    /// Number of unmount stage calls.
    pub fn unmount_count(&self) -> usize {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter(|c| matches!(c, MountCall::Unmount(..)))
                .count()
        })
    }
}

impl MountOps for MockMountOps {
    fn mount(&self, request: &MountRequest) -> io::Result<()> {
        self.with_state(|s| {
            s.calls.push(MountCall::Mount(request.clone()));
            if s.fail_mount {
                Err(io::Error::from_raw_os_error(libc::EINVAL))
            } else {
                Ok(())
            }
        })
    }

    fn unmount(&self, target: &Path, stage: UnmountStage) -> io::Result<()> {
        self.with_state(|s| {
            s.calls.push(MountCall::Unmount(target.to_path_buf(), stage));
            if s.failing_stages.contains(&stage) {
                Err(io::Error::from_raw_os_error(libc::EBUSY))
            } else {
                Ok(())
            }
        })
    }

    fn is_read_only(&self, target: &Path) -> io::Result<bool> {
        self.with_state(|s| {
            s.calls.push(MountCall::StatVfs(target.to_path_buf()));
            Ok(s.read_only)
        })
    }
}
