//! Notifier side of the socket protocol.
//!
//! A udev rule runs `nvr-hotplugd notify`, which builds a [`DeviceEvent`]
//! from the udev environment and delivers it as a single frame.

use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::error::{HotplugError, Result};
use crate::event::{Action, DeviceEvent, Subsystem};
use crate::frame;

/// Encode `event` and write it to the daemon socket within `timeout`.
pub async fn send_event(socket_path: &Path, event: &DeviceEvent, timeout: Duration) -> Result<()> {
    let bytes = frame::encode(event)?;
    let send = async {
        let mut stream = UnixStream::connect(socket_path).await?;
        stream.write_all(&bytes).await?;
        stream.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };
    match tokio::time::timeout(timeout, send).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(HotplugError::SocketError {
            path: socket_path.display().to_string(),
            source,
        }),
        Err(_) => Err(HotplugError::SocketError {
            path: socket_path.display().to_string(),
            source: std::io::Error::from(std::io::ErrorKind::TimedOut),
        }),
    }
}

/// Kernel base name of a device node: `/dev/sdb1` with `DEVTYPE=partition` is `sdb`.
pub fn base_node_name(devname: &str, is_partition: bool) -> String {
    let name = devname.rsplit('/').next().unwrap_or(devname);
    if is_partition {
        name.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()
    } else {
        name.to_string()
    }
}

/// Build an event from udev environment variables.
///
/// Returns `None` when `SUBSYSTEM`, `ACTION` or `DEVPATH` is missing, or the
/// action is one the daemon does not handle (`bind`, `move`, ...).
pub fn event_from_udev_env<F>(lookup: F) -> Option<DeviceEvent>
where
    F: Fn(&str) -> Option<String>,
{
    let subsystem = lookup("SUBSYSTEM")?;
    let action = Action::from_wire(&lookup("ACTION")?)?;
    let devpath = lookup("DEVPATH")?;
    let serial = lookup("ID_SERIAL").unwrap_or_default();
    let is_partition = lookup("DEVTYPE").is_some_and(|t| t == "partition");
    let base_node = lookup("DEVNAME")
        .map(|name| base_node_name(&name, is_partition))
        .unwrap_or_default();

    Some(DeviceEvent {
        subsystem: Subsystem::from_wire(&subsystem),
        action,
        devpath,
        serial,
        base_node,
    })
}
