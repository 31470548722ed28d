//! Service driver: accept loop, single dispatcher, startup resync.
//!
//! ```text
//! notifier -> [accept loop] -> per-connection task -> [forwarder, accept order] -> mpsc -> [dispatcher] -> SlotRegistry
//! ```
//!
//! The dispatcher owns the registry on a blocking thread and is the only
//! writer of the connection flags. On shutdown the accept loop stops first;
//! the dispatcher then drains whatever is already queued and hands the
//! registry back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::HotplugConfig;
use crate::error::{HotplugError, Result};
use crate::event::DeviceEvent;
use crate::mount::{LinuxMountOps, MountEngine, MountOps};
use crate::registry::{DispatchOutcome, SlotRegistry};
use crate::resync;
use crate::server::{IpcServer, IpcServerConfig, ServerState, ServerStats};
use crate::state::SlotStatus;

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Events handed to the registry.
    pub dispatched: AtomicU64,
    /// Dispatches that connected a slot.
    pub connected: AtomicU64,
    /// Dispatches that disconnected a slot.
    pub disconnected: AtomicU64,
    /// Mount or unmount failures.
    pub failed: AtomicU64,
    /// Events matching no slot.
    pub unresolved: AtomicU64,
}

impl DispatchStats {
    fn record(&self, outcome: &DispatchOutcome) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            DispatchOutcome::Connected(_) => &self.connected,
            DispatchOutcome::Disconnected(_) => &self.disconnected,
            DispatchOutcome::Failed { .. } => &self.failed,
            DispatchOutcome::Unresolved => &self.unresolved,
            DispatchOutcome::Unchanged(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Running hotplug service.
pub struct HotplugService<O: MountOps + 'static = LinuxMountOps> {
    status: SlotStatus,
    server: Option<Arc<IpcServer>>,
    stats: Arc<DispatchStats>,
    events: mpsc::Sender<DeviceEvent>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
    resync_task: Option<JoinHandle<()>>,
    dispatcher: JoinHandle<SlotRegistry<O>>,
}

impl HotplugService<LinuxMountOps> {
    /// Build the production registry from `config` and start.
    pub fn from_config(config: &HotplugConfig) -> Result<Self> {
        let table = config.slot_table()?;
        let engine = MountEngine::new(LinuxMountOps, &config.media_root).with_dev_root(&config.dev_root);
        Ok(Self::start(config, SlotRegistry::new(table, engine)))
    }
}

impl<O: MountOps + 'static> HotplugService<O> {
    /// Bind the socket, spawn the accept loop and the dispatcher, then kick
    /// off udev resync. A bind failure is logged and the service runs
    /// without hotplug detection. Must be called inside a tokio runtime.
    pub fn start(config: &HotplugConfig, registry: SlotRegistry<O>) -> Self {
        let status = registry.status();
        let stats = Arc::new(DispatchStats::default());
        let (events, rx) = mpsc::channel(config.event_queue);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = {
            let stats = stats.clone();
            tokio::task::spawn_blocking(move || run_dispatcher(registry, rx, &stats))
        };

        let server = match IpcServer::bind(IpcServerConfig {
            socket_path: config.socket_path.clone(),
            backlog: config.backlog,
            recv_timeout: config.recv_timeout(),
        }) {
            Ok(server) => Some(Arc::new(server)),
            Err(e) => {
                error!("hotplug detection disabled: {}", e);
                None
            }
        };

        let accept_task = server.as_ref().map(|server| {
            let server = server.clone();
            let events = events.clone();
            tokio::spawn(async move { server.run(events, shutdown_rx).await })
        });

        // After bind, so replayed events find the socket.
        let resync_task = config.resync.enabled.then(|| {
            let resync_config = config.resync.clone();
            tokio::spawn(async move {
                match tokio::task::spawn_blocking(move || resync::resync_from_config(&resync_config)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("udev resync incomplete: {}", e),
                    Err(e) => error!("udev resync task failed: {}", e),
                }
            })
        });

        info!(
            listening = server.is_some(),
            socket = %config.socket_path.display(),
            "hotplug service started"
        );

        Self {
            status,
            server,
            stats,
            events,
            shutdown_tx,
            accept_task,
            resync_task,
            dispatcher,
        }
    }

    /// Read handle on the connection flags.
    pub fn status(&self) -> SlotStatus {
        self.status.clone()
    }

    /// Whether the notifier socket is bound and accepting.
    pub fn is_listening(&self) -> bool {
        self.server
            .as_ref()
            .is_some_and(|s| s.state() == ServerState::Listening)
    }

    /// Shared dispatch counters.
    pub fn dispatch_stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }

    /// Connection counters; `None` when the socket never bound.
    pub fn server_stats(&self) -> Option<Arc<ServerStats>> {
        self.server.as_ref().map(|s| s.stats())
    }

    /// Queue an event for the dispatcher without going through the socket.
    pub async fn submit(&self, event: DeviceEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| HotplugError::Task("dispatcher stopped".to_string()))
    }

    /// Stop accepting, drain queued events and return the registry.
    pub async fn shutdown(self) -> Result<SlotRegistry<O>> {
        let Self {
            shutdown_tx,
            accept_task,
            resync_task,
            dispatcher,
            events,
            ..
        } = self;

        // The accept loop also stops if the sender is gone.
        let _ = shutdown_tx.send(true);
        if let Some(task) = accept_task {
            task.await.map_err(|e| HotplugError::Task(e.to_string()))?;
        }
        if let Some(task) = resync_task {
            task.await.map_err(|e| HotplugError::Task(e.to_string()))?;
        }
        drop(events);

        let registry = dispatcher
            .await
            .map_err(|e| HotplugError::Task(e.to_string()))?;
        info!(
            connected = ?registry.status().snapshot().connected_labels(),
            "hotplug service stopped"
        );
        Ok(registry)
    }
}

fn run_dispatcher<O: MountOps>(
    mut registry: SlotRegistry<O>,
    mut rx: mpsc::Receiver<DeviceEvent>,
    stats: &DispatchStats,
) -> SlotRegistry<O> {
    while let Some(event) = rx.blocking_recv() {
        let outcome = registry.dispatch(&event);
        stats.record(&outcome);
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, Subsystem};
    use crate::mount::MockMountOps;
    use crate::slot::{SlotId, UsbRole};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    const HDD2_PATH: &str = "/devices/platform/ahci.0/ata2/host1/target1:0:0/1:0:0:0/";

    fn test_config(dir: &TempDir) -> HotplugConfig {
        let mut config = HotplugConfig {
            socket_path: dir.path().join("hotplug.sock"),
            media_root: dir.path().join("media"),
            ..Default::default()
        };
        config.resync.enabled = false;
        config
    }

    fn mock_registry(config: &HotplugConfig) -> (MockMountOps, SlotRegistry<MockMountOps>) {
        let ops = MockMountOps::new();
        let engine = MountEngine::new(ops.clone(), &config.media_root);
        (ops, SlotRegistry::new(config.slot_table().unwrap(), engine))
    }

    #[tokio::test]
    async fn test_submit_then_shutdown_drains() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (ops, registry) = mock_registry(&config);
        let service = HotplugService::start(&config, registry);
        assert!(service.is_listening());

        service
            .submit(DeviceEvent::new(Subsystem::Block, Action::Add, HDD2_PATH, "S2", "sdb"))
            .await
            .unwrap();
        let stats = service.dispatch_stats();
        let registry = service.shutdown().await.unwrap();

        assert!(registry.is_hdd_connected(1));
        assert_eq!(ops.mount_count(), 1);
        assert_eq!(stats.connected.load(Ordering::Relaxed), 1);
        assert!(!config.socket_path.exists());
    }

    #[tokio::test]
    async fn test_bind_failure_runs_degraded() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.socket_path = PathBuf::from("/nonexistent-dir-for-test/hotplug.sock");
        let (_ops, registry) = mock_registry(&config);

        let service = HotplugService::start(&config, registry);
        assert!(!service.is_listening());
        assert!(service.server_stats().is_none());

        // Events can still be injected directly.
        let input = "/devices/platform/hiusb-ohci.0/usb2/2-1/2-1:1.0/input/input1";
        service
            .submit(DeviceEvent::new(Subsystem::Input, Action::Add, input, "", ""))
            .await
            .unwrap();
        let status = service.status();
        let registry = service.shutdown().await.unwrap();
        assert!(status.is_connected(SlotId::Usb(UsbRole::InputDevice)));
        assert!(registry.is_usb_connected(UsbRole::InputDevice.index()));
    }

    #[tokio::test]
    async fn test_resync_runs_against_configured_sysfs() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        let dev = dir.path().join("sys/devices/platform/ahci.0");
        std::fs::create_dir_all(&dev).unwrap();
        std::fs::write(dev.join("uevent"), b"").unwrap();
        config.resync.enabled = true;
        config.resync.sysfs_root = dir.path().join("sys");

        let (_ops, registry) = mock_registry(&config);
        let service = HotplugService::start(&config, registry);
        service.shutdown().await.unwrap();
        assert_eq!(std::fs::read(dev.join("uevent")).unwrap(), b"add");
    }

    #[test]
    fn test_dispatch_stats_record() {
        let stats = DispatchStats::default();
        stats.record(&DispatchOutcome::Unresolved);
        stats.record(&DispatchOutcome::Unchanged(SlotId::Usb(UsbRole::ManualBackup)));
        assert_eq!(stats.dispatched.load(Ordering::Relaxed), 2);
        assert_eq!(stats.unresolved.load(Ordering::Relaxed), 1);
        assert_eq!(stats.connected.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_with_idle_connection() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.recv_timeout_ms = 50;
        let (_ops, registry) = mock_registry(&config);
        let service = HotplugService::start(&config, registry);

        // Connected but silent: the connection task holds a sender until it times out.
        let _idle = tokio::net::UnixStream::connect(&config.socket_path).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::time::timeout(Duration::from_secs(5), service.shutdown())
            .await
            .unwrap()
            .unwrap();
    }
}
