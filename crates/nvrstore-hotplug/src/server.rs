//! Notifier socket server.
//!
//! Listens on a Unix-domain stream socket and reads exactly one frame per
//! connection. Each connection goes
//! `Accepted -> Receiving -> {Parsed | TimedOut | PeerClosed | Malformed} -> Closed`;
//! the connection is shut down before its result is reported, on every path.
//! Parsed events are forwarded over a channel to the single dispatcher.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::error::{HotplugError, Result};
use crate::event::DeviceEvent;
use crate::frame::{self, FrameError, MAX_MESSAGE_SIZE};

/// Default socket path shared with the notifier helper.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/IntSocket";
/// Listen backlog, sized for a burst of notifier processes.
pub const DEFAULT_BACKLOG: i32 = 20;
/// Per-message receive budget.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(1);
/// Budget used when the configured timeout is zero.
pub const ZERO_TIMEOUT_GRACE: Duration = Duration::from_millis(15);
/// Socket file mode: the notifier runs under another user.
pub const SOCKET_MODE: u32 = 0o777;

/// Why a connection produced no event.
#[derive(Debug, Error)]
pub enum RecvError {
    /// No complete frame within the receive budget.
    #[error("receive timed out after {0:?}")]
    TimedOut(Duration),

    /// Peer closed before sending the end marker.
    #[error("peer closed after {0} bytes without end marker")]
    PeerClosed(usize),

    /// Buffer filled without an end marker.
    #[error("buffer full ({0} bytes) without end marker")]
    Malformed(usize),

    /// Read error other than an interrupt.
    #[error("read failed: {0}")]
    Io(#[from] io::Error),

    /// Complete frame that failed to parse.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Receive budget for a configured timeout: zero becomes a short grace period.
pub fn effective_timeout(configured: Duration) -> Duration {
    if configured.is_zero() {
        ZERO_TIMEOUT_GRACE
    } else {
        configured
    }
}

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    /// Not accepting.
    #[default]
    Stopped,
    /// Accept loop running.
    Listening,
    /// Accept loop exited, cleaning up.
    Stopping,
}

/// Per-outcome connection counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Connections accepted.
    pub accepted: AtomicU64,
    /// Connections that yielded an event.
    pub parsed: AtomicU64,
    /// [`RecvError::TimedOut`] outcomes.
    pub timed_out: AtomicU64,
    /// [`RecvError::PeerClosed`] outcomes.
    pub peer_closed: AtomicU64,
    /// [`RecvError::Malformed`] outcomes.
    pub malformed: AtomicU64,
    /// Frames rejected by the parser.
    pub rejected: AtomicU64,
    /// Read errors.
    pub io_errors: AtomicU64,
}

impl ServerStats {
    fn record(&self, result: &std::result::Result<DeviceEvent, RecvError>) {
        let counter = match result {
            Ok(_) => &self.parsed,
            Err(RecvError::TimedOut(_)) => &self.timed_out,
            Err(RecvError::PeerClosed(_)) => &self.peer_closed,
            Err(RecvError::Malformed(_)) => &self.malformed,
            Err(RecvError::Frame(_)) => &self.rejected,
            Err(RecvError::Io(_)) => &self.io_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Configuration for the notifier socket.
#[derive(Debug, Clone)]
pub struct IpcServerConfig {
    /// Socket file, recreated on bind.
    pub socket_path: PathBuf,
    /// Listen backlog.
    pub backlog: i32,
    /// Per-message receive budget; zero means [`ZERO_TIMEOUT_GRACE`].
    pub recv_timeout: Duration,
}

impl Default for IpcServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            backlog: DEFAULT_BACKLOG,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }
}

/// Listening notifier socket.
pub struct IpcServer {
    config: IpcServerConfig,
    listener: UnixListener,
    state: AtomicU8,
    stats: Arc<ServerStats>,
}

impl IpcServer {
    /// Recreate the socket file and start listening. Must run inside a tokio runtime.
    pub fn bind(config: IpcServerConfig) -> Result<Self> {
        let socket_error = |source: io::Error| HotplugError::SocketError {
            path: config.socket_path.display().to_string(),
            source,
        };
        let std_listener = bind_listener(&config.socket_path, config.backlog).map_err(socket_error)?;
        let listener = UnixListener::from_std(std_listener).map_err(socket_error)?;
        info!(
            path = %config.socket_path.display(),
            backlog = config.backlog,
            "notifier socket listening"
        );
        Ok(Self {
            config,
            listener,
            state: AtomicU8::new(ServerState::Listening as u8),
            stats: Arc::new(ServerStats::default()),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &IpcServerConfig {
        &self.config
    }

    /// Bound socket path.
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Shared connection counters.
    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        match self.state.load(Ordering::SeqCst) {
            1 => ServerState::Listening,
            2 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Accept one connection and receive one event from it.
    pub async fn accept_one(&self) -> std::result::Result<DeviceEvent, RecvError> {
        let (stream, _) = self.listener.accept().await?;
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        let result = receive_event(stream, effective_timeout(self.config.recv_timeout)).await;
        self.stats.record(&result);
        result
    }

    /// Accept connections until `shutdown` flips (or its sender goes away),
    /// forwarding every parsed event to `events`.
    ///
    /// Connections are received concurrently but their events are forwarded
    /// in accept order, so a `remove` never overtakes the `add` before it. A
    /// stalled connection holds back later events for at most the receive
    /// timeout.
    pub async fn run(&self, events: mpsc::Sender<DeviceEvent>, mut shutdown: watch::Receiver<bool>) {
        let timeout = effective_timeout(self.config.recv_timeout);
        let (order_tx, order_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_in_order(order_rx, events));

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                        let (slot_tx, slot_rx) = oneshot::channel();
                        if order_tx.send(slot_rx).is_err() {
                            error!("event forwarder gone, stopping accept loop");
                            break;
                        }
                        let stats = self.stats.clone();
                        tokio::spawn(async move {
                            let event = handle_connection(stream, timeout, &stats).await;
                            let _ = slot_tx.send(event);
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        self.set_state(ServerState::Stopping);
        if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
            debug!(path = %self.config.socket_path.display(), "socket cleanup: {}", e);
        }
        // In-flight connections finish within the receive timeout.
        drop(order_tx);
        if let Err(e) = forwarder.await {
            error!("event forwarder failed: {}", e);
        }
        self.set_state(ServerState::Stopped);
        info!("notifier socket closed");
    }
}

async fn forward_in_order(
    mut pending: mpsc::UnboundedReceiver<oneshot::Receiver<Option<DeviceEvent>>>,
    events: mpsc::Sender<DeviceEvent>,
) {
    while let Some(slot) = pending.recv().await {
        // A dropped sender means the connection task died; nothing to forward.
        let Ok(Some(event)) = slot.await else {
            continue;
        };
        if events.send(event).await.is_err() {
            error!("dispatcher gone, dropping device event");
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    timeout: Duration,
    stats: &ServerStats,
) -> Option<DeviceEvent> {
    let result = receive_event(stream, timeout).await;
    stats.record(&result);
    match result {
        Ok(event) => {
            debug!(
                action = %event.action,
                subsystem = %event.subsystem,
                devpath = %event.devpath,
                node = %event.base_node,
                "device event received"
            );
            Some(event)
        }
        Err(e) => {
            warn!("notifier connection dropped: {}", e);
            None
        }
    }
}

/// Read one frame from `stream`, close it, then parse.
pub async fn receive_event<S>(mut stream: S, timeout: Duration) -> std::result::Result<DeviceEvent, RecvError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let received = read_frame(&mut stream, timeout).await;
    close(&mut stream).await;
    let buf = received?;
    Ok(frame::parse(&buf)?)
}

/// Accumulate bytes until the buffer holds a complete frame.
pub async fn read_frame<S>(stream: &mut S, timeout: Duration) -> std::result::Result<Vec<u8>, RecvError>
where
    S: AsyncRead + Unpin,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let mut len = 0;

    loop {
        if len == buf.len() {
            return Err(RecvError::Malformed(len));
        }
        let read = tokio::time::timeout_at(deadline, stream.read(&mut buf[len..])).await;
        let n = match read {
            Err(_) => return Err(RecvError::TimedOut(timeout)),
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                continue
            }
            Ok(Err(e)) => return Err(RecvError::Io(e)),
            Ok(Ok(0)) => return Err(RecvError::PeerClosed(len)),
            Ok(Ok(n)) => n,
        };
        len += n;
        if frame::is_complete(&buf[..len]) {
            buf.truncate(len);
            return Ok(buf);
        }
    }
}

/// Half-close then drop; errors here only mean the peer is already gone.
async fn close<S: AsyncWrite + Unpin>(stream: &mut S) {
    if let Err(e) = stream.shutdown().await {
        debug!("connection shutdown: {}", e);
    }
}

fn bind_listener(path: &Path, backlog: i32) -> io::Result<std::os::unix::net::UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let (addr, addr_len) = sockaddr_un(path)?;

    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            addr_len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::listen(socket.as_raw_fd(), backlog) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    Ok(std::os::unix::net::UnixListener::from(socket))
}

fn sockaddr_un(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() || bytes.contains(&0) {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid socket path"));
    }
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path too long"));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}
