//! Crate error type.

use thiserror::Error;

use crate::frame::FrameError;
use crate::mount::MountError;
use crate::resync::ResyncError;
use crate::server::RecvError;

/// Crate-level error.
#[derive(Debug, Error)]
pub enum HotplugError {
    /// Filesystem or socket I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The notifier socket could not be bound or reached.
    #[error("socket error on {path}: {source}")]
    SocketError {
        /// Socket path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Rejected frame.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Failed receive on a notifier connection.
    #[error(transparent)]
    Recv(#[from] RecvError),

    /// Mount engine failure.
    #[error(transparent)]
    Mount(#[from] MountError),

    /// udev resync failure.
    #[error(transparent)]
    Resync(#[from] ResyncError),

    /// Invalid configuration.
    #[error("Invalid configuration: {msg}")]
    Config {
        /// What is wrong.
        msg: String,
    },

    /// A service task panicked or was cancelled.
    #[error("Service task failed: {0}")]
    Task(String),
}

/// Result alias using [`HotplugError`].
pub type Result<T> = std::result::Result<T, HotplugError>;

impl HotplugError {
    /// Errors scoped to a single notifier connection. The server logs and
    /// drops these; they never reach the registry.
    pub fn is_per_connection(&self) -> bool {
        matches!(self, HotplugError::Frame(_) | HotplugError::Recv(_))
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        HotplugError::Config { msg: msg.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SyntaxFault;
    use std::time::Duration;

    #[test]
    fn test_per_connection_classification() {
        assert!(HotplugError::Frame(FrameError::InvalidSyntax(SyntaxFault::Empty)).is_per_connection());
        assert!(HotplugError::Recv(RecvError::TimedOut(Duration::from_secs(1))).is_per_connection());
        assert!(!HotplugError::config("bad").is_per_connection());
        assert!(!HotplugError::Mount(MountError::InvalidRequest("x".into())).is_per_connection());
    }

    #[test]
    fn test_socket_error_display() {
        let err = HotplugError::SocketError {
            path: "/tmp/IntSocket".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("/tmp/IntSocket"));
    }

    #[test]
    fn test_display_messages_non_empty() {
        let errors = [
            HotplugError::config("board_variant out of range"),
            HotplugError::Task("join".into()),
            HotplugError::Mount(MountError::UnmountFailed {
                mountpoint: "/media/USB/HDD1".into(),
                stages: 3,
                reason: "busy".into(),
            }),
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }
}
