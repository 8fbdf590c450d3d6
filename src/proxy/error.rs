//! Error types for the switcher server and client sessions.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::FrameError;

/// A client frame the switcher cannot route.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("unsupported message type {msg_type}")]
    UnsupportedMessage { msg_type: u8 },
}

/// Reasons a client session ends abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Errors that prevent the switcher from serving its socket.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no socket path configured")]
    NoSocketPath,

    /// The lock file next to the socket could not be opened.
    #[error("cannot open lock file '{}': {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Another switcher holds the lock on this socket path.
    #[error("another instance is already serving '{}'", .path.display())]
    AlreadyRunning { path: PathBuf },

    #[error("cannot remove stale socket '{}': {source}", .path.display())]
    RemoveStale {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot bind '{}': {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot set permissions on '{}': {source}", .path.display())]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `run` was called before a successful `bind`.
    #[error("server socket is not bound")]
    NotBound,
}
