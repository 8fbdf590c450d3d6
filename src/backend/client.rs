//! One request/response exchange with a backend agent socket.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::protocol::{
    decode_identities, read_frame, write_frame, Frame, FrameError, Identity, MessageError,
    MessageType,
};

/// Errors that can occur while talking to a backend agent.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Could not open the backend's socket.
    #[error("connect to '{}' failed: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The backend did not answer within the configured timeout.
    #[error("'{}' did not answer within {}ms", .path.display(), .after.as_millis())]
    Timeout { path: PathBuf, after: Duration },

    /// The backend sent something that is not a valid agent frame.
    #[error("protocol error from '{}': {source}", .path.display())]
    Protocol {
        path: PathBuf,
        #[source]
        source: FrameError,
    },

    /// The backend answered with a frame we could not interpret.
    #[error("malformed reply from '{}': {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: MessageError,
    },

    /// The backend replied with an unexpected message type.
    #[error("'{}' replied with message type {msg_type}", .path.display())]
    Unexpected { path: PathBuf, msg_type: u8 },

    /// The backend closed the connection without replying.
    #[error("'{}' closed the connection without replying", .path.display())]
    Closed { path: PathBuf },
}

impl BackendError {
    /// Whether the failure means the socket is gone for good (stale file or
    /// no process listening), as opposed to a slow or confused agent.
    pub fn is_stale(&self) -> bool {
        match self {
            BackendError::Connect { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ),
            _ => false,
        }
    }
}

/// Short-lived connections to backend agents.
///
/// Every call opens a fresh connection, writes one frame, reads one frame and
/// closes the connection. Failures are reported, never retried.
#[derive(Debug, Clone)]
pub struct BackendClient {
    timeout: Duration,
    max_frame_len: u32,
}

impl BackendClient {
    pub fn new(timeout: Duration, max_frame_len: u32) -> Self {
        Self {
            timeout,
            max_frame_len,
        }
    }

    /// Send `frame` to the agent at `path` and return its reply.
    pub async fn request(&self, path: &Path, frame: &Frame) -> Result<Frame, BackendError> {
        match timeout(self.timeout, self.exchange(path, frame)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                path: path.to_path_buf(),
                after: self.timeout,
            }),
        }
    }

    /// Ask the agent at `path` for its identities.
    pub async fn request_identities(&self, path: &Path) -> Result<Vec<Identity>, BackendError> {
        let reply = self
            .request(path, &Frame::bare(MessageType::RequestIdentities))
            .await?;

        if !reply.is(MessageType::IdentitiesAnswer) {
            return Err(BackendError::Unexpected {
                path: path.to_path_buf(),
                msg_type: reply.msg_type,
            });
        }

        decode_identities(&reply.payload).map_err(|source| BackendError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn exchange(&self, path: &Path, frame: &Frame) -> Result<Frame, BackendError> {
        let mut stream = UnixStream::connect(path)
            .await
            .map_err(|source| BackendError::Connect {
                path: path.to_path_buf(),
                source,
            })?;

        let protocol = |source| BackendError::Protocol {
            path: path.to_path_buf(),
            source,
        };

        write_frame(&mut stream, frame).await.map_err(protocol)?;
        read_frame(&mut stream, self.max_frame_len)
            .await
            .map_err(protocol)?
            .ok_or_else(|| BackendError::Closed {
                path: path.to_path_buf(),
            })
    }
}
