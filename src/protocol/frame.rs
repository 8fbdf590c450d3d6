//! Length-prefixed agent frames.
//!
//! ```text
//! +----------------+---------+---------------------+
//! | u32 BE length  | u8 type | length - 1 payload  |
//! +----------------+---------+---------------------+
//! ```

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::MessageType;

/// Largest frame OpenSSH's agent accepts.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 256 * 1024;

/// Errors raised while reading or writing a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The length field was zero, so there is no message type byte.
    #[error("empty frame")]
    Empty,

    /// The length field exceeds the configured maximum.
    #[error("frame length {len} exceeds maximum {max}")]
    TooLarge { len: u32, max: u32 },

    /// The peer closed the stream in the middle of a frame.
    #[error("truncated frame")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One decoded agent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: u8, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Payload-less frame of the given type.
    pub fn bare(msg_type: MessageType) -> Self {
        Self::new(msg_type as u8, Vec::new())
    }

    /// Standard `SSH_AGENT_FAILURE` reply.
    pub fn failure() -> Self {
        Self::bare(MessageType::Failure)
    }

    /// Standard `SSH_AGENT_SUCCESS` reply.
    pub fn success() -> Self {
        Self::bare(MessageType::Success)
    }

    pub fn is(&self, msg_type: MessageType) -> bool {
        self.msg_type == msg_type as u8
    }

    /// Serialize the frame including its length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let len = (self.payload.len() + 1) as u32;
        let mut buf = Vec::with_capacity(self.payload.len() + 5);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(self.msg_type);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Read one frame from `reader`.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header);
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;

    let payload = body.split_off(1);
    Ok(Some(Frame::new(body[0], payload)))
}

/// Write one frame to `writer` and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
