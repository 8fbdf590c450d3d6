use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::{message_name, read_frame, write_frame, FrameError};
use crate::proxy::error::SessionError;
use crate::proxy::router::RequestRouter;
use crate::proxy::shutdown::{ConnectionGuard, ShutdownManager};

/// One client connection on the switcher socket.
///
/// Frames are handled strictly in order: read, route, write. The session
/// ends when the client hangs up, sends something unroutable, or the server
/// starts draining. A reply already being produced is always written first.
pub struct ClientSession {
    id: String,
    stream: UnixStream,
    router: RequestRouter,
    shutdown: Arc<ShutdownManager>,
    max_frame_len: u32,
    _guard: ConnectionGuard,
}

impl ClientSession {
    pub fn new(
        stream: UnixStream,
        router: RequestRouter,
        shutdown: Arc<ShutdownManager>,
        max_frame_len: u32,
    ) -> Self {
        let guard = shutdown.track();
        Self {
            id: Uuid::new_v4().to_string(),
            stream,
            router,
            shutdown,
            max_frame_len,
            _guard: guard,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn run(mut self) -> Result<(), SessionError> {
        let session = self.id.as_str();
        debug!(session, "Session opened");

        loop {
            // Shutdown only wins between frames. Once the first byte is in,
            // the frame is read, answered and written.
            let mut first = [0u8; 1];
            let read = tokio::select! {
                biased;
                _ = self.shutdown.wait() => {
                    debug!(session, "Closing session for shutdown");
                    return Ok(());
                }
                read = self.stream.read(&mut first) => read.map_err(FrameError::from)?,
            };
            if read == 0 {
                debug!(session, "Client closed connection");
                return Ok(());
            }

            let mut rest = (&first[..]).chain(&mut self.stream);
            let Some(frame) = read_frame(&mut rest, self.max_frame_len).await? else {
                return Err(FrameError::Truncated.into());
            };

            let msg = message_name(frame.msg_type);
            debug!(session, msg, len = frame.payload.len(), "Request received");

            let reply = match self.router.route(session, frame).await {
                Ok(reply) => reply,
                Err(e) => {
                    info!(session, msg, error = %e, "Closing session on protocol violation");
                    return Err(e.into());
                }
            };
            write_frame(&mut self.stream, &reply).await?;
        }
    }
}
