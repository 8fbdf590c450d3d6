use tokio::sync::mpsc;

use super::types::ControlCommand;

/// Receiving end of the control channel, owned by the switcher's main loop.
pub struct ControlServer {
    pub(crate) receiver: mpsc::Receiver<ControlCommand>,
}

impl ControlServer {
    pub fn new(receiver: mpsc::Receiver<ControlCommand>) -> Self {
        Self { receiver }
    }

    /// Next command, or `None` once every client handle is gone.
    pub async fn recv(&mut self) -> Option<ControlCommand> {
        let command = self.receiver.recv().await?;
        tracing::debug!(command = command.name(), "Control command received");
        Some(command)
    }
}
