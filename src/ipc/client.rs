use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::backend::RefreshReport;

use super::types::{ControlCommand, IpcError, SwitcherStatus};

const IPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle for sending commands to a running switcher.
#[derive(Clone)]
pub struct ControlClient {
    sender: mpsc::Sender<ControlCommand>,
    reload_timeout: Duration,
}

impl ControlClient {
    pub fn new(sender: mpsc::Sender<ControlCommand>) -> Self {
        Self {
            sender,
            reload_timeout: IPC_TIMEOUT,
        }
    }

    /// A reload probes every candidate backend, so it may take up to one
    /// backend timeout longer than other commands.
    pub fn with_reload_timeout(mut self, backend_timeout: Duration) -> Self {
        self.reload_timeout = IPC_TIMEOUT + backend_timeout;
        self
    }

    pub async fn reload(&self) -> Result<RefreshReport, IpcError> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(ControlCommand::Reload { respond_to }).await?;

        recv_with_timeout(receiver, self.reload_timeout).await
    }

    pub async fn shutdown(&self) -> Result<(), IpcError> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(ControlCommand::Shutdown { respond_to }).await?;

        recv_with_timeout(receiver, IPC_TIMEOUT).await
    }

    pub async fn status(&self) -> Result<SwitcherStatus, IpcError> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(ControlCommand::Status { respond_to }).await?;

        recv_with_timeout(receiver, IPC_TIMEOUT).await
    }

    async fn send(&self, command: ControlCommand) -> Result<(), IpcError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| IpcError::Disconnected)
    }
}

async fn recv_with_timeout<T>(
    receiver: oneshot::Receiver<T>,
    timeout: Duration,
) -> Result<T, IpcError> {
    match tokio::time::timeout(timeout, receiver).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(IpcError::Disconnected),
        Err(_) => Err(IpcError::Timeout),
    }
}
