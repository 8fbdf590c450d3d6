use std::path::PathBuf;
use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::backend::RefreshReport;
use crate::proxy::ServerPhase;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpcError {
    #[error("control channel disconnected")]
    Disconnected,
    #[error("control request timed out")]
    Timeout,
}

/// Point-in-time view of a running switcher.
#[derive(Debug, Clone)]
pub struct SwitcherStatus {
    pub phase: ServerPhase,
    pub socket_path: PathBuf,
    pub uptime_seconds: u64,
    pub active_sessions: usize,
    pub registry_version: u64,
    pub backends: Vec<BackendInfo>,
}

#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub path: PathBuf,
    pub identities: usize,
    pub discovered_at: SystemTime,
    pub last_contact: SystemTime,
}

/// Commands accepted by the server's control channel.
pub enum ControlCommand {
    /// Rescan the agents directory and republish the backend set.
    Reload {
        respond_to: oneshot::Sender<RefreshReport>,
    },
    /// Drain sessions and stop. Acknowledged once draining has begun.
    Shutdown { respond_to: oneshot::Sender<()> },
    Status {
        respond_to: oneshot::Sender<SwitcherStatus>,
    },
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Reload { .. } => "reload",
            ControlCommand::Shutdown { .. } => "shutdown",
            ControlCommand::Status { .. } => "status",
        }
    }
}
