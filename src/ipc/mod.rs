//! In-process control channel for a running switcher.
//!
//! Signal handlers and tests drive the server through [`ControlClient`];
//! the server's main loop drains the matching [`ControlServer`].

mod client;
mod server;
mod types;


use tokio::sync::mpsc;

pub use client::ControlClient;
pub use server::ControlServer;
pub use types::{BackendInfo, ControlCommand, IpcError, SwitcherStatus};

const IPC_BUFFER: usize = 16;

pub struct ControlLayer;

impl ControlLayer {
    pub fn new() -> (ControlClient, ControlServer) {
        let (sender, receiver) = mpsc::channel(IPC_BUFFER);
        (ControlClient::new(sender), ControlServer::new(receiver))
    }
}
