//! Shared test utilities and mock infrastructure.

#![allow(dead_code, unused_imports)]

pub mod mock_agent;

use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh_agent_switcher::config::Config;
use ssh_agent_switcher::ipc::ControlClient;
use ssh_agent_switcher::protocol::{
    decode_identities, read_frame, write_frame, Frame, Identity, MessageType,
    DEFAULT_MAX_FRAME_LEN,
};
use ssh_agent_switcher::proxy::{ServerError, SwitcherServer};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

pub use mock_agent::MockAgent;

/// Encode `data` as an SSH wire string.
pub fn ssh_string(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// An ed25519-shaped public key blob, distinct per `seed`.
pub fn key_blob(seed: u8) -> Vec<u8> {
    let mut blob = ssh_string(b"ssh-ed25519");
    blob.extend(ssh_string(&[seed; 32]));
    blob
}

pub fn identity(seed: u8) -> Identity {
    Identity::new(key_blob(seed), format!("key-{seed}"))
}

pub fn sign_request(blob: &[u8]) -> Frame {
    let mut payload = ssh_string(blob);
    payload.extend(ssh_string(b"data to sign"));
    payload.extend_from_slice(&0u32.to_be_bytes());
    Frame::new(MessageType::SignRequest as u8, payload)
}

pub fn add_identity_request(seed: u8) -> Frame {
    let mut payload = ssh_string(b"ssh-ed25519");
    payload.extend(ssh_string(&[seed; 32]));
    payload.extend(ssh_string(&[seed; 64]));
    payload.extend(ssh_string(b"added"));
    Frame::new(MessageType::AddIdentity as u8, payload)
}

/// A running switcher serving `agents_dir`.
pub struct TestSwitcher {
    pub socket_path: PathBuf,
    pub control: ControlClient,
    pub task: JoinHandle<Result<(), ServerError>>,
    _socket_dir: TempDir,
}

impl TestSwitcher {
    pub async fn start(agents_dir: &Path) -> Self {
        Self::start_with(agents_dir, |_| {}).await
    }

    pub async fn start_with(agents_dir: &Path, tweak: impl FnOnce(&mut Config)) -> Self {
        let socket_dir = TempDir::new().expect("socket dir");
        let socket_path = socket_dir.path().join("switcher.sock");

        let mut config = Config::default();
        config.switcher.socket_path = Some(socket_path.clone());
        config.switcher.agents_dir = agents_dir.to_path_buf();
        config.backends.timeout_ms = 300;
        config.switcher.drain_timeout_ms = 2000;
        tweak(&mut config);

        let mut server = SwitcherServer::new(&config).expect("server");
        server.bind().expect("bind");
        let control = server.control();
        let task = tokio::spawn(server.run());

        // Status is only answered once the initial refresh is done.
        control.status().await.expect("switcher ready");

        Self {
            socket_path,
            control,
            task,
            _socket_dir: socket_dir,
        }
    }

    pub async fn connect(&self) -> AgentConnection {
        AgentConnection::connect(&self.socket_path).await
    }

    /// Request shutdown and wait for the server to stop.
    pub async fn stop(self) {
        self.control.shutdown().await.expect("shutdown");
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server stopped")
            .expect("server task")
            .expect("server result");
        assert!(
            !self.socket_path.exists(),
            "socket file left behind after shutdown"
        );
        let mut lock_file = self.socket_path.clone().into_os_string();
        lock_file.push(".lock");
        assert!(
            !PathBuf::from(lock_file).exists(),
            "lock file left behind after shutdown"
        );
    }
}

/// Client side of an agent protocol connection.
pub struct AgentConnection {
    stream: UnixStream,
}

impl AgentConnection {
    pub async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.expect("connect");
        Self { stream }
    }

    pub async fn send(&mut self, frame: &Frame) {
        write_frame(&mut self.stream, frame).await.expect("write");
    }

    /// Next reply, or `None` once the switcher has closed the connection.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(
            Duration::from_secs(5),
            read_frame(&mut self.stream, DEFAULT_MAX_FRAME_LEN),
        )
        .await
        .expect("reply in time")
        .ok()
        .flatten()
    }

    pub async fn request(&mut self, frame: &Frame) -> Frame {
        self.send(frame).await;
        self.recv().await.expect("reply")
    }

    pub async fn list_identities(&mut self) -> Vec<Identity> {
        let reply = self
            .request(&Frame::bare(MessageType::RequestIdentities))
            .await;
        assert!(reply.is(MessageType::IdentitiesAnswer), "got {reply:?}");
        decode_identities(&reply.payload).expect("identities answer")
    }
}
