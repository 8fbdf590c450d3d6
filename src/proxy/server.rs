use std::fs::{self, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, BackendRegistry};
use crate::config::Config;
use crate::ipc::{
    BackendInfo, ControlClient, ControlCommand, ControlLayer, ControlServer, SwitcherStatus,
};
use crate::proxy::error::ServerError;
use crate::proxy::router::RequestRouter;
use crate::proxy::session::ClientSession;
use crate::proxy::shutdown::ShutdownManager;

/// Lifecycle of a [`SwitcherServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerPhase {
    Starting = 0,
    Listening = 1,
    ReloadPending = 2,
    Draining = 3,
    Stopped = 4,
}

impl ServerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerPhase::Starting,
            1 => ServerPhase::Listening,
            2 => ServerPhase::ReloadPending,
            3 => ServerPhase::Draining,
            _ => ServerPhase::Stopped,
        }
    }
}

/// Shared phase cell, readable after the server has been moved into `run`.
#[derive(Clone)]
struct PhaseCell {
    phase: Arc<AtomicU8>,
    pending_reloads: Arc<AtomicUsize>,
}

impl PhaseCell {
    fn new() -> Self {
        Self {
            phase: Arc::new(AtomicU8::new(ServerPhase::Starting as u8)),
            pending_reloads: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn get(&self) -> ServerPhase {
        ServerPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn advance(&self, phase: ServerPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
        debug!(?phase, "Server phase");
    }

    fn reload_started(&self) {
        self.pending_reloads.fetch_add(1, Ordering::SeqCst);
        let _ = self.phase.compare_exchange(
            ServerPhase::Listening as u8,
            ServerPhase::ReloadPending as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn reload_finished(&self) {
        if self.pending_reloads.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Draining wins over a late reload.
            let _ = self.phase.compare_exchange(
                ServerPhase::ReloadPending as u8,
                ServerPhase::Listening as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}

/// The switcher: owns the listening socket, the backend registry and the
/// control channel.
pub struct SwitcherServer {
    socket_path: PathBuf,
    socket_mode: u32,
    drain_timeout: Duration,
    max_frame_len: u32,
    router: RequestRouter,
    shutdown: Arc<ShutdownManager>,
    phase: PhaseCell,
    listener: Option<UnixListener>,
    /// Held for as long as the server lives.
    lock: Option<File>,
    control: ControlServer,
    control_client: ControlClient,
    started_at: Instant,
}

impl SwitcherServer {
    pub fn new(config: &Config) -> Result<Self, ServerError> {
        config.validate()?;
        let socket_path = config.socket_path().ok_or(ServerError::NoSocketPath)?;

        let client = BackendClient::new(config.backends.timeout(), config.backends.max_frame_len);
        let registry = BackendRegistry::with_excluded(
            config.switcher.agents_dir.clone(),
            config.discovery.clone(),
            client,
            Some(socket_path.clone()),
        );
        let (control_client, control) = ControlLayer::new();

        Ok(Self {
            socket_path,
            socket_mode: config.switcher.socket_mode,
            drain_timeout: config.switcher.drain_timeout(),
            max_frame_len: config.backends.max_frame_len,
            router: RequestRouter::new(registry),
            shutdown: Arc::new(ShutdownManager::new()),
            phase: PhaseCell::new(),
            listener: None,
            lock: None,
            control,
            control_client: control_client.with_reload_timeout(config.backends.timeout()),
            started_at: Instant::now(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn phase(&self) -> ServerPhase {
        self.phase.get()
    }

    /// Handle for sending reload, shutdown and status commands.
    pub fn control(&self) -> ControlClient {
        self.control_client.clone()
    }

    /// Take the instance lock and create the listening socket.
    ///
    /// A leftover socket file from a previous run is replaced. The socket is
    /// created under a restrictive umask so it is never reachable by other
    /// users, even briefly, and then chmod'ed to the configured mode.
    pub fn bind(&mut self) -> Result<(), ServerError> {
        let lock_path = lock_path(&self.socket_path);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| ServerError::Lock {
                path: lock_path.clone(),
                source,
            })?;
        if lock.try_lock_exclusive().is_err() {
            return Err(ServerError::AlreadyRunning {
                path: self.socket_path.clone(),
            });
        }

        match fs::remove_file(&self.socket_path) {
            Ok(()) => info!(socket = %self.socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ServerError::RemoveStale {
                    path: self.socket_path.clone(),
                    source,
                })
            }
        }

        let listener = {
            // SAFETY: umask only swaps the process file mode creation mask.
            let previous = unsafe { libc::umask(0o177) };
            let _restore = scopeguard::guard(previous, |previous| unsafe {
                libc::umask(previous);
            });
            UnixListener::bind(&self.socket_path).map_err(|source| ServerError::Bind {
                path: self.socket_path.clone(),
                source,
            })?
        };

        fs::set_permissions(&self.socket_path, Permissions::from_mode(self.socket_mode)).map_err(
            |source| ServerError::Permissions {
                path: self.socket_path.clone(),
                source,
            },
        )?;

        info!(
            socket = %self.socket_path.display(),
            mode = %format!("{:o}", self.socket_mode),
            "Socket bound"
        );
        self.listener = Some(listener);
        self.lock = Some(lock);
        Ok(())
    }

    /// Serve until a shutdown command arrives.
    ///
    /// Consumes self to take ownership of the bound listener; call
    /// [`bind`](Self::bind) first.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let listener = self.listener.take().ok_or(ServerError::NotBound)?;
        let registry = self.router.registry().clone();

        registry.refresh().await;
        self.phase.advance(ServerPhase::Listening);
        info!(
            socket = %self.socket_path.display(),
            agents_dir = %registry.root().display(),
            "Listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => self.spawn_session(stream),
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                command = self.control.recv() => match command {
                    Some(ControlCommand::Reload { respond_to }) => {
                        info!("Reload requested");
                        self.phase.reload_started();
                        let registry = registry.clone();
                        let phase = self.phase.clone();
                        tokio::spawn(async move {
                            let report = registry.refresh().await;
                            phase.reload_finished();
                            if respond_to.send(report).is_err() {
                                tracing::trace!("Reload response dropped (receiver gone)");
                            }
                        });
                    }
                    Some(ControlCommand::Status { respond_to }) => {
                        if respond_to.send(self.status()).is_err() {
                            tracing::trace!("Status response dropped (receiver gone)");
                        }
                    }
                    Some(ControlCommand::Shutdown { respond_to }) => {
                        info!("Shutdown requested");
                        let _ = respond_to.send(());
                        break;
                    }
                    None => break,
                },
            }
        }

        self.phase.advance(ServerPhase::Draining);
        self.shutdown.signal_shutdown();
        drop(listener);
        info!(
            active = self.shutdown.active_connections(),
            "Draining sessions"
        );
        self.shutdown.wait_for_connections(self.drain_timeout).await;

        remove_if_present(&self.socket_path);
        // Unlink before unlocking.
        if let Some(lock) = self.lock.take() {
            remove_if_present(&lock_path(&self.socket_path));
            drop(lock);
        }

        self.phase.advance(ServerPhase::Stopped);
        info!("Shut down gracefully");
        Ok(())
    }

    fn spawn_session(&self, stream: UnixStream) {
        let session = ClientSession::new(
            stream,
            self.router.clone(),
            Arc::clone(&self.shutdown),
            self.max_frame_len,
        );
        tokio::spawn(async move {
            let id = session.id().to_string();
            if let Err(e) = session.run().await {
                warn!(session = %id, error = %e, "Session ended with error");
            }
        });
    }

    fn status(&self) -> SwitcherStatus {
        let snapshot = self.router.registry().snapshot();
        SwitcherStatus {
            phase: self.phase.get(),
            socket_path: self.socket_path.clone(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            active_sessions: self.shutdown.active_connections(),
            registry_version: snapshot.version(),
            backends: snapshot
                .backends()
                .iter()
                .map(|backend| BackendInfo {
                    path: backend.path().to_path_buf(),
                    identities: backend.identities().len(),
                    discovered_at: backend.discovered_at(),
                    last_contact: backend.last_contact(),
                })
                .collect(),
        }
    }
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

fn lock_path(socket_path: &Path) -> PathBuf {
    let mut path = socket_path.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}
