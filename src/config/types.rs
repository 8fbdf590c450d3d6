use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::DEFAULT_MAX_FRAME_LEN;

/// Root configuration container.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub switcher: SwitcherConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
}

/// Listening socket and lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SwitcherConfig {
    /// Socket to listen on. Defaults to `/tmp/ssh-agent.$USER`.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// Directory scanned for forwarded agent sockets (default: /tmp).
    #[serde(default = "default_agents_dir")]
    pub agents_dir: PathBuf,
    /// Permission bits applied to the listening socket (default: 0o600).
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,
    /// How long shutdown waits for open sessions (default: 5000).
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

/// Naming rules used when scanning `agents_dir`.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Prefix of the per-session directories sshd creates (default: "ssh-").
    #[serde(default = "default_dir_prefix")]
    pub dir_prefix: String,
    /// Prefix of the agent sockets inside them (default: "agent.").
    #[serde(default = "default_socket_prefix")]
    pub socket_prefix: String,
    /// Skip directories owned by other users (default: true).
    #[serde(default = "default_require_same_owner")]
    pub require_same_owner: bool,
}

/// Settings for talking to backend agents.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendsConfig {
    /// Per-backend request timeout in milliseconds (default: 2000).
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
    /// Largest frame accepted from clients or backends (default: 256 KiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
}

fn default_agents_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_socket_mode() -> u32 {
    0o600
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_dir_prefix() -> String {
    "ssh-".to_string()
}

fn default_socket_prefix() -> String {
    "agent.".to_string()
}

fn default_require_same_owner() -> bool {
    true
}

fn default_backend_timeout_ms() -> u64 {
    2000
}

fn default_max_frame_len() -> u32 {
    DEFAULT_MAX_FRAME_LEN
}

/// Conventional socket location for the invoking user, if `$USER` is set.
pub fn default_socket_path() -> Option<PathBuf> {
    match std::env::var("USER") {
        Ok(user) if !user.is_empty() => Some(PathBuf::from(format!("/tmp/ssh-agent.{user}"))),
        _ => None,
    }
}

impl Config {
    /// The socket to listen on: the configured one or the per-user default.
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.switcher
            .socket_path
            .clone()
            .filter(|path| !path.as_os_str().is_empty())
            .or_else(default_socket_path)
    }
}

impl SwitcherConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl BackendsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            agents_dir: default_agents_dir(),
            socket_mode: default_socket_mode(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            dir_prefix: default_dir_prefix(),
            socket_prefix: default_socket_prefix(),
            require_same_owner: default_require_same_owner(),
        }
    }
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_backend_timeout_ms(),
            max_frame_len: default_max_frame_len(),
        }
    }
}
