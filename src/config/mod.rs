//! Configuration: TOML file, defaults, and validation.

mod loader;
mod types;

pub use loader::ConfigError;
pub use types::{default_socket_path, BackendsConfig, Config, DiscoveryConfig, SwitcherConfig};
