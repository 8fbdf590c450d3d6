//! Backend agents: discovery, the live registry, and the wire client.
//!
//! The registry is the only shared mutable state in the switcher. It is
//! refreshed out-of-band and read through immutable snapshots from the
//! request path.

mod client;
mod discovery;
mod registry;

pub use client::{BackendClient, BackendError};
pub use discovery::scan;
pub use registry::{BackendAgent, BackendRegistry, RefreshReport, Snapshot};
