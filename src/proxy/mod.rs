pub mod error;
pub mod router;
pub mod server;
pub mod session;
pub mod shutdown;

use tracing_subscriber::EnvFilter;

pub use error::{RouterError, ServerError, SessionError};
pub use router::{classify, RequestRouter, Strategy};
pub use server::{ServerPhase, SwitcherServer};
pub use session::ClientSession;
pub use shutdown::{ConnectionGuard, ShutdownManager};

/// Install the global subscriber writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();
}
