//! Multiplexes forwarded SSH agents behind one stable socket.

pub mod backend;
pub mod config;
pub mod ipc;
pub mod protocol;
pub mod proxy;
pub mod signals;
