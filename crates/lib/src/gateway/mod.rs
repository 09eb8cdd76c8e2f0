//! Gateway: exposes the relay router over plain HTTP or FastCGI (TCP, Unix socket, stdio).
//!
//! One transport per process, chosen at startup from [`crate::config::Transport`].

pub mod fcgi;
pub mod protocol;
mod server;

pub use server::{router, run_server, serve, shutdown_signal};
