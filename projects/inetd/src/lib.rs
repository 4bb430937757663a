//! `inetd` is an internet super-server: it listens on the sockets of every
//! service in its service table and starts the configured program for each
//! connection or datagram, with the socket as the program's standard streams.
//!
//! It contains:
//! - Service table parsing and rendering
//! - Socket setup for stream and datagram services
//! - The select-based control loop with wait/nowait dispatch
//! - Process spawning, reaping and failure throttling
//! - Configuration reload on SIGHUP and graceful shutdown

pub mod config;
pub mod control;
pub mod dispatcher;
pub mod entries;
pub mod entrypoints;
pub mod logging;
pub mod multiplexer;
pub mod platform;
pub mod registry;
pub mod reload;
pub mod server;
pub mod services;
pub mod signal_handler;
pub mod sockets;
pub mod throttle;

#[cfg(test)]
mod tests;
