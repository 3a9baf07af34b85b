//! Line-oriented broadcast relay over TCP.
//!
//! Clients send `\n`-terminated lines and the server writes each line, byte for
//! byte, to every other connected client. Modules:
//!
//! - [`registry`] tracks live connections and fans a line out to all of them
//!   under one lock, evicting any peer whose write fails.
//! - [`session`] runs the per-connection read loop and owns registration.
//! - [`server`] binds the listener and spawns a session per accepted peer.
//! - [`client`] is the terminal peer: prints inbound lines and sends stdin.
//! - [`cli`] parses the `start` and `connect` commands.

pub mod cli;
pub mod client;
pub mod registry;
pub mod server;
pub mod session;
