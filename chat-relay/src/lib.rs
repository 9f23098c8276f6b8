//! Nickname-based chat relay.
//!
//! Clients connect over TCP, claim a unique nickname with `CONNECT`, and then
//! exchange point-to-point messages through the relay. Presence changes are
//! broadcast to everyone as `USERS` lists. The wire format is one JSON object
//! per line.
//!
//! - [`listener`] binds the port, runs the accept loop on its own task, and
//!   drives orderly shutdown.
//! - [`connection`] wraps one accepted socket: a receive loop on the read half
//!   and a mutex-guarded write half.
//! - [`router`] is the per-connection protocol state machine.
//! - [`directory`] is the shared nickname → connection registry, the only
//!   state touched by more than one session.
//! - [`message`] defines `Command`/`Response` and the line framing.
//! - [`console`], [`client`], [`config`] and [`cli`] are the operator console,
//!   the terminal client, its config file, and the command line.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod console;
pub mod directory;
pub mod listener;
pub mod message;
pub mod router;
