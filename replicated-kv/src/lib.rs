//! Replicated key-value store.
//!
//! A fixed cluster of nodes keeps a string-to-string map consistent with a
//! Raft-style consensus engine. Clients may talk to any node: reads are
//! served from the node's local state, writes are forwarded to the leader,
//! committed once a majority stores them, and answered back along the path
//! they were forwarded on.
//!
//! # Architecture
//!
//! - **Worker thread**: owns the consensus engine and its durable files.
//!   All protocol state lives here, so there are no locks around it.
//! - **Transport threads**: accept connections, read JSON lines into the
//!   worker's inbox and write what the worker sends.
//! - **Caller**: holds a [`runtime::NodeHandle`] to query or stop the worker.
//!
//! Threads talk over crossbeam channels. The engine itself does no I/O on
//! the network; it queues outbound messages that the worker hands to a
//! [`transport::Transport`].
//!
//! # Modules
//!
//! - [`node`]: consensus engine (roles, elections, replication, commit)
//! - [`log`]: replicated log, durable log file and the state machine applier
//! - [`state`]: durable `(term, voted_for)` file
//! - [`store`]: in-memory key-value map
//! - [`command`]: operations and log entries
//! - [`message`]: wire messages and line framing
//! - [`transport`]: TCP transport and an in-process network for tests
//! - [`runtime`]: worker loop and node spawning
//! - [`config`]: cluster configuration and property files
//! - [`client`]: blocking client
//! - [`protocol`]: REPL command parsing

pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod protocol;
pub mod runtime;
pub mod state;
pub mod store;
pub mod transport;

pub use error::{Error, Result};

/// Installs a `tracing` subscriber filtered by `RUST_LOG`, `info` by default.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
