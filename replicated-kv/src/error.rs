//! Error taxonomy for the replicated store.
//!
//! Only conditions that stop a node are errors. A rejected vote, a failed
//! AppendEntries or a "no known leader" reply are ordinary protocol data and
//! travel as messages instead.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing cluster configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A durable log record failed to parse while replaying.
    #[error("durable log {} is corrupted at line {line}: {source}", path.display())]
    Corruption {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// The term/vote state file failed to parse while restoring.
    #[error("state file {} is corrupted: {source}", path.display())]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Connect, send or receive failure. Callers normally log and drop the
    /// message; the timeout loop retries.
    #[error("transport failure talking to {addr}: {source}")]
    Transport {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A peer sent something that contradicts the log safety invariants.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Whether the node must stop after seeing this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Transport { .. })
    }
}
