//! Persistent log and applier.
//!
//! The whole log lives in memory. Only the committed prefix reaches disk:
//! each entry is appended to `dkvs_<n>.log` the moment it first commits, so
//! on restart everything in the file counts as committed. An uncommitted
//! entry lost in a crash was never acknowledged to anybody.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::command::{Command, LogEntry, Operation};
use crate::error::{Error, Result};
use crate::message::{Address, ClientResponse, Message, Outbound};
use crate::store::KvStore;

pub const KEY_MISSING: &str = "key doesn't exist";

/// Client waiting on an uncommitted entry. Held only by the leader that
/// accepted the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Where the request arrived from; the response goes back there.
    pub origin: Address,
    pub op: Operation,
    pub redirections: Vec<Address>,
}

pub struct ReplicatedLog {
    entries: Vec<LogEntry>,
    pending: HashMap<usize, PendingRequest>,
    store: KvStore,
    committed: usize,
    writer: BufWriter<File>,
}

impl ReplicatedLog {
    /// Opens (or creates) the durable log and replays it into the store.
    ///
    /// Every replayed entry is committed, so [`committed`](Self::committed)
    /// starts at the replayed length. A record that fails to decode is
    /// fatal: the node cannot tell what else it lost.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = replay(&path)?;

        let mut store = KvStore::new();
        for entry in &entries {
            apply(&mut store, &entry.command);
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let committed = entries.len();
        debug!(path = %path.display(), entries = committed, "replayed durable log");

        Ok(Self {
            entries,
            pending: HashMap::new(),
            store,
            committed,
            writer: BufWriter::new(file),
        })
    }

    /// Adds an entry to the in-memory tail and returns its index.
    pub fn append(&mut self, entry: LogEntry, pending: Option<PendingRequest>) -> usize {
        self.entries.push(entry);
        let index = self.entries.len() - 1;
        if let Some(request) = pending {
            self.pending.insert(index, request);
        }
        index
    }

    pub fn entry_at(&self, index: usize) -> Option<&LogEntry> {
        self.entries.get(index)
    }

    pub fn term_at(&self, index: usize) -> Option<u64> {
        self.entries.get(index).map(|entry| entry.term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> Option<usize> {
        self.entries.len().checked_sub(1)
    }

    pub fn last_term(&self) -> Option<u64> {
        self.entries.last().map(|entry| entry.term)
    }

    /// Entries from `start` to the end of the log.
    pub fn entries_from(&self, start: usize) -> Vec<LogEntry> {
        self.entries.get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Number of committed entries, all of which are on disk.
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Drops every entry after `index` (`None` empties the log) together
    /// with any client request bound to a dropped entry.
    ///
    /// The committed prefix is never touched; asking for that is a
    /// protocol violation.
    pub fn truncate_after(&mut self, index: Option<usize>) -> Result<()> {
        let keep = index.map_or(0, |i| i + 1);
        if keep >= self.entries.len() {
            return Ok(());
        }
        if keep < self.committed {
            return Err(Error::ProtocolViolation(format!(
                "refusing to truncate to {keep} entries below commit point {}",
                self.committed
            )));
        }

        self.pending.retain(|&i, _| i < keep);
        debug!(dropped = self.entries.len() - keep, keep, "truncated log suffix");
        self.entries.truncate(keep);
        Ok(())
    }

    /// Commits entries `[from, to)`: applies each to the store, appends it
    /// to the durable log, and builds the responses owed to waiting clients.
    pub fn commit(&mut self, from: usize, to: usize) -> Result<Vec<Outbound>> {
        if from != self.committed || to > self.entries.len() {
            return Err(Error::ProtocolViolation(format!(
                "commit range {from}..{to} does not follow {} committed of {} entries",
                self.committed,
                self.entries.len()
            )));
        }

        let mut responses = Vec::new();
        for index in from..to {
            let entry = &self.entries[index];
            let line = entry.encode().map_err(std::io::Error::from)?;
            self.writer.write_all(line.as_bytes())?;
            self.writer.write_all(b"\n")?;

            let outcome = apply(&mut self.store, &entry.command);
            debug!(index, term = entry.term, command = ?entry.command, "applied entry");

            if let Some(request) = self.pending.remove(&index) {
                responses.push(respond(request, outcome));
            }
        }
        self.writer.flush()?;
        self.committed = self.committed.max(to);
        Ok(responses)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.store.get(key)
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Flushes buffered records and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Result of applying a mutation; `false` only for a DELETE of a missing key.
fn apply(store: &mut KvStore, command: &Command) -> bool {
    match command {
        Command::Set { key, value } => {
            store.put(key.clone(), value.clone());
            true
        }
        Command::Delete { key } => store.remove(key),
        Command::Noop => true,
    }
}

fn respond(request: PendingRequest, success: bool) -> Outbound {
    let response = if success {
        ClientResponse::ok(request.op, None, request.redirections)
    } else {
        ClientResponse::failed(request.op, KEY_MISSING, request.redirections)
    };
    Outbound {
        to: request.origin,
        message: Message::ClientResponse(response),
    }
}

fn replay(path: &Path) -> Result<Vec<LogEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut entries = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = LogEntry::decode(&line).map_err(|source| Error::Corruption {
            path: path.to_path_buf(),
            line: number + 1,
            source,
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
impl ReplicatedLog {
    fn has_pending(&self, index: usize) -> bool {
        self.pending.contains_key(&index)
    }
}
