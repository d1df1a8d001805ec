//! Messages exchanged between nodes and clients, plus line framing.
//!
//! Every message is a single JSON object on its own line, tagged by `type`.
//! The same framing is used on client and peer connections, so a node does
//! not need to know which kind of party sits at the other end of a socket.

use std::io::{self, BufRead, Write};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::command::{LogEntry, Operation};

/// Position of a node inside the cluster view.
pub type NodeId = usize;

/// Transport address, `host:port`.
pub type Address = String;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ClientRequest(ClientRequest),
    ClientResponse(ClientResponse),
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResult(AppendEntriesResult),
}

impl Message {
    /// Term carried by peer messages. Client traffic has none.
    pub fn term(&self) -> Option<u64> {
        match self {
            Message::VoteRequest(m) => Some(m.term),
            Message::VoteResponse(m) => Some(m.term),
            Message::AppendEntries(m) => Some(m.term),
            Message::AppendEntriesResult(m) => Some(m.term),
            Message::ClientRequest(_) | Message::ClientResponse(_) => None,
        }
    }

    /// Index of the peer that produced a peer message.
    pub fn sender(&self) -> Option<NodeId> {
        match self {
            Message::VoteRequest(m) => Some(m.candidate),
            Message::VoteResponse(m) => Some(m.voter),
            Message::AppendEntries(m) => Some(m.leader),
            Message::AppendEntriesResult(m) => Some(m.responder),
            Message::ClientRequest(_) | Message::ClientResponse(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::ClientRequest(_) => "client_request",
            Message::ClientResponse(_) => "client_response",
            Message::VoteRequest(_) => "vote_request",
            Message::VoteResponse(_) => "vote_response",
            Message::AppendEntries(_) => "append_entries",
            Message::AppendEntriesResult(_) => "append_entries_result",
        }
    }
}

/// A message together with the address it arrived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: Address,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: impl Into<Address>, message: Message) -> Self {
        Self {
            from: from.into(),
            message,
        }
    }
}

/// A message the engine wants delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: Address,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub op: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Forwarding hops, oldest first. Each hop pushes the address it
    /// received the request from.
    #[serde(default)]
    pub redirections: Vec<Address>,
}

impl ClientRequest {
    pub fn get(key: impl Into<String>) -> Self {
        Self::new(Operation::Get, Some(key.into()), None)
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(Operation::Set, Some(key.into()), Some(value.into()))
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(Operation::Delete, Some(key.into()), None)
    }

    pub fn ping() -> Self {
        Self::new(Operation::Ping, None, None)
    }

    fn new(op: Operation, key: Option<String>, value: Option<String>) -> Self {
        Self {
            op,
            key,
            value,
            redirections: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub op: Operation,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub redirections: Vec<Address>,
}

impl ClientResponse {
    pub fn ok(op: Operation, result: Option<String>, redirections: Vec<Address>) -> Self {
        Self {
            op,
            success: true,
            result,
            redirections,
        }
    }

    pub fn failed(op: Operation, reason: impl Into<String>, redirections: Vec<Address>) -> Self {
        Self {
            op,
            success: false,
            result: Some(reason.into()),
            redirections,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: NodeId,
    /// `None` when the candidate's log is empty.
    pub last_log_index: Option<usize>,
    pub last_log_term: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
    pub voter: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader: NodeId,
    /// `None` means the entries start at the beginning of the log.
    pub prev_log_index: Option<usize>,
    pub prev_log_term: Option<u64>,
    pub entries: Vec<LogEntry>,
    /// Number of entries the leader has committed.
    pub leader_commit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    pub term: u64,
    pub success: bool,
    /// On success, the length of the prefix known to match the leader.
    /// On failure, the responder's current log length.
    pub log_length: usize,
    pub responder: NodeId,
}

/// Reads the next message from a line-framed stream.
///
/// Returns `Ok(None)` on a clean end of stream. Blank lines are skipped.
pub fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: BufRead,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

/// Writes one message followed by a newline and flushes.
pub fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: Write,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded)?;
    writer.flush()
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
