use serde::{Deserialize, Serialize};

/// Client-visible operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Get,
    Set,
    Delete,
    Ping,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Get => "GET",
            Operation::Set => "SET",
            Operation::Delete => "DELETE",
            Operation::Ping => "PING",
        };
        f.write_str(name)
    }
}

/// Commands that flow through the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
    Noop,
}


/// One position in the replicated log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    #[serde(flatten)]
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: u64, command: Command) -> Self {
        Self { term, command }
    }

    pub fn noop(term: u64) -> Self {
        Self::new(term, Command::Noop)
    }

    /// Single-line record written to the durable log.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}
