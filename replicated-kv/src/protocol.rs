//! Command parsing for the client REPL.
//!
//! This module turns text typed at the prompt (like "SET foo bar") into
//! structured commands. It is separate from [`crate::message::ClientRequest`]
//! because the console also has meta-commands (HELP, EXIT) that never reach
//! a server.

use anyhow::{Result, anyhow};

use crate::message::{ClientRequest, ClientResponse};

pub const HELP: &str = "\
Commands (case-insensitive):
  SET <key> <value>  (alias: s)  -- store a value, replicated through the leader
  GET <key>          (alias: g)  -- read the value held by the connected node
  DELETE <key>       (alias: d)  -- remove a key
  PING               (alias: p)  -- check the node is alive
  HELP               (alias: h)  -- show this message
  EXIT               (alias: e)  -- leave the shell";

/// Commands that can be entered at the client prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Set { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    Ping,
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses a line of user input into a command.
    ///
    /// # Syntax
    /// Commands are case-insensitive and support aliases:
    /// - `SET <key> <value>` (alias: `s`). The value is the rest of the
    ///   line, so it may contain spaces.
    /// - `GET <key>` (alias: `g`)
    /// - `DELETE <key>` (alias: `d`)
    /// - `PING` (alias: `p`)
    /// - `HELP` (alias: `h`)
    /// - `EXIT` (alias: `e`)
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let Some(first) = trimmed.split_whitespace().next() else {
            return Err(anyhow!("empty command"));
        };
        let rest = trimmed[first.len()..].trim_start();

        let cmd = first.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "S" => "SET",
            "G" => "GET",
            "D" | "DEL" => "DELETE",
            "P" => "PING",
            "H" => "HELP",
            "E" | "QUIT" => "EXIT",
            other => other,
        };

        match normalized_cmd {
            "PING" if rest.is_empty() => return Ok(ConsoleCommand::Ping),
            "HELP" => return Ok(ConsoleCommand::Help),
            "EXIT" => return Ok(ConsoleCommand::Exit),
            _ => {}
        }

        let args: Vec<&str> = rest.split_whitespace().collect();
        match (normalized_cmd, args.as_slice()) {
            ("GET", [key]) => Ok(ConsoleCommand::Get {
                key: key.to_string(),
            }),
            ("DELETE", [key]) => Ok(ConsoleCommand::Delete {
                key: key.to_string(),
            }),
            ("SET", [key, _, ..]) => {
                let value = rest[key.len()..].trim_start();
                Ok(ConsoleCommand::Set {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("DELETE", _) => Err(anyhow!("DELETE requires exactly one argument: DELETE <key>")),
            ("SET", _) => Err(anyhow!("SET requires a key and a value: SET <key> <value>")),
            ("PING", _) => Err(anyhow!("PING takes no arguments")),
            _ => Err(anyhow!(
                "invalid command. Try: SET/s <key> <value>, GET/g <key>, DELETE/d <key>, PING/p, HELP/h, EXIT/e"
            )),
        }
    }

    /// The request to send for this command, if it talks to a server.
    pub fn into_request(self) -> Option<ClientRequest> {
        match self {
            ConsoleCommand::Set { key, value } => Some(ClientRequest::set(key, value)),
            ConsoleCommand::Get { key } => Some(ClientRequest::get(key)),
            ConsoleCommand::Delete { key } => Some(ClientRequest::delete(key)),
            ConsoleCommand::Ping => Some(ClientRequest::ping()),
            ConsoleCommand::Help | ConsoleCommand::Exit => None,
        }
    }
}

/// Renders a response as one line for the console.
pub fn describe(response: &ClientResponse) -> String {
    match (response.success, response.result.as_deref()) {
        (true, Some(value)) => value.to_string(),
        (true, None) => "OK".to_string(),
        (false, Some(reason)) => format!("ERROR: {reason}"),
        (false, None) => format!("ERROR: {} failed", response.op),
    }
}
