//! Interactive client.
//!
//! Reads commands from stdin, sends them to one node and prints each
//! response. Type HELP for the command list.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;

use replicated_kv::client::Client;
use replicated_kv::protocol::{ConsoleCommand, HELP, describe};

#[derive(Parser, Debug)]
#[command(author, version, about = "Talk to a replicated key-value store node")]
struct Args {
    /// Address of the node to connect to
    #[arg(long, default_value = "127.0.0.1:7101")]
    server: String,

    /// How long to wait for a connection or a response, in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

fn main() -> Result<()> {
    replicated_kv::init_tracing();
    let args = Args::parse();

    let mut client = Client::connect(&args.server, Duration::from_millis(args.timeout_ms))?;
    println!("connected to {}. Type HELP (or h) for commands.", client.addr());

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut line = String::new();
    loop {
        print!("> ");
        stdout.flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line).context("failed to read stdin")? == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let request = match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Help) => {
                println!("{HELP}");
                continue;
            }
            Ok(ConsoleCommand::Exit) => break,
            Ok(command) => match command.into_request() {
                Some(request) => request,
                None => continue,
            },
            Err(err) => {
                println!("ERROR: {err}");
                continue;
            }
        };

        match client.send(request) {
            Ok(response) => println!("{}", describe(&response)),
            Err(err) => {
                println!("ERROR: {err:#}");
                // the connection may be half-read now, start over
                if let Err(err) = client.reconnect() {
                    warn!("reconnect failed: {err:#}");
                }
            }
        }
    }

    Ok(())
}
