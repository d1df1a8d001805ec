//! Blocking client for talking to a cluster node over TCP.
//!
//! Any node accepts requests. Followers forward writes to their leader and
//! the reply comes back over the same connection, so the client never has
//! to know who leads.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::message::{ClientRequest, ClientResponse, Message, read_message, write_message};
use crate::transport::tcp::connect;

pub struct Client {
    addr: String,
    timeout: Duration,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Client {
    /// Connects to `addr`. `timeout` bounds both the connect and every
    /// wait for a response.
    pub fn connect(addr: impl Into<String>, timeout: Duration) -> Result<Self> {
        let addr = addr.into();
        let (reader, writer) = open(&addr, timeout)?;
        Ok(Self {
            addr,
            timeout,
            reader,
            writer,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Drops the current connection and dials the same address again.
    pub fn reconnect(&mut self) -> Result<()> {
        let (reader, writer) = open(&self.addr, self.timeout)?;
        self.reader = reader;
        self.writer = writer;
        Ok(())
    }

    /// Stores `value` under `key`.
    ///
    /// Any node accepts the write; a follower forwards it to its leader and
    /// relays the answer. The response arrives once the entry is committed,
    /// and reports `success = false` with a result of `"no leader"` while
    /// the cluster has none.
    ///
    /// # Errors
    ///
    /// Fails if the request can't be written or no response arrives within
    /// the connection timeout.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<ClientResponse> {
        self.send(ClientRequest::set(key, value))
    }

    /// Reads `key` from the contacted node's own store.
    ///
    /// The read is not linearizable: a lagging follower may answer with an
    /// older value. A missing key gives `success = false`.
    ///
    /// # Errors
    ///
    /// Same as [`Client::set`].
    pub fn get(&mut self, key: impl Into<String>) -> Result<ClientResponse> {
        self.send(ClientRequest::get(key))
    }

    /// Removes `key` through the leader. `success` says whether it existed.
    ///
    /// # Errors
    ///
    /// Same as [`Client::set`].
    pub fn delete(&mut self, key: impl Into<String>) -> Result<ClientResponse> {
        self.send(ClientRequest::delete(key))
    }

    /// Liveness check answered by the contacted node without replication.
    pub fn ping(&mut self) -> Result<ClientResponse> {
        self.send(ClientRequest::ping())
    }

    /// Sends one request and waits for its response.
    ///
    /// Anything other than a client response on the connection is skipped.
    pub fn send(&mut self, request: ClientRequest) -> Result<ClientResponse> {
        let op = request.op;
        write_message(&mut self.writer, &Message::ClientRequest(request))
            .with_context(|| format!("failed to send {op} to {}", self.addr))?;

        loop {
            let message = read_message::<_, Message>(&mut self.reader)
                .with_context(|| format!("no response to {op} from {}", self.addr))?;
            match message {
                Some(Message::ClientResponse(response)) => return Ok(response),
                Some(other) => debug!(kind = other.kind(), "ignoring non-client message"),
                None => bail!("{} closed the connection", self.addr),
            }
        }
    }
}

fn open(addr: &str, timeout: Duration) -> Result<(BufReader<TcpStream>, BufWriter<TcpStream>)> {
    let stream = connect(addr, timeout).with_context(|| format!("failed to connect to {addr}"))?;
    stream.set_read_timeout(Some(timeout))?;
    let _ = stream.set_nodelay(true);
    let reader = BufReader::new(stream.try_clone()?);
    Ok((reader, BufWriter::new(stream)))
}
