//! TCP reference transport.
//!
//! Threads per link, JSON lines on the wire:
//!
//! - **Accept thread**: registers every inbound connection as a link keyed
//!   by the remote socket address, so replies to a client travel back over
//!   the connection it opened.
//! - **Link supervisor**: created lazily the first time a message targets
//!   an address without a link. It connects (bounded by the connect
//!   timeout) and then drains the link's queue onto the socket.
//! - **Reader thread**: one per link, turns lines into [`Envelope`]s in
//!   the node's inbox.
//!
//! A link disappears from the table when its reader sees EOF or an error,
//! or when its writer fails. Messages queued on a dead link are dropped.

use std::collections::{HashMap, HashSet};
use std::io::{self, BufReader, BufWriter};
use std::mem;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::{Envelope, Message, read_message, write_message};
use crate::transport::Transport;

struct Link {
    id: u64,
    queue: Sender<Message>,
    /// Set once connected; used to tear the socket down on close.
    stream: Option<TcpStream>,
}

struct Inner {
    links: Mutex<HashMap<String, Link>>,
    /// Addresses worth dialing. Anything else is only reachable over a
    /// connection it opened itself.
    peers: HashSet<String>,
    inbox: Sender<Envelope>,
    connect_timeout: Duration,
    closed: AtomicBool,
    next_link_id: AtomicU64,
}

pub struct TcpTransport {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Binds `addr` and starts accepting connections. Everything received
    /// is pushed into `inbox`. Only `peers` are ever dialed; replies to
    /// anybody else need the connection they came in on.
    pub fn bind(
        addr: &str,
        peers: &[String],
        inbox: Sender<Envelope>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|source| Error::Transport {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr()?;

        let inner = Arc::new(Inner {
            links: Mutex::new(HashMap::new()),
            peers: peers.iter().cloned().collect(),
            inbox,
            connect_timeout,
            closed: AtomicBool::new(false),
            next_link_id: AtomicU64::new(0),
        });

        let accept_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name(format!("kv-accept-{local_addr}"))
            .spawn(move || accept_inner.accept_loop(listener))?;

        debug!(%local_addr, "transport listening");
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: &str, message: Message) {
        if self.inner.is_closed() {
            return;
        }

        let mut links = self.inner.lock_links();
        if let Some(link) = links.get(to) {
            if link.queue.send(message).is_err() {
                links.remove(to);
            }
            return;
        }
        if !self.inner.peers.contains(to) {
            // most likely a client that hung up before its reply was ready
            debug!(to, kind = message.kind(), "no connection to non-peer, dropping");
            return;
        }

        let (queue, pending) = unbounded();
        let _ = queue.send(message);
        let id = self.inner.next_id();
        links.insert(
            to.to_string(),
            Link {
                id,
                queue,
                stream: None,
            },
        );
        drop(links);

        let inner = Arc::clone(&self.inner);
        let key = to.to_string();
        let spawned = thread::Builder::new()
            .name(format!("kv-link-{to}"))
            .spawn(move || inner.connect_and_serve(key, id, pending));
        if let Err(err) = spawned {
            warn!(peer = to, error = %err, "failed to spawn link thread");
            self.inner.remove(to, id);
        }
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let links = mem::take(&mut *self.inner.lock_links());
        for link in links.into_values() {
            if let Some(stream) = link.stream {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }

        // the accept thread only notices `closed` after its next accept
        let mut wake = self.local_addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(Ipv4Addr::LOCALHOST.into());
        }
        let _ = TcpStream::connect_timeout(&wake, self.inner.connect_timeout);
        debug!(local_addr = %self.local_addr, "transport closed");
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.next_link_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock_links(&self) -> MutexGuard<'_, HashMap<String, Link>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the link for `key` unless it has already been replaced.
    fn remove(&self, key: &str, id: u64) {
        let mut links = self.lock_links();
        if links.get(key).is_some_and(|link| link.id == id) {
            links.remove(key);
        }
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            if self.is_closed() {
                break;
            }
            match stream {
                Ok(stream) => {
                    if let Err(err) = self.adopt_inbound(stream) {
                        warn!(error = %err, "failed to set up inbound connection");
                    }
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    }

    fn adopt_inbound(self: &Arc<Self>, stream: TcpStream) -> io::Result<()> {
        let key = stream.peer_addr()?.to_string();
        let (queue, pending) = unbounded();
        let id = self.next_id();
        self.lock_links().insert(
            key.clone(),
            Link {
                id,
                queue,
                stream: Some(stream.try_clone()?),
            },
        );
        debug!(peer = %key, "accepted connection");

        let reader = stream.try_clone()?;
        let inner = Arc::clone(self);
        let from = key.clone();
        thread::Builder::new()
            .name(format!("kv-read-{key}"))
            .spawn(move || inner.read_loop(from, id, reader))?;

        let inner = Arc::clone(self);
        thread::Builder::new()
            .name(format!("kv-write-{key}"))
            .spawn(move || inner.write_loop(key, id, stream, pending))?;
        Ok(())
    }

    fn connect_and_serve(self: Arc<Self>, key: String, id: u64, pending: Receiver<Message>) {
        let stream = match connect(&key, self.connect_timeout) {
            Ok(stream) => stream,
            Err(source) => {
                let err = Error::Transport {
                    addr: key.clone(),
                    source,
                };
                debug!(dropped = pending.len(), "{err}");
                self.remove(&key, id);
                return;
            }
        };
        if self.is_closed() {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        let _ = stream.set_nodelay(true);

        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                warn!(peer = %key, error = %err, "failed to clone connection");
                self.remove(&key, id);
                return;
            }
        };
        if let Some(link) = self.lock_links().get_mut(&key).filter(|link| link.id == id) {
            link.stream = reader.try_clone().ok();
        }

        let inner = Arc::clone(&self);
        let from = key.clone();
        let spawned = thread::Builder::new()
            .name(format!("kv-read-{key}"))
            .spawn(move || inner.read_loop(from, id, reader));
        if let Err(err) = spawned {
            warn!(peer = %key, error = %err, "failed to spawn reader thread");
            self.remove(&key, id);
            return;
        }

        self.write_loop(key, id, stream, pending);
    }

    fn read_loop(&self, from: String, id: u64, stream: TcpStream) {
        let mut reader = BufReader::new(stream);
        loop {
            match read_message::<_, Message>(&mut reader) {
                Ok(Some(message)) => {
                    if self.inbox.send(Envelope::new(from.clone(), message)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(peer = %from, "connection closed by peer");
                    break;
                }
                Err(err) => {
                    if !self.is_closed() {
                        warn!(peer = %from, error = %err, "read failed, dropping connection");
                    }
                    break;
                }
            }
        }
        self.remove(&from, id);
    }

    fn write_loop(&self, key: String, id: u64, stream: TcpStream, pending: Receiver<Message>) {
        let mut writer = BufWriter::new(stream);
        for message in pending.iter() {
            if let Err(source) = write_message(&mut writer, &message) {
                let err = Error::Transport {
                    addr: key.clone(),
                    source,
                };
                debug!(kind = message.kind(), "{err}");
                break;
            }
        }
        self.remove(&key, id);
        let _ = writer.get_ref().shutdown(Shutdown::Both);
    }
}

/// Connects to `addr`, trying each resolved socket address in turn.
pub(crate) fn connect(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(io::ErrorKind::InvalidInput, "address did not resolve");
    for socket_addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&socket_addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}
