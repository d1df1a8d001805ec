//! In-process transport for tests.
//!
//! Every registered address gets an inbox channel. Links can be cut and
//! healed at runtime to simulate partitions without touching sockets.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::trace;

use crate::message::{Address, Envelope, Message};
use crate::transport::Transport;

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<Address, Sender<Envelope>>,
    /// Directed pairs that drop traffic.
    blocked: HashSet<(Address, Address)>,
    isolated: HashSet<Address>,
}

impl NetworkState {
    fn is_blocked(&self, from: &str, to: &str) -> bool {
        self.isolated.contains(from)
            || self.isolated.contains(to)
            || self.blocked.contains(&(from.to_string(), to.to_string()))
    }
}

/// Shared switchboard. Clones refer to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `addr` to the network. Re-registering an address replaces
    /// its inbox, which is how a restarted node reappears.
    pub fn register(
        &self,
        addr: impl Into<Address>,
        capacity: usize,
    ) -> (MemoryTransport, Receiver<Envelope>) {
        let addr = addr.into();
        let (tx, rx) = bounded(capacity);
        self.lock().inboxes.insert(addr.clone(), tx);
        let transport = MemoryTransport {
            addr,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Drops traffic in both directions between `a` and `b`.
    pub fn partition(&self, a: &str, b: &str) {
        let mut state = self.lock();
        state.blocked.insert((a.to_string(), b.to_string()));
        state.blocked.insert((b.to_string(), a.to_string()));
    }

    /// Drops all traffic to and from `addr`.
    pub fn isolate(&self, addr: &str) {
        self.lock().isolated.insert(addr.to_string());
    }

    pub fn heal(&self) {
        let mut state = self.lock();
        state.blocked.clear();
        state.isolated.clear();
    }

    fn unregister(&self, addr: &str) {
        self.lock().inboxes.remove(addr);
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One address's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    addr: Address,
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    fn send(&self, to: &str, message: Message) {
        let state = self.network.lock();
        if state.is_blocked(&self.addr, to) {
            trace!(from = %self.addr, to, kind = message.kind(), "partitioned, dropping");
            return;
        }
        match state.inboxes.get(to) {
            // a full inbox loses the message, like a congested link would
            Some(inbox) => {
                let _ = inbox.try_send(Envelope::new(self.addr.clone(), message));
            }
            None => trace!(from = %self.addr, to, "no such address, dropping"),
        }
    }

    fn close(&self) {
        self.network.unregister(&self.addr);
    }
}
