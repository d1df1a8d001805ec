//! Worker runtime for a node.
//!
//! This module owns the threading model:
//!
//! - **Worker thread**: owns the [`RaftNode`] and runs its event loop.
//! - **Transport threads**: feed received messages into the worker's
//!   bounded inbox and drain what the worker sends.
//! - **Caller**: talks to the worker through a [`NodeHandle`].
//!
//! The worker is the only thread that touches consensus state, so the
//! engine needs no locks. It waits on its control channel and inbox with
//! `crossbeam_channel::select!`, bounded by the time left until the node's
//! next timeout.

use std::collections::BTreeMap;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::message::{Envelope, NodeId};
use crate::node::{RaftNode, Role};
use crate::transport::{TcpTransport, Transport};

/// Snapshot of a node's state, as seen by its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub index: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
    /// Number of committed entries.
    pub commit_index: usize,
    pub log_len: usize,
    pub store: BTreeMap<String, String>,
}

enum Control {
    Status { respond_to: Sender<NodeStatus> },
    Shutdown,
}

/// Handle for a running node.
///
/// Dropping the handle shuts the worker down and waits for it.
pub struct NodeHandle {
    index: NodeId,
    control_tx: Sender<Control>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl NodeHandle {
    /// 0-based index of the node in the cluster configuration.
    pub fn index(&self) -> NodeId {
        self.index
    }

    /// Asks the worker for its current state.
    ///
    /// The worker answers between two events, so the snapshot never shows a
    /// half-handled message. Blocks until the answer arrives.
    ///
    /// # Errors
    ///
    /// Fails if the worker has already exited, whether after a shutdown or
    /// a fatal error.
    pub fn status(&self) -> Result<NodeStatus> {
        let (resp_tx, resp_rx) = bounded(1);
        self.control_tx
            .send(Control::Status {
                respond_to: resp_tx,
            })
            .context("failed to send status request")?;
        resp_rx.recv().context("status response channel closed")
    }

    /// Signals the worker to stop. Returns immediately.
    ///
    /// The worker finishes its current event, flushes the durable log and
    /// closes its transport. Use [`NodeHandle::join`] to wait for that.
    ///
    /// # Errors
    ///
    /// Fails if the worker is already gone.
    pub fn shutdown(&self) -> Result<()> {
        self.control_tx
            .send(Control::Shutdown)
            .context("failed to send shutdown")
    }

    /// Waits for the worker to exit and returns how it ended.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the worker, such as a corrupt log or a
    /// failed state write, or an error if the worker thread panicked.
    pub fn join(mut self) -> Result<()> {
        self.wait()
    }

    fn wait(&mut self) -> Result<()> {
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| anyhow!("worker for node {} panicked", self.index + 1))?,
            None => Ok(()),
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.control_tx.send(Control::Shutdown);
            let _ = self.wait();
        }
    }
}

/// Binds the node's configured address over TCP and starts its worker.
pub fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    let (inbox_tx, inbox_rx) = bounded(config.inbox_capacity);
    let transport = TcpTransport::bind(
        config.listen_addr(),
        &config.cluster.nodes,
        inbox_tx,
        config.connect_timeout,
    )
    .with_context(|| format!("failed to bind {}", config.listen_addr()))?;
    info!(
        node = config.number(),
        addr = %transport.local_addr(),
        "listening"
    );
    spawn_with_transport(config, transport, inbox_rx)
}

/// Starts a worker for `config` on top of any transport. `inbox` must be
/// the receiving end of the channel the transport delivers into.
pub fn spawn_with_transport<T>(
    config: NodeConfig,
    transport: T,
    inbox: Receiver<Envelope>,
) -> Result<NodeHandle>
where
    T: Transport + 'static,
{
    let node = RaftNode::open(&config).with_context(|| {
        format!(
            "failed to restore node {} from {}",
            config.number(),
            config.data_dir.display()
        )
    })?;
    let (control_tx, control_rx) = unbounded();
    let number = config.number();

    let worker = thread::Builder::new()
        .name(format!("kv-worker-{number}"))
        .spawn(move || {
            let result = Worker::new(node, transport, control_rx, inbox).run();
            if let Err(err) = &result {
                error!(node = number, "worker stopped on fatal error: {err:#}");
            }
            result
        })
        .context("failed to spawn worker thread")?;

    Ok(NodeHandle {
        index: config.index,
        control_tx,
        worker: Some(worker),
    })
}

/// Runs the node's event loop.
///
/// Each iteration waits for a control request or an inbound message, at
/// most until the node's deadline, then fires the timeout if it is due.
/// The timeout check runs after every message too, so a busy inbox cannot
/// starve elections or heartbeats.
struct Worker<T> {
    node: RaftNode,
    transport: T,
    control_rx: Receiver<Control>,
    inbox: Receiver<Envelope>,
    last_role: Role,
}

impl<T: Transport> Worker<T> {
    fn new(
        node: RaftNode,
        transport: T,
        control_rx: Receiver<Control>,
        inbox: Receiver<Envelope>,
    ) -> Self {
        let last_role = node.role();
        Self {
            node,
            transport,
            control_rx,
            inbox,
            last_role,
        }
    }

    /// Runs until shutdown or a fatal error, then closes the transport and
    /// syncs the durable log either way.
    fn run(mut self) -> Result<()> {
        info!(
            node = self.node.number(),
            role = %self.node.role(),
            term = self.node.term(),
            "worker started"
        );
        let result = self.event_loop();

        self.transport.close();
        let synced = self.node.close().context("failed to sync durable log");
        info!(node = self.node.number(), "worker stopped");
        result.and(synced)
    }

    fn event_loop(&mut self) -> Result<()> {
        self.dispatch();
        loop {
            let timeout = self
                .node
                .deadline()
                .saturating_duration_since(Instant::now());

            crossbeam_channel::select! {
                recv(self.control_rx) -> control => {
                    match control {
                        Ok(Control::Status { respond_to }) => {
                            let _ = respond_to.send(self.status());
                        }
                        Ok(Control::Shutdown) | Err(_) => return Ok(()),
                    }
                }
                recv(self.inbox) -> envelope => {
                    match envelope {
                        Ok(envelope) => {
                            if let Err(err) = self.node.step(envelope) {
                                if err.is_fatal() {
                                    return Err(err).context("consensus step failed");
                                }
                                warn!(node = self.node.number(), error = %err, "step failed, continuing");
                            }
                        }
                        Err(_) => return Ok(()), // transport gone
                    }
                }
                default(timeout) => {}
            }

            if Instant::now() >= self.node.deadline() {
                if let Err(err) = self.node.on_timeout() {
                    if err.is_fatal() {
                        return Err(err).context("timeout handling failed");
                    }
                    warn!(node = self.node.number(), error = %err, "timeout handling failed, continuing");
                }
            }

            self.dispatch();
            self.log_role_change();
        }
    }

    /// Hands everything the node queued to the transport.
    fn dispatch(&mut self) {
        for outbound in self.node.take_outbound() {
            self.transport.send(&outbound.to, outbound.message);
        }
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            index: self.node.id(),
            role: self.node.role(),
            term: self.node.term(),
            leader: self.node.leader(),
            commit_index: self.node.commit_index(),
            log_len: self.node.log_len(),
            store: self.node.store().snapshot(),
        }
    }

    fn log_role_change(&mut self) {
        let role = self.node.role();
        if role != self.last_role {
            info!(
                node = self.node.number(),
                from = %self.last_role,
                to = %role,
                term = self.node.term(),
                leader = ?self.node.leader().map(|leader| leader + 1),
                "role changed"
            );
            self.last_role = role;
        }
    }
}
