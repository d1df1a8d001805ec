//! Message delivery between nodes and clients.
//!
//! Delivery is best-effort: a message may be dropped, and messages to
//! different addresses may be reordered. The consensus engine tolerates
//! both because every leader timeout resends whatever a peer still lacks.

pub mod memory;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use crate::message::Message;

/// Outbound half of a transport.
///
/// Inbound traffic does not go through this trait: every implementation
/// pushes received [`Envelope`](crate::message::Envelope)s into the inbox
/// channel it was built with, and the runtime worker selects on that.
pub trait Transport: Send {
    /// Queues `message` for `to`. Never blocks on the network; failures are
    /// logged and the message is dropped.
    fn send(&self, to: &str, message: Message);

    /// Drops every connection and stops background threads.
    fn close(&self);
}
