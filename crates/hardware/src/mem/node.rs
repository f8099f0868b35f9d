//! Ring node buffers and deadlock-free insertion.
//!
//! Every cache, directory half, and root directory is one node on a ring.
//! A node owns an incoming and an outgoing buffer; a per-node forward
//! process drains the outgoing buffer into the next node's incoming buffer.
//! Insertion of new messages requires more free space than forwarding, so a
//! full ring can always drain.

use crate::kernel::{Buffer, ProcCtx};

use super::message::MemMessage;

/// Free outgoing slots required to insert a newly created message.
pub const MINSPACE_INSERTION: usize = 2;

/// Free outgoing slots required to forward a circulating message.
pub const MINSPACE_FORWARD: usize = 1;

/// Free slots required for a root to shortcut a message past its memory
/// queue.
pub const MINSPACE_SHORTCUT: usize = 2;

/// One node on a cache ring.
#[derive(Debug)]
pub struct RingNode {
    /// Messages delivered from the previous node.
    pub incoming: Buffer<MemMessage>,
    /// Messages awaiting transfer to the next node.
    pub outgoing: Buffer<MemMessage>,
}

impl RingNode {
    /// Creates a node with the given buffer capacity.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            incoming: Buffer::new(buffer_size),
            outgoing: Buffer::new(buffer_size),
        }
    }

    /// Queues a message for the next node, requiring `min_free` slots.
    ///
    /// Returns `false` without staging anything when the outgoing buffer
    /// has fewer free slots than required.
    pub fn send(&mut self, msg: MemMessage, min_free: usize, ctx: ProcCtx) -> bool {
        self.outgoing.push_min(msg, min_free, ctx)
    }
}
