//! Ring messages of the token-coherence protocol.
//!
//! Five message types circulate the cache rings. Tokens ride on
//! `ReadReplyWithTokens` and `Eviction` messages; the coherence invariant is
//! that the tokens held in cache lines, directory counters, and in-flight
//! messages always sum to the total issued at construction (one per cache).

use crate::common::{MemAddr, Tid};

/// Discriminates the purpose of a ring message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Read miss; no data collected yet.
    Request,
    /// Read miss that has collected data but no tokens.
    RequestData,
    /// Read reply carrying data and tokens, traveling back to the sender.
    ReadReplyWithTokens,
    /// Line eviction carrying the line's tokens and possibly dirty data.
    Eviction,
    /// Write-update to all sharers; loops back to the sender to confirm.
    Update,
}

/// One message on a cache ring.
#[derive(Clone, Debug)]
pub struct MemMessage {
    /// Message type.
    pub kind: MessageKind,
    /// Address of the access. Line-aligned except for `Update`, which
    /// addresses the written bytes directly.
    pub address: MemAddr,
    /// Pass-through marker: a root flagged this message as in transit over
    /// its memory queue; every node forwards it untouched.
    pub ignore: bool,
    /// Currently touring a directory's lower subring on its global trip.
    pub descended: bool,
    /// Cache that originated the message.
    pub sender: usize,
    /// Tokens carried by the message.
    pub tokens: usize,
    /// Data is dirty with respect to backing storage.
    pub dirty: bool,
    /// Line data (`Request*`, `Eviction`) or written bytes (`Update`).
    pub data: Vec<u8>,
    /// Per-byte validity for partially collected line data.
    pub valid: Vec<bool>,
    /// Bus client that issued the write (for `Update` confirmation).
    pub client: usize,
    /// Thread that issued the write (for `Update` confirmation).
    pub tid: Tid,
}

impl MemMessage {
    /// Builds a read request for the line holding `address`.
    pub fn request(address: MemAddr, sender: usize, line_size: usize) -> Self {
        Self {
            kind: MessageKind::Request,
            address,
            ignore: false,
            descended: false,
            sender,
            tokens: 0,
            dirty: false,
            data: vec![0; line_size],
            valid: vec![false; line_size],
            client: 0,
            tid: 0,
        }
    }
}
