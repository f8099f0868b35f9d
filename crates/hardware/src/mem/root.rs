//! Root directory: top-ring terminus backed by a DDR channel.
//!
//! A root directory owns the lines whose addresses interleave onto it. It
//! tracks, per line, whether the line lives anywhere in the cache system
//! (`Full`), is being served from memory (`Loading`), or is absent. Misses
//! are served from DDR only when no cached copy is known; evictions
//! returning the last token write back dirty data and clear the line from
//! the system. Messages not addressed to this root shortcut past it, or
//! take the long way through its memory queue with the `ignore` flag set
//! when the ring is congested.

use tracing::trace;

use crate::common::MemAddr;
use crate::config::DdrConfig;
use crate::kernel::{Arbitrator, Buffer, Flag, ProcCtx, ProcResult, ProcessId};

use super::ddr::DdrChannel;
use super::message::{MemMessage, MessageKind};
use super::node::{RingNode, MINSPACE_FORWARD, MINSPACE_INSERTION, MINSPACE_SHORTCUT};
use super::storage::VirtualMemory;

/// Presence state of a line at its root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootLineState {
    /// A miss is being served from memory.
    Loading,
    /// The line lives somewhere in the cache system.
    Full,
}

/// Root directory entry for one line.
#[derive(Clone, Copy, Debug)]
pub struct RootLine {
    /// Presence state.
    pub state: RootLineState,
    /// Spare tokens returned by partial evictions.
    pub tokens: usize,
    /// While loading: the cache that requested the line, for reply routing.
    pub sender: usize,
}

/// One root directory with its DDR channel.
#[derive(Debug)]
pub struct RootDirectory {
    /// Root id; lines interleave across roots by line address.
    pub id: usize,
    /// Ring node index on the top-level ring.
    pub node: usize,
    num_roots: usize,
    num_caches: usize,
    line_size: usize,
    lines: std::collections::BTreeMap<MemAddr, RootLine>,
    /// Messages queued toward memory (reads, writebacks, long-way transit).
    pub requests: Buffer<MemMessage>,
    /// Messages queued from memory back onto the ring.
    pub responses: Buffer<MemMessage>,
    /// Memory ready to accept another read.
    pub memready: Flag,
    active: Option<MemMessage>,
    ddr: DdrChannel,
    /// Guards line state between the processes.
    pub p_lines: Arbitrator,
    /// Process handling ring messages.
    pub proc_incoming: ProcessId,
    /// Process issuing queued requests to DDR.
    pub proc_requests: ProcessId,
    /// Process re-inserting responses onto the ring.
    pub proc_responses: ProcessId,
    /// Process retiring DDR completions.
    pub proc_ddr: ProcessId,
    /// Forward process of this node.
    pub proc_forward: ProcessId,
    nreads: u64,
    nwrites: u64,
}

impl RootDirectory {
    /// Creates a root directory.
    pub fn new(
        id: usize,
        node: usize,
        num_roots: usize,
        num_caches: usize,
        line_size: usize,
        buffer_size: usize,
        ddr: DdrConfig,
    ) -> Self {
        Self {
            id,
            node,
            num_roots,
            num_caches,
            line_size,
            lines: std::collections::BTreeMap::new(),
            requests: Buffer::new(buffer_size),
            responses: Buffer::new(buffer_size),
            memready: Flag::new(true),
            active: None,
            ddr: DdrChannel::new(ddr),
            p_lines: Arbitrator::new_cyclic("root.p_lines"),
            proc_incoming: 0,
            proc_requests: 0,
            proc_responses: 0,
            proc_ddr: 0,
            proc_forward: 0,
            nreads: 0,
            nwrites: 0,
        }
    }

    /// External memory accesses performed: (reads, writes).
    pub fn memory_stats(&self) -> (u64, u64) {
        (self.nreads, self.nwrites)
    }

    /// Spare tokens held at this root for `address`, for invariants.
    pub fn held_tokens(&self, address: MemAddr) -> usize {
        let line = address - address % self.line_size as u64;
        self.lines.get(&line).map_or(0, |l| l.tokens)
    }

    /// True when the DDR channel has work in flight.
    pub fn ddr_busy(&self) -> bool {
        !self.ddr.idle()
    }

    fn owns(&self, address: MemAddr) -> bool {
        (address / self.line_size as u64) as usize % self.num_roots == self.id
    }

    fn line_addr(&self, address: MemAddr) -> MemAddr {
        address - address % self.line_size as u64
    }

    /// Handles the front ring message.
    pub fn do_incoming(&mut self, node: &mut RingNode, ctx: ProcCtx) -> ProcResult {
        debug_assert!(!node.incoming.is_empty());
        let Some(msg) = node.incoming.front().cloned() else {
            return ProcResult::Delayed;
        };
        if self.on_message(msg, node, ctx) {
            node.incoming.pop(ctx);
            ProcResult::Success
        } else {
            ProcResult::Failed
        }
    }

    fn on_message(&mut self, mut msg: MemMessage, node: &mut RingNode, ctx: ProcCtx) -> bool {
        let line_addr = self.line_addr(msg.address);
        if self.owns(msg.address) && !msg.ignore {
            if !self.p_lines.invoke(ctx) {
                return false;
            }
            match msg.kind {
                MessageKind::Request => {
                    if !self.lines.contains_key(&line_addr) {
                        // Nothing cached anywhere: serve from memory.
                        trace!(root = self.id, address = msg.address, "queuing memory read");
                        if !self.requests.push(msg.clone(), ctx) {
                            return false;
                        }
                        if ctx.committing() {
                            let _ = self.lines.insert(
                                line_addr,
                                RootLine {
                                    state: RootLineState::Loading,
                                    tokens: 0,
                                    sender: msg.sender,
                                },
                            );
                        }
                        return true;
                    }
                    // Cached or loading elsewhere: let the request keep
                    // circulating until a cache serves it.
                }
                MessageKind::RequestData => {
                    match self.lines.get(&line_addr).copied() {
                        None => {
                            // The last copy was evicted from the system
                            // while this request traveled with its data.
                            // Reintroduce every token; memory need not be
                            // read since the data rides along.
                            msg.kind = MessageKind::ReadReplyWithTokens;
                            msg.tokens = self.num_caches;
                            if ctx.committing() {
                                let _ = self.lines.insert(
                                    line_addr,
                                    RootLine {
                                        state: RootLineState::Full,
                                        tokens: 0,
                                        sender: msg.sender,
                                    },
                                );
                            }
                        }
                        Some(line) if line.tokens > 0 => {
                            // Hand over the spare tokens we hold.
                            msg.kind = MessageKind::ReadReplyWithTokens;
                            msg.tokens = line.tokens;
                            if ctx.committing() {
                                if let Some(l) = self.lines.get_mut(&line_addr) {
                                    l.tokens = 0;
                                }
                            }
                        }
                        Some(_) => {}
                    }
                }
                MessageKind::Eviction => {
                    let line = self.lines.get(&line_addr).copied();
                    debug_assert!(line.is_some_and(|l| l.state == RootLineState::Full));
                    let held = line.map_or(0, |l| l.tokens);
                    let total = msg.tokens + held;
                    debug_assert!(total <= self.num_caches);
                    if total < self.num_caches {
                        // Keep the returned tokens at the root.
                        if ctx.committing() {
                            if let Some(l) = self.lines.get_mut(&line_addr) {
                                l.tokens = total;
                            }
                        }
                    } else {
                        // Every token came home: the line leaves the
                        // system, writing back dirty data first.
                        if msg.dirty && !self.requests.push(msg, ctx) {
                            return false;
                        }
                        if ctx.committing() {
                            trace!(root = self.id, address = line_addr, "line cleared from system");
                            let _ = self.lines.remove(&line_addr);
                        }
                    }
                    return true;
                }
                MessageKind::Update | MessageKind::ReadReplyWithTokens => {}
            }
        }

        // Forward: shortcut past the memory queue when the ring has room,
        // otherwise take the long way through it.
        if node.send(msg.clone(), MINSPACE_SHORTCUT, ctx) {
            return true;
        }
        msg.ignore = true;
        self.requests.push(msg, ctx)
    }

    /// Issues the front memory-queue entry to DDR (or reroutes transit
    /// messages to the response queue).
    pub fn do_requests(&mut self, ctx: ProcCtx) -> ProcResult {
        debug_assert!(!self.requests.is_empty());
        let Some(msg) = self.requests.front().cloned() else {
            return ProcResult::Delayed;
        };

        if msg.ignore {
            // Long-way transit: re-insert via the response queue.
            if !self.responses.push(msg, ctx) {
                return ProcResult::Failed;
            }
        } else if msg.kind == MessageKind::Request {
            if !self.memready.is_set() {
                // A read is already in flight.
                return ProcResult::Failed;
            }
            if !self.memready.clear(ctx) {
                return ProcResult::Failed;
            }
            if ctx.committing() {
                self.ddr.issue_read(self.line_addr(msg.address), ctx.cycle);
                self.active = Some(msg);
                self.nreads += 1;
            }
        } else {
            debug_assert!(msg.kind == MessageKind::Eviction);
            if ctx.committing() {
                self.ddr
                    .issue_write(self.line_addr(msg.address), msg.data.clone(), ctx.cycle);
                self.nwrites += 1;
            }
        }
        self.requests.pop(ctx);
        ProcResult::Success
    }

    /// Retires DDR completions: reads become replies carrying every token,
    /// writes land in backing storage.
    pub fn do_ddr(&mut self, vm: &mut VirtualMemory, ctx: ProcCtx) -> ProcResult {
        let (is_read, done_addr, done_data) = match self.ddr.completed(ctx.cycle) {
            None => return ProcResult::Delayed,
            Some(r) => (r.data.is_empty(), r.address, r.data.clone()),
        };

        if is_read {
            // Read completion: turn the active request into a reply.
            let Some(active) = self.active.clone() else {
                return ProcResult::Delayed;
            };
            let mut reply = active;
            reply.kind = MessageKind::ReadReplyWithTokens;
            reply.tokens = self.num_caches;
            reply.dirty = false;
            vm.read(reply.address, &mut reply.data);
            reply.valid.fill(true);
            if !self.responses.push(reply, ctx) {
                return ProcResult::Failed;
            }
            if !self.memready.set(ctx) {
                return ProcResult::Failed;
            }
            if ctx.committing() {
                let line_addr = self.line_addr(self.active.as_ref().map_or(0, |m| m.address));
                if let Some(l) = self.lines.get_mut(&line_addr) {
                    l.state = RootLineState::Full;
                }
                self.active = None;
                self.ddr.retire();
            }
        } else if ctx.committing() {
            // Write completion: the data reaches backing storage.
            vm.write(done_addr, &done_data);
            self.ddr.retire();
        }
        ProcResult::Success
    }

    /// Re-inserts the front response onto the ring.
    pub fn do_responses(&mut self, node: &mut RingNode, ctx: ProcCtx) -> ProcResult {
        debug_assert!(!self.responses.is_empty());
        let Some(mut msg) = self.responses.front().cloned() else {
            return ProcResult::Delayed;
        };
        let min_free = if msg.ignore {
            MINSPACE_FORWARD
        } else {
            MINSPACE_INSERTION
        };
        msg.ignore = false;
        if !node.send(msg, min_free, ctx) {
            return ProcResult::Failed;
        }
        self.responses.pop(ctx);
        ProcResult::Success
    }
}
