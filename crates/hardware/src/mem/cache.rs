//! L2 cache: one node of the token-coherence protocol.
//!
//! Each L2 cache serves a group of cores over an internal bus and sits on a
//! lower-level ring. Lines move through `Empty -> Loading -> Full`; tokens
//! arrive on read replies and evictions and leave on served requests and
//! evictions. A cache may complete a write locally only while holding every
//! token; otherwise an update circulates the ring and the line is pinned
//! against eviction until the update returns.

use tracing::trace;

use crate::common::{CycleNo, MemAddr, Pid, Tid};
use crate::kernel::{Arbitrator, Buffer, ProcCtx, ProcResult, ProcessId};

use super::message::{MemMessage, MessageKind};
use super::node::{RingNode, MINSPACE_FORWARD, MINSPACE_INSERTION};
use super::traits::MemoryClient;

/// State of one L2 line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineState {
    /// Unused; can be allocated.
    Empty,
    /// Allocated; read request sent, no data yet.
    Loading,
    /// Allocated with data present.
    Full,
}

/// One L2 cache line.
#[derive(Clone, Debug)]
pub struct Line {
    /// Line state.
    pub state: LineState,
    /// Address tag.
    pub tag: u64,
    /// Line data.
    pub data: Vec<u8>,
    /// Last access time, for LRU replacement.
    pub access: CycleNo,
    /// Coherence tokens held by this line.
    pub tokens: usize,
    /// Line has been written relative to backing storage.
    pub dirty: bool,
    /// Number of updates in flight for this line; pins it against eviction.
    pub updating: usize,
    /// Per-byte validity while data is being collected.
    pub valid: Vec<bool>,
}

/// A request from a core over the cache's internal bus.
#[derive(Clone, Debug)]
pub struct BusRequest {
    /// True for writes.
    pub write: bool,
    /// Byte address of the access.
    pub address: MemAddr,
    /// Written bytes (empty for reads).
    pub data: Vec<u8>,
    /// Issuing client (core id).
    pub client: Pid,
    /// Issuing thread, echoed on write completion.
    pub tid: Tid,
}

/// One L2 cache on the lower ring.
#[derive(Debug)]
pub struct L2Cache {
    /// Cache id; doubles as the sender id in ring messages.
    pub id: usize,
    /// Ring node index in the memory system.
    pub node: usize,
    line_size: usize,
    assoc: usize,
    sets: usize,
    total_tokens: usize,
    lines: Vec<Line>,
    /// Cores attached to this cache's bus.
    pub clients: Vec<Pid>,
    /// Requests from the attached cores.
    pub requests: Buffer<BusRequest>,
    /// Guards line state and ring insertion between the two processes.
    pub p_lines: Arbitrator,
    /// Guards the client-side bus.
    pub p_bus: Arbitrator,
    /// Process handling bus requests.
    pub proc_requests: ProcessId,
    /// Process handling ring messages.
    pub proc_incoming: ProcessId,
    /// Process forwarding the outgoing buffer to the next node.
    pub proc_forward: ProcessId,
    hits: u64,
    misses: u64,
}

impl L2Cache {
    /// Creates a cache with `sets * assoc` lines.
    pub fn new(
        id: usize,
        node: usize,
        sets: usize,
        assoc: usize,
        line_size: usize,
        total_tokens: usize,
        bus_buffer_size: usize,
    ) -> Self {
        Self {
            id,
            node,
            line_size,
            assoc,
            sets,
            total_tokens,
            lines: vec![
                Line {
                    state: LineState::Empty,
                    tag: 0,
                    data: vec![0; line_size],
                    access: 0,
                    tokens: 0,
                    dirty: false,
                    updating: 0,
                    valid: vec![false; line_size],
                };
                sets * assoc
            ],
            clients: Vec::new(),
            requests: Buffer::new(bus_buffer_size),
            p_lines: Arbitrator::new("l2.p_lines"),
            p_bus: Arbitrator::new("l2.p_bus"),
            proc_requests: 0,
            proc_incoming: 0,
            proc_forward: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Total (hits, misses) seen on the bus.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Tokens currently held across all lines, for invariant checks.
    pub fn held_tokens(&self) -> usize {
        self.lines.iter().map(|l| l.tokens).sum()
    }

    /// Looks up the line holding `address`, if present.
    pub fn find_line(&self, address: MemAddr) -> Option<&Line> {
        let (tag, set) = self.map(address);
        self.lines[set * self.assoc..(set + 1) * self.assoc]
            .iter()
            .find(|l| l.state != LineState::Empty && l.tag == tag)
    }

    fn map(&self, address: MemAddr) -> (u64, usize) {
        let line = address / self.line_size as u64;
        (line / self.sets as u64, (line % self.sets as u64) as usize)
    }

    fn find_line_idx(&self, address: MemAddr) -> Option<usize> {
        let (tag, set) = self.map(address);
        (set * self.assoc..(set + 1) * self.assoc)
            .find(|&i| self.lines[i].state != LineState::Empty && self.lines[i].tag == tag)
    }

    /// Picks a line for `address`: an empty slot if one exists, otherwise
    /// the least recently used replaceable line (unless `empty_only`).
    fn allocate_line(&self, address: MemAddr, empty_only: bool) -> Option<usize> {
        let (_, set) = self.map(address);
        let base = set * self.assoc;
        let mut empty = None;
        let mut replace: Option<usize> = None;
        for i in base..base + self.assoc {
            let line = &self.lines[i];
            if line.state == LineState::Empty {
                empty = Some(i);
            } else if !empty_only
                && line.state != LineState::Loading
                && line.updating == 0
                && replace.is_none_or(|r| line.access < self.lines[r].access)
            {
                replace = Some(i);
            }
        }
        empty.or(if empty_only { None } else { replace })
    }

    fn line_addr(&self, idx: usize) -> MemAddr {
        let set = (idx / self.assoc) as u64;
        (self.lines[idx].tag * self.sets as u64 + set) * self.line_size as u64
    }

    /// Evicts a committed line: emits an `Eviction` with its tokens and
    /// invalidates the attached cores' copies.
    fn evict_line(
        &mut self,
        idx: usize,
        node: &mut RingNode,
        clients: &mut [&mut dyn MemoryClient],
        ctx: ProcCtx,
    ) -> bool {
        debug_assert!(self.lines[idx].state == LineState::Full);
        debug_assert!(self.lines[idx].updating == 0);

        let address = self.line_addr(idx);
        let line = &self.lines[idx];
        let msg = MemMessage {
            kind: MessageKind::Eviction,
            address,
            ignore: false,
            descended: false,
            sender: self.id,
            tokens: line.tokens,
            dirty: line.dirty,
            data: line.data.clone(),
            valid: vec![true; self.line_size],
            client: 0,
            tid: 0,
        };
        if !node.send(msg, MINSPACE_INSERTION, ctx) {
            return false;
        }
        if !self.p_bus.invoke(ctx) {
            return false;
        }
        for &pid in &self.clients {
            if !clients[pid].on_memory_invalidated(address, ctx) {
                return false;
            }
        }
        if ctx.committing() {
            trace!(cache = self.id, address, "evicting line");
            self.lines[idx].state = LineState::Empty;
        }
        true
    }

    /// Broadcasts a completed line read to every core on the bus.
    fn read_completed(
        &mut self,
        address: MemAddr,
        data: &[u8],
        clients: &mut [&mut dyn MemoryClient],
        ctx: ProcCtx,
    ) -> bool {
        if !self.p_bus.invoke(ctx) {
            return false;
        }
        for &pid in &self.clients {
            if !clients[pid].on_memory_read_completed(address, data, ctx) {
                return false;
            }
        }
        true
    }

    /// Handles the front bus request.
    pub fn do_requests(
        &mut self,
        node: &mut RingNode,
        clients: &mut [&mut dyn MemoryClient],
        ctx: ProcCtx,
    ) -> ProcResult {
        debug_assert!(!self.requests.is_empty());
        let Some(req) = self.requests.front().cloned() else {
            return ProcResult::Delayed;
        };
        let result = if req.write {
            self.on_write_request(&req, node, clients, ctx)
        } else {
            self.on_read_request(&req, node, clients, ctx)
        };
        match result {
            ProcResult::Success => {
                self.requests.pop(ctx);
                ProcResult::Success
            }
            ProcResult::Delayed => ProcResult::Success,
            ProcResult::Failed => ProcResult::Failed,
        }
    }

    fn on_read_request(
        &mut self,
        req: &BusRequest,
        node: &mut RingNode,
        clients: &mut [&mut dyn MemoryClient],
        ctx: ProcCtx,
    ) -> ProcResult {
        if !self.p_lines.invoke(ctx) {
            return ProcResult::Failed;
        }
        let line_addr = req.address - req.address % self.line_size as u64;
        match self.find_line_idx(req.address) {
            None => {
                // Read miss; allocate and send a request around the ring.
                let Some(idx) = self.allocate_line(req.address, false) else {
                    return ProcResult::Failed;
                };
                if self.lines[idx].state != LineState::Empty {
                    if !self.evict_line(idx, node, clients, ctx) {
                        return ProcResult::Failed;
                    }
                    return ProcResult::Delayed;
                }
                let msg = MemMessage::request(line_addr, self.id, self.line_size);
                if !node.send(msg, MINSPACE_INSERTION, ctx) {
                    return ProcResult::Failed;
                }
                if ctx.committing() {
                    let (tag, _) = self.map(req.address);
                    let line = &mut self.lines[idx];
                    line.state = LineState::Loading;
                    line.tag = tag;
                    line.tokens = 0;
                    line.dirty = false;
                    line.updating = 0;
                    line.access = ctx.cycle;
                    line.valid.fill(false);
                    self.misses += 1;
                }
                ProcResult::Success
            }
            Some(idx) if self.lines[idx].state == LineState::Full => {
                // Full hit; put the line on the bus.
                let data = self.lines[idx].data.clone();
                if !self.read_completed(line_addr, &data, clients, ctx) {
                    return ProcResult::Failed;
                }
                if ctx.committing() {
                    self.lines[idx].access = ctx.cycle;
                    self.hits += 1;
                }
                ProcResult::Success
            }
            Some(_) => {
                // Loading hit: the earlier load's completion will also
                // satisfy this requester over the bus.
                if ctx.committing() {
                    self.misses += 1;
                }
                ProcResult::Success
            }
        }
    }

    fn on_write_request(
        &mut self,
        req: &BusRequest,
        node: &mut RingNode,
        clients: &mut [&mut dyn MemoryClient],
        ctx: ProcCtx,
    ) -> ProcResult {
        if !self.p_lines.invoke(ctx) {
            return ProcResult::Failed;
        }
        let offset = (req.address % self.line_size as u64) as usize;
        let line_addr = req.address - offset as u64;

        let idx = match self.find_line_idx(req.address) {
            None => {
                // Write miss; write-allocate.
                let Some(idx) = self.allocate_line(req.address, false) else {
                    return ProcResult::Failed;
                };
                if self.lines[idx].state != LineState::Empty {
                    if !self.evict_line(idx, node, clients, ctx) {
                        return ProcResult::Failed;
                    }
                    return ProcResult::Delayed;
                }
                let msg = MemMessage::request(line_addr, self.id, self.line_size);
                if !node.send(msg, MINSPACE_INSERTION, ctx) {
                    return ProcResult::Failed;
                }
                if ctx.committing() {
                    let (tag, _) = self.map(req.address);
                    let line = &mut self.lines[idx];
                    line.state = LineState::Loading;
                    line.tag = tag;
                    line.tokens = 0;
                    line.dirty = false;
                    line.updating = 0;
                    line.access = ctx.cycle;
                    line.valid.fill(false);
                    self.misses += 1;
                }
                // The written bytes are merged below once the line exists;
                // retry against the allocated line next cycle.
                return ProcResult::Delayed;
            }
            Some(idx) => idx,
        };

        if self.lines[idx].state == LineState::Full
            && self.lines[idx].tokens == self.total_tokens
        {
            // Exclusive hit: all tokens held, complete immediately.
            if !self.p_bus.invoke(ctx) {
                return ProcResult::Failed;
            }
            if !clients[req.client].on_memory_write_completed(req.tid, ctx) {
                return ProcResult::Failed;
            }
            if ctx.committing() {
                self.hits += 1;
            }
        } else {
            // Copies exist elsewhere (or the line is still loading):
            // broadcast the written bytes and wait for the loop-back.
            let msg = MemMessage {
                kind: MessageKind::Update,
                address: req.address,
                ignore: false,
                descended: false,
                sender: self.id,
                tokens: 0,
                dirty: false,
                data: req.data.clone(),
                valid: vec![true; req.data.len()],
                client: req.client,
                tid: req.tid,
            };
            if !node.send(msg, MINSPACE_INSERTION, ctx) {
                return ProcResult::Failed;
            }
            if ctx.committing() {
                self.lines[idx].updating += 1;
            }
        }

        if ctx.committing() {
            let line = &mut self.lines[idx];
            line.data[offset..offset + req.data.len()].copy_from_slice(&req.data);
            for v in &mut line.valid[offset..offset + req.data.len()] {
                *v = true;
            }
            line.dirty = true;
            line.access = ctx.cycle;
        }
        ProcResult::Success
    }

    /// Handles the front ring message.
    pub fn do_receive(
        &mut self,
        node: &mut RingNode,
        clients: &mut [&mut dyn MemoryClient],
        ctx: ProcCtx,
    ) -> ProcResult {
        debug_assert!(!node.incoming.is_empty());
        let Some(msg) = node.incoming.front().cloned() else {
            return ProcResult::Delayed;
        };
        if self.on_message(msg, node, clients, ctx) {
            node.incoming.pop(ctx);
            ProcResult::Success
        } else {
            ProcResult::Failed
        }
    }

    fn on_message(
        &mut self,
        mut msg: MemMessage,
        node: &mut RingNode,
        clients: &mut [&mut dyn MemoryClient],
        ctx: ProcCtx,
    ) -> bool {
        // The line arbitrator also covers the outgoing ring buffer.
        if !self.p_lines.invoke(ctx) {
            return false;
        }

        if msg.ignore
            || (msg.kind == MessageKind::ReadReplyWithTokens && msg.sender != self.id)
        {
            // A read reply still traveling back to its origin, or a
            // pass-through message. Just forward it.
            return node.send(msg, MINSPACE_FORWARD, ctx);
        }

        let line_idx = self.find_line_idx(msg.address);
        match msg.kind {
            MessageKind::Request | MessageKind::RequestData => {
                if let Some(idx) = line_idx {
                    if self.lines[idx].state == LineState::Full {
                        if self.lines[idx].tokens > 1 {
                            // Attach data and one token; the reply heads home.
                            trace!(cache = self.id, address = msg.address, "serving request with token");
                            msg.kind = MessageKind::ReadReplyWithTokens;
                            msg.tokens = 1;
                            msg.dirty = self.lines[idx].dirty;
                            msg.data.copy_from_slice(&self.lines[idx].data);
                            msg.valid.fill(true);
                            if ctx.committing() {
                                self.lines[idx].tokens -= 1;
                                self.lines[idx].access = ctx.cycle;
                            }
                        } else if msg.kind == MessageKind::Request {
                            // Only one token: attach data, keep the token.
                            msg.kind = MessageKind::RequestData;
                            msg.dirty = self.lines[idx].dirty;
                            msg.data.copy_from_slice(&self.lines[idx].data);
                            msg.valid.fill(true);
                        }
                    }
                }
                node.send(msg, MINSPACE_FORWARD, ctx)
            }

            MessageKind::ReadReplyWithTokens => {
                // Our own read miss coming home with data and tokens.
                let Some(idx) = line_idx else {
                    return true;
                };
                debug_assert!(self.lines[idx].state == LineState::Loading);
                debug_assert!(msg.tokens > 0);

                // Merge: locally written bytes win over the fetched data,
                // and the freshest bytes are what goes on the bus.
                let mut data = msg.data.clone();
                for (i, byte) in data.iter_mut().enumerate() {
                    if self.lines[idx].valid[i] {
                        *byte = self.lines[idx].data[i];
                    }
                }
                for req in self.requests.iter() {
                    let offset = (req.address % self.line_size as u64) as usize;
                    if req.write && req.address - offset as u64 == msg.address {
                        data[offset..offset + req.data.len()].copy_from_slice(&req.data);
                    }
                }
                if !self.read_completed(msg.address, &data, clients, ctx) {
                    return false;
                }
                if ctx.committing() {
                    let line = &mut self.lines[idx];
                    for (i, v) in line.valid.iter_mut().enumerate() {
                        if !*v {
                            line.data[i] = msg.data[i];
                            *v = true;
                        }
                    }
                    line.state = LineState::Full;
                    line.tokens = msg.tokens;
                    line.dirty |= msg.dirty;
                }
                true
            }

            MessageKind::Eviction => {
                if let Some(idx) = line_idx {
                    if self.lines[idx].state == LineState::Full {
                        // We hold the line: absorb the tokens.
                        debug_assert!(msg.tokens > 0);
                        if ctx.committing() {
                            self.lines[idx].tokens += msg.tokens;
                            self.lines[idx].dirty |= msg.dirty;
                        }
                        return true;
                    }
                } else if let Some(idx) = self.allocate_line(msg.address, true) {
                    // No copy here but a free slot: inject the line.
                    if ctx.committing() {
                        let (tag, _) = self.map(msg.address);
                        let line = &mut self.lines[idx];
                        line.state = LineState::Full;
                        line.tag = tag;
                        line.tokens = msg.tokens;
                        line.dirty = msg.dirty;
                        line.updating = 0;
                        line.access = ctx.cycle;
                        line.valid.fill(true);
                        line.data.copy_from_slice(&msg.data);
                    }
                    return true;
                }
                node.send(msg, MINSPACE_FORWARD, ctx)
            }

            MessageKind::Update => {
                if msg.sender == self.id {
                    // Full circle: write consistency reached.
                    let Some(idx) = line_idx else {
                        return true;
                    };
                    debug_assert!(self.lines[idx].updating > 0);
                    if !self.p_bus.invoke(ctx) {
                        return false;
                    }
                    if !clients[msg.client].on_memory_write_completed(msg.tid, ctx) {
                        return false;
                    }
                    if ctx.committing() {
                        self.lines[idx].updating -= 1;
                    }
                    true
                } else {
                    if let Some(idx) = line_idx {
                        if ctx.committing() {
                            let offset = (msg.address % self.line_size as u64) as usize;
                            let line = &mut self.lines[idx];
                            line.data[offset..offset + msg.data.len()].copy_from_slice(&msg.data);
                            for v in &mut line.valid[offset..offset + msg.data.len()] {
                                *v = true;
                            }
                        }
                        if !self.p_bus.invoke(ctx) {
                            return false;
                        }
                        for &pid in &self.clients.clone() {
                            if !clients[pid].on_memory_snooped(msg.address, &msg.data, ctx) {
                                return false;
                            }
                        }
                    }
                    node.send(msg, MINSPACE_FORWARD, ctx)
                }
            }
        }
    }
}
