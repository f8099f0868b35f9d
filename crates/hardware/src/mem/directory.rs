//! Intermediate directory between a lower cache ring and the top ring.
//!
//! A directory is composed of two ring nodes: the bottom half closes its
//! group's cache ring, the top half sits on the top-level ring. The
//! directory tracks, per line, how many tokens are currently below it; that
//! count decides whether a message traveling the top ring descends into the
//! subring, and is maintained exactly by counting the tokens messages carry
//! across the boundary.

use std::collections::BTreeMap;

use crate::common::MemAddr;
use crate::kernel::{ProcCtx, ProcResult, ProcessId};

use super::message::{MemMessage, MessageKind};
use super::node::{RingNode, MINSPACE_FORWARD};

/// One intermediate directory.
#[derive(Debug)]
pub struct Directory {
    /// Directory id.
    pub id: usize,
    /// Ring node index of the bottom half (on the cache subring).
    pub bottom_node: usize,
    /// Ring node index of the top half (on the top-level ring).
    pub top_node: usize,
    line_size: usize,
    /// Cache ids served by this directory's subring.
    pub below: std::ops::Range<usize>,
    tokens_below: BTreeMap<MemAddr, usize>,
    /// Process handling messages arriving at the bottom half.
    pub proc_bottom: ProcessId,
    /// Process handling messages arriving at the top half.
    pub proc_top: ProcessId,
    /// Forward process of the bottom node.
    pub proc_forward_bottom: ProcessId,
    /// Forward process of the top node.
    pub proc_forward_top: ProcessId,
}

impl Directory {
    /// Creates a directory covering the caches in `below`.
    pub fn new(
        id: usize,
        bottom_node: usize,
        top_node: usize,
        below: std::ops::Range<usize>,
        line_size: usize,
    ) -> Self {
        Self {
            id,
            bottom_node,
            top_node,
            line_size,
            below,
            tokens_below: BTreeMap::new(),
            proc_bottom: 0,
            proc_top: 0,
            proc_forward_bottom: 0,
            proc_forward_top: 0,
        }
    }

    fn line_addr(&self, address: MemAddr) -> MemAddr {
        address - address % self.line_size as u64
    }

    /// Tokens currently accounted below for `address`, for invariants.
    pub fn tokens_below(&self, address: MemAddr) -> usize {
        let line = self.line_addr(address);
        self.tokens_below.get(&line).copied().unwrap_or(0)
    }

    fn add_below(&mut self, address: MemAddr, tokens: usize) {
        if tokens > 0 {
            let line = self.line_addr(address);
            *self.tokens_below.entry(line).or_insert(0) += tokens;
        }
    }

    fn sub_below(&mut self, address: MemAddr, tokens: usize) {
        if tokens > 0 {
            let line = self.line_addr(address);
            if let Some(count) = self.tokens_below.get_mut(&line) {
                *count = count.saturating_sub(tokens);
                if *count == 0 {
                    let _ = self.tokens_below.remove(&line);
                }
            }
        }
    }

    /// True when the message must descend into this directory's subring.
    fn wants_below(&self, msg: &MemMessage) -> bool {
        let sender_below = self.below.contains(&msg.sender);
        match msg.kind {
            MessageKind::Request | MessageKind::RequestData | MessageKind::Eviction => {
                self.tokens_below(msg.address) > 0
            }
            MessageKind::ReadReplyWithTokens => sender_below,
            MessageKind::Update => self.tokens_below(msg.address) > 0 || sender_below,
        }
    }

    /// Handles a message arriving on the top ring.
    ///
    /// The message either descends into the subring or continues along the
    /// top ring.
    pub fn do_top(
        &mut self,
        top: &mut RingNode,
        bottom: &mut RingNode,
        ctx: ProcCtx,
    ) -> ProcResult {
        debug_assert!(!top.incoming.is_empty());
        let Some(msg) = top.incoming.front().cloned() else {
            return ProcResult::Delayed;
        };

        if !msg.ignore && self.wants_below(&msg) {
            let mut msg = msg;
            msg.descended = true;
            let tokens = msg.tokens;
            let address = msg.address;
            if !bottom.send(msg, MINSPACE_FORWARD, ctx) {
                return ProcResult::Failed;
            }
            if ctx.committing() {
                self.add_below(address, tokens);
            }
        } else if !top.send(msg, MINSPACE_FORWARD, ctx) {
            return ProcResult::Failed;
        }
        top.incoming.pop(ctx);
        ProcResult::Success
    }

    /// Handles a message arriving at the bottom half, having toured the
    /// subring.
    ///
    /// Replies still heading for a sender below circulate the subring
    /// again; everything else exits to the top ring, taking its tokens out
    /// of the below count.
    pub fn do_bottom(
        &mut self,
        bottom: &mut RingNode,
        top: &mut RingNode,
        ctx: ProcCtx,
    ) -> ProcResult {
        debug_assert!(!bottom.incoming.is_empty());
        let Some(mut msg) = bottom.incoming.front().cloned() else {
            return ProcResult::Delayed;
        };

        let stay_below = !msg.ignore
            && msg.kind == MessageKind::ReadReplyWithTokens
            && self.below.contains(&msg.sender);

        if stay_below {
            if !bottom.send(msg, MINSPACE_FORWARD, ctx) {
                return ProcResult::Failed;
            }
        } else {
            let tokens = msg.tokens;
            let address = msg.address;
            msg.descended = false;
            if !top.send(msg, MINSPACE_FORWARD, ctx) {
                return ProcResult::Failed;
            }
            if ctx.committing() {
                self.sub_below(address, tokens);
            }
        }
        bottom.incoming.pop(ctx);
        ProcResult::Success
    }
}
