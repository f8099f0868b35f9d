//! Register allocation unit.
//!
//! Each register bank is divided into fixed-size blocks (a power of two).
//! The unit keeps one run list per bank: each entry is either free or the
//! head of an allocated run tagged with its family. Allocation finds a
//! contiguous free run of `ceil(needed / block_size)` blocks for every
//! bank, or fails as a whole. Context reservations are counted separately
//! so reserved and exclusive creates always find a block.

use crate::common::{Lfid, PerType, RegIndex, RegType};
use crate::kernel::ProcCtx;

use super::family_table::ContextType;

/// One run-list entry: allocated run length (0 = free block) and owner.
#[derive(Clone, Copy, Debug, Default)]
struct Run {
    length: usize,
    owner: Option<Lfid>,
}

/// The per-core register allocation unit.
#[derive(Debug)]
pub struct RaUnit {
    block_size: PerType<usize>,
    lists: PerType<Vec<Run>>,
    reserved: usize,
    exclusive_used: bool,
}

impl RaUnit {
    /// Creates the unit for banks of the given sizes.
    ///
    /// Bank sizes must be multiples of the block size, which must be a
    /// power of two; the configuration validator enforces both.
    pub fn new(bank_sizes: PerType<usize>, block_size: usize) -> Self {
        debug_assert!(block_size.is_power_of_two());
        Self {
            block_size: PerType([block_size; RegType::COUNT]),
            lists: PerType([
                vec![Run::default(); bank_sizes[RegType::Integer] / block_size],
                vec![Run::default(); bank_sizes[RegType::Float] / block_size],
            ]),
            reserved: 0,
            exclusive_used: false,
        }
    }

    fn free_blocks(&self, rtype: RegType) -> usize {
        let list = &self.lists[rtype];
        let mut pos = 0;
        let mut free = 0;
        while pos < list.len() {
            if list[pos].length > 0 {
                pos += list[pos].length;
            } else {
                free += 1;
                pos += 1;
            }
        }
        free
    }

    /// True when a context of the given type can be granted a block in
    /// every bank.
    pub fn context_available(&self, context: ContextType) -> bool {
        match context {
            // A normal context must leave the standing reservations and
            // the exclusive spare untouched.
            ContextType::Normal => RegType::ALL
                .iter()
                .all(|&rt| self.free_blocks(rt) > self.reserved + 1),
            ContextType::Reserved => self.reserved > 0,
            ContextType::Exclusive => !self.exclusive_used,
        }
    }

    /// Registers a standing reservation for an in-flight remote
    /// allocation.
    pub fn reserve_context(&mut self, ctx: ProcCtx) {
        if ctx.committing() {
            self.reserved += 1;
        }
    }

    /// Releases a standing reservation.
    pub fn unreserve_context(&mut self, ctx: ProcCtx) {
        debug_assert!(self.reserved > 0);
        if ctx.committing() {
            self.reserved -= 1;
        }
    }

    /// Allocates a contiguous run per bank sized for `sizes` registers.
    ///
    /// Returns the starting register index per bank (`None` for a zero
    /// request in that bank), or `None` if any bank lacks a run.
    pub fn alloc(
        &mut self,
        sizes: PerType<usize>,
        owner: Lfid,
        context: ContextType,
        ctx: ProcCtx,
    ) -> Option<PerType<Option<RegIndex>>> {
        let mut indices = PerType([None, None]);
        for rt in RegType::ALL {
            if sizes[rt] == 0 {
                continue;
            }
            let bs = self.block_size[rt];
            let blocks = sizes[rt].div_ceil(bs);
            let list = &self.lists[rt];

            let mut found = None;
            let mut pos = 0;
            while pos < list.len() && found.is_none() {
                if list[pos].length > 0 {
                    pos += list[pos].length;
                } else {
                    let start = pos;
                    while pos < list.len() && list[pos].length == 0 {
                        pos += 1;
                        if pos - start == blocks {
                            found = Some(start);
                            break;
                        }
                    }
                }
            }
            indices[rt] = Some(found? * bs);
        }

        if ctx.committing() {
            for rt in RegType::ALL {
                if let Some(index) = indices[rt] {
                    let bs = self.block_size[rt];
                    let blocks = sizes[rt].div_ceil(bs);
                    let run = &mut self.lists[rt][index / bs];
                    run.length = blocks;
                    run.owner = Some(owner);
                }
            }
            match context {
                ContextType::Reserved => self.reserved -= 1,
                ContextType::Exclusive => self.exclusive_used = true,
                ContextType::Normal => {}
            }
        }
        Some(indices)
    }

    /// Frees the runs starting at the given indices.
    pub fn free(&mut self, indices: PerType<Option<RegIndex>>, context: ContextType, ctx: ProcCtx) {
        if !ctx.committing() {
            return;
        }
        for rt in RegType::ALL {
            if let Some(index) = indices[rt] {
                let run = &mut self.lists[rt][index / self.block_size[rt]];
                debug_assert!(run.length > 0);
                run.length = 0;
                run.owner = None;
            }
        }
        if context == ContextType::Exclusive {
            self.exclusive_used = false;
        }
    }
}
