//! Data cache.
//!
//! A write-through, write-no-allocate snoop cache between the pipeline and
//! the COMA hierarchy. Read misses park the destination register on the
//! line: registers waiting for the same line chain through their fill
//! metadata, and the fill walk writes them back one per cycle. Writes go
//! straight to the memory system, updating any local copy, and complete
//! when the coherence protocol confirms them.

use crate::common::{Cid, CycleNo, MemAddr, MemSize, Pid, RegAddr, Tid};
use crate::kernel::{Buffer, ProcCtx, ProcessId};
use crate::mem::traits::Memory;

/// State of one data cache line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DLineState {
    /// Unused.
    #[default]
    Empty,
    /// A load is in flight.
    Loading,
    /// Evicted with a load still pending.
    Invalid,
    /// Data present.
    Full,
}

/// One data cache line.
#[derive(Clone, Debug, Default)]
pub struct DLine {
    /// Line state.
    pub state: DLineState,
    /// Address tag.
    pub tag: u64,
    /// Line data.
    pub data: Vec<u8>,
    /// Per-byte validity; locally written bytes survive the fill.
    pub valid: Vec<bool>,
    /// Last access time, for LRU replacement.
    pub access: CycleNo,
    /// Head of the register chain waiting on this line.
    pub waiting: Option<RegAddr>,
}

/// Outcome of a data cache read.
#[derive(Clone, Debug)]
pub enum DRead {
    /// The value, little-endian, straight from the line.
    Hit(u64),
    /// The line is loading; the destination register was parked on it.
    /// Carries the slot and the previous chain head.
    Miss(Cid, Option<RegAddr>),
    /// No line or bus slot was available this cycle.
    Blocked,
}

/// A completed fill awaiting its register walk. Carries the merged line
/// data so a discarded (invalidated) line still serves its waiters.
#[derive(Clone, Debug)]
pub struct DcacheResponse {
    /// The filled line slot.
    pub cid: Cid,
    /// Fill data merged under the local valid mask.
    pub data: Vec<u8>,
}

/// The per-core data cache.
#[derive(Debug)]
pub struct DCache {
    line_size: usize,
    assoc: usize,
    sets: usize,
    lines: Vec<DLine>,
    /// Completed fills awaiting the register writeback walk.
    pub read_responses: Buffer<DcacheResponse>,
    /// Confirmed writes awaiting thread-dependency resolution.
    pub write_responses: Buffer<Tid>,
    /// Guards line state between the pipeline and the fill walk.
    pub p_service: crate::kernel::Arbitrator,
    /// Process walking read completions into registers.
    pub proc_read_responses: ProcessId,
    /// Process resolving write confirmations.
    pub proc_write_responses: ProcessId,
    hits: u64,
    misses: u64,
}

impl DCache {
    /// Creates a cache with `sets * assoc` lines.
    pub fn new(sets: usize, assoc: usize, line_size: usize, response_queue: usize) -> Self {
        Self {
            line_size,
            assoc,
            sets,
            lines: vec![
                DLine {
                    data: vec![0; line_size],
                    valid: vec![false; line_size],
                    ..DLine::default()
                };
                sets * assoc
            ],
            read_responses: Buffer::new(response_queue),
            write_responses: Buffer::new(response_queue),
            p_service: crate::kernel::Arbitrator::new("dcache.p_service"),
            proc_read_responses: 0,
            proc_write_responses: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Line size in bytes.
    pub fn line_size(&self) -> usize {
        self.line_size
    }

    /// Total (hits, misses).
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Accesses a line by slot.
    pub fn line(&self, cid: Cid) -> &DLine {
        &self.lines[cid]
    }

    /// Mutably accesses a line by slot.
    pub fn line_mut(&mut self, cid: Cid) -> &mut DLine {
        &mut self.lines[cid]
    }

    fn map(&self, addr: MemAddr) -> (u64, usize) {
        let line = addr / self.line_size as u64;
        (line / self.sets as u64, (line % self.sets as u64) as usize)
    }

    fn find(&self, addr: MemAddr) -> Option<Cid> {
        let (tag, set) = self.map(addr);
        (set * self.assoc..(set + 1) * self.assoc).find(|&i| {
            self.lines[i].state != DLineState::Empty
                && self.lines[i].state != DLineState::Invalid
                && self.lines[i].tag == tag
        })
    }

    fn allocate(&self, addr: MemAddr) -> Option<Cid> {
        let (_, set) = self.map(addr);
        let base = set * self.assoc;
        let mut empty = None;
        let mut replace: Option<Cid> = None;
        for i in base..base + self.assoc {
            let line = &self.lines[i];
            match line.state {
                DLineState::Empty => empty = Some(i),
                DLineState::Full if line.waiting.is_none() => {
                    if replace.is_none_or(|r| line.access < self.lines[r].access) {
                        replace = Some(i);
                    }
                }
                _ => {}
            }
        }
        empty.or(replace)
    }

    /// Reads `size` bytes at `addr` for `dest`.
    ///
    /// On a miss the destination register is parked at the head of the
    /// line's waiter chain; the caller records the returned previous head
    /// in the register's fill metadata.
    pub fn read(
        &mut self,
        mem: &mut dyn Memory,
        pid: Pid,
        addr: MemAddr,
        size: MemSize,
        dest: RegAddr,
        ctx: ProcCtx,
    ) -> DRead {
        let offset = (addr % self.line_size as u64) as usize;
        let base = addr - offset as u64;
        debug_assert!(offset + size <= self.line_size);

        if !self.p_service.invoke(ctx) {
            return DRead::Blocked;
        }
        if let Some(cid) = self.find(addr) {
            let line = &self.lines[cid];
            if line.state == DLineState::Full && line.valid[offset..offset + size].iter().all(|&v| v)
            {
                let mut bytes = [0u8; 8];
                bytes[..size].copy_from_slice(&line.data[offset..offset + size]);
                if ctx.committing() {
                    self.lines[cid].access = ctx.cycle;
                    self.hits += 1;
                }
                return DRead::Hit(u64::from_le_bytes(bytes));
            }
            // Loading, or full with the needed bytes not yet valid: park
            // the register on the line.
            let prev = line.waiting;
            if ctx.committing() {
                self.lines[cid].waiting = Some(dest);
                self.misses += 1;
            }
            return DRead::Miss(cid, prev);
        }

        let Some(cid) = self.allocate(addr) else {
            return DRead::Blocked;
        };
        if !mem.read(pid, base, self.line_size, ctx) {
            return DRead::Blocked;
        }
        if ctx.committing() {
            let (tag, _) = self.map(addr);
            let line = &mut self.lines[cid];
            line.state = DLineState::Loading;
            line.tag = tag;
            line.access = ctx.cycle;
            line.valid.fill(false);
            line.waiting = Some(dest);
            self.misses += 1;
        }
        DRead::Miss(cid, None)
    }

    /// Writes `data` at `addr`, write-through.
    ///
    /// Updates the local copy when one exists; completion arrives via
    /// [`DCache::write_responses`].
    pub fn write(
        &mut self,
        mem: &mut dyn Memory,
        pid: Pid,
        addr: MemAddr,
        data: &[u8],
        tid: Tid,
        ctx: ProcCtx,
    ) -> bool {
        if !self.p_service.invoke(ctx) {
            return false;
        }
        if !mem.write(pid, addr, data, tid, ctx) {
            return false;
        }
        if let Some(cid) = self.find(addr) {
            if ctx.committing() {
                let offset = (addr % self.line_size as u64) as usize;
                let line = &mut self.lines[cid];
                line.data[offset..offset + data.len()].copy_from_slice(data);
                for v in &mut line.valid[offset..offset + data.len()] {
                    *v = true;
                }
            }
        }
        true
    }

    /// Accepts a completed line read: merges the data under the local
    /// valid mask and queues the fill walk. Lines not owned here are
    /// ignored.
    pub fn on_fill(&mut self, addr: MemAddr, data: &[u8], ctx: ProcCtx) -> bool {
        let (tag, set) = self.map(addr);
        let cid = (set * self.assoc..(set + 1) * self.assoc).find(|&i| {
            matches!(
                self.lines[i].state,
                DLineState::Loading | DLineState::Invalid
            ) && self.lines[i].tag == tag
        });
        let Some(cid) = cid else {
            return true;
        };
        // Locally written bytes beat the fetched data; the walk below
        // serves the waiting registers from this merged copy even when
        // the line itself was invalidated in the meantime.
        let mut merged = data.to_vec();
        for (i, byte) in merged.iter_mut().enumerate() {
            if self.lines[cid].valid[i] {
                *byte = self.lines[cid].data[i];
            }
        }
        if !self
            .read_responses
            .push(DcacheResponse { cid, data: merged }, ctx)
        {
            return false;
        }
        if ctx.committing() && self.lines[cid].state == DLineState::Loading {
            let line = &mut self.lines[cid];
            for (i, &byte) in data.iter().enumerate() {
                if !line.valid[i] {
                    line.data[i] = byte;
                    line.valid[i] = true;
                }
            }
        }
        true
    }

    /// Finalizes a filled line once its register walk has drained: a
    /// loading line becomes full, an invalidated one is released.
    pub fn finish_fill(&mut self, cid: Cid, ctx: ProcCtx) {
        if ctx.committing() {
            let line = &mut self.lines[cid];
            line.state = match line.state {
                DLineState::Invalid => DLineState::Empty,
                _ => DLineState::Full,
            };
        }
    }

    /// Invalidates the line holding `addr`, if present.
    pub fn on_invalidate(&mut self, addr: MemAddr, ctx: ProcCtx) {
        if let Some(cid) = self.find(addr) {
            if ctx.committing() {
                let line = &mut self.lines[cid];
                line.state = match line.state {
                    DLineState::Loading => DLineState::Invalid,
                    _ => DLineState::Empty,
                };
            }
        }
    }

    /// Applies snooped bytes to a present line.
    pub fn on_snoop(&mut self, addr: MemAddr, data: &[u8], ctx: ProcCtx) {
        if let Some(cid) = self.find(addr) {
            if ctx.committing() {
                let offset = (addr % self.line_size as u64) as usize;
                let line = &mut self.lines[cid];
                line.data[offset..offset + data.len()].copy_from_slice(data);
                for v in &mut line.valid[offset..offset + data.len()] {
                    *v = true;
                }
            }
        }
    }
}
