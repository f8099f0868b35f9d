//! Instruction cache.
//!
//! Lines move through `Empty -> Loading -> Full`, with an `Invalid`
//! interstitial allowing eviction of a line whose load is still in flight:
//! the fill data is then discarded and the waiting threads are re-fetched
//! at their original PC. Lines are pinned by a reference count while the
//! family-create machine or a running thread holds them, and carry a queue
//! of threads waiting for the fill.

use tracing::trace;

use crate::common::{Cid, CycleNo, MemAddr, Tid};
use crate::kernel::{Arbitrator, Buffer, ProcCtx, ProcessId};

/// State of one instruction cache line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ILineState {
    /// Unused.
    #[default]
    Empty,
    /// A load is in flight.
    Loading,
    /// Evicted with a load still pending; fill data will be discarded.
    Invalid,
    /// Data present.
    Full,
}

/// One instruction cache line.
#[derive(Clone, Debug, Default)]
pub struct ILine {
    /// Line state.
    pub state: ILineState,
    /// Address tag.
    pub tag: u64,
    /// Line data.
    pub data: Vec<u8>,
    /// Last access time, for LRU replacement.
    pub access: CycleNo,
    /// The family-create machine waits on this line.
    pub creation: bool,
    /// Threads waiting for the fill (head, tail).
    pub waiting: Option<(Tid, Tid)>,
    /// Holders of this line; pinned while nonzero.
    pub references: usize,
}

/// Outcome of a fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IFetch {
    /// Line present; read it with [`ICache::read`].
    Hit(Cid),
    /// Line absent or loading; the requester waits for the fill.
    Miss(Cid),
    /// No line could be allocated this cycle.
    Blocked,
}

/// The per-core instruction cache.
#[derive(Debug)]
pub struct ICache {
    line_size: usize,
    assoc: usize,
    sets: usize,
    lines: Vec<ILine>,
    /// Pending line addresses toward memory.
    pub outgoing: Buffer<MemAddr>,
    /// Completed fills awaiting distribution.
    pub incoming: Buffer<Cid>,
    /// Guards fetches from the activation and create processes.
    pub p_service: Arbitrator,
    /// Process issuing outgoing reads.
    pub proc_outgoing: ProcessId,
    /// Process distributing completed fills.
    pub proc_incoming: ProcessId,
    hits: u64,
    misses: u64,
}

impl ICache {
    /// Creates a cache with `sets * assoc` lines.
    pub fn new(sets: usize, assoc: usize, line_size: usize) -> Self {
        Self {
            line_size,
            assoc,
            sets,
            lines: vec![
                ILine {
                    data: vec![0; line_size],
                    ..ILine::default()
                };
                sets * assoc
            ],
            outgoing: Buffer::new(sets),
            incoming: Buffer::new(sets),
            p_service: Arbitrator::new_cyclic("icache.p_service"),
            proc_outgoing: 0,
            proc_incoming: 0,
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
    pub fn line(&self, cid: Cid) -> &ILine {
        &self.lines[cid]
    }

    fn map(&self, addr: MemAddr) -> (u64, usize) {
        let line = addr / self.line_size as u64;
        (line / self.sets as u64, (line % self.sets as u64) as usize)
    }

    fn line_base(&self, addr: MemAddr) -> MemAddr {
        addr - addr % self.line_size as u64
    }

    fn find(&self, addr: MemAddr) -> Option<Cid> {
        let (tag, set) = self.map(addr);
        (set * self.assoc..(set + 1) * self.assoc).find(|&i| {
            self.lines[i].state != ILineState::Empty
                && self.lines[i].state != ILineState::Invalid
                && self.lines[i].tag == tag
        })
    }

    /// Picks a slot for `addr`: empty first, else the LRU unpinned full
    /// line.
    fn allocate(&self, addr: MemAddr) -> Option<Cid> {
        let (_, set) = self.map(addr);
        let base = set * self.assoc;
        let mut empty = None;
        let mut replace: Option<Cid> = None;
        for i in base..base + self.assoc {
            let line = &self.lines[i];
            match line.state {
                ILineState::Empty => empty = Some(i),
                ILineState::Full
                    if line.references == 0 && line.waiting.is_none() && !line.creation =>
                {
                    if replace.is_none_or(|r| line.access < self.lines[r].access) {
                        replace = Some(i);
                    }
                }
                _ => {}
            }
        }
        empty.or(replace)
    }

    /// Starts a fetch, returning the slot and whether it hit.
    ///
    /// On a miss the line transitions to `Loading` and the address is
    /// queued toward memory. The caller pins the line (`hold`) and, for
    /// thread fetches, links itself into the waiting queue.
    fn fetch(&mut self, addr: MemAddr, ctx: ProcCtx) -> IFetch {
        let base = self.line_base(addr);
        if !self.p_service.invoke(ctx) {
            return IFetch::Blocked;
        }
        if let Some(cid) = self.find(addr) {
            if ctx.committing() {
                self.lines[cid].access = ctx.cycle;
                self.hits += 1;
            }
            return match self.lines[cid].state {
                ILineState::Full => IFetch::Hit(cid),
                _ => IFetch::Miss(cid),
            };
        }
        let Some(cid) = self.allocate(addr) else {
            return IFetch::Blocked;
        };
        if !self.outgoing.push(base, ctx) {
            return IFetch::Blocked;
        }
        if ctx.committing() {
            let (tag, _) = self.map(addr);
            let line = &mut self.lines[cid];
            line.state = ILineState::Loading;
            line.tag = tag;
            line.access = ctx.cycle;
            line.creation = false;
            line.waiting = None;
            line.references = 0;
            self.misses += 1;
            trace!(addr, cid, "icache miss");
        }
        IFetch::Miss(cid)
    }

    /// Fetch for the family-create machine: pins the line and flags it so
    /// the fill notifies the creation process.
    pub fn fetch_create(&mut self, addr: MemAddr, ctx: ProcCtx) -> IFetch {
        let result = self.fetch(addr, ctx);
        if ctx.committing() {
            match result {
                IFetch::Hit(cid) => self.lines[cid].references += 1,
                IFetch::Miss(cid) => {
                    self.lines[cid].references += 1;
                    self.lines[cid].creation = true;
                }
                IFetch::Blocked => {}
            }
        }
        result
    }

    /// Fetch for thread activation: on a miss the thread is pushed onto
    /// the line's waiting queue.
    ///
    /// Returns the outcome and the previous queue head; the caller links
    /// the thread's `next` to it.
    pub fn fetch_thread(
        &mut self,
        addr: MemAddr,
        tid: Tid,
        ctx: ProcCtx,
    ) -> (IFetch, Option<Tid>) {
        let result = self.fetch(addr, ctx);
        let mut prev_head = None;
        if let IFetch::Miss(cid) = result {
            prev_head = self.lines[cid].waiting.map(|(h, _)| h);
            if ctx.committing() {
                let line = &mut self.lines[cid];
                let tail = line.waiting.map_or(tid, |(_, t)| t);
                line.waiting = Some((tid, tail));
                line.references += 1;
            }
        } else if let IFetch::Hit(cid) = result {
            if ctx.committing() {
                self.lines[cid].references += 1;
            }
        }
        (result, prev_head)
    }

    /// Copies `buf.len()` bytes from a held line.
    pub fn read(&self, cid: Cid, addr: MemAddr, buf: &mut [u8]) {
        let offset = (addr % self.line_size as u64) as usize;
        debug_assert!(offset + buf.len() <= self.line_size);
        buf.copy_from_slice(&self.lines[cid].data[offset..offset + buf.len()]);
    }

    /// Releases one reference on a held line.
    pub fn release(&mut self, cid: Cid, ctx: ProcCtx) {
        debug_assert!(self.lines[cid].references > 0);
        if ctx.committing() {
            self.lines[cid].references -= 1;
        }
    }

    /// Accepts a completed line read from memory.
    ///
    /// Copies the data into the matching loading line and queues the slot
    /// for distribution. Returns `false` when the distribution queue is
    /// full; lines not owned here are ignored.
    pub fn on_fill(&mut self, addr: MemAddr, data: &[u8], ctx: ProcCtx) -> bool {
        let (tag, set) = self.map(addr);
        let cid = (set * self.assoc..(set + 1) * self.assoc).find(|&i| {
            matches!(
                self.lines[i].state,
                ILineState::Loading | ILineState::Invalid
            ) && self.lines[i].tag == tag
        });
        let Some(cid) = cid else {
            return true;
        };
        if !self.incoming.push(cid, ctx) {
            return false;
        }
        if ctx.committing() && self.lines[cid].state == ILineState::Loading {
            self.lines[cid].data.copy_from_slice(data);
        }
        true
    }

    /// Takes the distribution queue front: `(cid, waiting queue,
    /// creation flag, was invalid)`. The core routes the woken threads.
    pub fn take_fill(&mut self, ctx: ProcCtx) -> Option<(Cid, Option<(Tid, Tid)>, bool, bool)> {
        let cid = *self.incoming.front()?;
        let line = &self.lines[cid];
        let result = (
            cid,
            line.waiting,
            line.creation,
            line.state == ILineState::Invalid,
        );
        if ctx.committing() {
            let invalid = self.lines[cid].state == ILineState::Invalid;
            let line = &mut self.lines[cid];
            line.state = if invalid {
                line.references = 0;
                ILineState::Empty
            } else {
                ILineState::Full
            };
            line.waiting = None;
            line.creation = false;
        }
        self.incoming.pop(ctx);
        Some(result)
    }

    /// Invalidates the line holding `addr`, if present.
    pub fn on_invalidate(&mut self, addr: MemAddr, ctx: ProcCtx) {
        if let Some(cid) = self.find(addr) {
            if ctx.committing() {
                let line = &mut self.lines[cid];
                line.state = match line.state {
                    ILineState::Loading => ILineState::Invalid,
                    _ => ILineState::Empty,
                };
            }
        }
    }

    /// Applies snooped bytes to a full line, keeping instructions
    /// coherent with stores.
    pub fn on_snoop(&mut self, addr: MemAddr, data: &[u8], ctx: ProcCtx) {
        if let Some(cid) = self.find(addr) {
            if self.lines[cid].state == ILineState::Full && ctx.committing() {
                let offset = (addr % self.line_size as u64) as usize;
                self.lines[cid].data[offset..offset + data.len()].copy_from_slice(data);
            }
        }
    }
}
