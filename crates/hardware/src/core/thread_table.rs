//! Thread table: per-core storage for hardware threads.
//!
//! Uses the same three-pool scheme as the family table, with a FIFO of
//! empty slots. Thread entries double as the link arena for every thread
//! queue in the core (ready lists, active list, cache line waiters): each
//! entry carries one `next` link and sits in at most one queue at a time.

use std::collections::VecDeque;

use crate::common::{Cid, Lfid, MemAddr, PerType, RegIndex, Tid};
use crate::kernel::{LinkArena, ProcCtx};

use super::family_table::ContextType;

/// Lifecycle state of a thread entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThreadState {
    /// Unused entry.
    #[default]
    Empty,
    /// Waiting for its instruction cache line to fill.
    Waiting,
    /// On a ready list, awaiting activation.
    Ready,
    /// On the active list, awaiting the fetch stage.
    Active,
    /// Executing in the pipeline.
    Running,
    /// Suspended on a register.
    Suspended,
    /// Allocated but not yet started.
    Unused,
    /// Terminated, awaiting cleanup.
    Killed,
}

/// Per-register-type window bases of one thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRegs {
    /// Base of this thread's locals.
    pub locals: Option<RegIndex>,
    /// Base of this thread's shareds.
    pub shareds: Option<RegIndex>,
    /// Base of the predecessor's shareds, read as dependents.
    pub dependents: Option<RegIndex>,
}

/// Dependencies resolving before a thread can be recycled.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadDeps {
    /// The thread has terminated.
    pub killed: bool,
    /// The previous thread in the block has been cleaned up.
    pub prev_cleaned_up: bool,
    /// Writes issued by this thread not yet confirmed by memory.
    pub num_pending_writes: usize,
}

/// One thread table entry.
#[derive(Clone, Debug, Default)]
pub struct Thread {
    /// Current program counter.
    pub pc: MemAddr,
    /// Owning family.
    pub family: Lfid,
    /// Iteration index value of this thread.
    pub index: i64,
    /// Instruction cache line holding this thread's code.
    pub cid: Option<Cid>,
    /// Next thread in the family's block.
    pub next_in_block: Option<Tid>,
    /// Queue link; meaningful only while queued.
    pub next: Option<Tid>,
    /// Register window bases per type.
    pub regs: PerType<ThreadRegs>,
    /// Cleanup dependencies.
    pub deps: ThreadDeps,
    /// Suspended awaiting write confirmations.
    pub waiting_for_writes: bool,
    /// Lifecycle state.
    pub state: ThreadState,
}

/// The per-core thread table.
#[derive(Debug)]
pub struct ThreadTable {
    threads: Vec<Thread>,
    empty: VecDeque<Tid>,
    free: [usize; ContextType::COUNT],
}

impl ThreadTable {
    /// Creates a table with `size` entries; one is held as the exclusive
    /// context.
    pub fn new(size: usize) -> Self {
        Self {
            threads: vec![Thread::default(); size],
            empty: (0..size).collect(),
            free: [size - 1, 0, 1],
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// True when every entry is free.
    pub fn is_empty(&self) -> bool {
        self.free.iter().sum::<usize>() == self.threads.len()
    }

    /// Free entries per pool, for the occupancy invariant.
    pub fn free_counts(&self) -> [usize; ContextType::COUNT] {
        self.free
    }

    /// Free entries in the normal pool.
    pub fn free_normal(&self) -> usize {
        self.free[ContextType::Normal as usize]
    }

    /// True when a free entry exists in the pool.
    pub fn has_free(&self, context: ContextType) -> bool {
        self.free[context as usize] > 0
    }

    /// Accesses an entry.
    pub fn get(&self, tid: Tid) -> &Thread {
        &self.threads[tid]
    }

    /// Mutably accesses an entry.
    pub fn get_mut(&mut self, tid: Tid) -> &mut Thread {
        &mut self.threads[tid]
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.threads.iter()
    }

    /// Pops an empty slot from the pool.
    pub fn pop_empty(&mut self, context: ContextType, ctx: ProcCtx) -> Option<Tid> {
        if self.free[context as usize] == 0 {
            return None;
        }
        let tid = *self.empty.front()?;
        debug_assert!(self.threads[tid].state == ThreadState::Empty);
        if ctx.committing() {
            let _ = self.empty.pop_front();
            self.free[context as usize] -= 1;
            self.threads[tid].state = ThreadState::Waiting;
        }
        Some(tid)
    }

    /// Returns a slot to the pool.
    pub fn push_empty(&mut self, tid: Tid, context: ContextType, ctx: ProcCtx) {
        if ctx.committing() {
            self.threads[tid] = Thread::default();
            self.empty.push_back(tid);
            self.free[context as usize] += 1;
        }
    }

    /// Moves one free entry from the normal to the reserved pool.
    pub fn reserve(&mut self, ctx: ProcCtx) {
        debug_assert!(self.free[ContextType::Normal as usize] > 0);
        if ctx.committing() {
            self.free[ContextType::Normal as usize] -= 1;
            self.free[ContextType::Reserved as usize] += 1;
        }
    }

    /// Moves one reserved entry back to the normal pool.
    pub fn unreserve(&mut self, ctx: ProcCtx) {
        debug_assert!(self.free[ContextType::Reserved as usize] > 0);
        if ctx.committing() {
            self.free[ContextType::Reserved as usize] -= 1;
            self.free[ContextType::Normal as usize] += 1;
        }
    }
}

impl LinkArena for ThreadTable {
    fn next_link(&self, i: usize) -> Option<usize> {
        self.threads[i].next
    }

    fn set_next_link(&mut self, i: usize, next: Option<usize>) {
        self.threads[i].next = next;
    }
}
