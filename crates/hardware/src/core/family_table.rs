//! Family table: per-core storage for thread families.
//!
//! A fixed-size array of family entries drawn from three pools: `Normal`
//! for ordinary allocations, `Reserved` for place-wide remote allocations
//! already in flight, and `Exclusive`, exactly one entry (the last slot)
//! guaranteeing forward progress for one special create at a time. The pool
//! counters plus used entries always sum to the table size.

use crate::common::{CycleNo, Lfid, MemAddr, Pid, PerType, RegIndex, Tid};
use crate::kernel::ProcCtx;

/// The pool a table context is drawn from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextType {
    /// Ordinary allocations.
    Normal,
    /// Held for a remote place-wide allocation already in flight.
    Reserved,
    /// The single entry reserved for exclusive creates.
    Exclusive,
}

impl ContextType {
    /// Number of pools.
    pub const COUNT: usize = 3;
}

/// Lifecycle state of a family entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FamilyState {
    /// Unused entry.
    #[default]
    Empty,
    /// Context allocated, awaiting setup.
    Allocated,
    /// Create queued behind earlier creates.
    CreateQueued,
    /// The create state machine is working on this family.
    Creating,
    /// Threads are being allocated and run.
    Active,
    /// All threads allocated and gone; awaiting final cleanup.
    Killed,
}

/// Per-register-type counts declared by the thread program.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegCounts {
    /// Globals broadcast from the parent.
    pub globals: usize,
    /// Shareds produced for the successor thread.
    pub shareds: usize,
    /// Private locals.
    pub locals: usize,
}

/// Per-register-type allocation plan of a family.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegInfo {
    /// Declared counts.
    pub count: RegCounts,
    /// Base of the family's register block.
    pub base: Option<RegIndex>,
    /// Size of the allocated block.
    pub size: usize,
    /// Address of the most recently allocated thread's shareds.
    pub last_shareds: Option<RegIndex>,
}

/// Dependencies that must resolve before termination and cleanup.
#[derive(Clone, Copy, Debug, Default)]
pub struct FamilyDeps {
    /// Every thread of the family has been allocated.
    pub allocation_done: bool,
    /// The family has terminated on all preceding cores.
    pub prev_synchronized: bool,
    /// The parent detached; contexts may be reclaimed.
    pub detached: bool,
    /// Threads currently occupying table entries.
    pub num_threads_allocated: usize,
    /// Outstanding memory reads issued on behalf of the family.
    pub num_pending_reads: usize,
}

/// Synchronization rendezvous of a family.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncState {
    /// The family's sync condition has fired on this core.
    pub done: bool,
    /// Core to notify on completion.
    pub pid: Option<Pid>,
    /// Register to write on completion.
    pub reg: Option<RegIndex>,
}

/// One family table entry.
#[derive(Clone, Debug, Default)]
pub struct Family {
    /// Lifecycle state.
    pub state: FamilyState,
    /// Capability presented on every external reference.
    pub capability: u64,
    /// Parent thread's core and family, when created by a thread.
    pub parent: Option<(Pid, Lfid)>,
    /// Matching family on the previous core of the place.
    pub link_prev: Option<Lfid>,
    /// Matching family on the next core of the place.
    pub link_next: Option<Lfid>,
    /// First core's family slot, carried for break delivery.
    pub first_lfid: Option<Lfid>,
    /// Single-threaded legacy mode.
    pub legacy: bool,
    /// Thread entry PC.
    pub pc: MemAddr,
    /// First index of the iteration space.
    pub start: i64,
    /// Iteration limit.
    pub limit: i64,
    /// Index step (nonzero).
    pub step: i64,
    /// Threads still to allocate on this core.
    pub nthreads: u64,
    /// Ordinal of the next thread to allocate (diagnostic).
    pub index: u64,
    /// Requested block size before restriction.
    pub virt_block_size: u64,
    /// Maximum concurrently allocated threads on this core.
    pub phys_block_size: usize,
    /// Cores in the place as requested.
    pub place_size: usize,
    /// Cores actually running the family.
    pub num_cores: usize,
    /// Any register type declares shareds.
    pub has_shareds: bool,
    /// The last thread of the previous block has been cleaned up.
    pub prev_cleaned_up: bool,
    /// Most recently allocated thread.
    pub last_allocated: Option<Tid>,
    /// Termination and cleanup dependencies.
    pub deps: FamilyDeps,
    /// Synchronization rendezvous.
    pub sync: SyncState,
    /// Register allocation plan per type.
    pub regs: PerType<RegInfo>,
}

/// The per-core family table.
#[derive(Debug)]
pub struct FamilyTable {
    families: Vec<Family>,
    free: [usize; ContextType::COUNT],
    total_allocated: u64,
    last_update: CycleNo,
}

impl FamilyTable {
    /// Creates a table with `size` entries; the last is the exclusive
    /// context.
    pub fn new(size: usize) -> Self {
        Self {
            families: vec![Family::default(); size],
            free: [size - 1, 0, 1],
            total_allocated: 0,
            last_update: 0,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.families.len()
    }

    /// True when every entry is free.
    pub fn is_empty(&self) -> bool {
        self.free.iter().sum::<usize>() == self.families.len()
    }

    /// Free entries in each pool, for the occupancy invariant.
    pub fn free_counts(&self) -> [usize; ContextType::COUNT] {
        self.free
    }

    /// Entries currently in use.
    pub fn used(&self) -> usize {
        self.families.len() - self.free.iter().sum::<usize>()
    }

    /// Used entries in the normal pool, for load balancing decisions.
    pub fn used_normal(&self) -> usize {
        self.families.len() - 1 - self.free[ContextType::Normal as usize]
            - self.free[ContextType::Reserved as usize]
    }

    /// Cumulative context-allocation count (diagnostic).
    pub fn total_allocated(&self) -> u64 {
        self.total_allocated
    }

    /// Whether `lfid` is the exclusive context.
    pub fn is_exclusive(&self, lfid: Lfid) -> bool {
        lfid + 1 == self.families.len()
    }

    /// True when the exclusive context is currently allocated.
    pub fn exclusive_used(&self) -> bool {
        self.free[ContextType::Exclusive as usize] == 0
    }

    /// True when a free entry exists in the pool.
    pub fn has_free(&self, context: ContextType) -> bool {
        self.free[context as usize] > 0
    }

    /// Accesses an entry.
    pub fn get(&self, lfid: Lfid) -> &Family {
        &self.families[lfid]
    }

    /// Mutably accesses an entry.
    pub fn get_mut(&mut self, lfid: Lfid) -> &mut Family {
        &mut self.families[lfid]
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &Family> {
        self.families.iter()
    }

    /// Allocates a family entry from the pool, returning its slot.
    ///
    /// Exclusive allocations take the dedicated last entry; others take the
    /// lowest empty ordinary slot.
    pub fn allocate(&mut self, context: ContextType, ctx: ProcCtx) -> Option<Lfid> {
        if self.free[context as usize] == 0 {
            return None;
        }
        let lfid = if context == ContextType::Exclusive {
            let last = self.families.len() - 1;
            debug_assert!(self.families[last].state == FamilyState::Empty);
            last
        } else {
            self.families[..self.families.len() - 1]
                .iter()
                .position(|f| f.state == FamilyState::Empty)?
        };
        if ctx.committing() {
            self.free[context as usize] -= 1;
            self.families[lfid].state = FamilyState::Allocated;
            self.total_allocated += 1;
            self.last_update = ctx.cycle;
        }
        Some(lfid)
    }

    /// Returns an entry to its pool.
    pub fn free_family(&mut self, lfid: Lfid, context: ContextType, ctx: ProcCtx) {
        if ctx.committing() {
            self.families[lfid] = Family::default();
            self.free[context as usize] += 1;
            self.last_update = ctx.cycle;
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
