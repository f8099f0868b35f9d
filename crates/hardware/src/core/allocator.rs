//! Allocator: thread and family lifecycle state machines.
//!
//! Four processes share this state:
//! 1. **Thread allocation:** recycles killed threads (cleanup has
//!    priority) and allocates fresh threads for active families, wiring
//!    the shared/dependent register chain between block neighbors.
//! 2. **Family allocation:** grants family contexts to local and remote
//!    requests, walking the link network for place-wide allocations.
//! 3. **Family creation:** a state machine that loads the register counts
//!    from the cache line before the entry PC, restricts the core count,
//!    allocates registers, broadcasts the create, and notifies the parent.
//! 4. **Thread activation:** turns ready threads into active ones once
//!    their instruction cache line is present.

use tracing::debug;

use crate::common::{Cid, Fid, Lfid, MemAddr, PerType, Pid, RegAddr, RegIndex, RegType, SimError,
    Tid};
use crate::kernel::{Buffer, ProcCtx, ProcResult, ProcessId, ThreadList};

use super::family_table::{ContextType, FamilyState, RegCounts};
use super::icache::IFetch;
use super::network::{AllocResponse, GridChannels, LinkMessage, RemoteMessage};
use super::regfile::{RegState, RegValue};
use super::thread_table::ThreadState;
use super::{Core, FamilyDep, ThreadDep};

/// States of the family creation machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CreateState {
    /// Pick up the next queued create.
    #[default]
    Initial,
    /// Waiting for the register-count cache line.
    LoadingLine,
    /// Counts available; unpack them.
    LineLoaded,
    /// Reduce the core count to what the family can use.
    Restricting,
    /// Allocate the family's register block.
    AllocatingRegisters,
    /// Forward the create along the place.
    BroadcastingCreate,
    /// Queue the family for thread allocation.
    ActivatingFamily,
    /// Deliver the completion to the parent.
    Notify,
}

/// One queued create.
#[derive(Clone, Copy, Debug)]
pub struct CreateInfo {
    /// The family to create.
    pub lfid: Lfid,
    /// Parent core awaiting the full FID, if any.
    pub completion_pid: Option<Pid>,
    /// Parent register awaiting the full FID.
    pub completion_reg: Option<RegIndex>,
    /// Arrived over the link with counts already known.
    pub from_link: bool,
}

/// Bundled create parameters riding on an allocation request.
#[derive(Clone, Copy, Debug)]
pub struct BundleInfo {
    /// Thread entry PC.
    pub pc: MemAddr,
    /// Value seeding the index sequence.
    pub parameter: u64,
}

/// One queued family allocation request.
#[derive(Clone, Copy, Debug)]
pub struct AllocRequest {
    /// Requested place size.
    pub place_size: usize,
    /// Fail the whole place on partial allocation.
    pub exact: bool,
    /// Use the exclusive context.
    pub exclusive: bool,
    /// Core awaiting the packed FID.
    pub completion_pid: Pid,
    /// Register awaiting the packed FID.
    pub completion_reg: RegIndex,
    /// Family slot on the previous core of the walk.
    pub prev_lfid: Option<Lfid>,
    /// Family slot on the first core of the walk.
    pub first_lfid: Option<Lfid>,
    /// Bundled create, for indirect creates.
    pub bundle: Option<BundleInfo>,
}

/// Allocator state owned by one core.
#[derive(Debug)]
pub struct Allocator {
    /// Families ready to allocate more threads.
    pub alloc: Buffer<Lfid>,
    /// Families with a pending create.
    pub creates: Buffer<CreateInfo>,
    /// Killed threads ready to recycle.
    pub cleanup: Buffer<Tid>,
    /// Ready threads woken by the pipeline.
    pub ready1: ThreadList,
    /// Ready threads woken asynchronously (memory, network, FPU).
    pub ready2: ThreadList,
    /// Threads with their code line present, awaiting fetch.
    pub active: ThreadList,
    /// Remote allocation requests that may suspend.
    pub alloc_suspend: Buffer<AllocRequest>,
    /// Remote allocation requests that fail rather than suspend.
    pub alloc_nosuspend: Buffer<AllocRequest>,
    /// Exclusive allocation requests.
    pub alloc_exclusive: Buffer<AllocRequest>,
    /// Current create machine state.
    pub create_state: CreateState,
    create_line: Cid,
    prev_ready_one: bool,
    rng_state: u64,
    /// Thread allocation / cleanup process.
    pub proc_thread_allocate: ProcessId,
    /// Family allocation process.
    pub proc_family_allocate: ProcessId,
    /// Family creation process.
    pub proc_family_create: ProcessId,
    /// Thread activation process.
    pub proc_thread_activation: ProcessId,
}

impl Allocator {
    /// Creates the allocator state.
    pub fn new(
        creates_queue: usize,
        cleanup_queue: usize,
        alloc_queue: usize,
        num_families: usize,
        seed: u64,
    ) -> Self {
        Self {
            alloc: Buffer::new(num_families),
            creates: Buffer::new(creates_queue),
            cleanup: Buffer::new(cleanup_queue),
            ready1: ThreadList::new(),
            ready2: ThreadList::new(),
            active: ThreadList::new(),
            alloc_suspend: Buffer::new(alloc_queue),
            alloc_nosuspend: Buffer::new(alloc_queue),
            alloc_exclusive: Buffer::new(alloc_queue),
            create_state: CreateState::Initial,
            create_line: 0,
            prev_ready_one: false,
            rng_state: seed | 1,
            proc_thread_allocate: 0,
            proc_family_allocate: 0,
            proc_family_create: 0,
            proc_thread_activation: 0,
        }
    }

    /// Deterministic capability source; the state advances only when
    /// committing so both phases observe the same draw.
    fn next_capability(&mut self, mask: u64, ctx: ProcCtx) -> u64 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        if ctx.committing() {
            self.rng_state = x;
        }
        x & mask
    }
}

impl Core {
    /// Queues a locally- or remotely-delegated allocation request.
    #[allow(clippy::too_many_arguments)]
    pub fn allocator_queue_allocation(
        &mut self,
        place_size: usize,
        exact: bool,
        suspend: bool,
        exclusive: bool,
        completion_pid: Pid,
        completion_reg: RegIndex,
        ctx: ProcCtx,
    ) -> bool {
        let req = AllocRequest {
            place_size,
            exact,
            exclusive,
            completion_pid,
            completion_reg,
            prev_lfid: None,
            first_lfid: None,
            bundle: None,
        };
        let queue = if exclusive {
            &mut self.allocator.alloc_exclusive
        } else if suspend {
            &mut self.allocator.alloc_suspend
        } else {
            &mut self.allocator.alloc_nosuspend
        };
        queue.push(req, ctx)
    }

    /// Queues a bundled (indirect-create) allocation request. Bundles
    /// always allocate a place of one on the receiving core.
    #[allow(clippy::too_many_arguments)]
    pub fn allocator_queue_bundle(
        &mut self,
        _place_size: usize,
        suspend: bool,
        pc: MemAddr,
        parameter: u64,
        completion_pid: Pid,
        completion_reg: RegIndex,
        ctx: ProcCtx,
    ) -> bool {
        let req = AllocRequest {
            place_size: 1,
            exact: false,
            exclusive: false,
            completion_pid,
            completion_reg,
            prev_lfid: None,
            first_lfid: None,
            bundle: Some(BundleInfo { pc, parameter }),
        };
        let queue = if suspend {
            &mut self.allocator.alloc_suspend
        } else {
            &mut self.allocator.alloc_nosuspend
        };
        queue.push(req, ctx)
    }

    /// Queues an allocation request arriving over the link.
    #[allow(clippy::too_many_arguments)]
    pub fn allocator_queue_link_allocation(
        &mut self,
        first_lfid: Lfid,
        prev_lfid: Lfid,
        size: usize,
        exact: bool,
        suspend: bool,
        completion_pid: Pid,
        completion_reg: RegIndex,
        ctx: ProcCtx,
    ) -> bool {
        let req = AllocRequest {
            place_size: size,
            exact,
            exclusive: false,
            completion_pid,
            completion_reg,
            prev_lfid: Some(prev_lfid),
            first_lfid: Some(first_lfid),
            bundle: None,
        };
        let queue = if suspend {
            &mut self.allocator.alloc_suspend
        } else {
            &mut self.allocator.alloc_nosuspend
        };
        queue.push(req, ctx)
    }

    /// Queues a delegated create for an allocated family.
    pub fn allocator_queue_create(
        &mut self,
        lfid: Lfid,
        pc: MemAddr,
        completion_pid: Pid,
        completion_reg: RegIndex,
        ctx: ProcCtx,
    ) -> bool {
        if !self.allocator.creates.push(
            CreateInfo {
                lfid,
                completion_pid: Some(completion_pid),
                completion_reg: Some(completion_reg),
                from_link: false,
            },
            ctx,
        ) {
            return false;
        }
        if ctx.committing() {
            let family = self.families.get_mut(lfid);
            family.pc = pc & !3;
            family.state = FamilyState::CreateQueued;
        }
        true
    }

    /// Queues a create arriving over the link, counts already known.
    pub fn allocator_queue_link_create(
        &mut self,
        lfid: Lfid,
        num_cores: usize,
        pc: MemAddr,
        regs: PerType<RegCounts>,
        _chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<bool, SimError> {
        if !self.allocator.creates.push(
            CreateInfo {
                lfid,
                completion_pid: None,
                completion_reg: None,
                from_link: true,
            },
            ctx,
        ) {
            return Ok(false);
        }
        if ctx.committing() {
            let has_shareds = RegType::ALL.iter().any(|&rt| regs[rt].shareds > 0);
            let position = self.pid % self.families.get(lfid).place_size;
            let family = self.families.get_mut(lfid);
            family.pc = pc;
            // The message counts the cores remaining from here; the
            // distribution arithmetic wants the family total.
            family.num_cores = num_cores + position;
            family.has_shareds = has_shareds;
            for rt in RegType::ALL {
                family.regs[rt].count = regs[rt];
                family.regs[rt].base = None;
            }
            family.state = FamilyState::CreateQueued;
        }
        Ok(true)
    }

    /// Notification from the instruction cache that the create machine's
    /// line arrived.
    pub fn on_cacheline_loaded(&mut self, cid: Cid, ctx: ProcCtx) {
        debug_assert!(self.allocator.create_state == CreateState::LoadingLine);
        if ctx.committing() {
            self.allocator.create_state = CreateState::LineLoaded;
            self.allocator.create_line = cid;
        }
    }

    /// Releases a context reserved during a place-wide allocation walk.
    pub fn release_context(&mut self, lfid: Lfid, ctx: ProcCtx) {
        self.families.free_family(lfid, ContextType::Normal, ctx);
        self.raunit.unreserve_context(ctx);
        self.threads.unreserve(ctx);
    }

    /// True when a context of the given type can be granted.
    pub fn context_available(&self, context: ContextType) -> bool {
        self.families.has_free(context)
            && self.raunit.context_available(context)
            && self.threads.has_free(context)
    }

    /// Grabs and initializes a family context.
    fn allocate_context(
        &mut self,
        context: ContextType,
        prev_lfid: Option<Lfid>,
        place_size: usize,
        ctx: ProcCtx,
    ) -> Option<Lfid> {
        if !self.context_available(context) {
            return None;
        }
        let lfid = self.families.allocate(context, ctx)?;
        if context == ContextType::Normal {
            self.raunit.reserve_context(ctx);
            self.threads.reserve(ctx);
        }
        let capability = self
            .allocator
            .next_capability(self.fid_format.capability_mask(), ctx);
        if ctx.committing() {
            let family = self.families.get_mut(lfid);
            family.capability = capability;
            family.start = 0;
            family.step = 1;
            family.limit = 1;
            family.virt_block_size = 0;
            family.phys_block_size = 0;
            family.place_size = place_size;
            family.num_cores = 1;
            family.link_prev = prev_lfid;
            family.link_next = None;
            family.deps.prev_synchronized = prev_lfid.is_none();
        }
        Some(lfid)
    }

    /// The family allocation process.
    ///
    /// Exclusive requests go first when the exclusive context is free,
    /// then non-suspending requests (always answerable), then suspending
    /// ones.
    pub fn do_family_allocate(
        &mut self,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<ProcResult, SimError> {
        #[derive(PartialEq, Clone, Copy)]
        enum Queue {
            Exclusive,
            NoSuspend,
            Suspend,
        }
        let queue = if !self.families.exclusive_used()
            && !self.allocator.alloc_exclusive.is_empty()
        {
            Queue::Exclusive
        } else if !self.allocator.alloc_nosuspend.is_empty() {
            Queue::NoSuspend
        } else if !self.allocator.alloc_suspend.is_empty() {
            Queue::Suspend
        } else {
            // Only an exclusive request remains, blocked behind a running
            // exclusive family.
            return Ok(ProcResult::Failed);
        };

        let req = match queue {
            Queue::Exclusive => self.allocator.alloc_exclusive.front(),
            Queue::NoSuspend => self.allocator.alloc_nosuspend.front(),
            Queue::Suspend => self.allocator.alloc_suspend.front(),
        };
        let Some(req) = req.copied() else {
            return Ok(ProcResult::Delayed);
        };

        let context = if queue == Queue::Exclusive {
            ContextType::Exclusive
        } else {
            ContextType::Normal
        };
        let lfid = self.allocate_context(context, req.prev_lfid, req.place_size, ctx);

        if lfid.is_none() && queue != Queue::NoSuspend {
            // Suspend until a context frees up.
            return Ok(ProcResult::Failed);
        }

        match lfid {
            None => {
                if let Some(prev) = req.prev_lfid {
                    // Unwind the walk through the previous cores.
                    let unwind = AllocResponse {
                        num_cores: 0,
                        exact: req.exact,
                        prev_lfid: prev,
                        next_lfid: None,
                        completion_pid: req.completion_pid,
                        completion_reg: req.completion_reg,
                    };
                    if !self.send_alloc_response(unwind, chans, ctx) {
                        return Ok(ProcResult::Failed);
                    }
                    debug!(core = self.pid, "unwinding allocation walk");
                } else {
                    // Nothing reserved yet: report failure directly.
                    let reply = RemoteMessage::RawRegister {
                        addr: RegAddr::new(RegType::Integer, req.completion_reg),
                        value: self.fid_format.pack(Fid::FAILED),
                    };
                    if !self.send_remote_to(req.completion_pid, reply, chans, ctx) {
                        return Ok(ProcResult::Failed);
                    }
                }
            }
            Some(lfid) => {
                let first_lfid = req.first_lfid.unwrap_or(lfid);
                if ctx.committing() {
                    self.families.get_mut(lfid).first_lfid = Some(first_lfid);
                }
                let last_in_place = (self.pid + 1) % req.place_size == 0;
                if last_in_place {
                    if ctx.committing() {
                        let family = self.families.get_mut(lfid);
                        family.num_cores = req.place_size;
                        family.link_next = None;
                    }
                    if req.place_size == 1 {
                        if let Some(bundle) = req.bundle {
                            // Indirect create: go straight to the create
                            // queue; its notify step answers the parent.
                            if !self.allocator.creates.push(
                                CreateInfo {
                                    lfid,
                                    completion_pid: Some(req.completion_pid),
                                    completion_reg: Some(req.completion_reg),
                                    from_link: false,
                                },
                                ctx,
                            ) {
                                return Ok(ProcResult::Failed);
                            }
                            if ctx.committing() {
                                let family = self.families.get_mut(lfid);
                                family.pc = bundle.pc & !3;
                                family.start = bundle.parameter as i64;
                                family.limit = bundle.parameter as i64 + 1;
                                family.state = FamilyState::CreateQueued;
                            }
                        } else {
                            let fid = Fid {
                                pid: self.pid,
                                lfid,
                                capability: self.families.get(lfid).capability,
                            };
                            let reply = RemoteMessage::RawRegister {
                                addr: RegAddr::new(RegType::Integer, req.completion_reg),
                                value: self.fid_format.pack(fid),
                            };
                            if !self.send_remote_to(req.completion_pid, reply, chans, ctx) {
                                return Ok(ProcResult::Failed);
                            }
                        }
                    } else {
                        // Commit the whole walk backwards.
                        let commit = AllocResponse {
                            num_cores: req.place_size,
                            exact: req.exact,
                            prev_lfid: req.prev_lfid.unwrap_or(lfid),
                            next_lfid: Some(lfid),
                            completion_pid: req.completion_pid,
                            completion_reg: req.completion_reg,
                        };
                        if !self.send_alloc_response(commit, chans, ctx) {
                            return Ok(ProcResult::Failed);
                        }
                    }
                } else {
                    // Keep walking the place forward.
                    let fwd = LinkMessage::Allocate {
                        first_lfid,
                        prev_lfid: lfid,
                        size: req.place_size,
                        exact: req.exact,
                        suspend: req.exact && queue != Queue::NoSuspend,
                        completion_pid: req.completion_pid,
                        completion_reg: req.completion_reg,
                    };
                    if !self.send_link(fwd, chans, ctx) {
                        return Ok(ProcResult::Failed);
                    }
                }
            }
        }

        match queue {
            Queue::Exclusive => self.allocator.alloc_exclusive.pop(ctx),
            Queue::NoSuspend => self.allocator.alloc_nosuspend.pop(ctx),
            Queue::Suspend => self.allocator.alloc_suspend.pop(ctx),
        }
        Ok(ProcResult::Success)
    }

    /// Computes the family's thread count from its iteration space.
    fn calculate_thread_count(&self, lfid: Lfid) -> Result<u64, SimError> {
        let family = self.families.get(lfid);
        if family.legacy {
            return Ok(1);
        }
        if family.step == 0 {
            return Err(SimError::ZeroStep {
                fid: lfid,
                pc: family.pc,
            });
        }
        let (diff, step) = if family.step > 0 {
            (
                family.limit.saturating_sub(family.start).max(0) as u64,
                family.step as u64,
            )
        } else {
            (
                family.start.saturating_sub(family.limit).max(0) as u64,
                family.step.unsigned_abs(),
            )
        };
        Ok(diff.div_ceil(step))
    }

    /// Distributes `nthreads` over `num_cores`, skipping the indices run
    /// by preceding cores and bounding the physical block size.
    fn calculate_distribution(&mut self, lfid: Lfid, nthreads: u64, num_cores: usize, ctx: ProcCtx) {
        let family = self.families.get(lfid);
        let per_core = (nthreads.div_ceil(num_cores as u64)).max(1);
        let skipped = per_core * (self.pid % family.place_size) as u64;
        let local = nthreads.max(skipped).saturating_sub(skipped).min(per_core);

        let block = if family.virt_block_size == 0 {
            self.threads.len() - 1
        } else {
            family.virt_block_size as usize
        };
        let phys = block.min(local as usize);
        let step = family.step;
        if ctx.committing() {
            let family = self.families.get_mut(lfid);
            family.start += step * skipped as i64;
            family.nthreads = local;
            family.phys_block_size = phys;
        }
    }

    /// Allocates the family's register block, shrinking the block size
    /// until a contiguous run fits.
    fn allocate_registers(&mut self, lfid: Lfid, context: ContextType, ctx: ProcCtx) -> bool {
        let counts: PerType<RegCounts> = {
            let family = self.families.get(lfid);
            PerType([
                family.regs[RegType::Integer].count,
                family.regs[RegType::Float].count,
            ])
        };
        let max_block = self.families.get(lfid).phys_block_size.max(1);

        for phys in (1..=max_block).rev() {
            let mut sizes = PerType([0usize, 0usize]);
            for rt in RegType::ALL {
                let c = counts[rt];
                sizes[rt] = (c.locals + c.shareds) * phys + c.globals + c.shareds;
            }
            if let Some(indices) = self.raunit.alloc(sizes, lfid, context, ctx) {
                for rt in RegType::ALL {
                    if let Some(base) = indices[rt] {
                        // The freshly granted block starts out empty.
                        let _ = self.regfile.clear(RegAddr::new(rt, base), sizes[rt], ctx);
                    }
                }
                if ctx.committing() {
                    let family = self.families.get_mut(lfid);
                    for rt in RegType::ALL {
                        let regs = &mut family.regs[rt];
                        regs.base = indices[rt];
                        regs.size = sizes[rt];
                        regs.last_shareds = indices[rt];
                    }
                    family.phys_block_size = phys;
                }
                return true;
            }
        }
        false
    }

    /// The family creation process.
    pub fn do_family_create(
        &mut self,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<ProcResult, SimError> {
        let Some(info) = self.allocator.creates.front().copied() else {
            return Ok(ProcResult::Delayed);
        };
        let lfid = info.lfid;

        match self.allocator.create_state {
            CreateState::Initial => {
                debug!(core = self.pid, family = lfid, "processing create");
                if info.from_link || self.families.get(lfid).legacy {
                    // Counts arrived with the link message, or the family
                    // is a single legacy thread with the default window:
                    // skip the line load and go straight to distribution.
                    let nthreads = self.calculate_thread_count(lfid)?;
                    if ctx.committing() {
                        let legacy = self.families.get(lfid).legacy;
                        let family = self.families.get_mut(lfid);
                        if legacy {
                            for rt in RegType::ALL {
                                family.regs[rt].count = RegCounts {
                                    globals: 0,
                                    shareds: 0,
                                    locals: 31,
                                };
                            }
                            family.has_shareds = false;
                        }
                        family.nthreads = nthreads;
                        family.state = FamilyState::Creating;
                        self.allocator.create_state = CreateState::Restricting;
                    }
                    return Ok(ProcResult::Success);
                }
                let pc = self.families.get(lfid).pc;
                match self.icache.fetch_create(pc - 4, ctx) {
                    IFetch::Hit(cid) => {
                        if ctx.committing() {
                            self.allocator.create_state = CreateState::LineLoaded;
                            self.allocator.create_line = cid;
                            self.families.get_mut(lfid).state = FamilyState::Creating;
                        }
                    }
                    IFetch::Miss(_) => {
                        if ctx.committing() {
                            self.allocator.create_state = CreateState::LoadingLine;
                            self.families.get_mut(lfid).state = FamilyState::Creating;
                        }
                    }
                    IFetch::Blocked => return Ok(ProcResult::Failed),
                }
            }
            CreateState::LoadingLine => {
                // The fill notifies us through the instruction cache.
                return Ok(ProcResult::Failed);
            }
            CreateState::LineLoaded => {
                let pc = self.families.get(lfid).pc;
                let mut word = [0u8; 4];
                self.icache.read(self.allocator.create_line, pc - 4, &mut word);
                let counts = crate::isa::unpack_reg_counts(u32::from_le_bytes(word));
                for &(globals, shareds, locals) in &counts {
                    if globals + 2 * shareds + locals > 31 {
                        return Err(SimError::RegisterCountOverflow {
                            pc,
                            globals,
                            shareds,
                            locals,
                        });
                    }
                }
                self.icache.release(self.allocator.create_line, ctx);
                let nthreads = self.calculate_thread_count(lfid)?;
                if ctx.committing() {
                    let has_shareds = counts.iter().any(|&(_, s, _)| s > 0);
                    let family = self.families.get_mut(lfid);
                    for (i, &(globals, shareds, locals)) in counts.iter().enumerate() {
                        let regs = &mut family.regs.0[i];
                        regs.count = RegCounts {
                            globals,
                            shareds,
                            locals,
                        };
                        regs.base = None;
                    }
                    family.has_shareds = has_shareds;
                    family.nthreads = nthreads;
                    self.allocator.create_state = CreateState::Restricting;
                }
            }
            CreateState::Restricting => {
                let family = self.families.get(lfid);
                let nthreads = family.nthreads;
                let num_cores = if info.from_link {
                    family.num_cores
                } else if self.families.is_exclusive(lfid) || family.has_shareds {
                    1
                } else {
                    (family.num_cores as u64).min(nthreads.max(1)) as usize
                };
                self.calculate_distribution(lfid, nthreads, num_cores, ctx);
                if ctx.committing() {
                    self.families.get_mut(lfid).num_cores = num_cores;
                    self.allocator.create_state = CreateState::AllocatingRegisters;
                }
            }
            CreateState::AllocatingRegisters => {
                let context = if self.families.is_exclusive(lfid) {
                    ContextType::Exclusive
                } else {
                    ContextType::Reserved
                };
                if !self.allocate_registers(lfid, context, ctx) {
                    return Ok(ProcResult::Failed);
                }
                if ctx.committing() {
                    self.allocator.create_state = CreateState::BroadcastingCreate;
                }
            }
            CreateState::BroadcastingCreate => {
                let family = self.families.get(lfid);
                if let Some(next) = family.link_next {
                    // Cores of the place still ahead of this one.
                    let remaining = family
                        .num_cores
                        .saturating_sub(self.pid % family.place_size);
                    let msg = LinkMessage::Create {
                        lfid: next,
                        num_cores: remaining.saturating_sub(1),
                        pc: family.pc,
                        regs: PerType([
                            family.regs[RegType::Integer].count,
                            family.regs[RegType::Float].count,
                        ]),
                    };
                    let clear_link = remaining <= 1;
                    if !self.send_link(msg, chans, ctx) {
                        return Ok(ProcResult::Failed);
                    }
                    if ctx.committing() && clear_link {
                        self.families.get_mut(lfid).link_next = None;
                    }
                }
                if ctx.committing() {
                    self.allocator.create_state = CreateState::ActivatingFamily;
                }
            }
            CreateState::ActivatingFamily => {
                if !self.allocator.alloc.push(lfid, ctx) {
                    return Ok(ProcResult::Failed);
                }
                if ctx.committing() {
                    self.families.get_mut(lfid).state = FamilyState::Active;
                    self.allocator.create_state = CreateState::Notify;
                }
            }
            CreateState::Notify => {
                if let (Some(pid), Some(reg)) = (info.completion_pid, info.completion_reg) {
                    let fid = Fid {
                        pid: self.pid,
                        lfid,
                        capability: self.families.get(lfid).capability,
                    };
                    let reply = RemoteMessage::RawRegister {
                        addr: RegAddr::new(RegType::Integer, reg),
                        value: self.fid_format.pack(fid),
                    };
                    if !self.send_remote_to(pid, reply, chans, ctx) {
                        return Ok(ProcResult::Failed);
                    }
                }
                self.allocator.creates.pop(ctx);
                if ctx.committing() {
                    self.allocator.create_state = CreateState::Initial;
                }
            }
        }
        Ok(ProcResult::Success)
    }

    /// Initializes a (re)allocated thread entry and activates it.
    fn allocate_thread(
        &mut self,
        lfid: Lfid,
        tid: Tid,
        newly_allocated: bool,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<bool, SimError> {
        let family = self.families.get(lfid).clone();
        debug_assert!(family.nthreads > 0);

        let prev_cleaned_up = family.prev_cleaned_up
            || !family.has_shareds
            || family.deps.num_threads_allocated == 0
            || family.phys_block_size == 1;

        // Window bases: a fresh slot gets the next block position; a
        // recycled slot turns its old dependents into the new shareds.
        let mut regs = PerType([super::thread_table::ThreadRegs::default(); 2]);
        for rt in RegType::ALL {
            let finfo = family.regs[rt];
            let (locals, shareds) = if finfo.count.locals + finfo.count.shareds == 0 {
                (None, None)
            } else if newly_allocated {
                let base = finfo.base.map(|b| {
                    b + family.deps.num_threads_allocated
                        * (finfo.count.shareds + finfo.count.locals)
                        + finfo.count.shareds
                });
                (base, base.map(|l| l + finfo.count.locals))
            } else {
                let old = self.threads.get(tid).regs[rt];
                (old.locals, old.dependents)
            };
            regs[rt] = super::thread_table::ThreadRegs {
                locals,
                shareds,
                dependents: finfo.last_shareds,
            };
        }

        // Seed the first local with the thread's index value.
        if family.regs[RegType::Integer].count.locals > 0 {
            if let Some(locals) = regs[RegType::Integer].locals {
                let addr = RegAddr::int(locals);
                if !self.regfile.p_async_w.invoke(ctx) {
                    return Ok(false);
                }
                let current = self.regfile.read(addr)?;
                debug_assert!(current.state != RegState::Waiting);
                if current.state == RegState::Pending {
                    return Ok(false);
                }
                if ctx.committing() {
                    *self.regfile.get_mut(addr)? = RegValue::full(family.start as u64);
                }
            }
        }

        if ctx.committing() {
            if let Some(last) = family.last_allocated {
                self.threads.get_mut(last).next_in_block = Some(tid);
            }
            let thread = self.threads.get_mut(tid);
            thread.pc = family.pc;
            thread.family = lfid;
            thread.index = family.start;
            thread.cid = None;
            thread.next_in_block = None;
            thread.next = None;
            thread.regs = regs;
            thread.waiting_for_writes = false;
            thread.deps = super::thread_table::ThreadDeps {
                killed: false,
                prev_cleaned_up,
                num_pending_writes: 0,
            };
            thread.state = ThreadState::Unused;

            let fam = self.families.get_mut(lfid);
            fam.prev_cleaned_up = false;
            for rt in RegType::ALL {
                fam.regs[rt].last_shareds = regs[rt].shareds.or(fam.regs[rt].last_shareds);
            }
            if newly_allocated {
                debug_assert!(fam.deps.num_threads_allocated < fam.phys_block_size);
                fam.deps.num_threads_allocated += 1;
            }
            if fam.has_shareds && fam.phys_block_size > 1 {
                fam.last_allocated = Some(tid);
            }
            fam.start += fam.step;
            fam.nthreads -= 1;
            fam.index += 1;
        }

        if family.nthreads == 1 {
            // That was the last thread of the family on this core.
            if !self.dec_family_dep(lfid, FamilyDep::AllocationDone, chans, ctx)? {
                return Ok(false);
            }
        }

        // Hand the thread to the activation process.
        self.activate_threads(tid, tid, ctx);
        debug!(core = self.pid, family = lfid, thread = tid, "allocated thread");
        Ok(true)
    }

    /// The thread allocation / cleanup process. Cleanup has priority.
    pub fn do_thread_allocate(
        &mut self,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<ProcResult, SimError> {
        if let Some(&tid) = self.allocator.cleanup.front() {
            let thread = self.threads.get(tid).clone();
            let lfid = thread.family;
            let family = self.families.get(lfid).clone();
            debug_assert!(thread.state == ThreadState::Killed);

            // Clear the dependents so the recycled slot starts fresh.
            for rt in RegType::ALL {
                if family.regs[rt].count.shareds > 0 {
                    if let Some(deps) = thread.regs[rt].dependents {
                        self.regfile.clear(
                            RegAddr::new(rt, deps),
                            family.regs[rt].count.shareds,
                            ctx,
                        )?;
                    }
                }
            }

            if family.has_shareds && family.phys_block_size > 1 {
                match thread.next_in_block {
                    None => {
                        if ctx.committing() {
                            self.families.get_mut(lfid).prev_cleaned_up = true;
                        }
                    }
                    Some(next) => {
                        if !self.dec_thread_dep(next, ThreadDep::PrevCleanedUp, ctx) {
                            return Ok(ProcResult::Failed);
                        }
                    }
                }
            }

            if family.deps.allocation_done {
                // Give the slot back; the exclusive family returns its
                // last thread to the exclusive pool.
                let context = if self.families.is_exclusive(lfid)
                    && family.deps.num_threads_allocated == 1
                {
                    ContextType::Exclusive
                } else {
                    ContextType::Normal
                };
                self.threads.push_empty(tid, context, ctx);
                if !self.dec_family_dep(lfid, FamilyDep::ThreadCount, chans, ctx)? {
                    return Ok(ProcResult::Failed);
                }
                debug!(core = self.pid, thread = tid, family = lfid, "thread cleaned up");
            } else if !self.allocate_thread(lfid, tid, false, chans, ctx)? {
                return Ok(ProcResult::Failed);
            }
            self.allocator.cleanup.pop(ctx);
            return Ok(ProcResult::Success);
        }

        let Some(&lfid) = self.allocator.alloc.front() else {
            return Ok(ProcResult::Delayed);
        };
        let family = self.families.get(lfid);

        if family.nthreads == 0 && !family.deps.allocation_done {
            // Nothing (left) to run on this core; a zero-thread share of
            // a distributed family resolves here too.
            if !self.dec_family_dep(lfid, FamilyDep::AllocationDone, chans, ctx)? {
                return Ok(ProcResult::Failed);
            }
        } else if family.deps.num_threads_allocated == family.phys_block_size
            || family.deps.allocation_done
        {
            // Block full or done: this family needs no more from us.
            self.allocator.alloc.pop(ctx);
        } else {
            // Only the first thread draws from a special pool.
            let first = family.deps.num_threads_allocated == 0;
            let context = if first && self.families.is_exclusive(lfid) {
                ContextType::Exclusive
            } else if first {
                ContextType::Reserved
            } else {
                ContextType::Normal
            };
            let Some(tid) = self.threads.pop_empty(context, ctx) else {
                debug_assert!(context == ContextType::Normal);
                return Ok(ProcResult::Failed);
            };
            if !self.allocate_thread(lfid, tid, true, chans, ctx)? {
                return Ok(ProcResult::Failed);
            }
        }
        Ok(ProcResult::Success)
    }

    /// The thread activation process: drains the two ready lists round
    /// robin and fetches each thread's code line.
    pub fn do_thread_activation(&mut self, ctx: ProcCtx) -> ProcResult {
        let use_one = (!self.allocator.prev_ready_one || self.allocator.ready2.is_empty())
            && !self.allocator.ready1.is_empty();
        let (tid, from_one) = if use_one {
            (self.allocator.ready1.front(), true)
        } else {
            (self.allocator.ready2.front(), false)
        };
        let Some(tid) = tid else {
            return ProcResult::Delayed;
        };

        let pc = self.threads.get(tid).pc;
        let (result, prev_head) = self.icache.fetch_thread(pc, tid, ctx);
        match result {
            IFetch::Blocked => return ProcResult::Failed,
            IFetch::Hit(cid) => {
                if from_one {
                    self.allocator.ready1.pop(ctx);
                } else {
                    self.allocator.ready2.pop(ctx);
                }
                if ctx.committing() {
                    self.allocator.prev_ready_one = from_one;
                    let thread = self.threads.get_mut(tid);
                    thread.cid = Some(cid);
                    thread.state = ThreadState::Active;
                }
                self.allocator.active.push(tid, tid, ctx);
            }
            IFetch::Miss(cid) => {
                if from_one {
                    self.allocator.ready1.pop(ctx);
                } else {
                    self.allocator.ready2.pop(ctx);
                }
                if ctx.committing() {
                    self.allocator.prev_ready_one = from_one;
                    let thread = self.threads.get_mut(tid);
                    thread.cid = Some(cid);
                    thread.next = prev_head;
                    thread.state = ThreadState::Waiting;
                }
            }
        }
        ProcResult::Success
    }

    /// Boot helper: seeds this core with the initial single-thread
    /// family and queues its create.
    pub fn allocate_initial_family(&mut self, pc: MemAddr, legacy: bool) -> Lfid {
        let boot_ctx = ProcCtx {
            phase: crate::kernel::Phase::Commit,
            cycle: 0,
            pid: 0,
        };
        let lfid = self
            .allocate_context(ContextType::Normal, None, 1, boot_ctx)
            .unwrap_or_else(|| unreachable!("an empty table always has a context"));
        let family = self.families.get_mut(lfid);
        family.pc = pc & !3;
        family.legacy = legacy;
        family.start = 0;
        family.limit = 1;
        family.step = 1;
        family.num_cores = 1;
        family.place_size = 1;
        family.first_lfid = Some(lfid);
        // The boot family has no parent to sync or detach.
        family.deps.detached = true;
        family.sync.pid = None;
        family.state = FamilyState::CreateQueued;
        let _ = self.allocator.creates.push(
            CreateInfo {
                lfid,
                completion_pid: None,
                completion_reg: None,
                from_link: false,
            },
            boot_ctx,
        );
        lfid
    }
}
