//! Per-core hardware: tables, register file, caches, pipeline, allocator,
//! and network interfaces.
//!
//! `Core` owns every block of one processor. The blocks are wired through
//! the core rather than through each other, so cross-block operations
//! (register writes that wake threads, dependency resolution that sends
//! network messages, cache fills that reactivate waiters) are methods on
//! `Core` with full access to its state.

/// Thread and family lifecycle state machines.
pub mod allocator;
/// Data cache.
pub mod dcache;
/// Family table.
pub mod family_table;
/// Shared floating-point unit.
pub mod fpu;
/// Instruction cache.
pub mod icache;
/// Inter-core network interfaces.
pub mod network;
/// Six-stage pipeline.
pub mod pipeline;
/// Register allocation unit.
pub mod raunit;
/// Register file.
pub mod regfile;
/// Thread table.
pub mod thread_table;

use tracing::debug;

use crate::common::{FidFormat, Lfid, MemAddr, PerType, Pid, PlaceFormat, RegAddr, RegType,
    SimError, Tid};
use crate::config::Config;
use crate::kernel::{ProcCtx, ProcResult, ProcessId, Scheduler};
use crate::mem::traits::{Memory, MemoryClient};

use self::allocator::Allocator;
use self::dcache::DCache;
use self::family_table::{ContextType, FamilyState, FamilyTable};
use self::fpu::Fpu;
use self::icache::ICache;
use self::network::{LinkMessage, Network, RemoteMessage, SyncInfo};
use self::pipeline::Pipeline;
use self::raunit::RaUnit;
use self::regfile::{RegState, RegValue, RegisterFile};
use self::thread_table::{ThreadState, ThreadTable};

/// A family dependency being resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FamilyDep {
    /// One allocated thread was cleaned up.
    ThreadCount,
    /// One outstanding memory read completed.
    OutstandingReads,
    /// All preceding cores synchronized.
    PrevSynchronized,
    /// Every thread of the family has been allocated.
    AllocationDone,
    /// The parent detached.
    Detached,
}

/// A thread dependency being resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadDep {
    /// The previous thread in the block was cleaned up.
    PrevCleanedUp,
    /// One outstanding write completed.
    OutstandingWrites,
    /// The thread terminated.
    Terminated,
}

/// One process of a core, for dispatch.
#[derive(Clone, Copy, Debug)]
pub enum CoreProcess {
    /// The six-stage pipeline.
    Pipeline,
    /// Instruction cache outgoing reads.
    IcacheOutgoing,
    /// Instruction cache fill distribution.
    IcacheIncoming,
    /// Data cache fill walk into registers.
    DcacheReadResponses,
    /// Data cache write confirmations.
    DcacheWriteResponses,
    /// Thread allocation and cleanup.
    ThreadAllocate,
    /// Family allocation.
    FamilyAllocate,
    /// Family creation.
    FamilyCreate,
    /// Thread activation.
    ThreadActivation,
    /// Delegation outbox.
    DelegationOut,
    /// Delegation input.
    DelegationIn,
    /// Link input.
    Link,
    /// Allocation response input.
    AllocResponse,
    /// Queued synchronization deliveries.
    Syncs,
}

/// One processor core.
#[derive(Debug)]
pub struct Core {
    /// This core's id.
    pub pid: Pid,
    /// Number of cores in the grid.
    pub grid_size: usize,
    /// FID wire format.
    pub fid_format: FidFormat,
    /// Place wire format.
    pub place_format: PlaceFormat,
    /// Bytes covered by one control word.
    pub control_block_size: usize,
    /// This core's slot in its FPU.
    pub fpu_source: usize,
    /// Family table.
    pub families: FamilyTable,
    /// Thread table.
    pub threads: ThreadTable,
    /// Register file.
    pub regfile: RegisterFile,
    /// Register allocation unit.
    pub raunit: RaUnit,
    /// Instruction cache.
    pub icache: ICache,
    /// Data cache.
    pub dcache: DCache,
    /// Pipeline.
    pub pipeline: Pipeline,
    /// Allocator.
    pub allocator: Allocator,
    /// Network interfaces.
    pub network: Network,
}

impl Core {
    /// Builds one core from the configuration.
    pub fn new(pid: Pid, config: &Config) -> Self {
        let c = &config.core;
        let mut pipeline = Pipeline::new();
        pipeline.fetch.reset();
        Self {
            pid,
            grid_size: config.num_processors,
            fid_format: FidFormat::new(config.num_processors, c.num_families),
            place_format: PlaceFormat::new(config.num_processors),
            control_block_size: c.control_block_size,
            fpu_source: pid % config.fpu.num_processors_per_fpu,
            families: FamilyTable::new(c.num_families),
            threads: ThreadTable::new(c.num_threads),
            regfile: RegisterFile::new(c.num_int_registers, c.num_flt_registers),
            raunit: RaUnit::new(
                PerType([c.num_int_registers, c.num_flt_registers]),
                c.register_block_size,
            ),
            icache: ICache::new(
                c.icache_num_sets,
                c.icache_associativity,
                config.memory.cache_line_size,
            ),
            dcache: DCache::new(
                c.dcache_num_sets,
                c.dcache_associativity,
                config.memory.cache_line_size,
                c.thread_cleanup_queue_size.max(4),
            ),
            pipeline,
            allocator: Allocator::new(
                c.local_creates_queue_size,
                c.thread_cleanup_queue_size,
                c.family_allocation_queue_size,
                c.num_families,
                0x9E37_79B9_7F4A_7C15 ^ (pid as u64) << 32,
            ),
            network: Network::new(c.num_families, c.load_balance_threshold),
        }
    }

    /// Registers every core process and wires storage sensitivities.
    /// Returns the dispatch table entries.
    pub fn register(
        &mut self,
        sched: &mut Scheduler,
        chans: &mut GridChannels,
    ) -> Vec<(ProcessId, CoreProcess)> {
        let pid = self.pid;
        let mut table = Vec::new();
        let mut reg = |sched: &mut Scheduler, name: &str| sched.register(format!("cpu{pid}.{name}"));

        let p_pipeline = reg(sched, "pipeline");
        let p_ic_out = reg(sched, "icache.outgoing");
        let p_ic_in = reg(sched, "icache.incoming");
        let p_dc_read = reg(sched, "dcache.read-responses");
        let p_dc_write = reg(sched, "dcache.write-responses");
        let p_thread_alloc = reg(sched, "alloc.thread-allocate");
        let p_family_alloc = reg(sched, "alloc.family-allocate");
        let p_family_create = reg(sched, "alloc.family-create");
        let p_thread_act = reg(sched, "alloc.thread-activation");
        let p_deleg_out = reg(sched, "net.delegation-out");
        let p_deleg_in = reg(sched, "net.delegation-in");
        let p_link = reg(sched, "net.link");
        let p_alloc_resp = reg(sched, "net.alloc-response");
        let p_syncs = reg(sched, "net.syncs");

        self.pipeline.proc_pipeline = p_pipeline;
        self.icache.proc_outgoing = p_ic_out;
        self.icache.proc_incoming = p_ic_in;
        self.dcache.proc_read_responses = p_dc_read;
        self.dcache.proc_write_responses = p_dc_write;
        self.allocator.proc_thread_allocate = p_thread_alloc;
        self.allocator.proc_family_allocate = p_family_alloc;
        self.allocator.proc_family_create = p_family_create;
        self.allocator.proc_thread_activation = p_thread_act;
        self.network.proc_delegation_out = p_deleg_out;
        self.network.proc_delegation_in = p_deleg_in;
        self.network.proc_link = p_link;
        self.network.proc_alloc_response = p_alloc_resp;
        self.network.proc_syncs = p_syncs;

        self.icache.outgoing.set_sensitive(p_ic_out);
        self.icache.incoming.set_sensitive(p_ic_in);
        self.dcache.read_responses.set_sensitive(p_dc_read);
        self.dcache.write_responses.set_sensitive(p_dc_write);
        self.allocator.alloc.set_sensitive(p_thread_alloc);
        self.allocator.cleanup.set_sensitive(p_thread_alloc);
        self.allocator.creates.set_sensitive(p_family_create);
        self.allocator.ready1.set_sensitive(p_thread_act);
        self.allocator.ready2.set_sensitive(p_thread_act);
        self.allocator.active.set_sensitive(p_pipeline);
        self.allocator.alloc_suspend.set_sensitive(p_family_alloc);
        self.allocator.alloc_nosuspend.set_sensitive(p_family_alloc);
        self.allocator.alloc_exclusive.set_sensitive(p_family_alloc);
        self.network.delegate_out.set_sensitive(p_deleg_out);
        self.network.syncs.set_sensitive(p_syncs);
        chans.delegate_in[pid].set_sensitive(p_deleg_in);
        chans.link_in[pid].set_sensitive(p_link);
        chans.alloc_resp_in[pid].set_sensitive(p_alloc_resp);

        // Port arbitration: writers of the asynchronous register port.
        self.regfile.p_async_w.add_process(p_dc_read);
        self.regfile.p_async_w.add_process(p_deleg_in);
        self.regfile.p_async_w.add_process(p_link);
        self.regfile.p_async_w.add_process(p_thread_alloc);
        self.regfile.p_pipeline_w.add_process(p_pipeline);
        self.icache.p_service.add_process(p_thread_act);
        self.icache.p_service.add_process(p_family_create);
        self.dcache.p_service.add_process(p_pipeline);
        self.dcache.p_service.add_process(p_dc_read);

        table.push((p_pipeline, CoreProcess::Pipeline));
        table.push((p_ic_out, CoreProcess::IcacheOutgoing));
        table.push((p_ic_in, CoreProcess::IcacheIncoming));
        table.push((p_dc_read, CoreProcess::DcacheReadResponses));
        table.push((p_dc_write, CoreProcess::DcacheWriteResponses));
        table.push((p_thread_alloc, CoreProcess::ThreadAllocate));
        table.push((p_family_alloc, CoreProcess::FamilyAllocate));
        table.push((p_family_create, CoreProcess::FamilyCreate));
        table.push((p_thread_act, CoreProcess::ThreadActivation));
        table.push((p_deleg_out, CoreProcess::DelegationOut));
        table.push((p_deleg_in, CoreProcess::DelegationIn));
        table.push((p_link, CoreProcess::Link));
        table.push((p_alloc_resp, CoreProcess::AllocResponse));
        table.push((p_syncs, CoreProcess::Syncs));
        table
    }

    /// Runs one core process for one phase.
    pub fn cycle(
        &mut self,
        proc: CoreProcess,
        chans: &mut GridChannels,
        mem: &mut dyn Memory,
        fpu: &mut Fpu,
        ctx: ProcCtx,
    ) -> Result<ProcResult, SimError> {
        match proc {
            CoreProcess::Pipeline => self.do_pipeline(chans, mem, fpu, ctx),
            CoreProcess::IcacheOutgoing => Ok(self.do_icache_outgoing(mem, ctx)),
            CoreProcess::IcacheIncoming => Ok(self.do_icache_incoming(ctx)),
            CoreProcess::DcacheReadResponses => self.do_dcache_read_responses(chans, ctx),
            CoreProcess::DcacheWriteResponses => Ok(self.do_dcache_write_responses(ctx)),
            CoreProcess::ThreadAllocate => self.do_thread_allocate(chans, ctx),
            CoreProcess::FamilyAllocate => self.do_family_allocate(chans, ctx),
            CoreProcess::FamilyCreate => self.do_family_create(chans, ctx),
            CoreProcess::ThreadActivation => Ok(self.do_thread_activation(ctx)),
            CoreProcess::DelegationOut => Ok(self.do_delegation_out(chans, ctx)),
            CoreProcess::DelegationIn => self.do_delegation_in(chans, ctx),
            CoreProcess::Link => self.do_link(chans, ctx),
            CoreProcess::AllocResponse => self.do_alloc_response(chans, ctx),
            CoreProcess::Syncs => Ok(self.do_syncs(chans, ctx)),
        }
    }

    /// Verifies a family reference's capability.
    pub fn get_family_checked(&self, lfid: Lfid, capability: u64) -> Result<(), SimError> {
        let family = self.families.get(lfid);
        if family.state == FamilyState::Empty || family.capability != capability {
            return Err(SimError::InvalidFid {
                pid: self.pid,
                lfid,
            });
        }
        Ok(())
    }

    /// Behavioral register write: wakes suspended threads and forwards to
    /// remote consumers.
    ///
    /// Returns `Ok(false)` when a required network buffer is unavailable
    /// this cycle.
    pub fn write_register(
        &mut self,
        addr: RegAddr,
        data: RegValue,
        from_memory: bool,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<bool, SimError> {
        let current = *self.regfile.read(addr)?;

        if current.state == RegState::Pending && data.state == RegState::Full && !from_memory {
            return Err(SimError::PendingOverwrite { addr });
        }
        if current.state == RegState::Waiting && data.state == RegState::Empty {
            return Err(SimError::WaitingReset { addr });
        }

        if data.state == RegState::Full {
            if let Some(remote) = current.remote {
                // A remote register consumes this value.
                let msg = RemoteMessage::RawRegister {
                    addr: remote.reg,
                    value: data.value,
                };
                if !self.send_remote_to(remote.pid, msg, chans, ctx) {
                    return Ok(false);
                }
            }
            if current.state == RegState::Waiting {
                if let Some((head, tail)) = current.waiting {
                    self.activate_threads(head, tail, ctx);
                }
            }
            if ctx.committing() {
                *self.regfile.get_mut(addr)? = RegValue::full(data.value);
            }
            return Ok(true);
        }

        if ctx.committing() {
            let reg = self.regfile.get_mut(addr)?;
            match data.state {
                RegState::Pending => {
                    // Attach the fill; a waiting queue survives the merge.
                    reg.memory = data.memory;
                    if reg.state != RegState::Waiting {
                        reg.state = RegState::Pending;
                    }
                }
                RegState::Empty => *reg = data,
                RegState::Waiting | RegState::Full => *reg = data,
            }
        }
        Ok(true)
    }

    /// Marks a chain of threads ready and queues it for activation.
    pub fn activate_threads(&mut self, head: Tid, tail: Tid, ctx: ProcCtx) {
        if ctx.committing() {
            let mut cur = Some(head);
            while let Some(tid) = cur {
                self.threads.get_mut(tid).state = ThreadState::Ready;
                if tid == tail {
                    break;
                }
                cur = self.threads.get(tid).next;
            }
        }
        if ctx.pid == self.pipeline.proc_pipeline {
            self.allocator.ready1.push(head, tail, ctx);
        } else {
            self.allocator.ready2.push(head, tail, ctx);
        }
    }

    /// Suspends a thread on a register, joining its waiter queue.
    pub fn park_thread_on_register(
        &mut self,
        tid: Tid,
        addr: RegAddr,
        pc: MemAddr,
        ctx: ProcCtx,
    ) {
        if !ctx.committing() {
            return;
        }
        let Ok(reg) = self.regfile.get_mut(addr) else {
            return;
        };
        let waiting = reg.waiting;
        if reg.state == RegState::Waiting {
            if let Some((head, tail)) = waiting {
                reg.waiting = Some((head, tid));
                self.threads.get_mut(tail).next = Some(tid);
            }
        } else {
            reg.state = RegState::Waiting;
            reg.waiting = Some((tid, tid));
        }
        let thread = self.threads.get_mut(tid);
        thread.pc = pc;
        thread.state = ThreadState::Suspended;
        thread.next = None;
        debug!(core = self.pid, thread = tid, register = %addr, "thread suspended");
    }

    /// Requeues a switched-out thread at `pc`.
    pub fn reschedule_thread(&mut self, tid: Tid, pc: MemAddr, ctx: ProcCtx) {
        if ctx.committing() {
            let thread = self.threads.get_mut(tid);
            thread.pc = pc;
            thread.state = ThreadState::Ready;
            thread.next = None;
        }
        if ctx.pid == self.pipeline.proc_pipeline {
            self.allocator.ready1.push(tid, tid, ctx);
        } else {
            self.allocator.ready2.push(tid, tid, ctx);
        }
    }

    /// Terminates a thread; it recycles once its dependencies resolve.
    pub fn kill_thread(&mut self, tid: Tid, ctx: ProcCtx) -> bool {
        if !self.dec_thread_dep(tid, ThreadDep::Terminated, ctx) {
            return false;
        }
        if ctx.committing() {
            self.threads.get_mut(tid).state = ThreadState::Killed;
            debug!(core = self.pid, thread = tid, "thread killed");
        }
        true
    }

    /// Raises a thread dependency.
    pub fn inc_thread_dep(&mut self, tid: Tid, dep: ThreadDep, ctx: ProcCtx) {
        debug_assert!(dep == ThreadDep::OutstandingWrites);
        if ctx.committing() {
            self.threads.get_mut(tid).deps.num_pending_writes += 1;
        }
    }

    /// Resolves a thread dependency; pushes the thread into cleanup once
    /// every dependency is resolved.
    pub fn dec_thread_dep(&mut self, tid: Tid, dep: ThreadDep, ctx: ProcCtx) -> bool {
        let deps = self.threads.get(tid).deps;
        let (killed, prev, writes) = match dep {
            ThreadDep::PrevCleanedUp => {
                debug_assert!(!deps.prev_cleaned_up);
                (deps.killed, true, deps.num_pending_writes)
            }
            ThreadDep::OutstandingWrites => {
                debug_assert!(deps.num_pending_writes > 0);
                (deps.killed, deps.prev_cleaned_up, deps.num_pending_writes - 1)
            }
            ThreadDep::Terminated => {
                debug_assert!(!deps.killed);
                (true, deps.prev_cleaned_up, deps.num_pending_writes)
            }
        };

        if killed && prev && writes == 0 {
            if !self.allocator.cleanup.push(tid, ctx) {
                return false;
            }
        }
        if ctx.committing() {
            let deps = &mut self.threads.get_mut(tid).deps;
            match dep {
                ThreadDep::PrevCleanedUp => deps.prev_cleaned_up = true,
                ThreadDep::OutstandingWrites => deps.num_pending_writes -= 1,
                ThreadDep::Terminated => deps.killed = true,
            }
        }
        true
    }

    /// Resolves a family dependency, firing termination, synchronization,
    /// and cleanup as their conditions are met.
    pub fn dec_family_dep(
        &mut self,
        lfid: Lfid,
        dep: FamilyDep,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<bool, SimError> {
        let family = self.families.get(lfid);
        debug_assert!(family.state != FamilyState::Empty);
        let mut deps = family.deps;
        let sync_done = family.sync.done;
        let sync_pid = family.sync.pid;
        let sync_reg = family.sync.reg;
        let link_next = family.link_next;

        match dep {
            FamilyDep::ThreadCount => {
                debug_assert!(deps.num_threads_allocated > 0);
                deps.num_threads_allocated -= 1;
            }
            FamilyDep::OutstandingReads => {
                debug_assert!(deps.num_pending_reads > 0);
                deps.num_pending_reads -= 1;
            }
            FamilyDep::PrevSynchronized => {
                debug_assert!(!deps.prev_synchronized);
                deps.prev_synchronized = true;
            }
            FamilyDep::AllocationDone => {
                debug_assert!(!deps.allocation_done);
                deps.allocation_done = true;
            }
            FamilyDep::Detached => {
                debug_assert!(!deps.detached);
                deps.detached = true;
            }
        }

        let terminated = deps.num_threads_allocated == 0 && deps.allocation_done;
        let synchronized =
            terminated && deps.num_pending_reads == 0 && deps.prev_synchronized && !sync_done;
        let cleanable = terminated
            && deps.num_pending_reads == 0
            && deps.prev_synchronized
            && deps.detached;

        if synchronized {
            // Forward the synchronization token along the place, or
            // deliver the completion when this is the last core.
            if let Some(next) = link_next {
                if !self.send_link(LinkMessage::Done { lfid: next }, chans, ctx) {
                    return Ok(false);
                }
            } else if let (Some(pid), Some(reg)) = (sync_pid, sync_reg) {
                if !self.network.syncs.push(SyncInfo { pid, reg }, ctx) {
                    return Ok(false);
                }
            }
            debug!(core = self.pid, family = lfid, "family synchronized");
        }

        if cleanable {
            let context = if self.families.is_exclusive(lfid) {
                ContextType::Exclusive
            } else {
                ContextType::Normal
            };
            let indices = PerType([
                self.families.get(lfid).regs[RegType::Integer].base,
                self.families.get(lfid).regs[RegType::Float].base,
            ]);
            self.raunit.free(indices, context, ctx);
            self.families.free_family(lfid, context, ctx);
            debug!(core = self.pid, family = lfid, "family cleaned up");
            // The entry is gone; nothing further to record.
            return Ok(true);
        }

        if ctx.committing() {
            let family = self.families.get_mut(lfid);
            family.deps = deps;
            if terminated && family.state != FamilyState::Killed {
                family.state = FamilyState::Killed;
                debug!(core = self.pid, family = lfid, "family terminated");
            }
            if synchronized {
                family.sync.done = true;
            }
        }
        Ok(true)
    }

    /// Instruction cache outgoing read process.
    fn do_icache_outgoing(&mut self, mem: &mut dyn Memory, ctx: ProcCtx) -> ProcResult {
        let Some(&addr) = self.icache.outgoing.front() else {
            return ProcResult::Delayed;
        };
        if !mem.read(self.pid, addr, self.icache.line_size(), ctx) {
            return ProcResult::Failed;
        }
        self.icache.outgoing.pop(ctx);
        ProcResult::Success
    }

    /// Instruction cache fill distribution process.
    fn do_icache_incoming(&mut self, ctx: ProcCtx) -> ProcResult {
        let Some((cid, waiting, creation, invalid)) = self.icache.take_fill(ctx) else {
            return ProcResult::Delayed;
        };
        if creation {
            self.on_cacheline_loaded(cid, ctx);
        }
        if let Some((head, tail)) = waiting {
            if invalid {
                // Discarded fill: the waiters re-fetch at their PC.
                if ctx.committing() {
                    let mut cur = Some(head);
                    while let Some(tid) = cur {
                        self.threads.get_mut(tid).cid = None;
                        if tid == tail {
                            break;
                        }
                        cur = self.threads.get(tid).next;
                    }
                }
                self.activate_threads(head, tail, ctx);
            } else {
                // Line present: the waiters are ready to run.
                if ctx.committing() {
                    let mut cur = Some(head);
                    while let Some(tid) = cur {
                        self.threads.get_mut(tid).state = ThreadState::Active;
                        if tid == tail {
                            break;
                        }
                        cur = self.threads.get(tid).next;
                    }
                }
                self.allocator.active.push(head, tail, ctx);
            }
        }
        ProcResult::Success
    }

    /// Data cache fill walk: writes one waiting register per cycle.
    fn do_dcache_read_responses(
        &mut self,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<ProcResult, SimError> {
        let Some(response) = self.dcache.read_responses.front().cloned() else {
            return Ok(ProcResult::Delayed);
        };
        if !self.dcache.p_service.invoke(ctx) {
            return Ok(ProcResult::Failed);
        }

        let head = self.dcache.line(response.cid).waiting;
        let Some(addr) = head else {
            // Chain drained: finalize the line and retire the response.
            self.dcache.finish_fill(response.cid, ctx);
            self.dcache.read_responses.pop(ctx);
            return Ok(ProcResult::Success);
        };

        let reg = *self.regfile.read(addr)?;
        let Some(fill) = reg.memory else {
            // The register was recycled under the fill; drop it.
            if ctx.committing() {
                self.dcache.line_mut(response.cid).waiting = None;
            }
            return Ok(ProcResult::Success);
        };

        let mut bytes = [0u8; 8];
        bytes[..fill.size].copy_from_slice(&response.data[fill.offset..fill.offset + fill.size]);
        let mut value = u64::from_le_bytes(bytes);
        if fill.sign_extend && fill.size < 8 {
            let shift = 64 - fill.size as u32 * 8;
            value = ((value << shift) as i64 >> shift) as u64;
        }

        if !self.regfile.p_async_w.invoke(ctx) {
            return Ok(ProcResult::Failed);
        }
        if !self.write_register(addr, RegValue::full(value), true, chans, ctx)? {
            return Ok(ProcResult::Failed);
        }
        if !self.dec_family_dep(fill.fid, FamilyDep::OutstandingReads, chans, ctx)? {
            return Ok(ProcResult::Failed);
        }
        if ctx.committing() {
            self.dcache.line_mut(response.cid).waiting = fill.next;
        }
        Ok(ProcResult::Success)
    }

    /// Data cache write confirmation process.
    fn do_dcache_write_responses(&mut self, ctx: ProcCtx) -> ProcResult {
        let Some(&tid) = self.dcache.write_responses.front() else {
            return ProcResult::Delayed;
        };
        let thread = self.threads.get(tid);
        let resume = thread.waiting_for_writes && thread.deps.num_pending_writes == 1;
        let pc = thread.pc;

        if !self.dec_thread_dep(tid, ThreadDep::OutstandingWrites, ctx) {
            return ProcResult::Failed;
        }
        if resume {
            // The memory barrier lifted; re-execute the barrier
            // instruction.
            if ctx.committing() {
                self.threads.get_mut(tid).waiting_for_writes = false;
            }
            self.reschedule_thread(tid, pc, ctx);
        }
        self.dcache.write_responses.pop(ctx);
        ProcResult::Success
    }

    /// End-of-cycle storage publication for this core.
    pub fn update(&mut self, wake: &mut dyn FnMut(ProcessId)) {
        self.icache.outgoing.update(wake);
        self.icache.incoming.update(wake);
        self.dcache.read_responses.update(wake);
        self.dcache.write_responses.update(wake);
        self.allocator.alloc.update(wake);
        self.allocator.creates.update(wake);
        self.allocator.cleanup.update(wake);
        self.allocator.alloc_suspend.update(wake);
        self.allocator.alloc_nosuspend.update(wake);
        self.allocator.alloc_exclusive.update(wake);
        self.allocator.ready1.update(&mut self.threads, wake);
        self.allocator.ready2.update(&mut self.threads, wake);
        self.allocator.active.update(&mut self.threads, wake);
        self.network.delegate_out.update(wake);
        self.network.syncs.update(wake);

        // The pipeline holds state outside any storage: latched
        // instructions and the running thread keep it awake.
        if !self.pipeline.is_idle() || self.pipeline.fetch.tid.is_some() {
            wake(self.pipeline.proc_pipeline);
        }
    }
}

impl MemoryClient for Core {
    fn on_memory_read_completed(&mut self, addr: MemAddr, data: &[u8], ctx: ProcCtx) -> bool {
        self.icache.on_fill(addr, data, ctx) && self.dcache.on_fill(addr, data, ctx)
    }

    fn on_memory_write_completed(&mut self, tid: Tid, ctx: ProcCtx) -> bool {
        self.dcache.write_responses.push(tid, ctx)
    }

    fn on_memory_snooped(&mut self, addr: MemAddr, data: &[u8], ctx: ProcCtx) -> bool {
        self.icache.on_snoop(addr, data, ctx);
        self.dcache.on_snoop(addr, data, ctx);
        true
    }

    fn on_memory_invalidated(&mut self, addr: MemAddr, ctx: ProcCtx) -> bool {
        self.icache.on_invalidate(addr, ctx);
        self.dcache.on_invalidate(addr, ctx);
        true
    }
}

pub use self::network::GridChannels;
