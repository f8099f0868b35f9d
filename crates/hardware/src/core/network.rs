//! Inter-core network: delegation and link channels.
//!
//! Two physically distinct carriers connect the cores:
//! 1. **Delegation:** fully connected, any core to any core, FIFO per
//!    source-destination pair. Carries family operations addressed by FID
//!    and raw register writes. A message to self short-circuits into the
//!    local input register.
//! 2. **Link:** point-to-point between ring neighbors of a place. Carries
//!    the allocation walk, create broadcast, family synchronization,
//!    global broadcasts, and break propagation, in FIFO order per pair.
//! 3. **Allocation responses:** walk the link chain backwards, committing
//!    or unwinding a place-wide allocation.

use tracing::debug;

use crate::common::{Fid, Lfid, MemAddr, PerType, Pid, RegAddr, RegIndex, RegType, SimError};
use crate::isa::{AllocationType, FamilyProperty};
use crate::kernel::{Buffer, ProcCtx, ProcResult, ProcessId, Register};

use super::family_table::RegCounts;
use super::regfile::{RegValue, RemoteWaiter};
use super::{Core, FamilyDep};

/// Which family register window a remote access names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteRegKind {
    /// The family's globals.
    Global,
    /// The last allocated thread's shareds (a remote read).
    LastShared,
    /// The first thread's dependents (a remote write).
    FirstDependent,
}

/// Payload of a delegation message.
#[derive(Clone, Debug)]
pub enum RemoteMessage {
    /// Request a family context on a place.
    Allocate {
        /// First core of the place.
        place_pid: Pid,
        /// Size of the place.
        place_size: usize,
        /// Suspend on failure instead of failing with FID 0.
        suspend: bool,
        /// Use the exclusive context.
        exclusive: bool,
        /// Core selection strategy.
        atype: AllocationType,
        /// Core awaiting the packed FID.
        completion_pid: Pid,
        /// Register awaiting the packed FID.
        completion_reg: RegIndex,
    },
    /// Indirect create: allocate a place-of-one context, create a family
    /// running `pc` seeded with `parameter`, and notify on completion.
    Bundle {
        /// Target core.
        place_pid: Pid,
        /// Requested place size (used for the walk bookkeeping).
        place_size: usize,
        /// Suspend rather than fail when no context is free.
        suspend: bool,
        /// Thread entry PC.
        pc: MemAddr,
        /// Value seeding the index sequence.
        parameter: u64,
        /// Core awaiting the full FID.
        completion_pid: Pid,
        /// Register awaiting the full FID.
        completion_reg: RegIndex,
    },
    /// Set a pre-create family property.
    SetProperty {
        /// Target family.
        fid: Fid,
        /// Property selector.
        prop: FamilyProperty,
        /// New value.
        value: u64,
    },
    /// Start a family.
    Create {
        /// Target family.
        fid: Fid,
        /// Thread entry PC.
        pc: MemAddr,
        /// Core awaiting the full FID.
        completion_pid: Pid,
        /// Register awaiting the full FID.
        completion_reg: RegIndex,
    },
    /// Synchronize on family termination.
    Sync {
        /// Target family.
        fid: Fid,
        /// Register written on completion (on the source core).
        completion_reg: RegIndex,
    },
    /// Detach from a family.
    Detach {
        /// Target family.
        fid: Fid,
    },
    /// Break a family, addressed to its first core.
    Break {
        /// Family slot on the first core.
        lfid: Lfid,
    },
    /// Write a value into a specific register.
    RawRegister {
        /// Register to write.
        addr: RegAddr,
        /// The value.
        value: u64,
    },
    /// Access a family's register window.
    FamRegister {
        /// Target family.
        fid: Fid,
        /// Window selector.
        kind: RemoteRegKind,
        /// Window-relative register address.
        addr: RegAddr,
        /// For reads: register awaiting the value on the source core.
        completion_reg: Option<RegIndex>,
        /// For writes: the value.
        value: Option<u64>,
    },
}

/// A routed delegation message.
#[derive(Clone, Debug)]
pub struct DelegateMessage {
    /// Originating core.
    pub src: Pid,
    /// Destination core.
    pub dest: Pid,
    /// The operation.
    pub payload: RemoteMessage,
}

/// A message on the neighbor link.
#[derive(Clone, Debug)]
pub enum LinkMessage {
    /// Forward leg of the place-wide allocation walk.
    Allocate {
        /// Family slot on the first core of the walk.
        first_lfid: Lfid,
        /// Family slot on the previous core.
        prev_lfid: Lfid,
        /// Requested place size.
        size: usize,
        /// Fail the whole place on partial allocation.
        exact: bool,
        /// Suspend rather than unwind on failure.
        suspend: bool,
        /// Core awaiting the packed FID.
        completion_pid: Pid,
        /// Register awaiting the packed FID.
        completion_reg: RegIndex,
    },
    /// Balanced allocation walk recording the least-loaded core.
    BAllocate {
        /// Lowest used-context count seen so far.
        min_contexts: usize,
        /// Core holding that minimum.
        min_pid: Pid,
        /// Requested place size.
        size: usize,
        /// Suspend rather than fail.
        suspend: bool,
        /// Core awaiting the packed FID.
        completion_pid: Pid,
        /// Register awaiting the packed FID.
        completion_reg: RegIndex,
    },
    /// Property update forwarded along the place.
    SetProperty {
        /// Family slot on the receiving core.
        lfid: Lfid,
        /// Property selector.
        prop: FamilyProperty,
        /// New value.
        value: u64,
    },
    /// Create broadcast carrying the program and register plan.
    Create {
        /// Family slot on the receiving core.
        lfid: Lfid,
        /// Cores remaining in the place after this one.
        num_cores: usize,
        /// Thread entry PC.
        pc: MemAddr,
        /// Register counts per type.
        regs: PerType<RegCounts>,
    },
    /// Predecessor cores have terminated.
    Done {
        /// Family slot on the receiving core.
        lfid: Lfid,
    },
    /// Synchronization rendezvous traveling to the last core.
    Sync {
        /// Family slot on the receiving core.
        lfid: Lfid,
        /// Core awaiting completion.
        completion_pid: Pid,
        /// Register awaiting completion.
        completion_reg: RegIndex,
    },
    /// Detach forwarded along the place.
    Detach {
        /// Family slot on the receiving core.
        lfid: Lfid,
    },
    /// Global register broadcast along the place.
    Global {
        /// Family slot on the receiving core.
        lfid: Lfid,
        /// Window-relative register address.
        addr: RegAddr,
        /// The value.
        value: u64,
    },
    /// Break propagation along the place.
    Break {
        /// Family slot on the receiving core.
        lfid: Lfid,
    },
}

/// Backward leg of the place-wide allocation walk.
#[derive(Clone, Copy, Debug)]
pub struct AllocResponse {
    /// Cores committed so far; 0 while unwinding.
    pub num_cores: usize,
    /// The allocation demanded the exact place size.
    pub exact: bool,
    /// Family slot on the receiving core.
    pub prev_lfid: Lfid,
    /// Family slot on the core after the receiver, or `None` when the
    /// suffix was released.
    pub next_lfid: Option<Lfid>,
    /// Core awaiting the packed FID.
    pub completion_pid: Pid,
    /// Register awaiting the packed FID.
    pub completion_reg: RegIndex,
}

/// A family synchronization event awaiting delivery.
#[derive(Clone, Copy, Debug)]
pub struct SyncInfo {
    /// Core awaiting completion.
    pub pid: Pid,
    /// Register awaiting completion.
    pub reg: RegIndex,
}

/// The grid-level channel state: one input latch per core per carrier.
#[derive(Debug)]
pub struct GridChannels {
    /// Delegation input per core.
    pub delegate_in: Vec<Register<DelegateMessage>>,
    /// Link input per core, written by the previous core.
    pub link_in: Vec<Register<LinkMessage>>,
    /// Allocation response input per core, written by the next core.
    pub alloc_resp_in: Vec<Register<AllocResponse>>,
}

impl GridChannels {
    /// Creates channels for `num_cores` cores.
    pub fn new(num_cores: usize) -> Self {
        Self {
            delegate_in: (0..num_cores).map(|_| Register::new()).collect(),
            link_in: (0..num_cores).map(|_| Register::new()).collect(),
            alloc_resp_in: (0..num_cores).map(|_| Register::new()).collect(),
        }
    }

    /// End-of-cycle publication of every channel latch.
    pub fn update(&mut self, wake: &mut dyn FnMut(ProcessId)) {
        for reg in &mut self.delegate_in {
            reg.update(wake);
        }
        for reg in &mut self.link_in {
            reg.update(wake);
        }
        for reg in &mut self.alloc_resp_in {
            reg.update(wake);
        }
    }
}

/// Per-core network state.
#[derive(Debug)]
pub struct Network {
    /// Outbox toward the delegation crossbar.
    pub delegate_out: Buffer<DelegateMessage>,
    /// Pending family synchronization deliveries.
    pub syncs: Buffer<SyncInfo>,
    /// Used-context threshold for balanced allocation.
    pub load_balance_threshold: usize,
    /// Process draining the delegation outbox.
    pub proc_delegation_out: ProcessId,
    /// Process handling delegation input.
    pub proc_delegation_in: ProcessId,
    /// Process handling link input.
    pub proc_link: ProcessId,
    /// Process handling allocation responses.
    pub proc_alloc_response: ProcessId,
    /// Process delivering queued syncs.
    pub proc_syncs: ProcessId,
}

impl Network {
    /// Creates the network state.
    ///
    /// The sync queue is sized to the family table: every family can have
    /// at most one pending synchronization event.
    pub fn new(num_families: usize, load_balance_threshold: usize) -> Self {
        Self {
            delegate_out: Buffer::new(4),
            syncs: Buffer::new(num_families),
            load_balance_threshold,
            proc_delegation_out: 0,
            proc_delegation_in: 0,
            proc_link: 0,
            proc_alloc_response: 0,
            proc_syncs: 0,
        }
    }
}

impl Core {
    /// Sends a delegation message, resolving its destination.
    ///
    /// A message to self short-circuits into the local input register; when
    /// sent while processing delegation input it replaces the input in
    /// place, avoiding a dependency on the output buffer.
    pub fn send_remote(
        &mut self,
        payload: RemoteMessage,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> bool {
        let dest = match &payload {
            RemoteMessage::Allocate { place_pid, .. }
            | RemoteMessage::Bundle { place_pid, .. } => *place_pid,
            RemoteMessage::SetProperty { fid, .. }
            | RemoteMessage::Create { fid, .. }
            | RemoteMessage::Sync { fid, .. }
            | RemoteMessage::Detach { fid }
            | RemoteMessage::FamRegister { fid, .. } => fid.pid,
            RemoteMessage::Break { .. } | RemoteMessage::RawRegister { .. } => {
                unreachable!("addressed sends must use send_remote_to")
            }
        };
        self.send_remote_to(dest, payload, chans, ctx)
    }

    /// Sends a delegation message to an explicit destination.
    pub fn send_remote_to(
        &mut self,
        dest: Pid,
        payload: RemoteMessage,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> bool {
        let msg = DelegateMessage {
            src: self.pid,
            dest,
            payload,
        };
        if dest == self.pid {
            if ctx.pid == self.network.proc_delegation_in {
                chans.delegate_in[self.pid].write_force(msg, ctx);
                return true;
            }
            return chans.delegate_in[self.pid].write(msg, ctx);
        }
        self.network.delegate_out.push(msg, ctx)
    }

    /// Sends a link message to the next core.
    pub fn send_link(&mut self, msg: LinkMessage, chans: &mut GridChannels, ctx: ProcCtx) -> bool {
        let next = (self.pid + 1) % self.grid_size;
        chans.link_in[next].write(msg, ctx)
    }

    /// Sends an allocation response to the previous core.
    pub fn send_alloc_response(
        &mut self,
        msg: AllocResponse,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> bool {
        let prev = (self.pid + self.grid_size - 1) % self.grid_size;
        chans.alloc_resp_in[prev].write(msg, ctx)
    }

    /// Drains one delegation outbox entry into its destination's input.
    pub fn do_delegation_out(
        &mut self,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> ProcResult {
        let Some(msg) = self.network.delegate_out.front().cloned() else {
            return ProcResult::Delayed;
        };
        debug_assert!(msg.dest != self.pid);
        if !chans.delegate_in[msg.dest].write(msg, ctx) {
            return ProcResult::Failed;
        }
        self.network.delegate_out.pop(ctx);
        ProcResult::Success
    }

    /// Handles one incoming delegation message.
    pub fn do_delegation_in(
        &mut self,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<ProcResult, SimError> {
        let Some(msg) = chans.delegate_in[self.pid].read().cloned() else {
            return Ok(ProcResult::Delayed);
        };
        debug_assert!(msg.dest == self.pid);
        // Clear before processing: a self-directed response may overwrite
        // the input register during processing.
        chans.delegate_in[self.pid].clear(ctx);
        debug!(core = self.pid, payload = ?msg.payload, "delegation in");

        match msg.payload {
            RemoteMessage::Allocate {
                place_size,
                suspend,
                exclusive,
                atype,
                completion_pid,
                completion_reg,
                ..
            } => {
                if atype == AllocationType::Balanced && place_size > 1 {
                    let used = self.families.used_normal();
                    if used >= self.network.load_balance_threshold {
                        // Too busy; walk the place for a better core.
                        let fwd = LinkMessage::BAllocate {
                            min_contexts: used,
                            min_pid: self.pid,
                            size: place_size,
                            suspend,
                            completion_pid,
                            completion_reg,
                        };
                        if !self.send_link(fwd, chans, ctx) {
                            return Ok(ProcResult::Failed);
                        }
                        return Ok(ProcResult::Success);
                    }
                }
                let single = matches!(
                    atype,
                    AllocationType::Single | AllocationType::Balanced
                );
                if !self.allocator_queue_allocation(
                    if single { 1 } else { place_size },
                    atype == AllocationType::Exact,
                    suspend,
                    exclusive,
                    completion_pid,
                    completion_reg,
                    ctx,
                ) {
                    return Ok(ProcResult::Failed);
                }
            }
            RemoteMessage::Bundle {
                place_size,
                suspend,
                pc,
                parameter,
                completion_pid,
                completion_reg,
                ..
            } => {
                if !self.allocator_queue_bundle(
                    place_size,
                    suspend,
                    pc,
                    parameter,
                    completion_pid,
                    completion_reg,
                    ctx,
                ) {
                    return Ok(ProcResult::Failed);
                }
            }
            RemoteMessage::SetProperty { fid, prop, value } => {
                self.get_family_checked(fid.lfid, fid.capability)?;
                self.set_family_property(fid.lfid, prop, value, ctx);
                let link_next = self.families.get(fid.lfid).link_next;
                if let Some(next) = link_next {
                    let fwd = LinkMessage::SetProperty {
                        lfid: next,
                        prop,
                        value,
                    };
                    if !self.send_link(fwd, chans, ctx) {
                        return Ok(ProcResult::Failed);
                    }
                }
            }
            RemoteMessage::Create {
                fid,
                pc,
                completion_pid,
                completion_reg,
            } => {
                self.get_family_checked(fid.lfid, fid.capability)?;
                if !self.allocator_queue_create(fid.lfid, pc, completion_pid, completion_reg, ctx)
                {
                    return Ok(ProcResult::Failed);
                }
            }
            RemoteMessage::Sync {
                fid,
                completion_reg,
            } => {
                self.get_family_checked(fid.lfid, fid.capability)?;
                if !self.on_sync(fid.lfid, msg.src, completion_reg, chans, ctx)? {
                    return Ok(ProcResult::Failed);
                }
            }
            RemoteMessage::Detach { fid } => {
                self.get_family_checked(fid.lfid, fid.capability)?;
                if !self.on_detach(fid.lfid, chans, ctx)? {
                    return Ok(ProcResult::Failed);
                }
            }
            RemoteMessage::Break { lfid } => {
                if !self.on_break(lfid, chans, ctx)? {
                    return Ok(ProcResult::Failed);
                }
            }
            RemoteMessage::RawRegister { addr, value } => {
                if !self.regfile.p_async_w.invoke(ctx) {
                    return Ok(ProcResult::Failed);
                }
                if !self.write_register(addr, RegValue::full(value), false, chans, ctx)? {
                    return Ok(ProcResult::Failed);
                }
            }
            RemoteMessage::FamRegister {
                fid,
                kind,
                addr,
                completion_reg,
                value,
            } => {
                self.get_family_checked(fid.lfid, fid.capability)?;
                match kind {
                    RemoteRegKind::LastShared => {
                        let completion = completion_reg.unwrap_or(0);
                        let target = RemoteWaiter {
                            pid: msg.src,
                            reg: RegAddr::new(addr.rtype, completion),
                        };
                        if !self.read_last_shared(fid.lfid, addr, target, chans, ctx)? {
                            return Ok(ProcResult::Failed);
                        }
                    }
                    RemoteRegKind::FirstDependent => {
                        if !self.write_family_register(
                            fid.lfid,
                            kind,
                            addr,
                            value.unwrap_or(0),
                            chans,
                            ctx,
                        )? {
                            return Ok(ProcResult::Failed);
                        }
                    }
                    RemoteRegKind::Global => {
                        if !self.write_family_register(
                            fid.lfid,
                            kind,
                            addr,
                            value.unwrap_or(0),
                            chans,
                            ctx,
                        )? {
                            return Ok(ProcResult::Failed);
                        }
                        let link_next = self.families.get(fid.lfid).link_next;
                        if let Some(next) = link_next {
                            let fwd = LinkMessage::Global {
                                lfid: next,
                                addr,
                                value: value.unwrap_or(0),
                            };
                            if !self.send_link(fwd, chans, ctx) {
                                return Ok(ProcResult::Failed);
                            }
                        }
                    }
                }
            }
        }
        Ok(ProcResult::Success)
    }

    /// Handles one incoming link message.
    pub fn do_link(
        &mut self,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<ProcResult, SimError> {
        let Some(msg) = chans.link_in[self.pid].read().cloned() else {
            return Ok(ProcResult::Delayed);
        };
        debug!(core = self.pid, ?msg, "link in");

        match msg {
            LinkMessage::Allocate {
                first_lfid,
                prev_lfid,
                size,
                exact,
                suspend,
                completion_pid,
                completion_reg,
            } => {
                if !self.allocator_queue_link_allocation(
                    first_lfid,
                    prev_lfid,
                    size,
                    exact,
                    suspend,
                    completion_pid,
                    completion_reg,
                    ctx,
                ) {
                    return Ok(ProcResult::Failed);
                }
            }
            LinkMessage::BAllocate {
                min_contexts,
                min_pid,
                size,
                suspend,
                completion_pid,
                completion_reg,
            } => {
                let used = self.families.used_normal();
                let last_in_place = (self.pid + 1) % size == 0;
                if used >= self.network.load_balance_threshold && !last_in_place {
                    // Keep walking, tracking the minimum.
                    let fwd = LinkMessage::BAllocate {
                        min_contexts: used.min(min_contexts),
                        min_pid: if used <= min_contexts { self.pid } else { min_pid },
                        size,
                        suspend,
                        completion_pid,
                        completion_reg,
                    };
                    if !self.send_link(fwd, chans, ctx) {
                        return Ok(ProcResult::Failed);
                    }
                } else {
                    // Allocate as a place of one, here or on the minimum.
                    let target = if used >= self.network.load_balance_threshold
                        && used > min_contexts
                    {
                        min_pid
                    } else {
                        self.pid
                    };
                    let rmsg = RemoteMessage::Allocate {
                        place_pid: target,
                        place_size: size,
                        suspend,
                        exclusive: false,
                        atype: AllocationType::Single,
                        completion_pid,
                        completion_reg,
                    };
                    if !self.send_remote_to(target, rmsg, chans, ctx) {
                        return Ok(ProcResult::Failed);
                    }
                }
            }
            LinkMessage::SetProperty { lfid, prop, value } => {
                self.set_family_property(lfid, prop, value, ctx);
                let link_next = self.families.get(lfid).link_next;
                if let Some(next) = link_next {
                    let fwd = LinkMessage::SetProperty {
                        lfid: next,
                        prop,
                        value,
                    };
                    if !self.send_link(fwd, chans, ctx) {
                        return Ok(ProcResult::Failed);
                    }
                }
            }
            LinkMessage::Create {
                lfid,
                num_cores,
                pc,
                regs,
            } => {
                if num_cores == 0 {
                    // Restriction cut the place short of this core: clean
                    // up the reserved context and pass it on.
                    let link_next = self.families.get(lfid).link_next;
                    if let Some(next) = link_next {
                        let fwd = LinkMessage::Create {
                            lfid: next,
                            num_cores: 0,
                            pc,
                            regs,
                        };
                        if !self.send_link(fwd, chans, ctx) {
                            return Ok(ProcResult::Failed);
                        }
                    }
                    self.release_context(lfid, ctx);
                } else if !self.allocator_queue_link_create(lfid, num_cores, pc, regs, chans, ctx)?
                {
                    return Ok(ProcResult::Failed);
                }
            }
            LinkMessage::Done { lfid } => {
                if !self.dec_family_dep(lfid, FamilyDep::PrevSynchronized, chans, ctx)? {
                    return Ok(ProcResult::Failed);
                }
            }
            LinkMessage::Sync {
                lfid,
                completion_pid,
                completion_reg,
            } => {
                if !self.on_sync(lfid, completion_pid, completion_reg, chans, ctx)? {
                    return Ok(ProcResult::Failed);
                }
            }
            LinkMessage::Detach { lfid } => {
                if !self.on_detach(lfid, chans, ctx)? {
                    return Ok(ProcResult::Failed);
                }
            }
            LinkMessage::Global { lfid, addr, value } => {
                if !self.write_family_register(
                    lfid,
                    RemoteRegKind::Global,
                    addr,
                    value,
                    chans,
                    ctx,
                )? {
                    return Ok(ProcResult::Failed);
                }
                let link_next = self.families.get(lfid).link_next;
                if let Some(next) = link_next {
                    let fwd = LinkMessage::Global {
                        lfid: next,
                        addr,
                        value,
                    };
                    if !self.send_link(fwd, chans, ctx) {
                        return Ok(ProcResult::Failed);
                    }
                }
            }
            LinkMessage::Break { lfid } => {
                if !self.on_break(lfid, chans, ctx)? {
                    return Ok(ProcResult::Failed);
                }
            }
        }
        chans.link_in[self.pid].clear(ctx);
        Ok(ProcResult::Success)
    }

    /// Handles one allocation response walking back along the place.
    pub fn do_alloc_response(
        &mut self,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<ProcResult, SimError> {
        let Some(mut msg) = chans.alloc_resp_in[self.pid].read().copied() else {
            return Ok(ProcResult::Delayed);
        };

        let lfid = msg.prev_lfid;
        let prev_prev = self.families.get(lfid).link_prev;

        // Cores in the place up to and including this one.
        let num_cores_here = self.pid % self.families.get(lfid).place_size + 1;
        if msg.num_cores == 0 && !msg.exact && num_cores_here.is_power_of_two() {
            // Unwound down to a power of two; commit this prefix.
            msg.num_cores = num_cores_here;
            debug!(core = self.pid, num_cores = num_cores_here, "unwind stops");
        }

        if msg.num_cores == 0 {
            // Still unwinding: release this core's context.
            if ctx.committing() {
                self.families.get_mut(lfid).link_next = None;
            }
            self.release_context(lfid, ctx);
        } else {
            if ctx.committing() {
                let family = self.families.get_mut(lfid);
                family.num_cores = msg.num_cores;
                family.link_next = msg.next_lfid;
            }
            msg.next_lfid = Some(lfid);
        }

        if let Some(prev) = prev_prev {
            // Keep walking backward.
            msg.prev_lfid = prev;
            if !self.send_alloc_response(msg, chans, ctx) {
                return Ok(ProcResult::Failed);
            }
        } else {
            // First core: acknowledge the allocation or report failure.
            let fid = if msg.num_cores == 0 {
                debug_assert!(msg.exact);
                Fid::FAILED
            } else {
                Fid {
                    pid: self.pid,
                    lfid,
                    capability: self.families.get(lfid).capability,
                }
            };
            let packed = self.fid_format.pack(fid);
            let reply = RemoteMessage::RawRegister {
                addr: RegAddr::new(RegType::Integer, msg.completion_reg),
                value: packed,
            };
            if !self.send_remote_to(msg.completion_pid, reply, chans, ctx) {
                return Ok(ProcResult::Failed);
            }
        }
        chans.alloc_resp_in[self.pid].clear(ctx);
        Ok(ProcResult::Success)
    }

    /// Delivers one queued family synchronization completion.
    pub fn do_syncs(&mut self, chans: &mut GridChannels, ctx: ProcCtx) -> ProcResult {
        let Some(info) = self.network.syncs.front().copied() else {
            return ProcResult::Delayed;
        };
        let msg = RemoteMessage::RawRegister {
            addr: RegAddr::new(RegType::Integer, info.reg),
            value: 0,
        };
        if !self.send_remote_to(info.pid, msg, chans, ctx) {
            return ProcResult::Failed;
        }
        self.network.syncs.pop(ctx);
        ProcResult::Success
    }

    /// Synchronization request: travels to the place's last core, then
    /// fires immediately or records the rendezvous.
    pub fn on_sync(
        &mut self,
        lfid: Lfid,
        completion_pid: Pid,
        completion_reg: RegIndex,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<bool, SimError> {
        let link_next = self.families.get(lfid).link_next;
        if let Some(next) = link_next {
            let fwd = LinkMessage::Sync {
                lfid: next,
                completion_pid,
                completion_reg,
            };
            return Ok(self.send_link(fwd, chans, ctx));
        }
        if self.families.get(lfid).sync.done {
            // Already terminated; deliver at once.
            return Ok(self.network.syncs.push(
                SyncInfo {
                    pid: completion_pid,
                    reg: completion_reg,
                },
                ctx,
            ));
        }
        if ctx.committing() {
            let family = self.families.get_mut(lfid);
            family.sync.pid = Some(completion_pid);
            family.sync.reg = Some(completion_reg);
        }
        Ok(true)
    }

    /// Detach: resolves the detach dependency on every core of the place.
    pub fn on_detach(
        &mut self,
        lfid: Lfid,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<bool, SimError> {
        let link_next = self.families.get(lfid).link_next;
        if let Some(next) = link_next {
            if !self.send_link(LinkMessage::Detach { lfid: next }, chans, ctx) {
                return Ok(false);
            }
        }
        self.dec_family_dep(lfid, FamilyDep::Detached, chans, ctx)
    }

    /// Break: stop allocating new threads on every core of the place;
    /// running threads finish naturally.
    pub fn on_break(
        &mut self,
        lfid: Lfid,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<bool, SimError> {
        if self.families.get(lfid).state == super::family_table::FamilyState::Empty {
            // A late break: the family already terminated and was
            // reclaimed. Nothing left to stop.
            return Ok(true);
        }
        let link_next = self.families.get(lfid).link_next;
        if let Some(next) = link_next {
            if !self.send_link(LinkMessage::Break { lfid: next }, chans, ctx) {
                return Ok(false);
            }
        }
        if !self.families.get(lfid).deps.allocation_done {
            if ctx.committing() {
                self.families.get_mut(lfid).nthreads = 0;
            }
            return self.dec_family_dep(lfid, FamilyDep::AllocationDone, chans, ctx);
        }
        Ok(true)
    }

    /// Applies a family property update.
    pub fn set_family_property(
        &mut self,
        lfid: Lfid,
        prop: FamilyProperty,
        value: u64,
        ctx: ProcCtx,
    ) {
        if ctx.committing() {
            let family = self.families.get_mut(lfid);
            match prop {
                FamilyProperty::Start => family.start = value as i64,
                FamilyProperty::Limit => family.limit = value as i64,
                FamilyProperty::Step => family.step = value as i64,
                FamilyProperty::BlockSize => family.virt_block_size = value,
            }
        }
    }

    /// Reads the last allocated thread's shared register, forwarding the
    /// value to the remote consumer now or when it is produced.
    pub fn read_last_shared(
        &mut self,
        lfid: Lfid,
        addr: RegAddr,
        target: RemoteWaiter,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<bool, SimError> {
        let family = self.families.get(lfid);
        let regs = family.regs[addr.rtype];
        let Some(last_shareds) = regs.last_shareds else {
            return Err(SimError::InvalidRegister {
                class: "shared",
                index: addr.index,
                pc: family.pc,
                tid: 0,
            });
        };
        if addr.index >= regs.count.shareds {
            return Err(SimError::InvalidRegister {
                class: "shared",
                index: addr.index,
                pc: family.pc,
                tid: 0,
            });
        }
        let phys = RegAddr::new(addr.rtype, last_shareds + addr.index);
        let current = *self.regfile.read(phys)?;
        if current.state == super::regfile::RegState::Full {
            let reply = RemoteMessage::RawRegister {
                addr: target.reg,
                value: current.value,
            };
            return Ok(self.send_remote_to(target.pid, reply, chans, ctx));
        }
        // Not produced yet: leave a remote waiter on the register.
        if ctx.committing() {
            if let Ok(reg) = self.regfile.get_mut(phys) {
                reg.remote = Some(target);
            }
        }
        Ok(true)
    }

    /// Writes into a family's register window from the network.
    pub fn write_family_register(
        &mut self,
        lfid: Lfid,
        kind: RemoteRegKind,
        addr: RegAddr,
        value: u64,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<bool, SimError> {
        let family = self.families.get(lfid);
        let regs = family.regs[addr.rtype];
        let (base, window) = match kind {
            RemoteRegKind::Global => (
                regs.base.map(|b| b + regs.size - regs.count.globals),
                regs.count.globals,
            ),
            RemoteRegKind::FirstDependent => (regs.base, regs.count.shareds),
            RemoteRegKind::LastShared => (regs.last_shareds, regs.count.shareds),
        };
        let Some(base) = base else {
            return Err(SimError::InvalidRegister {
                class: "remote",
                index: addr.index,
                pc: family.pc,
                tid: 0,
            });
        };
        if addr.index >= window {
            return Err(SimError::InvalidRegister {
                class: "remote",
                index: addr.index,
                pc: family.pc,
                tid: 0,
            });
        }
        let phys = RegAddr::new(addr.rtype, base + addr.index);
        if !self.regfile.p_async_w.invoke(ctx) {
            return Ok(false);
        }
        self.write_register(phys, RegValue::full(value), false, chans, ctx)
    }
}
