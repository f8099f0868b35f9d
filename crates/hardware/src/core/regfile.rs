//! Register file: two banks of synchronizing registers per core.
//!
//! Every register is a synchronization point. Besides a payload it carries
//! a state: `Full` (value present), `Empty` (nothing pending), `Pending`
//! (a memory fill is in flight), or `Waiting` (threads are suspended on
//! it). Empty and pending registers remember fill metadata and a possible
//! remote consumer; waiting registers head a queue of suspended threads.
//! Ports are arbitrated: the pipeline writeback and the asynchronous
//! writers (memory, FPU, network) compete per cycle.

use crate::common::{Cid, Pid, PerType, RegAddr, RegIndex, RegType, SimError, Tid};
use crate::kernel::{Arbitrator, ProcCtx};

/// Synchronization state of one register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RegState {
    /// No value and nothing pending.
    #[default]
    Empty,
    /// A memory fill is in flight toward this register.
    Pending,
    /// Threads are suspended waiting on this register.
    Waiting,
    /// A value is present.
    Full,
}

/// Memory fill metadata attached to a pending register.
#[derive(Clone, Copy, Debug)]
pub struct MemFill {
    /// Cache line slot the fill arrives on.
    pub cid: Cid,
    /// Byte offset of the loaded value within the line.
    pub offset: usize,
    /// Size of the loaded value in bytes.
    pub size: usize,
    /// Sign-extend the loaded value.
    pub sign_extend: bool,
    /// Owning family, for pending-read accounting.
    pub fid: crate::common::Lfid,
    /// Next register waiting on the same line.
    pub next: Option<RegAddr>,
}

/// A remote register consuming this register's value once written.
#[derive(Clone, Copy, Debug)]
pub struct RemoteWaiter {
    /// Core to deliver to.
    pub pid: Pid,
    /// Register to deliver into.
    pub reg: RegAddr,
}

/// Contents of one register.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegValue {
    /// Synchronization state.
    pub state: RegState,
    /// Payload; floating-point registers store raw bits.
    pub value: u64,
    /// Suspended thread queue (head, tail) while `Waiting`.
    pub waiting: Option<(Tid, Tid)>,
    /// Fill metadata while a memory load is in flight.
    pub memory: Option<MemFill>,
    /// Remote consumer to forward the value to.
    pub remote: Option<RemoteWaiter>,
}

impl RegValue {
    /// A full register holding `value`.
    pub fn full(value: u64) -> Self {
        Self {
            state: RegState::Full,
            value,
            ..Self::default()
        }
    }
}

/// The per-core register file.
#[derive(Debug)]
pub struct RegisterFile {
    banks: PerType<Vec<RegValue>>,
    /// Write port of the pipeline writeback stage.
    pub p_pipeline_w: Arbitrator,
    /// Write port shared by memory, FPU, and network writers.
    pub p_async_w: Arbitrator,
}

impl RegisterFile {
    /// Creates a register file with the given bank sizes.
    pub fn new(num_integers: usize, num_floats: usize) -> Self {
        Self {
            banks: PerType([
                vec![RegValue::default(); num_integers],
                vec![RegValue::default(); num_floats],
            ]),
            p_pipeline_w: Arbitrator::new("regfile.p_pipeline_w"),
            p_async_w: Arbitrator::new_cyclic("regfile.p_async_w"),
        }
    }

    /// Size of one bank.
    pub fn size(&self, rtype: RegType) -> usize {
        self.banks[rtype].len()
    }

    /// Reads a register.
    pub fn read(&self, addr: RegAddr) -> Result<&RegValue, SimError> {
        self.banks[addr.rtype]
            .get(addr.index)
            .ok_or(SimError::NonExistingRegister { addr })
    }

    /// Mutably accesses a register.
    pub fn get_mut(&mut self, addr: RegAddr) -> Result<&mut RegValue, SimError> {
        self.banks[addr.rtype]
            .get_mut(addr.index)
            .ok_or(SimError::NonExistingRegister { addr })
    }

    /// Unconditionally replaces a register. Administrative writes only;
    /// behavioral writes go through the core so waiters are reactivated.
    pub fn write_raw(&mut self, addr: RegAddr, value: RegValue) -> Result<(), SimError> {
        *self.get_mut(addr)? = value;
        Ok(())
    }

    /// Resets `size` registers starting at `addr` to empty.
    pub fn clear(&mut self, addr: RegAddr, size: usize, ctx: ProcCtx) -> Result<(), SimError> {
        if addr.index + size > self.banks[addr.rtype].len() {
            return Err(SimError::NonExistingRegister {
                addr: RegAddr::new(addr.rtype, addr.index + size - 1),
            });
        }
        if ctx.committing() {
            for i in 0..size {
                self.banks[addr.rtype][addr.index + i] = RegValue::default();
            }
        }
        Ok(())
    }

    /// Iterates one bank (diagnostics and tests).
    pub fn bank(&self, rtype: RegType) -> &[RegValue] {
        &self.banks[rtype]
    }

    /// First index of a bank range, bounds-checked.
    pub fn check_range(&self, rtype: RegType, base: RegIndex, size: usize) -> Result<(), SimError> {
        if base + size > self.banks[rtype].len() {
            return Err(SimError::NonExistingRegister {
                addr: RegAddr::new(rtype, base + size.saturating_sub(1)),
            });
        }
        Ok(())
    }
}
