//! Inter-stage latch records.
//!
//! Every latch carries the identity of the instruction flowing through it
//! (thread, family, PC) plus the control bits decided at fetch: `swch`
//! requests a thread switch after the instruction, `kill` ends the thread.

use crate::common::{Cid, Lfid, MemAddr, PerType, RegAddr, Tid};
use crate::core::family_table::RegInfo;
use crate::core::regfile::MemFill;
use crate::core::thread_table::ThreadRegs;
use crate::isa::Instr;

/// Identity and control bits shared by all latches.
#[derive(Clone, Copy, Debug, Default)]
pub struct LatchCommon {
    /// Executing thread.
    pub tid: Tid,
    /// The thread's family.
    pub lfid: Lfid,
    /// PC of the instruction.
    pub pc: MemAddr,
    /// Switch threads after this instruction.
    pub swch: bool,
    /// The thread ends after this instruction.
    pub kill: bool,
}

/// Fetch output: the raw instruction and the window description needed to
/// translate its register specifiers.
#[derive(Clone, Debug)]
pub struct FetchDecodeLatch {
    /// Identity and control bits.
    pub common: LatchCommon,
    /// Raw instruction word.
    pub instr: u32,
    /// Family register plan per type.
    pub fam_regs: PerType<RegInfo>,
    /// Thread window bases per type.
    pub thread_regs: PerType<ThreadRegs>,
}

/// Decode output: the decoded operation with physical register addresses.
#[derive(Clone, Debug)]
pub struct DecodeReadLatch {
    /// Identity and control bits.
    pub common: LatchCommon,
    /// Decoded operation.
    pub instr: Instr,
    /// First source operand.
    pub ra: Option<RegAddr>,
    /// Second source operand.
    pub rb: Option<RegAddr>,
    /// Destination register.
    pub rc: Option<RegAddr>,
}

/// Read output: operands resolved to values.
#[derive(Clone, Debug)]
pub struct ReadExecuteLatch {
    /// Identity and control bits.
    pub common: LatchCommon,
    /// Decoded operation.
    pub instr: Instr,
    /// First operand value.
    pub rav: u64,
    /// Second operand value.
    pub rbv: u64,
    /// Destination register.
    pub rc: Option<RegAddr>,
}

/// Memory operation decided by execute.
#[derive(Clone, Copy, Debug, Default)]
pub enum MemoryOp {
    /// No memory access.
    #[default]
    None,
    /// Load into the destination register.
    Load {
        /// Byte address.
        addr: MemAddr,
        /// Access size in bytes.
        size: usize,
        /// Sign-extend the loaded value.
        sign: bool,
    },
    /// Store from the value operand.
    Store {
        /// Byte address.
        addr: MemAddr,
        /// Access size in bytes.
        size: usize,
        /// Value to store.
        value: u64,
    },
}

/// Value headed for writeback.
#[derive(Clone, Copy, Debug, Default)]
pub enum WbValue {
    /// Nothing to write.
    #[default]
    None,
    /// A completed value.
    Full(u64),
    /// Clear the destination; an asynchronous writer will fill it.
    Empty,
    /// A load in flight; the destination becomes memory-pending.
    Pending(MemFill),
}

/// Execute output.
#[derive(Clone, Debug)]
pub struct ExecuteMemoryLatch {
    /// Identity and control bits.
    pub common: LatchCommon,
    /// Memory access to perform, if any.
    pub op: MemoryOp,
    /// Destination register.
    pub rc: Option<RegAddr>,
    /// Value computed by execute (for non-memory operations).
    pub rcv: WbValue,
}

/// Memory output.
#[derive(Clone, Debug)]
pub struct MemoryWritebackLatch {
    /// Identity and control bits.
    pub common: LatchCommon,
    /// Destination register.
    pub rc: Option<RegAddr>,
    /// Value to write back.
    pub rcv: WbValue,
}

/// Fetch stage bookkeeping: the running thread and its line buffer.
#[derive(Clone, Debug, Default)]
pub struct FetchState {
    /// A switch is pending; pop the next active thread.
    pub switched: bool,
    /// Running thread, if any.
    pub tid: Option<Tid>,
    /// The running thread's family.
    pub lfid: Lfid,
    /// Next PC to fetch.
    pub pc: MemAddr,
    /// Held instruction cache slot.
    pub cid: Cid,
    /// Copy of the cache line.
    pub line: Vec<u8>,
    /// Control word of the current control block.
    pub control: u32,
    /// Family register plan snapshot.
    pub fam_regs: PerType<RegInfo>,
    /// Thread window snapshot.
    pub thread_regs: PerType<ThreadRegs>,
}

impl FetchState {
    /// Resets to the switched state with no running thread.
    pub fn reset(&mut self) {
        self.switched = true;
        self.tid = None;
    }
}
