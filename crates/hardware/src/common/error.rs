//! Fatal simulation errors.
//!
//! Resource contention (arbitration lost, buffer full, port busy) never
//! surfaces here; processes report it by returning `Failed` and retrying the
//! next cycle. Everything in this module aborts the simulated program:
//! 1. **Programmer errors:** illegal instructions, capability mismatches,
//!    register window violations.
//! 2. **Deadlock:** no process made progress for the configured threshold.
//! 3. **Host errors:** malformed configuration at startup.

use thiserror::Error;

use super::ids::{Lfid, MemAddr, Pid, RegAddr, Tid};

/// A fatal simulation error, carrying the context of the offending
/// instruction where one exists.
#[derive(Debug, Error)]
pub enum SimError {
    /// The instruction word could not be decoded.
    #[error("illegal instruction {instr:#010x} at pc {pc:#x} (T{tid} in F{fid})")]
    IllegalInstruction {
        /// Program counter of the offending instruction.
        pc: MemAddr,
        /// The raw instruction word.
        instr: u32,
        /// Thread executing the instruction.
        tid: Tid,
        /// Family the thread belongs to.
        fid: Lfid,
    },

    /// A family was referenced with a mismatching capability.
    #[error("invalid family reference: capability mismatch for F{lfid} on core {pid}")]
    InvalidFid {
        /// Core holding the family table entry.
        pid: Pid,
        /// The referenced family slot.
        lfid: Lfid,
    },

    /// A register specifier fell outside the thread's register window.
    #[error("register specifier out of range: class {class} index {index} at pc {pc:#x} (T{tid})")]
    InvalidRegister {
        /// Register class name (global, shared, local, dependent).
        class: &'static str,
        /// The out-of-range window index.
        index: usize,
        /// Program counter of the offending instruction.
        pc: MemAddr,
        /// Thread executing the instruction.
        tid: Tid,
    },

    /// An access addressed a register that does not exist in the bank.
    #[error("access to non-existing register {addr}")]
    NonExistingRegister {
        /// The physical register address.
        addr: RegAddr,
    },

    /// A value write targeted a register whose memory fill is in flight.
    #[error("writing to a memory-load destination register {addr}")]
    PendingOverwrite {
        /// The contested register.
        addr: RegAddr,
    },

    /// A register with suspended threads was reset to empty.
    #[error("resetting a waiting register {addr}")]
    WaitingReset {
        /// The contested register.
        addr: RegAddr,
    },

    /// The control word before the thread entry point declared more
    /// registers than a window can hold.
    #[error("too many registers specified in thread body at {pc:#x}: {globals}g {shareds}s {locals}l")]
    RegisterCountOverflow {
        /// Entry PC of the family.
        pc: MemAddr,
        /// Declared global count.
        globals: usize,
        /// Declared shared count.
        shareds: usize,
        /// Declared local count.
        locals: usize,
    },

    /// A memory access fell outside every reserved range.
    #[error("access violation at {addr:#x} ({size} bytes) from pc {pc:#x} (T{tid})")]
    AccessViolation {
        /// The faulting address.
        addr: MemAddr,
        /// Access size in bytes.
        size: usize,
        /// Program counter of the access.
        pc: MemAddr,
        /// Thread issuing the access.
        tid: Tid,
    },

    /// A family was created with a zero step.
    #[error("family step cannot be zero (F{fid} at pc {pc:#x})")]
    ZeroStep {
        /// The family being created.
        fid: Lfid,
        /// Entry PC of the family.
        pc: MemAddr,
    },

    /// No process made progress for the deadlock threshold.
    #[error("deadlock detected at cycle {cycle}:\n{dump}")]
    Deadlock {
        /// Cycle at which the deadlock was declared.
        cycle: u64,
        /// Per-process state dump.
        dump: String,
    },

    /// The configuration was rejected at construction.
    #[error("configuration error: {0}")]
    Config(String),
}
