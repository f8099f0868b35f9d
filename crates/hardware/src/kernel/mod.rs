//! Discrete-event kernel: clock, two-phase scheduler, arbitration, storage.
//!
//! Every hardware block in the simulator advances through this kernel. It
//! provides:
//! 1. **Processes:** named per-component callbacks with `Idle`, `Ready`,
//!    `Running`, and `Stalled` states, woken by the storages they are
//!    sensitive to.
//! 2. **Two-Phase Cycles:** every runnable process executes twice per cycle,
//!    once to acquire shared resources and once to commit side effects; the
//!    phase is threaded explicitly through [`ProcCtx`].
//! 3. **Arbitration:** at most one process per cycle wins each shared
//!    resource, with static or rotating priorities.
//! 4. **Storage Primitives:** registers, FIFO buffers, flags, and linked
//!    thread lists that stage mutations during the commit pass and publish
//!    them at the end of the cycle.

/// Arbitrated access to shared resources.
pub mod arbitrator;

/// Process identity, phases, and step results.
pub mod process;

/// Cycle counter, ready-set management, and deadlock accounting.
pub mod scheduler;

/// Buffered storage primitives with process sensitivity.
pub mod storage;

pub use arbitrator::Arbitrator;
pub use process::{Phase, ProcCtx, ProcResult, ProcessId, ProcessState};
pub use scheduler::Scheduler;
pub use storage::{Buffer, Flag, LinkArena, Register, ThreadList};
