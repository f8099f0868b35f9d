//! Process identity, phases, and step results.
//!
//! A process is a named callback owned by a component. The scheduler assigns
//! each one a dense [`ProcessId`] at registration; storages use that id to
//! wake their sensitive process, and arbitrators use it to identify
//! requesters. The two-phase execution model is made explicit here: every
//! process step receives a [`ProcCtx`] naming the current phase, and a
//! commit block is simply `if ctx.committing() { .. }`.

use crate::common::CycleNo;

/// Dense process identifier assigned by the scheduler at registration.
pub type ProcessId = usize;

/// The phases of one simulated cycle.
///
/// During `Acquire`, processes run speculatively: shared-resource requests
/// are collected and no side effects are applied. The commit half runs
/// twice: a `Check` pass with arbitration decided but nothing applied,
/// which determines whether the process can complete at all, and a final
/// `Commit` pass, run only for processes that passed the check, in which
/// side effects actually take place. Splitting the decision from the
/// application keeps a process that stalls halfway from leaving partial
/// state behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Speculative pass: collect requests, apply nothing.
    Acquire,
    /// Deciding pass: arbitration is known, still nothing applied.
    Check,
    /// Applying pass: winners apply their side effects.
    Commit,
}

/// Result of one process step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcResult {
    /// The process made progress; it stays ready while input remains.
    Success,
    /// No progress this cycle, but the process is waiting, not stuck.
    Delayed,
    /// Lost a resource this cycle; retry next cycle with no state change.
    Failed,
}

/// Externally visible state of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// No sensitive storage holds work for this process.
    Idle,
    /// Work is pending; the process runs this cycle.
    Ready,
    /// Currently executing a step.
    Running,
    /// Returned [`ProcResult::Failed`] on its last step.
    Stalled,
}

/// Per-step context handed to every process invocation.
///
/// Carries the phase, the cycle number (used by storages and arbitrators to
/// reset per-cycle staging), and the identity of the running process (used
/// when invoking arbitrated services).
#[derive(Clone, Copy, Debug)]
pub struct ProcCtx {
    /// Current phase of the cycle.
    pub phase: Phase,
    /// Current cycle number.
    pub cycle: CycleNo,
    /// The process currently executing.
    pub pid: ProcessId,
}

impl ProcCtx {
    /// True when side effects must be applied.
    #[inline]
    pub fn committing(&self) -> bool {
        self.phase == Phase::Commit
    }
}
