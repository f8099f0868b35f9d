//! Cycle counter, ready-set management, and deadlock accounting.
//!
//! The scheduler owns the global clock and the state of every registered
//! process. The driving loop (in `sim::simulator`) asks for the runnable
//! set, dispatches each process in both phases, reports results back, and
//! advances the cycle. Readiness is recomputed from scratch at the end of
//! every cycle by the storage update sweep: a process is ready exactly when
//! one of its sensitive storages holds work.

use tracing::trace;

use super::process::{Phase, ProcCtx, ProcResult, ProcessId, ProcessState};
use crate::common::{CycleNo, SimError};

/// Default number of progress-free cycles before a deadlock is declared.
pub const DEFAULT_DEADLOCK_THRESHOLD: CycleNo = 1000;

#[derive(Debug)]
struct ProcEntry {
    name: String,
    state: ProcessState,
}

/// The global clock and process registry.
#[derive(Debug)]
pub struct Scheduler {
    cycle: CycleNo,
    procs: Vec<ProcEntry>,
    ready: Vec<bool>,
    last_progress: CycleNo,
    deadlock_threshold: CycleNo,
}

impl Scheduler {
    /// Creates a scheduler with the given deadlock threshold.
    pub fn new(deadlock_threshold: CycleNo) -> Self {
        Self {
            cycle: 0,
            procs: Vec::new(),
            ready: Vec::new(),
            last_progress: 0,
            deadlock_threshold,
        }
    }

    /// Registers a named process and returns its id.
    pub fn register(&mut self, name: impl Into<String>) -> ProcessId {
        let pid = self.procs.len();
        self.procs.push(ProcEntry {
            name: name.into(),
            state: ProcessState::Idle,
        });
        self.ready.push(false);
        pid
    }

    /// Current cycle number.
    pub fn cycle(&self) -> CycleNo {
        self.cycle
    }

    /// Builds the per-step context for one process in one phase.
    pub fn ctx(&self, phase: Phase, pid: ProcessId) -> ProcCtx {
        ProcCtx {
            phase,
            cycle: self.cycle,
            pid,
        }
    }

    /// The processes that run this cycle, in registration order.
    ///
    /// Registration order is fixed at construction, so the visit order is
    /// deterministic and independent of prior cycles.
    pub fn runnable(&self) -> Vec<ProcessId> {
        (0..self.procs.len()).filter(|&p| self.ready[p]).collect()
    }

    /// True when no process has pending work: the simulation is finished.
    pub fn all_idle(&self) -> bool {
        self.ready.iter().all(|r| !r)
    }

    /// Marks a process ready for the next cycle.
    ///
    /// Called by the storage update sweep for every storage holding work.
    pub fn wake(&mut self, pid: ProcessId) {
        self.ready[pid] = true;
    }

    /// Clears the ready set before the update sweep recomputes it.
    pub fn clear_ready(&mut self) {
        for r in &mut self.ready {
            *r = false;
        }
        for p in &mut self.procs {
            p.state = ProcessState::Idle;
        }
    }

    /// Records the commit-phase result of one process step.
    pub fn record(&mut self, pid: ProcessId, result: ProcResult) {
        self.procs[pid].state = match result {
            ProcResult::Success => {
                self.last_progress = self.cycle;
                ProcessState::Ready
            }
            ProcResult::Delayed => ProcessState::Ready,
            ProcResult::Failed => {
                trace!(cycle = self.cycle, process = %self.procs[pid].name, "stalled");
                ProcessState::Stalled
            }
        };
    }

    /// Advances the clock, checking the deadlock threshold.
    ///
    /// Returns an error when runnable work exists but nothing has committed
    /// progress for the threshold number of cycles.
    pub fn advance(&mut self) -> Result<(), SimError> {
        self.cycle += 1;
        if !self.all_idle() && self.cycle - self.last_progress > self.deadlock_threshold {
            return Err(SimError::Deadlock {
                cycle: self.cycle,
                dump: self.dump(),
            });
        }
        Ok(())
    }

    /// Per-process state dump used in deadlock diagnostics.
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        for (i, p) in self.procs.iter().enumerate() {
            if p.state != ProcessState::Idle || self.ready[i] {
                let _ = writeln!(out, "  {:<40} {:?}", p.name, p.state);
            }
        }
        out
    }
}
