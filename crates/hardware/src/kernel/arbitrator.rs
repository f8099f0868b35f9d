//! Arbitrated access to shared resources.
//!
//! Every multi-client storage and every register file port is guarded by an
//! [`Arbitrator`]. During the acquire phase each participating process
//! records a request; on the first commit-phase invocation the winner is
//! decided and every requester learns whether it was granted. A cyclic
//! arbitrator rotates priorities after each grant for fairness.

use super::process::{Phase, ProcCtx, ProcessId};
use crate::common::CycleNo;

/// An arbitrated service guarding one shared resource.
///
/// Participating processes are listed in priority order at construction
/// time. `invoke` must be called in both phases with identical arguments;
/// it returns `true` during acquire (request recorded) and, during commit,
/// `true` only for the winning process.
#[derive(Debug)]
pub struct Arbitrator {
    name: &'static str,
    processes: Vec<ProcessId>,
    cyclic: bool,
    offset: usize,
    stamp: Option<(CycleNo, Phase)>,
    requests: Vec<ProcessId>,
    winner: Option<ProcessId>,
}

impl Arbitrator {
    /// Creates a fixed-priority arbitrator.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            processes: Vec::new(),
            cyclic: false,
            offset: 0,
            stamp: None,
            requests: Vec::new(),
            winner: None,
        }
    }

    /// Creates an arbitrator that rotates priorities after each grant.
    pub fn new_cyclic(name: &'static str) -> Self {
        Self {
            cyclic: true,
            ..Self::new(name)
        }
    }

    /// Registers a participating process. Earlier registrations win ties.
    pub fn add_process(&mut self, pid: ProcessId) {
        debug_assert!(!self.processes.contains(&pid), "{}: duplicate process", self.name);
        self.processes.push(pid);
    }

    /// Resets per-cycle staging when a new cycle or phase begins.
    fn touch(&mut self, ctx: ProcCtx) {
        if self.stamp != Some((ctx.cycle, ctx.phase)) {
            // Requests recorded during acquire carry over into commit;
            // a fresh cycle discards them.
            if self.stamp.map(|(c, _)| c) != Some(ctx.cycle) {
                self.requests.clear();
                self.winner = None;
            }
            self.stamp = Some((ctx.cycle, ctx.phase));
        }
    }

    /// Requests (acquire) or tests (commit) access to the resource.
    pub fn invoke(&mut self, ctx: ProcCtx) -> bool {
        self.touch(ctx);
        debug_assert!(
            self.processes.contains(&ctx.pid),
            "{}: process {} is not registered",
            self.name,
            ctx.pid
        );
        match ctx.phase {
            Phase::Acquire => {
                if !self.requests.contains(&ctx.pid) {
                    self.requests.push(ctx.pid);
                }
                true
            }
            Phase::Check | Phase::Commit => {
                if self.winner.is_none() {
                    self.winner = self.arbitrate();
                }
                self.winner == Some(ctx.pid)
            }
        }
    }

    /// Picks the highest-priority requester, honoring the rotation offset.
    fn arbitrate(&mut self) -> Option<ProcessId> {
        let n = self.processes.len();
        let winner = (0..n)
            .map(|i| (i + self.offset) % n)
            .map(|i| self.processes[i])
            .find(|p| self.requests.contains(p));
        if self.cyclic {
            if let Some(w) = winner {
                // Rotate so the winner has lowest priority next cycle.
                let pos = self.processes.iter().position(|&p| p == w).unwrap_or(0);
                self.offset = (pos + 1) % n;
            }
        }
        winner
    }
}
