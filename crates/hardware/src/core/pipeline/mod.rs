//! Six-stage in-order pipeline.
//!
//! Fetch, decode, read, execute, memory, and writeback communicate through
//! single-entry latches. Each cycle the stages run in reverse order so a
//! stage only advances into a latch its successor has just drained:
//! 1. **Stall:** a stalled stage blocks every earlier stage.
//! 2. **Flush:** a flushing stage (thread suspension, thread end) clears
//!    the earlier latches belonging to the same thread and tells fetch to
//!    switch.
//! 3. **Delay:** the stage keeps its input latch but surrenders the cycle.
//!
//! The writeback latch is additionally captured at the start of the cycle
//! as a bypass source for the read stage, standing in for the value the
//! concurrently retiring instruction is writing.

/// Decode stage.
pub mod decode;
/// Execute stage.
pub mod execute;
/// Fetch stage.
pub mod fetch;
/// Inter-stage latch records.
pub mod latches;
/// Memory stage.
pub mod memory;
/// Read stage.
pub mod read;
/// Writeback stage.
pub mod writeback;

use crate::common::SimError;
use crate::kernel::{Phase, ProcCtx, ProcResult, ProcessId};
use crate::mem::traits::Memory;

use self::latches::{
    DecodeReadLatch, ExecuteMemoryLatch, FetchDecodeLatch, FetchState, MemoryWritebackLatch,
};
use super::fpu::Fpu;
use super::network::GridChannels;
use super::Core;

/// Verdict of one stage for one cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeAction {
    /// Nothing to do.
    Idle,
    /// Input consumed, output produced.
    Success,
    /// Input kept; the cycle is surrendered.
    Delay,
    /// Blocked on a resource; earlier stages must not advance.
    Stall,
    /// Input consumed with no output; earlier same-thread latches die.
    Flush,
}

/// Pipeline state owned by one core.
#[derive(Debug, Default)]
pub struct Pipeline {
    /// Fetch output.
    pub fd: Option<FetchDecodeLatch>,
    /// Decode output.
    pub dr: Option<DecodeReadLatch>,
    /// Read output.
    pub re: Option<latches::ReadExecuteLatch>,
    /// Execute output.
    pub em: Option<ExecuteMemoryLatch>,
    /// Memory output.
    pub mw: Option<MemoryWritebackLatch>,
    /// Copy of the writeback input captured at cycle start, used as the
    /// retiring-instruction bypass.
    pub mw_bypass: Option<MemoryWritebackLatch>,
    /// Fetch stage bookkeeping.
    pub fetch: FetchState,
    /// The pipeline process.
    pub proc_pipeline: ProcessId,
    /// Retired instruction count.
    pub instructions: u64,
    /// Pipeline flushes taken.
    pub flushes: u64,
}

impl Pipeline {
    /// Creates an idle pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no latch holds an instruction.
    pub fn is_idle(&self) -> bool {
        self.fd.is_none()
            && self.dr.is_none()
            && self.re.is_none()
            && self.em.is_none()
            && self.mw.is_none()
    }
}

impl Core {
    /// Runs the whole pipeline for one phase.
    pub fn do_pipeline(
        &mut self,
        chans: &mut GridChannels,
        mem: &mut dyn Memory,
        fpu: &mut Fpu,
        ctx: ProcCtx,
    ) -> Result<ProcResult, SimError> {
        if ctx.phase == Phase::Acquire {
            // Capture the retiring instruction for the read-stage bypass.
            self.pipeline.mw_bypass = self.pipeline.mw.clone();
        }

        let mut progress = false;
        let mut blocked = false;
        let mut failed = false;

        // Writeback.
        if self.pipeline.mw.is_some() {
            match self.stage_writeback(chans, ctx)? {
                PipeAction::Stall => failed = true,
                PipeAction::Delay => blocked = true,
                action => {
                    progress = true;
                    if ctx.committing() {
                        self.pipeline.mw = None;
                        if action != PipeAction::Flush {
                            self.pipeline.instructions += 1;
                        }
                    }
                }
            }
        }

        // Memory.
        if !failed && !blocked && self.pipeline.em.is_some() {
            match self.stage_memory(mem, ctx)? {
                PipeAction::Stall => failed = true,
                PipeAction::Delay => blocked = true,
                _ => {
                    progress = true;
                    if ctx.committing() {
                        self.pipeline.em = None;
                    }
                }
            }
        }

        // Execute.
        if !failed && !blocked && self.pipeline.re.is_some() {
            match self.stage_execute(chans, fpu, ctx)? {
                PipeAction::Stall => failed = true,
                PipeAction::Delay => blocked = true,
                PipeAction::Flush => {
                    progress = true;
                    self.flush_before_execute(ctx);
                    if ctx.committing() {
                        self.pipeline.re = None;
                        self.pipeline.flushes += 1;
                    }
                }
                _ => {
                    progress = true;
                    if ctx.committing() {
                        self.pipeline.re = None;
                    }
                }
            }
        }

        // Read.
        if !failed && !blocked && self.pipeline.dr.is_some() {
            match self.stage_read(ctx)? {
                PipeAction::Stall => failed = true,
                PipeAction::Delay => blocked = true,
                PipeAction::Flush => {
                    progress = true;
                    self.flush_before_read(ctx);
                    if ctx.committing() {
                        self.pipeline.dr = None;
                        self.pipeline.flushes += 1;
                    }
                }
                _ => {
                    progress = true;
                    if ctx.committing() {
                        self.pipeline.dr = None;
                    }
                }
            }
        }

        // Decode.
        if !failed && !blocked && self.pipeline.fd.is_some() {
            match self.stage_decode(ctx)? {
                PipeAction::Stall => failed = true,
                PipeAction::Delay => blocked = true,
                _ => {
                    progress = true;
                    if ctx.committing() {
                        self.pipeline.fd = None;
                    }
                }
            }
        }

        // Fetch.
        if !failed && !blocked && self.pipeline.fd.is_none() {
            match self.stage_fetch(ctx) {
                PipeAction::Stall => failed = true,
                PipeAction::Idle | PipeAction::Delay => {}
                _ => progress = true,
            }
        }

        if failed && !progress {
            return Ok(ProcResult::Failed);
        }
        Ok(if progress {
            ProcResult::Success
        } else {
            ProcResult::Delayed
        })
    }

    /// Kills the latches before the execute stage that belong to the
    /// flushing thread, and resets fetch.
    fn flush_before_execute(&mut self, ctx: ProcCtx) {
        let Some(tid) = self.pipeline.re.as_ref().map(|l| l.common.tid) else {
            return;
        };
        if ctx.committing() {
            if self.pipeline.dr.as_ref().is_some_and(|l| l.common.tid == tid) {
                self.pipeline.dr = None;
            }
            if self.pipeline.fd.as_ref().is_some_and(|l| l.common.tid == tid) {
                self.pipeline.fd = None;
            }
        }
        self.fetch_clear(tid, ctx);
    }

    /// Kills the latches before the read stage that belong to the
    /// flushing thread, and resets fetch.
    fn flush_before_read(&mut self, ctx: ProcCtx) {
        let Some(tid) = self.pipeline.dr.as_ref().map(|l| l.common.tid) else {
            return;
        };
        if ctx.committing() {
            if self.pipeline.fd.as_ref().is_some_and(|l| l.common.tid == tid) {
                self.pipeline.fd = None;
            }
        }
        self.fetch_clear(tid, ctx);
    }
}
