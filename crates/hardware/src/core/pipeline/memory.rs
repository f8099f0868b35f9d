//! Memory stage.
//!
//! Issues loads and stores to the data cache. A load hit completes in
//! place; a miss leaves the destination register memory-pending and
//! increments the family's outstanding read count. Stores go write-through
//! and raise the thread's outstanding write count until the coherence
//! protocol confirms them.

use crate::common::SimError;
use crate::kernel::ProcCtx;
use crate::mem::traits::Memory;

use super::latches::{MemoryOp, MemoryWritebackLatch, WbValue};
use super::PipeAction;
use crate::core::dcache::DRead;
use crate::core::regfile::MemFill;
use crate::core::{Core, ThreadDep};

impl Core {
    /// Runs the memory stage for one phase.
    pub fn stage_memory(
        &mut self,
        mem: &mut dyn Memory,
        ctx: ProcCtx,
    ) -> Result<PipeAction, SimError> {
        let Some(input) = self.pipeline.em.clone() else {
            return Ok(PipeAction::Idle);
        };
        let mut rcv = input.rcv;

        if let MemoryOp::Load { addr, size, .. } | MemoryOp::Store { addr, size, .. } = input.op {
            let write = matches!(input.op, MemoryOp::Store { .. });
            if !mem.check_permissions(addr, size, write) {
                return Err(SimError::AccessViolation {
                    addr,
                    size,
                    pc: input.common.pc,
                    tid: input.common.tid,
                });
            }
        }

        match input.op {
            MemoryOp::None => {}
            MemoryOp::Load { addr, size, sign } => {
                let Some(dest) = input.rc else {
                    return Ok(PipeAction::Success);
                };
                match self.dcache.read(mem, self.pid, addr, size, dest, ctx) {
                    DRead::Hit(value) => rcv = WbValue::Full(value),
                    DRead::Miss(cid, prev) => {
                        // The fill walk finds the register through this
                        // metadata; reads pin the family until they land.
                        rcv = WbValue::Pending(MemFill {
                            cid,
                            offset: (addr % self.dcache.line_size() as u64) as usize,
                            size,
                            sign_extend: sign,
                            fid: input.common.lfid,
                            next: prev,
                        });
                        if ctx.committing() {
                            self.families
                                .get_mut(input.common.lfid)
                                .deps
                                .num_pending_reads += 1;
                        }
                    }
                    DRead::Blocked => return Ok(PipeAction::Stall),
                }
            }
            MemoryOp::Store { addr, size, value } => {
                let bytes = value.to_le_bytes();
                if !self.dcache.write(
                    mem,
                    self.pid,
                    addr,
                    &bytes[..size],
                    input.common.tid,
                    ctx,
                ) {
                    return Ok(PipeAction::Stall);
                }
                self.inc_thread_dep(input.common.tid, ThreadDep::OutstandingWrites, ctx);
            }
        }

        let latch = MemoryWritebackLatch {
            common: input.common,
            rc: input.rc,
            rcv,
        };
        if ctx.committing() {
            self.pipeline.mw = Some(latch);
        }
        Ok(PipeAction::Success)
    }
}
