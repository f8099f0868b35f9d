//! Fetch stage.
//!
//! Holds the running thread and a copy of its instruction cache line. On a
//! switch it pops the next thread from the active list and reloads its
//! line and control word; the switch itself costs a cycle. Each fetched
//! instruction carries the annotation bits from the control word heading
//! its control block, plus switch conditions for end-of-line and thread
//! end.

use crate::isa;
use crate::kernel::ProcCtx;

use super::latches::{FetchDecodeLatch, LatchCommon};
use super::PipeAction;
use crate::core::thread_table::ThreadState;
use crate::core::Core;

impl Core {
    /// Runs the fetch stage for one phase.
    pub fn stage_fetch(&mut self, ctx: ProcCtx) -> PipeAction {
        if self.pipeline.fetch.switched {
            return self.fetch_switch(ctx);
        }
        let Some(tid) = self.pipeline.fetch.tid else {
            return PipeAction::Idle;
        };

        let line_size = self.icache.line_size();
        let cbs = self.control_block_size as u64;
        let pc = self.pipeline.fetch.pc;
        let slot = ((pc % cbs) / 4) as usize;

        if slot == 0 {
            // The first word of a control block is its control word.
            let offset = (pc % line_size as u64) as usize;
            let line = &self.pipeline.fetch.line;
            let control =
                u32::from_le_bytes([line[offset], line[offset + 1], line[offset + 2], line[offset + 3]]);
            if ctx.committing() {
                self.pipeline.fetch.control = control;
                self.pipeline.fetch.pc = pc + 4;
            }
            return PipeAction::Success;
        }

        let offset = (pc % line_size as u64) as usize;
        let line = &self.pipeline.fetch.line;
        let instr =
            u32::from_le_bytes([line[offset], line[offset + 1], line[offset + 2], line[offset + 3]]);
        let annotation = isa::annotation(self.pipeline.fetch.control, slot);

        let end_of_line = (pc + 4) % line_size as u64 == 0;
        let kill = annotation.kill;
        let swch = kill
            || end_of_line
            || (annotation.swch && !self.allocator.active.is_empty());

        let latch = FetchDecodeLatch {
            common: LatchCommon {
                tid,
                lfid: self.pipeline.fetch.lfid,
                pc,
                swch,
                kill,
            },
            instr,
            fam_regs: self.pipeline.fetch.fam_regs,
            thread_regs: self.pipeline.fetch.thread_regs,
        };

        if ctx.committing() {
            self.pipeline.fd = Some(latch);
            if swch {
                // The thread leaves the pipeline front; its line reference
                // drops with it. Writeback reschedules it unless killed.
                let cid = self.pipeline.fetch.cid;
                self.pipeline.fetch.switched = true;
                self.pipeline.fetch.tid = None;
                self.icache.release(cid, ctx);
            } else {
                self.pipeline.fetch.pc = pc + 4;
            }
        }
        PipeAction::Success
    }

    /// Pops the next active thread and loads its line.
    fn fetch_switch(&mut self, ctx: ProcCtx) -> PipeAction {
        let Some(tid) = self.allocator.active.front() else {
            return PipeAction::Idle;
        };
        let thread = self.threads.get(tid);
        let Some(cid) = thread.cid else {
            return PipeAction::Idle;
        };
        let lfid = thread.family;
        let pc = thread.pc;
        let thread_regs = thread.regs;
        let fam_regs = self.families.get(lfid).regs;

        self.allocator.active.pop(ctx);
        if ctx.committing() {
            let line_size = self.icache.line_size();
            let cbs = self.control_block_size as u64;
            let mut line = vec![0; line_size];
            self.icache
                .read(cid, pc - pc % line_size as u64, &mut line);

            // Control word of the block holding the entry PC.
            let block_base = pc - pc % cbs;
            let coff = (block_base % line_size as u64) as usize;
            let control =
                u32::from_le_bytes([line[coff], line[coff + 1], line[coff + 2], line[coff + 3]]);

            let fetch = &mut self.pipeline.fetch;
            fetch.switched = false;
            fetch.tid = Some(tid);
            fetch.lfid = lfid;
            fetch.pc = pc;
            fetch.cid = cid;
            fetch.line = line;
            fetch.control = control;
            fetch.fam_regs = fam_regs;
            fetch.thread_regs = thread_regs;

            self.threads.get_mut(tid).state = ThreadState::Running;
        }
        PipeAction::Success
    }

    /// Drops the fetch stage's claim on a flushed thread.
    pub fn fetch_clear(&mut self, tid: crate::common::Tid, ctx: ProcCtx) {
        if self.pipeline.fetch.tid == Some(tid) {
            if ctx.committing() {
                let cid = self.pipeline.fetch.cid;
                self.icache.release(cid, ctx);
                self.pipeline.fetch.switched = true;
                self.pipeline.fetch.tid = None;
            }
        }
    }
}
