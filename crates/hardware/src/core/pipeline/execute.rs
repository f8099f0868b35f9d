//! Execute stage.
//!
//! Consumes operands and either computes a result, forms a memory
//! operation, dispatches to the FPU, or issues a family management
//! operation onto the network. A create issued by a thread with writes
//! still in flight acts as a memory barrier: the thread suspends until its
//! writes complete and re-executes the create.

use crate::common::{RegAddr, SimError};
use crate::isa::Instr;
use crate::kernel::ProcCtx;

use super::latches::{ExecuteMemoryLatch, MemoryOp, WbValue};
use super::PipeAction;
use crate::core::fpu::{Fpu, FpuOp};
use crate::core::network::{RemoteMessage, RemoteRegKind};
use crate::core::{Core, GridChannels};

impl Core {
    /// Runs the execute stage for one phase.
    pub fn stage_execute(
        &mut self,
        chans: &mut GridChannels,
        fpu: &mut Fpu,
        ctx: ProcCtx,
    ) -> Result<PipeAction, SimError> {
        let Some(input) = self.pipeline.re.clone() else {
            return Ok(PipeAction::Idle);
        };
        let mut common = input.common;
        let mut op = MemoryOp::None;
        let mut rcv = WbValue::None;

        match input.instr {
            Instr::Nop => {}
            Instr::Ldi { imm, .. } => rcv = WbValue::Full(imm as i64 as u64),
            Instr::Add { .. } => rcv = WbValue::Full(input.rav.wrapping_add(input.rbv)),
            Instr::Load { offset, .. } => {
                op = MemoryOp::Load {
                    addr: input.rav.wrapping_add(offset as u64),
                    size: 8,
                    sign: false,
                };
            }
            Instr::Store { offset, .. } => {
                op = MemoryOp::Store {
                    addr: input.rav.wrapping_add(offset as u64),
                    size: 8,
                    value: input.rbv,
                };
            }
            Instr::FAdd { .. } | Instr::FMul { .. } | Instr::FDiv { .. } => {
                let fop = match input.instr {
                    Instr::FAdd { .. } => FpuOp::Add,
                    Instr::FMul { .. } => FpuOp::Mul,
                    _ => FpuOp::Div,
                };
                let Some(dst) = input.rc else {
                    return Ok(PipeAction::Success);
                };
                if !fpu.queue_operation(self.fpu_source, fop, input.rav, input.rbv, dst, ctx) {
                    return Ok(PipeAction::Stall);
                }
                // The FPU fills the destination asynchronously.
                rcv = WbValue::Empty;
            }
            Instr::Allocate {
                suspend,
                exclusive,
                atype,
                ..
            } => {
                let place = self.place_format.unpack(input.rav);
                let (place_pid, place_size) = if place.size == 0 {
                    // The default place: the whole grid.
                    (0, self.grid_size)
                } else {
                    (place.pid, place.size)
                };
                let completion_reg = completion_reg(input.rc)?;
                let msg = RemoteMessage::Allocate {
                    place_pid,
                    place_size,
                    suspend,
                    exclusive,
                    atype,
                    completion_pid: self.pid,
                    completion_reg,
                };
                if !self.send_remote(msg, chans, ctx) {
                    return Ok(PipeAction::Stall);
                }
                rcv = WbValue::Empty;
            }
            Instr::SetProperty { prop, .. } => {
                let fid = self.fid_format.unpack(input.rav);
                let msg = RemoteMessage::SetProperty {
                    fid,
                    prop,
                    value: input.rbv,
                };
                if !self.send_remote(msg, chans, ctx) {
                    return Ok(PipeAction::Stall);
                }
            }
            Instr::Create { .. } => {
                // Create acts as a memory barrier: the new family must
                // observe every write this thread has issued.
                if self.threads.get(common.tid).deps.num_pending_writes > 0 {
                    if ctx.committing() {
                        let thread = self.threads.get_mut(common.tid);
                        thread.waiting_for_writes = true;
                        thread.pc = common.pc;
                        thread.state = crate::core::thread_table::ThreadState::Suspended;
                    }
                    return Ok(PipeAction::Flush);
                }
                let fid = self.fid_format.unpack(input.rav);
                let completion_reg = completion_reg(input.rc)?;
                let msg = RemoteMessage::Create {
                    fid,
                    pc: input.rbv,
                    completion_pid: self.pid,
                    completion_reg,
                };
                if !self.send_remote(msg, chans, ctx) {
                    return Ok(PipeAction::Stall);
                }
                rcv = WbValue::Empty;
            }
            Instr::Sync { .. } => {
                let fid = self.fid_format.unpack(input.rav);
                let completion_reg = completion_reg(input.rc)?;
                let msg = RemoteMessage::Sync {
                    fid,
                    completion_reg,
                };
                if !self.send_remote(msg, chans, ctx) {
                    return Ok(PipeAction::Stall);
                }
                rcv = WbValue::Empty;
            }
            Instr::Detach { .. } => {
                let fid = self.fid_format.unpack(input.rav);
                if !self.send_remote(RemoteMessage::Detach { fid }, chans, ctx) {
                    return Ok(PipeAction::Stall);
                }
            }
            Instr::Break => {
                // Address the family's first core; the break then walks
                // the whole place over the link.
                let family = self.families.get(common.lfid);
                let first_pid = self.pid - self.pid % family.place_size;
                let first_lfid = family.first_lfid.unwrap_or(common.lfid);
                if !self.send_remote_to(
                    first_pid,
                    RemoteMessage::Break { lfid: first_lfid },
                    chans,
                    ctx,
                ) {
                    return Ok(PipeAction::Stall);
                }
            }
            Instr::PutGlobal { index, .. } => {
                let fid = self.fid_format.unpack(input.rav);
                let msg = RemoteMessage::FamRegister {
                    fid,
                    kind: RemoteRegKind::Global,
                    addr: RegAddr::int(index as usize),
                    completion_reg: None,
                    value: Some(input.rbv),
                };
                if !self.send_remote(msg, chans, ctx) {
                    return Ok(PipeAction::Stall);
                }
            }
            Instr::GetShared { index, .. } => {
                let fid = self.fid_format.unpack(input.rav);
                let completion_reg = completion_reg(input.rc)?;
                let msg = RemoteMessage::FamRegister {
                    fid,
                    kind: RemoteRegKind::LastShared,
                    addr: RegAddr::int(index as usize),
                    completion_reg: Some(completion_reg),
                    value: None,
                };
                if !self.send_remote(msg, chans, ctx) {
                    return Ok(PipeAction::Stall);
                }
                rcv = WbValue::Empty;
            }
            Instr::PutShared { index, .. } => {
                let fid = self.fid_format.unpack(input.rav);
                let msg = RemoteMessage::FamRegister {
                    fid,
                    kind: RemoteRegKind::FirstDependent,
                    addr: RegAddr::int(index as usize),
                    completion_reg: None,
                    value: Some(input.rbv),
                };
                if !self.send_remote(msg, chans, ctx) {
                    return Ok(PipeAction::Stall);
                }
            }
            Instr::End => {
                common.kill = true;
                common.swch = true;
            }
        }

        let flush = common.kill && !input.common.kill;
        let latch = ExecuteMemoryLatch {
            common,
            op,
            rc: input.rc,
            rcv,
        };
        if ctx.committing() {
            self.pipeline.em = Some(latch);
        }
        // An END opcode was unknown to fetch: kill the younger
        // same-thread instructions behind it.
        Ok(if flush {
            PipeAction::Flush
        } else {
            PipeAction::Success
        })
    }
}

/// The absolute completion register index behind a destination operand.
fn completion_reg(rc: Option<RegAddr>) -> Result<usize, SimError> {
    rc.map(|r| r.index).ok_or(SimError::NonExistingRegister {
        addr: RegAddr::int(0),
    })
}
