//! Decode stage.
//!
//! Purely functional: decodes the raw instruction word and translates its
//! windowed register specifiers into absolute register file addresses
//! using the family plan and thread window carried in the latch.
//! Out-of-range specifiers raise an illegal-instruction fault with the
//! thread context attached.

use crate::common::{RegAddr, RegType, SimError};
use crate::isa::{self, Instr, RegClass, RegSpec};
use crate::kernel::ProcCtx;

use super::latches::{DecodeReadLatch, FetchDecodeLatch};
use super::PipeAction;
use crate::core::Core;

impl Core {
    /// Runs the decode stage for one phase.
    pub fn stage_decode(&mut self, ctx: ProcCtx) -> Result<PipeAction, SimError> {
        let Some(input) = self.pipeline.fd.clone() else {
            return Ok(PipeAction::Idle);
        };

        let instr = match isa::decode(input.instr, input.common.pc) {
            Ok(instr) => instr,
            Err(_) => {
                return Err(SimError::IllegalInstruction {
                    pc: input.common.pc,
                    instr: input.instr,
                    tid: input.common.tid,
                    fid: input.common.lfid,
                })
            }
        };

        let (ra, rb, rc) = operand_specs(instr);
        let bank = match instr {
            Instr::FAdd { .. } | Instr::FMul { .. } | Instr::FDiv { .. } => RegType::Float,
            _ => RegType::Integer,
        };

        let translate = |spec: Option<RegSpec>| -> Result<Option<RegAddr>, SimError> {
            let Some(spec) = spec else { return Ok(None) };
            let fam = input.fam_regs[bank];
            let thr = input.thread_regs[bank];
            let fault = |class: &'static str| SimError::InvalidRegister {
                class,
                index: spec.index,
                pc: input.common.pc,
                tid: input.common.tid,
            };
            let index = match spec.class {
                RegClass::Global => {
                    if spec.index >= fam.count.globals {
                        return Err(fault("global"));
                    }
                    fam.base.ok_or_else(|| fault("global"))? + fam.size - fam.count.globals
                        + spec.index
                }
                RegClass::Shared => {
                    if spec.index >= fam.count.shareds {
                        return Err(fault("shared"));
                    }
                    thr.shareds.ok_or_else(|| fault("shared"))? + spec.index
                }
                RegClass::Local => {
                    if spec.index >= fam.count.locals {
                        return Err(fault("local"));
                    }
                    thr.locals.ok_or_else(|| fault("local"))? + spec.index
                }
                RegClass::Dependent => {
                    if spec.index >= fam.count.shareds {
                        return Err(fault("dependent"));
                    }
                    thr.dependents.ok_or_else(|| fault("dependent"))? + spec.index
                }
            };
            Ok(Some(RegAddr::new(bank, index)))
        };

        let latch = DecodeReadLatch {
            common: input.common,
            instr,
            ra: translate(ra)?,
            rb: translate(rb)?,
            rc: translate(rc)?,
        };
        if ctx.committing() {
            self.pipeline.dr = Some(latch);
        }
        Ok(PipeAction::Success)
    }
}

/// The source and destination specifiers of an instruction:
/// `(ra, rb, rc)`.
fn operand_specs(instr: Instr) -> (Option<RegSpec>, Option<RegSpec>, Option<RegSpec>) {
    match instr {
        Instr::Nop | Instr::Break | Instr::End => (None, None, None),
        Instr::Ldi { rd, .. } => (None, None, Some(rd)),
        Instr::Add { rd, ra, rb }
        | Instr::FAdd { rd, ra, rb }
        | Instr::FMul { rd, ra, rb }
        | Instr::FDiv { rd, ra, rb } => (Some(ra), Some(rb), Some(rd)),
        Instr::Load { rd, ra, .. } => (Some(ra), None, Some(rd)),
        Instr::Store { rv, ra, .. } => (Some(ra), Some(rv), None),
        Instr::Allocate { rd, ra, .. } => (Some(ra), None, Some(rd)),
        Instr::SetProperty { ra, rb, .. } => (Some(ra), Some(rb), None),
        Instr::Create { rd, ra, rb } => (Some(ra), Some(rb), Some(rd)),
        Instr::Sync { rd, ra } => (Some(ra), None, Some(rd)),
        Instr::Detach { ra } => (Some(ra), None, None),
        Instr::PutGlobal { ra, rb, .. } | Instr::PutShared { ra, rb, .. } => {
            (Some(ra), Some(rb), None)
        }
        Instr::GetShared { rd, ra, .. } => (Some(ra), None, Some(rd)),
    }
}
