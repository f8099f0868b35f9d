//! Read stage.
//!
//! Reads the source operands from the register file, bypassing from the
//! execute and memory output latches and from the writeback captured at
//! the start of the cycle. An operand that is not full suspends the thread
//! on the source register: the thread joins the register's waiter queue,
//! the instruction is flushed, and the pipeline switches.

use crate::common::{RegAddr, SimError};
use crate::kernel::ProcCtx;

use super::latches::{ReadExecuteLatch, WbValue};
use super::PipeAction;
use crate::core::regfile::RegState;
use crate::core::Core;

/// An operand after bypass resolution.
enum Operand {
    /// Value available.
    Full(u64),
    /// Not produced yet; suspend on this register.
    Unavailable,
}

impl Core {
    /// Runs the read stage for one phase.
    pub fn stage_read(&mut self, ctx: ProcCtx) -> Result<PipeAction, SimError> {
        let Some(input) = self.pipeline.dr.clone() else {
            return Ok(PipeAction::Idle);
        };

        let mut suspend_on: Option<RegAddr> = None;
        let mut rav = 0;
        let mut rbv = 0;
        for (addr, value) in [(input.ra, &mut rav), (input.rb, &mut rbv)] {
            let Some(addr) = addr else { continue };
            match self.resolve_operand(addr)? {
                Operand::Full(v) => *value = v,
                Operand::Unavailable => {
                    suspend_on = Some(addr);
                    break;
                }
            }
        }

        if let Some(addr) = suspend_on {
            // Park the thread on the register and flush.
            self.park_thread_on_register(input.common.tid, addr, input.common.pc, ctx);
            return Ok(PipeAction::Flush);
        }

        let latch = ReadExecuteLatch {
            common: input.common,
            instr: input.instr,
            rav,
            rbv,
            rc: input.rc,
        };
        if ctx.committing() {
            self.pipeline.re = Some(latch);
        }
        Ok(PipeAction::Success)
    }

    /// Reads one operand through the bypass network.
    ///
    /// The register file value is overridden by older in-flight results,
    /// youngest last: the captured writeback, then the memory output,
    /// then the execute output.
    fn resolve_operand(&self, addr: RegAddr) -> Result<Operand, SimError> {
        let reg = self.regfile.read(addr)?;
        let mut state = reg.state;
        let mut value = reg.value;

        let bypasses = [
            self.pipeline
                .mw_bypass
                .as_ref()
                .map(|l| (l.rc, l.rcv)),
            self.pipeline.mw.as_ref().map(|l| (l.rc, l.rcv)),
            self.pipeline
                .em
                .as_ref()
                .map(|l| (l.rc, l.rcv)),
        ];
        for bypass in bypasses.into_iter().flatten() {
            if bypass.0 == Some(addr) {
                match bypass.1 {
                    WbValue::Full(v) => {
                        state = RegState::Full;
                        value = v;
                    }
                    WbValue::Pending(_) | WbValue::Empty => {
                        state = RegState::Pending;
                    }
                    WbValue::None => {}
                }
            }
        }

        Ok(if state == RegState::Full {
            Operand::Full(value)
        } else {
            Operand::Unavailable
        })
    }
}
