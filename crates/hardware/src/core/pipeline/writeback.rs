//! Writeback stage.
//!
//! Writes the latched result through the pipeline write port, reactivating
//! any threads suspended on the destination and forwarding the value to a
//! remote consumer when one is registered. Retires the control bits: a
//! killed thread enters cleanup once its dependencies resolve, a switched
//! thread is rescheduled at the next PC.

use crate::common::SimError;
use crate::kernel::ProcCtx;

use super::latches::WbValue;
use super::PipeAction;
use crate::core::regfile::{RegState, RegValue};
use crate::core::{Core, GridChannels};

impl Core {
    /// Runs the writeback stage for one phase.
    pub fn stage_writeback(
        &mut self,
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<PipeAction, SimError> {
        let Some(input) = self.pipeline.mw.clone() else {
            return Ok(PipeAction::Idle);
        };

        if let Some(rc) = input.rc {
            let data = match input.rcv {
                WbValue::None => None,
                WbValue::Full(value) => Some(RegValue::full(value)),
                WbValue::Empty => Some(RegValue::default()),
                WbValue::Pending(fill) => Some(RegValue {
                    state: RegState::Pending,
                    value: 0,
                    waiting: None,
                    memory: Some(fill),
                    remote: None,
                }),
            };
            if let Some(data) = data {
                if !self.regfile.p_pipeline_w.invoke(ctx) {
                    return Ok(PipeAction::Stall);
                }
                if !self.write_register(rc, data, false, chans, ctx)? {
                    return Ok(PipeAction::Stall);
                }
            }
        }

        if input.common.kill {
            if !self.kill_thread(input.common.tid, ctx) {
                return Ok(PipeAction::Stall);
            }
        } else if input.common.swch {
            // Fetch dropped the thread at the switch; requeue it at the
            // instruction after this one.
            self.reschedule_thread(input.common.tid, input.common.pc + 4, ctx);
        }
        Ok(PipeAction::Success)
    }
}
