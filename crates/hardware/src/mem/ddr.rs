//! DDR channel timing model.
//!
//! Each root directory owns one DDR channel. The channel models open-row
//! access timing: an access to the currently open row pays only column
//! latency and burst transfer; any other row pays precharge and activate
//! first. Requests complete in issue order.

use std::collections::VecDeque;

use crate::common::{CycleNo, MemAddr};
use crate::config::DdrConfig;

/// Bits of the address selecting the DDR row.
const ROW_SHIFT: u32 = 13;

/// A request in flight on the channel.
#[derive(Clone, Debug)]
pub struct DdrRequest {
    /// Line address of the access.
    pub address: MemAddr,
    /// Write data; empty for reads.
    pub data: Vec<u8>,
    /// Cycle at which the access completes.
    pub done_at: CycleNo,
}

/// One DDR channel with open-row timing.
#[derive(Debug)]
pub struct DdrChannel {
    config: DdrConfig,
    open_row: Option<u64>,
    busy_until: CycleNo,
    in_flight: VecDeque<DdrRequest>,
}

impl DdrChannel {
    /// Creates a channel with the given timing parameters.
    pub fn new(config: DdrConfig) -> Self {
        Self {
            config,
            open_row: None,
            busy_until: 0,
            in_flight: VecDeque::new(),
        }
    }

    /// True when no request is in flight.
    pub fn idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    fn access_latency(&mut self, address: MemAddr) -> CycleNo {
        let row = address >> ROW_SHIFT;
        let row_latency = if self.open_row == Some(row) {
            0
        } else {
            self.open_row = Some(row);
            self.config.t_rp + self.config.t_rcd
        };
        row_latency + self.config.t_cl + self.config.burst_cycles
    }

    /// Issues a read of the line at `address`.
    pub fn issue_read(&mut self, address: MemAddr, now: CycleNo) {
        let start = now.max(self.busy_until);
        let done_at = start + self.access_latency(address);
        self.busy_until = done_at;
        self.in_flight.push_back(DdrRequest {
            address,
            data: Vec::new(),
            done_at,
        });
    }

    /// Issues a write of `data` to the line at `address`.
    pub fn issue_write(&mut self, address: MemAddr, data: Vec<u8>, now: CycleNo) {
        let start = now.max(self.busy_until);
        let done_at = start + self.access_latency(address) + self.config.t_wr;
        self.busy_until = done_at;
        self.in_flight.push_back(DdrRequest {
            address,
            data,
            done_at,
        });
    }

    /// The oldest request, once its completion time has passed.
    ///
    /// Completion is observed here and consumed with [`Self::retire`] in
    /// the commit phase, so both phases of a cycle see the same request.
    pub fn completed(&self, now: CycleNo) -> Option<&DdrRequest> {
        self.in_flight
            .front()
            .filter(|r| r.done_at <= now)
    }

    /// Removes the completed front request.
    pub fn retire(&mut self) {
        let _ = self.in_flight.pop_front();
    }
}
