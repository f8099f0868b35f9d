//! Floating-point unit shared by a group of cores.
//!
//! Each source core owns an input queue; the unit drains them round robin
//! into per-class pipelines with configurable latency, one result per
//! cycle per class. Completions are delivered by writing the destination
//! register through the owning core's asynchronous write port, waking any
//! suspended consumers.

use std::collections::VecDeque;

use crate::common::{CycleNo, Pid, RegAddr, SimError};
use crate::config::FpuConfig;
use crate::kernel::{Buffer, ProcCtx, ProcResult, ProcessId};

use super::network::GridChannels;
use super::regfile::RegValue;
use super::Core;

/// Operation classes with distinct pipelines and latencies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FpuOp {
    /// Addition/subtraction class.
    Add,
    /// Multiplication class.
    Mul,
    /// Division/square-root class (long latency).
    Div,
}

impl FpuOp {
    /// Number of operation classes.
    pub const COUNT: usize = 3;

    /// The pipeline this class issues into.
    fn class(self) -> usize {
        match self {
            Self::Add => 0,
            Self::Mul => 1,
            Self::Div => 2,
        }
    }
}

/// One queued operation.
#[derive(Clone, Copy, Debug)]
pub struct FpuOperation {
    /// Operation class.
    pub op: FpuOp,
    /// First operand, raw bits.
    pub a: u64,
    /// Second operand, raw bits.
    pub b: u64,
    /// Destination register on the issuing core.
    pub dst: RegAddr,
    /// Issuing source slot.
    pub source: usize,
}

/// A result moving through a pipeline.
#[derive(Clone, Copy, Debug)]
struct InFlight {
    done_at: CycleNo,
    value: u64,
    dst: RegAddr,
    source: usize,
}

/// One input queue, owned by a source core.
#[derive(Debug)]
pub struct FpuSource {
    /// Queued operations from this core.
    pub input: Buffer<FpuOperation>,
    /// The owning core.
    pub core_pid: Pid,
}

/// One floating-point unit.
#[derive(Debug)]
pub struct Fpu {
    /// Input queues, one per served core.
    pub sources: Vec<FpuSource>,
    pipelines: [VecDeque<InFlight>; FpuOp::COUNT],
    latencies: [u64; FpuOp::COUNT],
    last_source: usize,
    /// The unit's pipeline process.
    pub proc_pipeline: ProcessId,
}

impl Fpu {
    /// Creates a unit serving the given cores. The add and multiply
    /// classes run at the arithmetic latency; divides take the long one.
    pub fn new(core_pids: &[Pid], config: &FpuConfig) -> Self {
        Self {
            sources: core_pids
                .iter()
                .map(|&core_pid| FpuSource {
                    input: Buffer::new(config.queue_size),
                    core_pid,
                })
                .collect(),
            pipelines: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            latencies: [
                config.arith_latency,
                config.arith_latency,
                config.div_latency,
            ],
            last_source: 0,
            proc_pipeline: 0,
        }
    }

    /// True when results are still in flight.
    pub fn busy(&self) -> bool {
        self.pipelines.iter().any(|p| !p.is_empty())
    }

    /// Queues an operation from a source core.
    ///
    /// Returns `false` when the source's queue is full this cycle.
    pub fn queue_operation(
        &mut self,
        source: usize,
        op: FpuOp,
        a: u64,
        b: u64,
        dst: RegAddr,
        ctx: ProcCtx,
    ) -> bool {
        self.sources[source].input.push(
            FpuOperation {
                op,
                a,
                b,
                dst,
                source,
            },
            ctx,
        )
    }

    fn compute(op: FpuOp, a: u64, b: u64) -> u64 {
        let (a, b) = (f64::from_bits(a), f64::from_bits(b));
        match op {
            FpuOp::Add => (a + b).to_bits(),
            FpuOp::Mul => (a * b).to_bits(),
            FpuOp::Div => (a / b).to_bits(),
        }
    }

    /// Advances the unit: retires one result per class, then issues one
    /// queued operation round robin.
    pub fn do_pipeline(
        &mut self,
        cores: &mut [Core],
        chans: &mut GridChannels,
        ctx: ProcCtx,
    ) -> Result<ProcResult, SimError> {
        let mut progress = false;

        // Retire.
        for class in 0..self.pipelines.len() {
            let Some(front) = self.pipelines[class].front().copied() else {
                continue;
            };
            if front.done_at > ctx.cycle {
                continue;
            }
            let core = &mut cores[self.sources[front.source].core_pid];
            if !core.regfile.p_async_w.invoke(ctx) {
                return Ok(ProcResult::Failed);
            }
            if !core.write_register(front.dst, RegValue::full(front.value), false, chans, ctx)? {
                return Ok(ProcResult::Failed);
            }
            if ctx.committing() {
                let _ = self.pipelines[class].pop_front();
            }
            progress = true;
        }

        // Issue one operation, round robin over the sources.
        let n = self.sources.len();
        let mut issued = None;
        for i in 0..n {
            let s = (self.last_source + 1 + i) % n;
            if let Some(op) = self.sources[s].input.front().copied() {
                issued = Some((s, op));
                break;
            }
        }
        if let Some((s, op)) = issued {
            let class = op.op.class();
            let value = Self::compute(op.op, op.a, op.b);
            self.sources[s].input.pop(ctx);
            if ctx.committing() {
                self.last_source = s;
                let done_at = ctx.cycle + self.latencies[class];
                self.pipelines[class].push_back(InFlight {
                    done_at,
                    value,
                    dst: op.dst,
                    source: op.source,
                });
            }
            progress = true;
        }

        Ok(if progress {
            ProcResult::Success
        } else {
            ProcResult::Delayed
        })
    }

    /// End-of-cycle publication of the input queues.
    pub fn update(&mut self, wake: &mut dyn FnMut(ProcessId)) {
        for source in &mut self.sources {
            source.input.update(wake);
        }
        if self.busy() {
            wake(self.proc_pipeline);
        }
    }
}
