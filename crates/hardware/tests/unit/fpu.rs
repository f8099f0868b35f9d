//! FPU queueing and asynchronous register writeback.

use microgrid_core::common::RegAddr;
use microgrid_core::core::fpu::{Fpu, FpuOp};
use microgrid_core::core::network::GridChannels;
use microgrid_core::core::regfile::RegState;
use microgrid_core::core::Core;
use microgrid_core::kernel::{Phase, ProcCtx};
use microgrid_core::Config;

const FPU_PROC: usize = 99;
const PIPE_PROC: usize = 98;

fn ctx(phase: Phase, cycle: u64, pid: usize) -> ProcCtx {
    ProcCtx { phase, cycle, pid }
}

fn crank(fpu: &mut Fpu, core: &mut Core, chans: &mut GridChannels, cycle: u64) {
    for phase in [Phase::Acquire, Phase::Check, Phase::Commit] {
        let _ = fpu
            .do_pipeline(std::slice::from_mut(core), chans, ctx(phase, cycle, FPU_PROC))
            .unwrap_or_else(|e| panic!("{e}"));
    }
    fpu.update(&mut |_| {});
}

#[test]
fn fpu_add_completes_after_latency_and_fills_register() {
    let config = Config::default();
    let mut core = Core::new(0, &config);
    let mut chans = GridChannels::new(1);
    let mut fpu = Fpu::new(&[0], &config.fpu);
    fpu.proc_pipeline = FPU_PROC;
    core.regfile.p_async_w.add_process(FPU_PROC);

    let dst = RegAddr::float(5);
    for phase in [Phase::Acquire, Phase::Check, Phase::Commit] {
        assert!(fpu.queue_operation(
            0,
            FpuOp::Add,
            1.5f64.to_bits(),
            2.25f64.to_bits(),
            dst,
            ctx(phase, 0, PIPE_PROC),
        ));
    }
    fpu.update(&mut |_| {});

    let mut done_at = None;
    for cycle in 1..40 {
        crank(&mut fpu, &mut core, &mut chans, cycle);
        let reg = core.regfile.read(dst).unwrap_or_else(|e| panic!("{e}"));
        if reg.state == RegState::Full {
            done_at = Some(cycle);
            assert_eq!(f64::from_bits(reg.value), 3.75);
            break;
        }
    }
    let done_at = done_at.unwrap_or_else(|| panic!("result never arrived"));
    assert!(
        done_at >= config.fpu.arith_latency,
        "result arrived before the configured latency"
    );
}

#[test]
fn fpu_div_runs_in_its_own_longer_pipeline() {
    let config = Config::default();
    assert!(
        config.fpu.div_latency > config.fpu.arith_latency,
        "the default timings must distinguish the classes"
    );
    let mut core = Core::new(0, &config);
    let mut chans = GridChannels::new(1);
    let mut fpu = Fpu::new(&[0], &config.fpu);
    fpu.proc_pipeline = FPU_PROC;
    core.regfile.p_async_w.add_process(FPU_PROC);

    // Issue an add and a divide in the same cycle; the add must retire
    // first even though the divide was queued alongside it.
    let add_dst = RegAddr::float(2);
    let div_dst = RegAddr::float(3);
    for phase in [Phase::Acquire, Phase::Check, Phase::Commit] {
        let c = ctx(phase, 0, PIPE_PROC);
        assert!(fpu.queue_operation(0, FpuOp::Add, 1.0f64.to_bits(), 2.0f64.to_bits(), add_dst, c));
        assert!(fpu.queue_operation(0, FpuOp::Div, 9.0f64.to_bits(), 2.0f64.to_bits(), div_dst, c));
    }
    fpu.update(&mut |_| {});

    let mut add_done = None;
    let mut div_done = None;
    for cycle in 1..80 {
        crank(&mut fpu, &mut core, &mut chans, cycle);
        for (dst, done) in [(add_dst, &mut add_done), (div_dst, &mut div_done)] {
            let reg = core.regfile.read(dst).unwrap_or_else(|e| panic!("{e}"));
            if reg.state == RegState::Full && done.is_none() {
                *done = Some(cycle);
            }
        }
        if add_done.is_some() && div_done.is_some() {
            break;
        }
    }
    let add_done = add_done.unwrap_or_else(|| panic!("add never retired"));
    let div_done = div_done.unwrap_or_else(|| panic!("div never retired"));
    assert!(add_done < div_done, "the divide class must be slower");
    assert!(div_done >= config.fpu.div_latency);
    let reg = core.regfile.read(div_dst).unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(f64::from_bits(reg.value), 4.5);
}

#[test]
fn fpu_source_queue_exerts_backpressure() {
    let config = Config::default();
    let mut fpu = Fpu::new(&[0], &config.fpu);
    fpu.proc_pipeline = FPU_PROC;

    let dst = RegAddr::float(1);
    let c = ctx(Phase::Commit, 0, PIPE_PROC);
    for _ in 0..config.fpu.queue_size {
        assert!(fpu.queue_operation(0, FpuOp::Mul, 0, 0, dst, c));
    }
    assert!(
        !fpu.queue_operation(0, FpuOp::Mul, 0, 0, dst, c),
        "queue must refuse past its capacity"
    );
}
