//! Top-level simulator: wiring and the per-cycle dispatch loop.
//!
//! `Microgrid` owns the scheduler, the cores, the grid channels, the COMA
//! memory system, and the FPUs. Each cycle it collects the runnable
//! processes and drives them through the acquire, check, and commit
//! passes, then publishes every storage and recomputes the ready set. The
//! simulation finishes when every process is idle; a deadlock surfaces as
//! an error carrying the process state dump.

use tracing::info;

use crate::common::{MemAddr, Pid, SimError};
use crate::config::Config;
use crate::core::fpu::Fpu;
use crate::core::network::GridChannels;
use crate::core::{Core, CoreProcess};
use crate::kernel::{Phase, ProcResult, ProcessId, Scheduler};
use crate::mem::traits::{Memory, MemoryClient};
use crate::mem::{Coma, MemProcess};
use crate::stats::SimStats;

/// How a bounded run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every process went idle: the workload completed.
    Finished,
    /// The cycle budget ran out with work still pending.
    CycleLimit,
}

/// One process in the global dispatch table.
#[derive(Clone, Copy, Debug)]
enum ProcessKind {
    Core(Pid, CoreProcess),
    Mem(MemProcess),
    Fpu(usize),
}

/// The complete simulated Microgrid.
#[derive(Debug)]
pub struct Microgrid {
    /// The clock and process registry.
    pub sched: Scheduler,
    /// All cores, by pid.
    pub cores: Vec<Core>,
    /// The memory hierarchy.
    pub memory: Coma,
    /// The floating-point units.
    pub fpus: Vec<Fpu>,
    /// The inter-core channels.
    pub channels: GridChannels,
    table: Vec<ProcessKind>,
    core_fpu: Vec<usize>,
}

impl Microgrid {
    /// Builds and wires a grid from the configuration.
    pub fn new(config: &Config) -> Result<Self, SimError> {
        config.validate()?;
        let mut sched = Scheduler::new(config.deadlock_threshold);
        let mut channels = GridChannels::new(config.num_processors);
        let mut cores: Vec<Core> = (0..config.num_processors)
            .map(|pid| Core::new(pid, config))
            .collect();
        let mut memory = Coma::new(config);

        let per_fpu = config.fpu.num_processors_per_fpu.max(1);
        let num_fpus = config.num_processors.div_ceil(per_fpu);
        let mut fpus: Vec<Fpu> = (0..num_fpus)
            .map(|i| {
                let pids: Vec<Pid> = (i * per_fpu..((i + 1) * per_fpu).min(config.num_processors))
                    .collect();
                Fpu::new(&pids, &config.fpu)
            })
            .collect();
        let core_fpu: Vec<usize> = (0..config.num_processors).map(|pid| pid / per_fpu).collect();

        // Register processes; the registration order fixes the
        // deterministic per-cycle visit order.
        let mut entries: Vec<(ProcessId, ProcessKind)> = Vec::new();
        for core in &mut cores {
            for (pid, proc) in core.register(&mut sched, &mut channels) {
                entries.push((pid, ProcessKind::Core(core.pid, proc)));
            }
        }
        for (pid, proc) in memory.register(&mut sched) {
            entries.push((pid, ProcessKind::Mem(proc)));
        }
        for (i, fpu) in fpus.iter_mut().enumerate() {
            let pid = sched.register(format!("fpu{i}.pipeline"));
            fpu.proc_pipeline = pid;
            entries.push((pid, ProcessKind::Fpu(i)));
            for source in &mut fpu.sources {
                source.input.set_sensitive(pid);
                cores[source.core_pid].regfile.p_async_w.add_process(pid);
            }
        }

        // Attach cores to their serving caches and register the issuing
        // processes on each cache's bus arbitrator.
        for pid in 0..config.num_processors {
            memory.attach_core(pid);
            let cache = memory.cache_of(pid);
            let pipeline = cores[pid].pipeline.proc_pipeline;
            let ic_out = cores[pid].icache.proc_outgoing;
            memory.caches[cache].p_bus.add_process(pipeline);
            memory.caches[cache].p_bus.add_process(ic_out);
        }

        let mut table = vec![ProcessKind::Fpu(0); entries.len()];
        for (pid, kind) in entries {
            table[pid] = kind;
        }

        Ok(Self {
            sched,
            cores,
            memory,
            fpus,
            channels,
            table,
            core_fpu,
        })
    }

    /// Writes bytes into backing storage, reserving the range.
    pub fn write_memory(&mut self, addr: MemAddr, data: &[u8]) {
        self.memory.storage.reserve(addr, data.len());
        self.memory.storage.write(addr, data);
    }

    /// Reads one machine word from backing storage.
    pub fn read_memory_u64(&self, addr: MemAddr) -> u64 {
        self.memory.storage.read_u64(addr)
    }

    /// Seeds a core with the initial family at `pc` and publishes the
    /// boot state.
    pub fn boot(&mut self, core: Pid, pc: MemAddr, legacy: bool) {
        info!(core, pc, "booting initial family");
        let _ = self.cores[core].allocate_initial_family(pc, legacy);
        self.update();
    }

    /// Current cycle number.
    pub fn cycle(&self) -> u64 {
        self.sched.cycle()
    }

    /// True when no process has pending work.
    pub fn is_idle(&self) -> bool {
        self.sched.all_idle()
    }

    /// Advances the grid by one clock cycle.
    pub fn step(&mut self) -> Result<(), SimError> {
        let runnable = self.sched.runnable();

        for &p in &runnable {
            let _ = self.dispatch_process(p, Phase::Acquire)?;
        }
        let mut checked = Vec::with_capacity(runnable.len());
        for &p in &runnable {
            checked.push(self.dispatch_process(p, Phase::Check)?);
        }
        for (&p, &check) in runnable.iter().zip(&checked) {
            if check == ProcResult::Failed {
                self.sched.record(p, ProcResult::Failed);
            } else {
                let result = self.dispatch_process(p, Phase::Commit)?;
                self.sched.record(p, result);
            }
        }

        self.update();
        self.sched.advance()
    }

    /// Runs until idle or until `max_cycles` have elapsed.
    pub fn run(&mut self, max_cycles: u64) -> Result<RunOutcome, SimError> {
        let limit = self.sched.cycle() + max_cycles;
        while !self.sched.all_idle() {
            if self.sched.cycle() >= limit {
                return Ok(RunOutcome::CycleLimit);
            }
            self.step()?;
        }
        info!(cycle = self.sched.cycle(), "simulation finished");
        Ok(RunOutcome::Finished)
    }

    fn dispatch_process(&mut self, p: ProcessId, phase: Phase) -> Result<ProcResult, SimError> {
        let ctx = self.sched.ctx(phase, p);
        let kind = self.table[p];
        let Self {
            cores,
            memory,
            fpus,
            channels,
            core_fpu,
            ..
        } = self;
        match kind {
            ProcessKind::Core(pid, proc) => {
                let fpu = &mut fpus[core_fpu[pid]];
                cores[pid].cycle(proc, channels, memory as &mut dyn Memory, fpu, ctx)
            }
            ProcessKind::Mem(proc) => {
                let mut clients: Vec<&mut dyn MemoryClient> = cores
                    .iter_mut()
                    .map(|c| c as &mut dyn MemoryClient)
                    .collect();
                Ok(memory.cycle(proc, &mut clients, ctx))
            }
            ProcessKind::Fpu(i) => fpus[i].do_pipeline(cores, channels, ctx),
        }
    }

    /// Publishes every storage and recomputes the ready set.
    fn update(&mut self) {
        self.sched.clear_ready();
        let Self {
            sched,
            cores,
            memory,
            fpus,
            channels,
            ..
        } = self;
        let mut wake = |p: ProcessId| sched.wake(p);
        for core in cores.iter_mut() {
            core.update(&mut wake);
        }
        channels.update(&mut wake);
        memory.update(&mut wake);
        for fpu in fpus.iter_mut() {
            fpu.update(&mut wake);
        }
    }

    /// Collects the aggregate statistics of the run so far.
    pub fn stats(&self) -> SimStats {
        let mut stats = SimStats {
            cycles: self.sched.cycle(),
            ..SimStats::default()
        };
        for core in &self.cores {
            stats.instructions += core.pipeline.instructions;
            stats.pipeline_flushes += core.pipeline.flushes;
            let (ih, im) = core.icache.stats();
            stats.icache_hits += ih;
            stats.icache_misses += im;
            let (dh, dm) = core.dcache.stats();
            stats.dcache_hits += dh;
            stats.dcache_misses += dm;
            stats.families_allocated += core.families.total_allocated();
        }
        for cache in &self.memory.caches {
            let (h, m) = cache.stats();
            stats.l2_hits += h;
            stats.l2_misses += m;
        }
        for root in &self.memory.roots {
            let (r, w) = root.memory_stats();
            stats.external_reads += r;
            stats.external_writes += w;
        }
        stats
    }
}
