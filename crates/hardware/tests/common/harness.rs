//! Test harness: small grids, request injection, and coherent inspection.

use microgrid_core::common::{MemAddr, Pid, Tid};
use microgrid_core::kernel::{Phase, ProcCtx};
use microgrid_core::mem::traits::Memory as _;
use microgrid_core::{Config, Microgrid};

/// A grid under test plus its configuration.
pub struct TestGrid {
    /// The grid.
    pub grid: Microgrid,
    /// The configuration it was built from.
    pub config: Config,
}

impl TestGrid {
    /// Builds a small grid: shallow tables, fast DDR, short deadlock
    /// threshold.
    pub fn new(num_processors: usize, num_caches: usize) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let mut config = Config::default();
        config.num_processors = num_processors;
        config.core.num_families = 4;
        config.core.num_threads = 16;
        config.core.num_int_registers = 256;
        config.core.num_flt_registers = 64;
        config.core.register_block_size = 16;
        config.memory.num_caches = num_caches;
        config.memory.l2_cache_num_sets = 16;
        config.deadlock_threshold = 2000;
        config
            .validate()
            .unwrap_or_else(|e| panic!("test config invalid: {e}"));
        let grid = Microgrid::new(&config).unwrap_or_else(|e| panic!("grid construction: {e}"));
        Self { grid, config }
    }

    /// A commit-phase context for direct state manipulation in tests.
    pub fn commit_ctx(&self, pid: usize) -> ProcCtx {
        ProcCtx {
            phase: Phase::Commit,
            cycle: self.grid.cycle(),
            pid,
        }
    }

    /// Runs the three-phase dance of one injected memory read, as if the
    /// core's pipeline had issued it.
    pub fn inject_read(&mut self, core: Pid, addr: MemAddr) {
        let proc = self.grid.cores[core].pipeline.proc_pipeline;
        let line = self.config.memory.cache_line_size;
        for phase in [Phase::Acquire, Phase::Check, Phase::Commit] {
            let ctx = ProcCtx {
                phase,
                cycle: self.grid.cycle(),
                pid: proc,
            };
            assert!(
                self.grid.memory.read(core, addr, line, ctx),
                "injected read refused"
            );
        }
    }

    /// Injects one memory write from a core, tagged with `tid`.
    pub fn inject_write(&mut self, core: Pid, addr: MemAddr, data: &[u8], tid: Tid) {
        let proc = self.grid.cores[core].pipeline.proc_pipeline;
        for phase in [Phase::Acquire, Phase::Check, Phase::Commit] {
            let ctx = ProcCtx {
                phase,
                cycle: self.grid.cycle(),
                pid: proc,
            };
            assert!(
                self.grid.memory.write(core, addr, data, tid, ctx),
                "injected write refused"
            );
        }
    }

    /// Reads one machine word through the cache hierarchy: the freshest
    /// L2 copy wins, falling back to backing storage.
    pub fn read_coherent_u64(&self, addr: MemAddr) -> u64 {
        let line_size = self.config.memory.cache_line_size as u64;
        let base = addr - addr % line_size;
        let offset = (addr % line_size) as usize;
        for cache in &self.grid.memory.caches {
            if let Some(line) = cache.find_line(base) {
                if line.valid[offset..offset + 8].iter().all(|&v| v) {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&line.data[offset..offset + 8]);
                    return u64::from_le_bytes(bytes);
                }
            }
        }
        self.grid.read_memory_u64(addr)
    }

    /// Runs until idle, panicking on simulation errors or budget
    /// exhaustion.
    ///
    /// Always takes one step first so that work staged outside the loop
    /// (injected requests) gets published and picked up.
    pub fn run_to_idle(&mut self, max_cycles: u64) {
        self.grid
            .step()
            .unwrap_or_else(|e| panic!("simulation error: {e}"));
        match self.grid.run(max_cycles) {
            Ok(microgrid_core::sim::RunOutcome::Finished) => {}
            Ok(microgrid_core::sim::RunOutcome::CycleLimit) => {
                panic!(
                    "cycle budget exhausted at cycle {}:\n{}",
                    self.grid.cycle(),
                    self.grid.sched.dump()
                )
            }
            Err(e) => panic!("simulation error: {e}"),
        }
    }

    /// Asserts the pool occupancy invariant on every table of the grid.
    pub fn assert_pool_invariants(&self) {
        for core in &self.grid.cores {
            let f = core.families.free_counts();
            assert_eq!(
                f.iter().sum::<usize>() + core.families.used(),
                core.families.len(),
                "family pool invariant broken on core {}",
                core.pid
            );
            let t = core.threads.free_counts();
            let used = core
                .threads
                .iter()
                .filter(|t| t.state != microgrid_core::core::thread_table::ThreadState::Empty)
                .count();
            assert_eq!(
                t.iter().sum::<usize>() + used,
                core.threads.len(),
                "thread pool invariant broken on core {}",
                core.pid
            );
        }
    }

    /// Asserts token conservation for the line holding `addr`.
    pub fn assert_tokens(&self, addr: MemAddr, expected: usize) {
        assert_eq!(
            self.grid.memory.token_census(addr),
            expected,
            "token census mismatch for {addr:#x}"
        );
    }
}
