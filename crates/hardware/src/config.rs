//! Configuration system for the Microgrid simulator.
//!
//! This module defines all configuration structures used to parameterize the
//! simulated hardware. It provides:
//! 1. **Defaults:** baseline constants for the grid, per-core tables, caches,
//!    COMA hierarchy, DDR timing, and the FPU.
//! 2. **Structures:** hierarchical config for the grid, cores, memory, and
//!    floating-point units.
//! 3. **Validation:** structural checks (powers of two, divisibility) that
//!    reject a malformed configuration at startup.
//!
//! Configuration is supplied as JSON (`Config::from_json`) or built in code
//! from `Config::default()`.

use serde::Deserialize;

use crate::common::SimError;

/// Default configuration constants.
///
/// These values define the baseline hardware when a field is not explicitly
/// present in the configuration input.
mod defaults {
    /// Number of cores in the grid.
    pub const NUM_PROCESSORS: usize = 1;

    /// Family table entries per core, including the exclusive context.
    pub const NUM_FAMILIES: usize = 8;

    /// Thread table entries per core, including the exclusive context.
    pub const NUM_THREADS: usize = 64;

    /// Integer registers per core.
    pub const NUM_INT_REGISTERS: usize = 1024;

    /// Floating-point registers per core.
    pub const NUM_FLT_REGISTERS: usize = 128;

    /// Register allocation block size (registers per block, power of two).
    pub const REGISTER_BLOCK_SIZE: usize = 32;

    /// Instruction cache associativity.
    pub const ICACHE_ASSOCIATIVITY: usize = 4;

    /// Instruction cache sets.
    pub const ICACHE_NUM_SETS: usize = 8;

    /// Data cache associativity.
    pub const DCACHE_ASSOCIATIVITY: usize = 4;

    /// Data cache sets.
    pub const DCACHE_NUM_SETS: usize = 16;

    /// Size of the control block covered by one control word, in bytes.
    pub const CONTROL_BLOCK_SIZE: usize = 64;

    /// Pending local creates queued per core.
    pub const LOCAL_CREATES_QUEUE_SIZE: usize = 8;

    /// Threads pending cleanup queued per core.
    pub const THREAD_CLEANUP_QUEUE_SIZE: usize = 8;

    /// Incoming family allocation requests queued per core, per kind.
    pub const FAMILY_ALLOCATION_QUEUE_SIZE: usize = 8;

    /// Used-context threshold above which balanced allocations walk on.
    pub const LOAD_BALANCE_THRESHOLD: usize = 1;

    /// Cache line size in bytes, shared by all caches in the system.
    pub const CACHE_LINE_SIZE: usize = 64;

    /// L2 (COMA) cache associativity.
    pub const L2_CACHE_ASSOCIATIVITY: usize = 4;

    /// L2 (COMA) cache sets.
    pub const L2_CACHE_NUM_SETS: usize = 128;

    /// Number of L2 caches; cores are divided evenly over them.
    pub const NUM_CACHES: usize = 1;

    /// Number of intermediate directories on the top-level ring.
    pub const NUM_DIRECTORIES: usize = 1;

    /// Number of root directories terminating the top-level ring.
    pub const NUM_ROOT_DIRECTORIES: usize = 1;

    /// Ring node buffer capacity, in messages.
    pub const MEMORY_BUFFER_SIZE: usize = 16;

    /// Processor bus request buffer capacity, in requests.
    pub const BUS_BUFFER_SIZE: usize = 16;

    /// DDR row-activate latency (tRCD), in memory cycles.
    pub const DDR_T_RCD: u64 = 14;

    /// DDR column access latency (tCL), in memory cycles.
    pub const DDR_T_CL: u64 = 14;

    /// DDR write recovery latency (tWR), in memory cycles.
    pub const DDR_T_WR: u64 = 15;

    /// DDR precharge latency (tRP), in memory cycles.
    pub const DDR_T_RP: u64 = 14;

    /// DDR burst transfer cycles per cache line.
    pub const DDR_BURST_CYCLES: u64 = 4;

    /// Cores served by one FPU.
    pub const NUM_PROCESSORS_PER_FPU: usize = 2;

    /// FPU input queue capacity per source core.
    pub const FPU_QUEUE_SIZE: usize = 4;

    /// FPU add/sub/mul latency in cycles.
    pub const FPU_ARITH_LATENCY: u64 = 4;

    /// FPU divide/sqrt latency in cycles.
    pub const FPU_DIV_LATENCY: u64 = 12;

    /// Progress-free cycles before a deadlock is declared.
    pub const DEADLOCK_THRESHOLD: u64 = 1000;
}

fn is_pow2(n: usize) -> bool {
    n != 0 && n & (n - 1) == 0
}

/// Per-core configuration: tables, register file, instruction cache, and
/// allocator queue depths.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Family table entries, including the exclusive context.
    #[serde(alias = "NumFamilies")]
    pub num_families: usize,
    /// Thread table entries, including the exclusive context.
    #[serde(alias = "NumThreads")]
    pub num_threads: usize,
    /// Integer registers.
    pub num_int_registers: usize,
    /// Floating-point registers.
    pub num_flt_registers: usize,
    /// Register allocation block size (power of two).
    pub register_block_size: usize,
    /// Instruction cache associativity.
    pub icache_associativity: usize,
    /// Instruction cache sets.
    pub icache_num_sets: usize,
    /// Data cache associativity.
    pub dcache_associativity: usize,
    /// Data cache sets.
    pub dcache_num_sets: usize,
    /// Bytes covered by one control word.
    #[serde(alias = "ControlBlockSize")]
    pub control_block_size: usize,
    /// Pending local creates queued.
    #[serde(alias = "LocalCreatesQueueSize")]
    pub local_creates_queue_size: usize,
    /// Threads pending cleanup queued.
    #[serde(alias = "ThreadCleanupQueueSize")]
    pub thread_cleanup_queue_size: usize,
    /// Incoming family allocation requests queued, per request kind.
    pub family_allocation_queue_size: usize,
    /// Used-context threshold for balanced allocation.
    #[serde(alias = "LoadBalanceThreshold")]
    pub load_balance_threshold: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            num_families: defaults::NUM_FAMILIES,
            num_threads: defaults::NUM_THREADS,
            num_int_registers: defaults::NUM_INT_REGISTERS,
            num_flt_registers: defaults::NUM_FLT_REGISTERS,
            register_block_size: defaults::REGISTER_BLOCK_SIZE,
            icache_associativity: defaults::ICACHE_ASSOCIATIVITY,
            icache_num_sets: defaults::ICACHE_NUM_SETS,
            dcache_associativity: defaults::DCACHE_ASSOCIATIVITY,
            dcache_num_sets: defaults::DCACHE_NUM_SETS,
            control_block_size: defaults::CONTROL_BLOCK_SIZE,
            local_creates_queue_size: defaults::LOCAL_CREATES_QUEUE_SIZE,
            thread_cleanup_queue_size: defaults::THREAD_CLEANUP_QUEUE_SIZE,
            family_allocation_queue_size: defaults::FAMILY_ALLOCATION_QUEUE_SIZE,
            load_balance_threshold: defaults::LOAD_BALANCE_THRESHOLD,
        }
    }
}

/// DDR channel timing parameters, in memory cycles.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DdrConfig {
    /// Row-activate latency (tRCD).
    pub t_rcd: u64,
    /// Column access latency (tCL).
    pub t_cl: u64,
    /// Write recovery latency (tWR).
    pub t_wr: u64,
    /// Precharge latency (tRP).
    pub t_rp: u64,
    /// Burst transfer cycles per cache line.
    pub burst_cycles: u64,
}

impl Default for DdrConfig {
    fn default() -> Self {
        Self {
            t_rcd: defaults::DDR_T_RCD,
            t_cl: defaults::DDR_T_CL,
            t_wr: defaults::DDR_T_WR,
            t_rp: defaults::DDR_T_RP,
            burst_cycles: defaults::DDR_BURST_CYCLES,
        }
    }
}

/// COMA memory hierarchy configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Cache line size in bytes (power of two).
    #[serde(alias = "CacheLineSize")]
    pub cache_line_size: usize,
    /// L2 cache associativity.
    #[serde(alias = "L2CacheAssociativity")]
    pub l2_cache_associativity: usize,
    /// L2 cache sets (power of two).
    #[serde(alias = "L2CacheNumSets")]
    pub l2_cache_num_sets: usize,
    /// Number of L2 caches.
    #[serde(alias = "NumCaches")]
    pub num_caches: usize,
    /// Number of intermediate directories.
    #[serde(alias = "NumDirectories")]
    pub num_directories: usize,
    /// Number of root directories (power of two).
    #[serde(alias = "NumRootDirectories")]
    #[serde(alias = "NumSplitRootDirectories")]
    pub num_root_directories: usize,
    /// Ring node buffer capacity.
    #[serde(alias = "MemoryBufferSize")]
    pub memory_buffer_size: usize,
    /// Processor bus request buffer capacity.
    pub bus_buffer_size: usize,
    /// DDR channel timings.
    pub ddr: DdrConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            cache_line_size: defaults::CACHE_LINE_SIZE,
            l2_cache_associativity: defaults::L2_CACHE_ASSOCIATIVITY,
            l2_cache_num_sets: defaults::L2_CACHE_NUM_SETS,
            num_caches: defaults::NUM_CACHES,
            num_directories: defaults::NUM_DIRECTORIES,
            num_root_directories: defaults::NUM_ROOT_DIRECTORIES,
            memory_buffer_size: defaults::MEMORY_BUFFER_SIZE,
            bus_buffer_size: defaults::BUS_BUFFER_SIZE,
            ddr: DdrConfig::default(),
        }
    }
}

/// Floating-point unit configuration.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FpuConfig {
    /// Cores served by one FPU.
    #[serde(alias = "NumProcessorsPerFPU")]
    pub num_processors_per_fpu: usize,
    /// Input queue capacity per source core.
    pub queue_size: usize,
    /// Add/sub/mul latency in cycles.
    pub arith_latency: u64,
    /// Divide/sqrt latency in cycles.
    pub div_latency: u64,
}

impl Default for FpuConfig {
    fn default() -> Self {
        Self {
            num_processors_per_fpu: defaults::NUM_PROCESSORS_PER_FPU,
            queue_size: defaults::FPU_QUEUE_SIZE,
            arith_latency: defaults::FPU_ARITH_LATENCY,
            div_latency: defaults::FPU_DIV_LATENCY,
        }
    }
}

/// Root configuration for one simulated Microgrid.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of cores in the grid (power of two).
    #[serde(alias = "NumProcessors")]
    pub num_processors: usize,
    /// Per-core configuration.
    pub core: CoreConfig,
    /// Memory hierarchy configuration.
    pub memory: MemoryConfig,
    /// FPU configuration.
    pub fpu: FpuConfig,
    /// Progress-free cycles before a deadlock is declared.
    pub deadlock_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_processors: defaults::NUM_PROCESSORS,
            core: CoreConfig::default(),
            memory: MemoryConfig::default(),
            fpu: FpuConfig::default(),
            deadlock_threshold: defaults::DEADLOCK_THRESHOLD,
        }
    }
}

impl Config {
    /// Parses a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self, SimError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| SimError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks structural constraints the hardware model depends on.
    pub fn validate(&self) -> Result<(), SimError> {
        if !is_pow2(self.num_processors) {
            return Err(SimError::Config(format!(
                "num_processors must be a power of two, got {}",
                self.num_processors
            )));
        }
        if !is_pow2(self.core.register_block_size) {
            return Err(SimError::Config(format!(
                "register_block_size must be a power of two, got {}",
                self.core.register_block_size
            )));
        }
        for (name, count) in [
            ("num_int_registers", self.core.num_int_registers),
            ("num_flt_registers", self.core.num_flt_registers),
        ] {
            if count % self.core.register_block_size != 0 {
                return Err(SimError::Config(format!(
                    "{name} must be a multiple of the register block size"
                )));
            }
        }
        if self.core.num_families < 2 || self.core.num_threads < 2 {
            return Err(SimError::Config(
                "family and thread tables need at least one normal and one exclusive entry"
                    .to_string(),
            ));
        }
        if !is_pow2(self.memory.cache_line_size) {
            return Err(SimError::Config(format!(
                "cache_line_size must be a power of two, got {}",
                self.memory.cache_line_size
            )));
        }
        if self.num_processors % self.memory.num_caches != 0 {
            return Err(SimError::Config(
                "num_processors must be divisible by num_caches".to_string(),
            ));
        }
        if self.memory.num_caches % self.memory.num_directories != 0 {
            return Err(SimError::Config(
                "num_caches must be divisible by num_directories".to_string(),
            ));
        }
        if self.memory.memory_buffer_size < 4 {
            return Err(SimError::Config(
                "memory_buffer_size must be at least 4 to keep the ring deadlock-free".to_string(),
            ));
        }
        Ok(())
    }
}
