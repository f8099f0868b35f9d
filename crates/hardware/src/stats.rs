//! Aggregate simulation statistics.
//!
//! Collected across all cores and memory nodes at the end of a run:
//! 1. **Execution:** cycles, retired instructions, pipeline flushes.
//! 2. **Concurrency:** family contexts allocated.
//! 3. **Memory hierarchy:** hit/miss counts per level and external DDR
//!    traffic.

use std::fmt;

/// Counters aggregated over a whole grid.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimStats {
    /// Simulated cycles elapsed.
    pub cycles: u64,
    /// Instructions retired across all cores.
    pub instructions: u64,
    /// Pipeline flushes (suspensions and thread ends).
    pub pipeline_flushes: u64,
    /// Family contexts allocated across all cores.
    pub families_allocated: u64,
    /// Instruction cache hits.
    pub icache_hits: u64,
    /// Instruction cache misses.
    pub icache_misses: u64,
    /// Data cache hits.
    pub dcache_hits: u64,
    /// Data cache misses.
    pub dcache_misses: u64,
    /// L2 (COMA) bus hits.
    pub l2_hits: u64,
    /// L2 (COMA) bus misses.
    pub l2_misses: u64,
    /// Line reads served by DDR.
    pub external_reads: u64,
    /// Line writebacks to DDR.
    pub external_writes: u64,
}

impl SimStats {
    /// Instructions per cycle over the run.
    pub fn ipc(&self) -> f64 {
        if self.cycles == 0 {
            0.0
        } else {
            self.instructions as f64 / self.cycles as f64
        }
    }
}

impl fmt::Display for SimStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cycles:              {}", self.cycles)?;
        writeln!(f, "instructions:        {} (ipc {:.3})", self.instructions, self.ipc())?;
        writeln!(f, "pipeline flushes:    {}", self.pipeline_flushes)?;
        writeln!(f, "families allocated:  {}", self.families_allocated)?;
        writeln!(
            f,
            "icache:              {} hits, {} misses",
            self.icache_hits, self.icache_misses
        )?;
        writeln!(
            f,
            "dcache:              {} hits, {} misses",
            self.dcache_hits, self.dcache_misses
        )?;
        writeln!(f, "l2:                  {} hits, {} misses", self.l2_hits, self.l2_misses)?;
        write!(
            f,
            "external memory:     {} reads, {} writes",
            self.external_reads, self.external_writes
        )
    }
}
