//! Simulation layer: the top-level `Microgrid`, program assembly, and the
//! run loop.

/// Program image assembly (control blocks, annotations, register counts).
pub mod loader;

/// Top-level simulator: construction, wiring, and the cycle loop.
pub mod simulator;

pub use loader::Assembler;
pub use simulator::{Microgrid, RunOutcome};
