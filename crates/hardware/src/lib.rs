//! Cycle-accurate Microgrid simulator library.
//!
//! This crate implements a many-core Microgrid processor simulator with the following:
//! 1. **Kernel:** a two-phase discrete-event scheduler with arbitrated shared
//!    resources and buffered storages.
//! 2. **Cores:** family and thread tables, register file and allocation unit,
//!    instruction and data caches, a six-stage pipeline, and the allocator
//!    state machines that create, schedule, and reclaim hardware threads.
//! 3. **Network:** delegation (any-to-any) and link (ring-neighbor) message
//!    paths carrying family operations, register traffic, and allocation
//!    walks.
//! 4. **Memory:** a token-coherent COMA hierarchy of L2 caches, directories,
//!    and DDR-backed root directories on a two-level ring.
//! 5. **Simulation:** `Microgrid` (construction, wiring, run loop), the
//!    program assembler, and statistics.

/// Common identifier types, wire formats, and errors.
pub mod common;
/// Simulator configuration (defaults and hierarchical structures).
pub mod config;
/// Per-core hardware blocks.
pub mod core;
/// Instruction contract and the built-in test ISA.
pub mod isa;
/// Discrete-event kernel: scheduler, arbitration, storage primitives.
pub mod kernel;
/// Token-coherent COMA memory hierarchy.
pub mod mem;
/// Simulation: top-level grid, loader, run loop.
pub mod sim;
/// Aggregate statistics collection and reporting.
pub mod stats;

/// Root configuration type; use `Config::default()` or `Config::from_json`.
pub use crate::config::Config;
/// Fatal simulation error type.
pub use crate::common::SimError;
/// Top-level simulator; owns the cores, network, memory, and FPUs.
pub use crate::sim::simulator::Microgrid;
