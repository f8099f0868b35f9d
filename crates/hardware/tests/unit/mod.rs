/// Token coherence: read-miss merge, write update, conservation.
pub mod coherence;
/// FPU queueing and asynchronous writeback.
pub mod fpu;
/// Instruction encoding, control words, register counts.
pub mod isa;
/// Kernel primitives: storages and arbitration.
pub mod kernel;
/// End-to-end concurrency scenarios.
pub mod scenarios;
/// Family/thread table pools and the register allocation unit.
pub mod tables;
/// FID and place wire formats.
pub mod wire;
