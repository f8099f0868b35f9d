//! Common types shared by every layer of the Microgrid simulator.
//!
//! This module provides the fundamental vocabulary of the simulator. It includes:
//! 1. **Identifiers:** Core, family, thread, and cache-line ids plus register addressing.
//! 2. **Wire Formats:** The packed `Fid` and `PlaceId` encodings exchanged between cores.
//! 3. **Error Handling:** The `SimError` type for programmer errors and fatal conditions.

/// Error types for fatal simulation conditions.
pub mod error;

/// Packed family and place identifier wire formats.
pub mod fid;

/// Identifier aliases and register addressing types.
pub mod ids;

pub use error::SimError;
pub use fid::{ceil_log2, Fid, FidFormat, PlaceFormat, PlaceId};
pub use ids::{
    Cid, CycleNo, Lfid, MemAddr, MemSize, PerType, Pid, RegAddr, RegIndex, RegType, Tid,
};
