//! Identifier aliases and register addressing.
//!
//! Every hardware table in the simulator is an arena indexed by a small integer.
//! This module defines the index aliases and the register addressing scheme:
//! 1. **Table Indices:** `Pid`, `Lfid`, `Tid`, and `Cid` name slots in the grid,
//!    family table, thread table, and instruction cache respectively.
//! 2. **Register Addressing:** `RegType` selects the integer or floating-point
//!    bank; `RegAddr` names one physical register within a bank.
//! 3. **Per-Type Storage:** `PerType<T>` holds one value per register type and
//!    is indexable by `RegType` directly.

use std::fmt;
use std::ops::{Index, IndexMut};

/// Core (processor) id, unique across the whole grid.
pub type Pid = usize;

/// Local family id: a slot index in one core's family table.
pub type Lfid = usize;

/// Local thread id: a slot index in one core's thread table.
pub type Tid = usize;

/// Cache-line slot id within a core-local cache.
pub type Cid = usize;

/// Byte address in the simulated memory space.
pub type MemAddr = u64;

/// Size of a memory operation in bytes.
pub type MemSize = usize;

/// Simulation cycle number.
pub type CycleNo = u64;

/// Physical register index within one bank.
pub type RegIndex = usize;

/// Register bank selector.
///
/// Each core carries two physical register banks, one per type. Register
/// plans, allocation block lists, and thread windows all exist once per type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegType {
    /// The integer register bank.
    Integer,
    /// The floating-point register bank.
    Float,
}

impl RegType {
    /// Number of register types (banks per core).
    pub const COUNT: usize = 2;

    /// All register types, in bank order.
    pub const ALL: [Self; Self::COUNT] = [Self::Integer, Self::Float];
}

/// One value per register type, indexable by [`RegType`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerType<T>(pub [T; RegType::COUNT]);

impl<T> Index<RegType> for PerType<T> {
    type Output = T;

    fn index(&self, rt: RegType) -> &T {
        &self.0[rt as usize]
    }
}

impl<T> IndexMut<RegType> for PerType<T> {
    fn index_mut(&mut self, rt: RegType) -> &mut T {
        &mut self.0[rt as usize]
    }
}

/// Address of one physical register: a bank plus an index within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegAddr {
    /// The bank the register lives in.
    pub rtype: RegType,
    /// Index within the bank.
    pub index: RegIndex,
}

impl RegAddr {
    /// Creates a register address in the given bank.
    #[inline]
    pub const fn new(rtype: RegType, index: RegIndex) -> Self {
        Self { rtype, index }
    }

    /// Creates an integer-bank register address.
    #[inline]
    pub const fn int(index: RegIndex) -> Self {
        Self::new(RegType::Integer, index)
    }

    /// Creates a floating-point-bank register address.
    #[inline]
    pub const fn float(index: RegIndex) -> Self {
        Self::new(RegType::Float, index)
    }
}

impl fmt::Display for RegAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rtype {
            RegType::Integer => write!(f, "R{:04}", self.index),
            RegType::Float => write!(f, "F{:04}", self.index),
        }
    }
}
