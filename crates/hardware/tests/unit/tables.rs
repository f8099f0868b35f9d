//! Family table, thread table, and register allocation unit tests,
//! including the pool occupancy invariant as a property over random
//! allocate/free sequences.

use microgrid_core::common::{PerType, RegType};
use microgrid_core::core::family_table::{ContextType, FamilyTable};
use microgrid_core::core::raunit::RaUnit;
use microgrid_core::core::thread_table::ThreadTable;
use microgrid_core::kernel::{Phase, ProcCtx};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn commit() -> ProcCtx {
    ProcCtx {
        phase: Phase::Commit,
        cycle: 0,
        pid: 0,
    }
}

fn pool_sum(free: [usize; 3]) -> usize {
    free.iter().sum()
}

// ══════════════════════════════════════════════════════════
// 1. Family table pools
// ══════════════════════════════════════════════════════════

#[test]
fn family_table_starts_with_one_exclusive_entry() {
    let table = FamilyTable::new(8);
    assert_eq!(table.free_counts(), [7, 0, 1]);
    assert!(table.is_empty());
}

#[test]
fn exclusive_allocation_takes_the_last_slot() {
    let mut table = FamilyTable::new(8);
    let lfid = table
        .allocate(ContextType::Exclusive, commit())
        .unwrap_or_else(|| panic!("exclusive context must be free"));
    assert_eq!(lfid, 7);
    assert!(table.is_exclusive(lfid));
    assert!(table.exclusive_used());
    assert!(table.allocate(ContextType::Exclusive, commit()).is_none());
}

#[test]
fn reserve_moves_normal_entries_to_the_reserved_pool() {
    let mut table = FamilyTable::new(8);
    table.reserve(commit());
    assert_eq!(table.free_counts(), [6, 1, 1]);
    let lfid = table
        .allocate(ContextType::Reserved, commit())
        .unwrap_or_else(|| panic!("reserved context must be available"));
    table.free_family(lfid, ContextType::Normal, commit());
    assert_eq!(table.free_counts(), [7, 0, 1]);
}

proptest! {
    // Invariant: free pools plus used entries always equal the table
    // size, through any allocate/free interleaving.
    #[test]
    fn family_pool_occupancy_invariant(ops in proptest::collection::vec(0u8..4, 1..64)) {
        let mut table = FamilyTable::new(8);
        let mut live: Vec<usize> = Vec::new();
        for op in ops {
            match op {
                0 => {
                    if let Some(lfid) = table.allocate(ContextType::Normal, commit()) {
                        live.push(lfid);
                    }
                }
                1 => {
                    if let Some(lfid) = live.pop() {
                        let context = if table.is_exclusive(lfid) {
                            ContextType::Exclusive
                        } else {
                            ContextType::Normal
                        };
                        table.free_family(lfid, context, commit());
                    }
                }
                2 => {
                    if let Some(lfid) = table.allocate(ContextType::Exclusive, commit()) {
                        live.push(lfid);
                    }
                }
                _ => {
                    if table.free_counts()[0] > 0 {
                        table.reserve(commit());
                        table.unreserve(commit());
                    }
                }
            }
            prop_assert_eq!(pool_sum(table.free_counts()) + table.used(), table.len());
        }
    }
}

// ══════════════════════════════════════════════════════════
// 2. Thread table pools
// ══════════════════════════════════════════════════════════

#[test]
fn thread_table_pops_fifo_and_recycles() {
    let mut table = ThreadTable::new(8);
    let a = table.pop_empty(ContextType::Normal, commit());
    let b = table.pop_empty(ContextType::Normal, commit());
    assert_eq!(a, Some(0));
    assert_eq!(b, Some(1));
    table.push_empty(0, ContextType::Normal, commit());
    // Slot 0 went to the back of the empty queue.
    assert_eq!(table.pop_empty(ContextType::Normal, commit()), Some(2));
}

#[test]
fn thread_pool_refuses_when_pool_exhausted() {
    let mut table = ThreadTable::new(4);
    // 3 normal entries (one is exclusive).
    assert!(table.pop_empty(ContextType::Normal, commit()).is_some());
    assert!(table.pop_empty(ContextType::Normal, commit()).is_some());
    assert!(table.pop_empty(ContextType::Normal, commit()).is_some());
    assert!(table.pop_empty(ContextType::Normal, commit()).is_none());
    assert!(table.pop_empty(ContextType::Exclusive, commit()).is_some());
}

// ══════════════════════════════════════════════════════════
// 3. Register allocation unit
// ══════════════════════════════════════════════════════════

#[test]
fn raunit_allocates_contiguous_runs() {
    let mut unit = RaUnit::new(PerType([128, 64]), 16);
    let a = unit
        .alloc(PerType([20, 0]), 0, ContextType::Normal, commit())
        .unwrap_or_else(|| panic!("first run must fit"));
    assert_eq!(a[RegType::Integer], Some(0));
    assert_eq!(a[RegType::Float], None);

    let b = unit
        .alloc(PerType([16, 16]), 1, ContextType::Normal, commit())
        .unwrap_or_else(|| panic!("second run must fit"));
    // 20 registers consumed 2 blocks of 16.
    assert_eq!(b[RegType::Integer], Some(32));
    assert_eq!(b[RegType::Float], Some(0));
}

#[test]
fn raunit_free_reopens_the_gap() {
    let mut unit = RaUnit::new(PerType([64, 64]), 16);
    let a = unit
        .alloc(PerType([32, 0]), 0, ContextType::Normal, commit())
        .unwrap_or_else(|| panic!("alloc a"));
    let _b = unit
        .alloc(PerType([16, 0]), 1, ContextType::Normal, commit())
        .unwrap_or_else(|| panic!("alloc b"));
    unit.free(a, ContextType::Normal, commit());
    let c = unit
        .alloc(PerType([32, 0]), 2, ContextType::Normal, commit())
        .unwrap_or_else(|| panic!("re-alloc into the gap"));
    assert_eq!(c[RegType::Integer], Some(0));
}

#[test]
fn raunit_refuses_when_no_contiguous_run_exists() {
    let mut unit = RaUnit::new(PerType([32, 32]), 16);
    let _a = unit.alloc(PerType([32, 0]), 0, ContextType::Normal, commit());
    assert!(unit
        .alloc(PerType([1, 0]), 1, ContextType::Normal, commit())
        .is_none());
}
