//! End-to-end concurrency scenarios: local and place-wide creates, the
//! allocation unwind, and break propagation, driven by assembled programs
//! on the full grid.

use microgrid_core::core::family_table::ContextType;
use microgrid_core::isa::{AllocationType, Annotation, FamilyProperty, Instr, RegSpec};
use microgrid_core::sim::Assembler;

use crate::common::harness::TestGrid;

const PARENT_BASE: u64 = 0x1000;
const CHILD_BASE: u64 = 0x2000;
const RESULT: u64 = 0x7000;

fn kill() -> Annotation {
    Annotation {
        swch: false,
        kill: true,
    }
}

fn l(i: usize) -> RegSpec {
    RegSpec::l(i)
}

/// Assembles the parent: allocate a place, set the iteration space,
/// create, seed the first dependent (when `with_shareds`), sync, read the
/// final shared back, store it, detach, die.
fn parent_program(
    t: &mut TestGrid,
    place: i16,
    limit: i16,
    block: i16,
    child_entry: u64,
    with_shareds: bool,
) -> u64 {
    let cbs = t.config.core.control_block_size;
    let mut asm = Assembler::new(PARENT_BASE, cbs);
    let entry = asm.reg_counts([(0, 0, 8), (0, 0, 0)]);
    asm.instr(Instr::Ldi { rd: l(0), imm: place });
    asm.instr(Instr::Allocate {
        rd: l(1),
        ra: l(0),
        suspend: true,
        exclusive: false,
        atype: AllocationType::Normal,
    });
    asm.instr(Instr::Ldi { rd: l(2), imm: 0 });
    asm.instr(Instr::Ldi { rd: l(3), imm: limit });
    asm.instr(Instr::Ldi { rd: l(4), imm: 1 });
    asm.instr(Instr::Ldi { rd: l(5), imm: block });
    asm.instr(Instr::SetProperty {
        ra: l(1),
        prop: FamilyProperty::Start,
        rb: l(2),
    });
    asm.instr(Instr::SetProperty {
        ra: l(1),
        prop: FamilyProperty::Limit,
        rb: l(3),
    });
    asm.instr(Instr::SetProperty {
        ra: l(1),
        prop: FamilyProperty::Step,
        rb: l(4),
    });
    asm.instr(Instr::SetProperty {
        ra: l(1),
        prop: FamilyProperty::BlockSize,
        rb: l(5),
    });
    asm.instr(Instr::Ldi {
        rd: l(6),
        imm: child_entry as i16,
    });
    asm.instr(Instr::Create {
        rd: l(7),
        ra: l(1),
        rb: l(6),
    });
    if with_shareds {
        // The first thread's dependent starts the accumulation at zero.
        asm.instr(Instr::PutShared {
            ra: l(7),
            index: 0,
            rb: l(2),
        });
    }
    asm.instr(Instr::Sync { rd: l(0), ra: l(7) });
    // Reading the sync register orders everything after completion.
    asm.instr(Instr::Add {
        rd: l(0),
        ra: l(0),
        rb: l(0),
    });
    if with_shareds {
        asm.instr(Instr::GetShared {
            rd: l(2),
            ra: l(7),
            index: 0,
        });
    } else {
        asm.instr(Instr::Ldi { rd: l(2), imm: 7 });
    }
    asm.instr(Instr::Ldi {
        rd: l(3),
        imm: RESULT as i16,
    });
    asm.instr(Instr::Store {
        rv: l(2),
        ra: l(3),
        offset: 0,
    });
    asm.instr(Instr::Detach { ra: l(7) });
    asm.instr_annotated(Instr::Nop, kill());

    let (base, image) = asm.finish();
    t.grid.write_memory(base, &image);
    entry
}

/// Child accumulating its index into the shared chain.
fn sum_child(t: &mut TestGrid) -> u64 {
    let cbs = t.config.core.control_block_size;
    let mut asm = Assembler::new(CHILD_BASE, cbs);
    let entry = asm.reg_counts([(0, 1, 1), (0, 0, 0)]);
    asm.instr_annotated(
        Instr::Add {
            rd: RegSpec::s(0),
            ra: RegSpec::d(0),
            rb: l(0),
        },
        kill(),
    );
    let (base, image) = asm.finish();
    t.grid.write_memory(base, &image);
    entry
}

/// Shared-free child touching only its index local.
fn trivial_child(t: &mut TestGrid) -> u64 {
    let cbs = t.config.core.control_block_size;
    let mut asm = Assembler::new(CHILD_BASE, cbs);
    let entry = asm.reg_counts([(0, 0, 1), (0, 0, 0)]);
    asm.instr_annotated(
        Instr::Add {
            rd: l(0),
            ra: l(0),
            rb: l(0),
        },
        kill(),
    );
    let (base, image) = asm.finish();
    t.grid.write_memory(base, &image);
    entry
}

fn assert_tables_drained(t: &TestGrid) {
    for core in &t.grid.cores {
        assert!(
            core.families.is_empty(),
            "core {} still holds families",
            core.pid
        );
        assert!(
            core.threads.is_empty(),
            "core {} still holds threads",
            core.pid
        );
    }
    t.assert_pool_invariants();
}

// Scenario S1: a local create of a finite family of ten threads with a
// block of four. The shared chain accumulates the indices, so the parent
// reads back 0 + 1 + .. + 9.
#[test]
fn local_create_runs_ten_threads_and_cleans_up() {
    let mut t = TestGrid::new(1, 1);
    t.grid.write_memory(RESULT, &[0u8; 64]);
    let child = sum_child(&mut t);
    let entry = parent_program(&mut t, 1, 10, 4, child, true);

    t.grid.boot(0, entry, false);
    t.run_to_idle(100_000);

    assert_eq!(t.read_coherent_u64(RESULT), 45, "shared chain sum");
    assert_tables_drained(&t);
    // Boot family plus the created family.
    assert_eq!(t.grid.cores[0].families.total_allocated(), 2);
    t.assert_tokens(RESULT, t.grid.memory.total_tokens());
}

// Scenario S2: a place-wide create over two cores; four threads run on
// each, the done-token chain crosses the link, and the sync completion
// comes back to the parent.
#[test]
fn place_wide_create_distributes_threads_and_synchronizes() {
    let mut t = TestGrid::new(2, 1);
    t.grid.write_memory(RESULT, &[0u8; 64]);
    let child = trivial_child(&mut t);
    let entry = parent_program(&mut t, 2, 8, 4, child, false);

    t.grid.boot(0, entry, false);
    t.run_to_idle(100_000);

    assert_eq!(t.read_coherent_u64(RESULT), 7, "sync sentinel");
    assert_tables_drained(&t);
    // Each core ran its half of the family: four one-instruction
    // threads apiece.
    assert!(
        t.grid.cores[1].pipeline.instructions >= 4,
        "second core never ran its threads (retired {})",
        t.grid.cores[1].pipeline.instructions
    );
    assert_eq!(t.grid.cores[1].families.total_allocated(), 1);
}

fn occupy_normal_contexts(t: &mut TestGrid, core: usize) {
    let ctx = t.commit_ctx(0);
    while t.grid.cores[core]
        .families
        .allocate(ContextType::Normal, ctx)
        .is_some()
    {}
}

fn unwind_parent(t: &mut TestGrid, atype: AllocationType) -> u64 {
    let cbs = t.config.core.control_block_size;
    let mut asm = Assembler::new(PARENT_BASE, cbs);
    let entry = asm.reg_counts([(0, 0, 4), (0, 0, 0)]);
    asm.instr(Instr::Ldi { rd: l(0), imm: 4 });
    asm.instr(Instr::Allocate {
        rd: l(1),
        ra: l(0),
        suspend: false,
        exclusive: false,
        atype,
    });
    asm.instr(Instr::Ldi {
        rd: l(2),
        imm: RESULT as i16,
    });
    asm.instr(Instr::Store {
        rv: l(1),
        ra: l(2),
        offset: 0,
    });
    asm.instr_annotated(Instr::Nop, kill());
    let (base, image) = asm.finish();
    t.grid.write_memory(base, &image);
    entry
}

// Scenario S3, non-exact: a four-core place with the third core out of
// contexts unwinds to the largest power of two, committing two cores.
#[test]
fn allocation_unwinds_to_power_of_two() {
    let mut t = TestGrid::new(4, 1);
    t.grid.write_memory(RESULT, &[0u8; 64]);
    occupy_normal_contexts(&mut t, 2);
    let entry = unwind_parent(&mut t, AllocationType::Normal);

    t.grid.boot(0, entry, false);
    t.run_to_idle(100_000);

    let packed = t.read_coherent_u64(RESULT);
    assert_ne!(packed, 0, "the partial allocation must succeed");
    let fid = t.grid.cores[0].fid_format.unpack(packed);
    assert_eq!(fid.pid, 0, "the committed place starts at core 0");
    let family = t.grid.cores[0].families.get(fid.lfid);
    assert_eq!(family.num_cores, 2, "committed to the power-of-two prefix");
    assert_eq!(
        t.grid.cores[1].families.used(),
        1,
        "the second core keeps its context"
    );
    assert_eq!(
        t.grid.cores[3].families.used(),
        0,
        "the walk never reached the fourth core"
    );
}

// Scenario S3, exact: the same shortage releases every reserved context
// and reports FID 0 to the caller.
#[test]
fn exact_allocation_unwinds_completely() {
    let mut t = TestGrid::new(4, 1);
    t.grid.write_memory(RESULT, &[0u8; 64]);
    occupy_normal_contexts(&mut t, 2);
    let entry = unwind_parent(&mut t, AllocationType::Exact);

    t.grid.boot(0, entry, false);
    t.run_to_idle(100_000);

    assert_eq!(
        t.read_coherent_u64(RESULT),
        0,
        "an exact allocation that cannot complete reports FID 0"
    );
    assert_eq!(t.grid.cores[0].families.used(), 0);
    assert_eq!(t.grid.cores[1].families.used(), 0);
}

/// Child that breaks its own family and dies.
fn breaking_child(t: &mut TestGrid) -> u64 {
    let cbs = t.config.core.control_block_size;
    let mut asm = Assembler::new(CHILD_BASE, cbs);
    let entry = asm.reg_counts([(0, 0, 1), (0, 0, 0)]);
    asm.instr(Instr::Break);
    asm.instr_annotated(Instr::Nop, kill());
    let (base, image) = asm.finish();
    t.grid.write_memory(base, &image);
    entry
}

// Scenario S6: a break issued by a running thread walks the whole place;
// every core stops allocating, running threads finish, and the family
// still synchronizes back to the parent.
#[test]
fn break_propagates_across_the_place_and_family_syncs() {
    let mut t = TestGrid::new(4, 1);
    t.grid.write_memory(RESULT, &[0u8; 64]);
    let child = breaking_child(&mut t);
    let entry = parent_program(&mut t, 4, 10_000, 2, child, false);

    t.grid.boot(0, entry, false);
    t.run_to_idle(200_000);

    assert_eq!(t.read_coherent_u64(RESULT), 7, "sync sentinel after break");
    assert_tables_drained(&t);
    let child_instructions: u64 = t
        .grid
        .cores
        .iter()
        .map(|c| c.pipeline.instructions)
        .sum();
    assert!(
        child_instructions < 1000,
        "break failed to stop allocation: {child_instructions} instructions retired"
    );
}
