//! Kernel primitive tests.
//!
//! Verifies the storage staging discipline (acquire and check passes stage
//! nothing durable, commit publishes at update), buffer capacity
//! backpressure, flag levels, and arbitration order.

use microgrid_core::kernel::{Arbitrator, Buffer, Flag, Phase, ProcCtx, Register};
use pretty_assertions::assert_eq;

fn ctx(phase: Phase, cycle: u64, pid: usize) -> ProcCtx {
    ProcCtx { phase, cycle, pid }
}

// ══════════════════════════════════════════════════════════
// 1. Buffer staging
// ══════════════════════════════════════════════════════════

#[test]
fn buffer_push_publishes_only_after_commit_update() {
    let mut buf: Buffer<u32> = Buffer::new(4);
    let mut woken = Vec::new();

    // Acquire and check passes stage speculatively.
    assert!(buf.push(1, ctx(Phase::Acquire, 0, 0)));
    assert!(buf.push(1, ctx(Phase::Check, 0, 0)));
    buf.update(&mut |p| woken.push(p));
    assert!(buf.is_empty(), "non-commit staging must be discarded");

    assert!(buf.push(1, ctx(Phase::Commit, 1, 0)));
    assert!(buf.is_empty(), "not visible before update");
    buf.update(&mut |p| woken.push(p));
    assert_eq!(buf.front(), Some(&1));
}

#[test]
fn buffer_capacity_counts_staged_pushes() {
    let mut buf: Buffer<u32> = Buffer::new(2);
    let c = ctx(Phase::Commit, 0, 0);
    assert!(buf.push(1, c));
    assert!(buf.push(2, c));
    assert!(!buf.push(3, c), "third push must fail against capacity 2");
    buf.update(&mut |_| {});
    assert_eq!(buf.len(), 2);
}

#[rstest::rstest]
#[case(1)]
#[case(4)]
#[case(16)]
fn buffer_accepts_exactly_its_capacity(#[case] capacity: usize) {
    let mut buf: Buffer<usize> = Buffer::new(capacity);
    let c = ctx(Phase::Commit, 0, 0);
    for i in 0..capacity {
        assert!(buf.push(i, c), "push {i} of {capacity}");
    }
    assert!(!buf.push(capacity, c));
}

#[test]
fn buffer_pop_keeps_front_stable_within_cycle() {
    let mut buf: Buffer<u32> = Buffer::new(4);
    assert!(buf.push(7, ctx(Phase::Commit, 0, 0)));
    buf.update(&mut |_| {});

    buf.pop(ctx(Phase::Commit, 1, 0));
    // The pop is staged: the front stays readable all cycle.
    assert_eq!(buf.front(), Some(&7));
    buf.update(&mut |_| {});
    assert!(buf.is_empty());
}

#[test]
fn buffer_wakes_sensitive_process_while_nonempty() {
    let mut buf: Buffer<u32> = Buffer::new(4);
    buf.set_sensitive(5);
    assert!(buf.push(1, ctx(Phase::Commit, 0, 0)));
    let mut woken = Vec::new();
    buf.update(&mut |p| woken.push(p));
    assert_eq!(woken, vec![5]);
}

// ══════════════════════════════════════════════════════════
// 2. Single-entry registers
// ══════════════════════════════════════════════════════════

#[test]
fn register_write_fails_while_occupied() {
    let mut reg: Register<u8> = Register::new();
    assert!(reg.write(1, ctx(Phase::Commit, 0, 0)));
    reg.update(&mut |_| {});

    assert!(!reg.write(2, ctx(Phase::Commit, 1, 0)));
    // Clearing first frees the slot within the same cycle.
    reg.clear(ctx(Phase::Commit, 1, 0));
    assert!(reg.write(3, ctx(Phase::Commit, 1, 0)));
    reg.update(&mut |_| {});
    assert_eq!(reg.read(), Some(&3));
}

#[test]
fn register_force_write_overrides() {
    let mut reg: Register<u8> = Register::new();
    assert!(reg.write(1, ctx(Phase::Commit, 0, 0)));
    reg.update(&mut |_| {});
    reg.write_force(9, ctx(Phase::Commit, 1, 0));
    reg.update(&mut |_| {});
    assert_eq!(reg.read(), Some(&9));
}

// ══════════════════════════════════════════════════════════
// 3. Flags
// ══════════════════════════════════════════════════════════

#[test]
fn flag_levels_publish_at_update() {
    let mut flag = Flag::new(false);
    assert!(flag.set(ctx(Phase::Commit, 0, 0)));
    assert!(!flag.is_set());
    flag.update(&mut |_| {});
    assert!(flag.is_set());
    assert!(flag.clear(ctx(Phase::Commit, 1, 0)));
    flag.update(&mut |_| {});
    assert!(!flag.is_set());
}

// ══════════════════════════════════════════════════════════
// 4. Arbitration
// ══════════════════════════════════════════════════════════

#[test]
fn arbitrator_grants_highest_priority_requester() {
    let mut arb = Arbitrator::new("test");
    arb.add_process(0);
    arb.add_process(1);

    // Both request during acquire; only the first registered wins.
    assert!(arb.invoke(ctx(Phase::Acquire, 0, 0)));
    assert!(arb.invoke(ctx(Phase::Acquire, 0, 1)));
    assert!(arb.invoke(ctx(Phase::Commit, 0, 0)));
    assert!(!arb.invoke(ctx(Phase::Commit, 0, 1)));
}

#[test]
fn arbitrator_resets_between_cycles() {
    let mut arb = Arbitrator::new("test");
    arb.add_process(0);
    arb.add_process(1);

    assert!(arb.invoke(ctx(Phase::Acquire, 0, 0)));
    assert!(arb.invoke(ctx(Phase::Commit, 0, 0)));

    // Next cycle only process 1 requests.
    assert!(arb.invoke(ctx(Phase::Acquire, 1, 1)));
    assert!(arb.invoke(ctx(Phase::Commit, 1, 1)));
}

#[test]
fn cyclic_arbitrator_rotates_priority_after_grant() {
    let mut arb = Arbitrator::new_cyclic("test");
    arb.add_process(0);
    arb.add_process(1);

    assert!(arb.invoke(ctx(Phase::Acquire, 0, 0)));
    assert!(arb.invoke(ctx(Phase::Acquire, 0, 1)));
    assert!(arb.invoke(ctx(Phase::Commit, 0, 0)));

    // Process 0 won cycle 0, so cycle 1 favors process 1.
    assert!(arb.invoke(ctx(Phase::Acquire, 1, 0)));
    assert!(arb.invoke(ctx(Phase::Acquire, 1, 1)));
    assert!(!arb.invoke(ctx(Phase::Commit, 1, 0)));
    assert!(arb.invoke(ctx(Phase::Commit, 1, 1)));
}

#[test]
fn check_and_commit_agree_on_the_winner() {
    let mut arb = Arbitrator::new("test");
    arb.add_process(0);
    arb.add_process(1);

    assert!(arb.invoke(ctx(Phase::Acquire, 0, 1)));
    assert!(arb.invoke(ctx(Phase::Check, 0, 1)));
    assert!(arb.invoke(ctx(Phase::Commit, 0, 1)));
}
