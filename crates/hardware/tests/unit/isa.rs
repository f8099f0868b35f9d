//! Instruction encoding and control word tests.

use microgrid_core::isa::{
    annotation, decode, encode, pack_annotations, pack_reg_counts, unpack_reg_counts,
    AllocationType, Annotation, FamilyProperty, Instr, RegSpec,
};

#[test]
fn representative_instructions_roundtrip() {
    let samples = [
        Instr::Nop,
        Instr::Ldi {
            rd: RegSpec::l(3),
            imm: -42,
        },
        Instr::Add {
            rd: RegSpec::s(0),
            ra: RegSpec::d(0),
            rb: RegSpec::l(0),
        },
        Instr::Load {
            rd: RegSpec::l(1),
            ra: RegSpec::g(0),
            offset: 16,
        },
        Instr::Store {
            rv: RegSpec::l(2),
            ra: RegSpec::l(1),
            offset: 8,
        },
        Instr::FDiv {
            rd: RegSpec::l(4),
            ra: RegSpec::l(1),
            rb: RegSpec::l(2),
        },
        Instr::Allocate {
            rd: RegSpec::l(1),
            ra: RegSpec::l(0),
            suspend: true,
            exclusive: false,
            atype: AllocationType::Balanced,
        },
        Instr::SetProperty {
            ra: RegSpec::l(1),
            prop: FamilyProperty::Limit,
            rb: RegSpec::l(3),
        },
        Instr::Create {
            rd: RegSpec::l(7),
            ra: RegSpec::l(1),
            rb: RegSpec::l(6),
        },
        Instr::Sync {
            rd: RegSpec::l(0),
            ra: RegSpec::l(7),
        },
        Instr::Detach { ra: RegSpec::l(7) },
        Instr::Break,
        Instr::PutGlobal {
            ra: RegSpec::l(1),
            index: 2,
            rb: RegSpec::l(4),
        },
        Instr::GetShared {
            rd: RegSpec::l(2),
            ra: RegSpec::l(7),
            index: 0,
        },
        Instr::PutShared {
            ra: RegSpec::l(7),
            index: 0,
            rb: RegSpec::l(2),
        },
        Instr::End,
    ];
    for instr in samples {
        let decoded = decode(encode(instr), 0x1000).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(decoded, instr);
    }
}

#[test]
fn unknown_opcode_is_illegal() {
    assert!(decode(0xEE00_0000, 0x1000).is_err());
}

#[test]
fn reg_counts_pack_per_type_halves() {
    let word = pack_reg_counts([(3, 1, 8), (0, 0, 2)]);
    assert_eq!(unpack_reg_counts(word), [(3, 1, 8), (0, 0, 2)]);
    // Integer counts sit in the low half.
    assert_eq!(word & 0x1F, 3);
    assert_eq!((word >> 5) & 0x1F, 1);
    assert_eq!((word >> 10) & 0x1F, 8);
}

#[test]
fn annotations_target_their_slot() {
    let control = pack_annotations(&[
        (1, Annotation { swch: true, kill: false }),
        (3, Annotation { swch: false, kill: true }),
    ]);
    assert_eq!(annotation(control, 1), Annotation { swch: true, kill: false });
    assert_eq!(annotation(control, 2), Annotation::default());
    assert_eq!(annotation(control, 3), Annotation { swch: false, kill: true });
}
