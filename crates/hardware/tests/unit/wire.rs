//! FID and place wire format tests, including the pack/unpack round-trip
//! property over all representable triples.

use microgrid_core::common::{ceil_log2, Fid, FidFormat, PlaceFormat, PlaceId};
use proptest::prelude::*;

#[test]
fn ceil_log2_edges() {
    assert_eq!(ceil_log2(0), 0);
    assert_eq!(ceil_log2(1), 0);
    assert_eq!(ceil_log2(2), 1);
    assert_eq!(ceil_log2(3), 2);
    assert_eq!(ceil_log2(64), 6);
    assert_eq!(ceil_log2(65), 7);
}

#[test]
fn fid_packs_fields_into_expected_positions() {
    let format = FidFormat::new(4, 8);
    let fid = Fid {
        pid: 3,
        lfid: 5,
        capability: 0x1234,
    };
    let packed = format.pack(fid);
    assert_eq!(packed & 0b11, 3, "pid occupies the low bits");
    assert_eq!((packed >> 2) & 0b111, 5, "lfid follows the pid");
    assert_eq!(packed >> 5, 0x1234, "capability fills the rest");
}

#[test]
fn single_core_grid_needs_no_pid_bits() {
    let format = FidFormat::new(1, 8);
    let fid = Fid {
        pid: 0,
        lfid: 7,
        capability: 9,
    };
    assert_eq!(format.unpack(format.pack(fid)), fid);
}

#[test]
fn place_encoding_recovers_size_from_lowest_set_bit() {
    let format = PlaceFormat::new(8);
    for (pid, size) in [(0, 1), (2, 2), (4, 4), (0, 8)] {
        let place = PlaceId {
            pid,
            size,
            capability: 3,
        };
        let unpacked = format.unpack(format.pack(place));
        assert_eq!(unpacked, place, "pid {pid} size {size}");
    }
}

#[test]
fn default_place_is_the_zero_field() {
    let format = PlaceFormat::new(8);
    let place = format.unpack(0);
    assert_eq!(place.size, 0);
    assert_eq!(place.pid, 0);
}

proptest! {
    // Round-trip: packing then unpacking preserves every representable
    // {pid, lfid, capability} triple.
    #[test]
    fn fid_roundtrip(pid in 0usize..16, lfid in 0usize..8, cap in 0u64..(1 << 20)) {
        let format = FidFormat::new(16, 8);
        let fid = Fid { pid, lfid, capability: cap & format.capability_mask() };
        prop_assert_eq!(format.unpack(format.pack(fid)), fid);
    }

    #[test]
    fn place_roundtrip(size_log in 0u32..4, block in 0usize..4, cap in 0u64..1024) {
        let size = 1usize << size_log;
        // Places are aligned: the first pid is a multiple of the size.
        let pid = block * size;
        prop_assume!(pid < 16);
        let format = PlaceFormat::new(16);
        let place = PlaceId { pid, size, capability: cap };
        prop_assert_eq!(format.unpack(format.pack(place)), place);
    }
}
