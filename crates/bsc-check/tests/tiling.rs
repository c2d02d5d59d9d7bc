//! Derived free space must exactly tile the complement of the allocations.

use bsc_check::{CancelFlag, ExtentTreeWalker, FreeSpaceTreeValidator, Verdict};
use bsc_harness::FsImage;
use bsc_ondisk::FreeExtent;
use bsc_types::SectorSize;
use proptest::prelude::*;

const REGION_START: u64 = 1 << 30;
const UNIT: u64 = 4096;

/// `(gap, length)` pairs in sectors, laid out back to back from the region
/// start; a zero gap makes two allocations adjacent.
fn layouts() -> impl Strategy<Value = Vec<(u64, u64)>> {
    proptest::collection::vec((0_u64..4, 1_u64..6), 0..24)
}

fn build(layout: &[(u64, u64)]) -> (FsImage, Vec<(u64, u64)>, u64) {
    let mut image = FsImage::new();
    let mut allocated = Vec::new();
    let mut cursor = REGION_START;
    for &(gap, len) in layout {
        let start = cursor + gap * UNIT;
        image = image.data_extent(start, len * UNIT);
        allocated.push((start, len * UNIT));
        cursor = start + len * UNIT;
    }
    // Leave a free tail half the time.
    let length = cursor - REGION_START + (layout.len() as u64 % 2) * UNIT;
    let length = length.max(UNIT);
    (image.block_group(REGION_START, length), allocated, length)
}

fn walk(image: FsImage) -> Vec<FreeExtent> {
    let fs = image.build();
    let mut walker = ExtentTreeWalker::new(&fs, 16384, 7);
    let region = walker
        .next_region(&CancelFlag::new())
        .expect("walk")
        .expect("one region");
    assert!(region.findings.is_empty(), "{:?}", region.findings);
    region.free
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn free_list_tiles_complement(layout in layouts()) {
        let (image, allocated, length) = build(&layout);
        let free = walk(image);

        // Sorted, non-empty, never adjacent to each other.
        for pair in free.windows(2) {
            prop_assert!(pair[0].end() < pair[1].start);
        }
        prop_assert!(free.iter().all(|e| e.size > 0));

        // Free plus allocated covers the region exactly once.
        let mut pieces: Vec<(u64, u64)> = free.iter().map(|e| (e.start, e.size)).collect();
        pieces.extend(allocated.iter().copied());
        pieces.sort_unstable();
        let mut cursor = REGION_START;
        for (start, size) in pieces {
            prop_assert_eq!(start, cursor);
            cursor = start + size;
        }
        prop_assert_eq!(cursor, REGION_START + length);
    }

    #[test]
    fn matching_index_validates_clean(layout in layouts(), bitmaps in any::<bool>()) {
        let (image, _, _) = build(&layout);
        let image = if bitmaps {
            image.matching_free_space_bitmaps()
        } else {
            image.matching_free_space_tree()
        };
        let fs = image.build();
        let mut walker = ExtentTreeWalker::new(&fs, 16384, 7);
        let cancel = CancelFlag::new();
        let region = walker.next_region(&cancel).expect("walk").expect("region");
        let sectorsize = SectorSize::new(4096).expect("sector size");
        let validator = FreeSpaceTreeValidator::new(&fs, sectorsize, 7);
        let verdict = validator
            .validate(&region.block_group, &region.free, &cancel)
            .expect("validate");
        prop_assert_eq!(verdict, Verdict::Clean);
    }
}

#[test]
fn empty_region_is_one_free_extent() {
    let free = walk(FsImage::new().block_group(REGION_START, 64 * UNIT));
    assert_eq!(free, vec![FreeExtent::new(REGION_START, 64 * UNIT)]);
}

#[test]
fn adjacent_allocations_leave_no_gap() {
    let free = walk(
        FsImage::new()
            .block_group(REGION_START, 4 * UNIT)
            .data_extent(REGION_START, UNIT)
            .data_extent(REGION_START + UNIT, UNIT),
    );
    assert_eq!(free, vec![FreeExtent::new(REGION_START + 2 * UNIT, 2 * UNIT)]);
}
