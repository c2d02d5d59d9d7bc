//! Free space tree validation for one block group.
//!
//! The free space tree describes each block group with one
//! `FREE_SPACE_INFO` item followed by either `FREE_SPACE_EXTENT` items (one
//! per free extent) or `FREE_SPACE_BITMAP` items (one bit per sector), as
//! selected by the info's `USING_BITMAPS` flag. The validator streams those
//! records and compares every claimed free extent, in order, against the
//! free space derived from the extent tree.
//!
//! Structural damage that makes further comparison meaningless (truncated
//! items, missing info, bitmap coverage gaps) stops validation of the group
//! immediately; everything else is recorded and the stream continues.

use crate::finding::{ClaimSource, Finding, Verdict};
use crate::guard::CancelFlag;
use crate::walker::BlockGroup;
use bsc_error::Result;
use bsc_ondisk::{BitRunCollector, BtrfsKey, FreeExtent, FreeSpaceInfo};
use bsc_search::{SearchKey, TreeIterator, TreeSearch};
use bsc_types::{
    BTRFS_FREE_SPACE_BITMAP_KEY, BTRFS_FREE_SPACE_EXTENT_KEY, BTRFS_FREE_SPACE_INFO_KEY,
    SectorSize, TreeId,
};
use tracing::{debug, trace};

/// Compares a block group's free space tree records with derived free space.
pub struct FreeSpaceTreeValidator<'a, S: TreeSearch + ?Sized> {
    search: &'a S,
    sectorsize: SectorSize,
    batch_items: u32,
}

impl<'a, S: TreeSearch + ?Sized> FreeSpaceTreeValidator<'a, S> {
    #[must_use]
    pub fn new(search: &'a S, sectorsize: SectorSize, batch_items: u32) -> Self {
        Self {
            search,
            sectorsize,
            batch_items,
        }
    }

    /// Validate the free space tree records of `group` against `expected`.
    ///
    /// `expected` must be ascending and non-overlapping, as produced by the
    /// extent tree walk. Errors are reserved for failures of the check
    /// itself (query failure, cancellation); corruption is a [`Verdict`].
    pub fn validate(
        &self,
        group: &BlockGroup,
        expected: &[FreeExtent],
        cancel: &CancelFlag,
    ) -> Result<Verdict> {
        let mut pass = Pass::new(group, expected);
        let range = SearchKey::range(
            TreeId::FREE_SPACE,
            BtrfsKey::new(group.start, BTRFS_FREE_SPACE_INFO_KEY, group.length),
            BtrfsKey::new(group.end().saturating_sub(1), u8::MAX, u64::MAX),
        );
        for item in TreeIterator::with_batch(self.search, range, self.batch_items) {
            let item = item?;
            cancel.check()?;
            let flow = match item.key.item_type {
                BTRFS_FREE_SPACE_INFO_KEY => pass.on_info(item.key, &item.data),
                BTRFS_FREE_SPACE_EXTENT_KEY => pass.on_extent(item.key),
                BTRFS_FREE_SPACE_BITMAP_KEY => pass.on_bitmap(item.key, &item.data, self.sectorsize),
                _ => Flow::Continue,
            };
            if let Flow::Stop = flow {
                debug!(group = %group, "free space tree validation stopped early");
                return Ok(Verdict::from_findings(pass.findings));
            }
        }
        Ok(pass.finish())
    }
}

enum Flow {
    Continue,
    Stop,
}

/// State of one validation pass over a block group.
struct Pass<'e> {
    group: BlockGroup,
    info: Option<(BtrfsKey, FreeSpaceInfo)>,
    last_bitmap: Option<BtrfsKey>,
    runs: BitRunCollector,
    observed: u32,
    matcher: Matcher<'e>,
    findings: Vec<Finding>,
}

impl<'e> Pass<'e> {
    fn new(group: &BlockGroup, expected: &'e [FreeExtent]) -> Self {
        Self {
            group: *group,
            info: None,
            last_bitmap: None,
            runs: BitRunCollector::new(),
            observed: 0,
            matcher: Matcher::new(expected),
            findings: Vec::new(),
        }
    }

    fn on_info(&mut self, key: BtrfsKey, data: &[u8]) -> Flow {
        if self.info.is_some() {
            self.findings.push(Finding::DuplicateInfo { info: key });
            return Flow::Continue;
        }
        if key.objectid != self.group.start || key.offset != self.group.length {
            self.findings.push(Finding::InfoMismatch {
                info: key,
                block_group: self.group.key(),
            });
            return Flow::Continue;
        }
        match FreeSpaceInfo::parse(data) {
            Ok(info) => {
                trace!(
                    info = %key,
                    extent_count = info.extent_count,
                    bitmaps = info.uses_bitmaps(),
                    "free space info"
                );
                self.info = Some((key, info));
                Flow::Continue
            }
            Err(_) => {
                self.findings.push(Finding::InfoTruncated { info: key });
                Flow::Stop
            }
        }
    }

    fn missing_info(&mut self) -> Flow {
        self.findings.push(Finding::MissingInfo {
            start: self.group.start,
            length: self.group.length,
        });
        Flow::Stop
    }

    fn on_extent(&mut self, key: BtrfsKey) -> Flow {
        let Some((info_key, info)) = self.info else {
            return self.missing_info();
        };
        self.observed = self.observed.saturating_add(1);
        if info.uses_bitmaps() {
            self.findings.push(Finding::ExtentWithBitmapFlag {
                item: key,
                info: info_key,
            });
            return Flow::Continue;
        }
        self.matcher.check(
            FreeExtent::new(key.objectid, key.offset),
            ClaimSource::Extent,
            &mut self.findings,
        );
        Flow::Continue
    }

    fn on_bitmap(&mut self, key: BtrfsKey, data: &[u8], sectorsize: SectorSize) -> Flow {
        let Some((info_key, info)) = self.info else {
            return self.missing_info();
        };
        if !info.uses_bitmaps() {
            self.findings.push(Finding::BitmapWithoutBitmapFlag {
                item: key,
                info: info_key,
            });
            return Flow::Continue;
        }
        match self.last_bitmap {
            None if key.objectid != self.group.start => {
                self.findings.push(Finding::BitmapGapAtStart {
                    info: info_key,
                    first: key,
                });
                return Flow::Stop;
            }
            Some(previous) if key.objectid != previous.objectid.saturating_add(previous.offset) => {
                self.findings.push(Finding::BitmapGap {
                    previous,
                    next: key,
                });
                return Flow::Stop;
            }
            _ => {}
        }
        let num_bits = sectorsize.sectors_in(key.offset);
        let available = u64::try_from(data.len()).unwrap_or(u64::MAX).saturating_mul(8);
        if num_bits > available {
            self.findings.push(Finding::BitmapTruncated { item: key });
            return Flow::Stop;
        }
        for run in self
            .runs
            .push_item(key.objectid, sectorsize.get(), data, num_bits)
        {
            self.observed = self.observed.saturating_add(1);
            self.matcher
                .check(run, ClaimSource::Bitmap, &mut self.findings);
        }
        self.last_bitmap = Some(key);
        Flow::Continue
    }

    fn finish(mut self) -> Verdict {
        let Some((info_key, info)) = self.info else {
            self.missing_info();
            return Verdict::from_findings(self.findings);
        };
        if info.uses_bitmaps() {
            match self.last_bitmap {
                None => {
                    self.findings.push(Finding::NoBitmaps);
                    return Verdict::from_findings(self.findings);
                }
                Some(last) if last.objectid.saturating_add(last.offset) != self.group.end() => {
                    self.findings.push(Finding::BitmapGapAtEnd {
                        last,
                        info: info_key,
                    });
                    return Verdict::from_findings(self.findings);
                }
                Some(_) => {}
            }
            if let Some(run) = self.runs.finish(self.group.end()) {
                self.observed = self.observed.saturating_add(1);
                self.matcher
                    .check(run, ClaimSource::Bitmap, &mut self.findings);
            }
        }
        for expected in self.matcher.remaining() {
            self.findings.push(Finding::MissingFreeSpace { expected });
        }
        if self.observed != info.extent_count {
            self.findings.push(Finding::ExtentCountMismatch {
                info: info_key,
                recorded: info.extent_count,
                observed: self.observed,
            });
        }
        Verdict::from_findings(self.findings)
    }
}

/// Ordered comparison of claimed free extents against expected ones.
///
/// On a mismatch the matcher resynchronizes by skipping every expected
/// extent that starts at or before the claimed one. If the last skipped
/// extent reaches past the claimed extent's end, its uncovered tail stays
/// expected so that later records (or the final "missing" sweep) account
/// for it.
struct Matcher<'e> {
    expected: &'e [FreeExtent],
    next: usize,
    residue: Option<FreeExtent>,
}

impl<'e> Matcher<'e> {
    fn new(expected: &'e [FreeExtent]) -> Self {
        Self {
            expected,
            next: 0,
            residue: None,
        }
    }

    fn head(&self) -> Option<FreeExtent> {
        self.residue
            .or_else(|| self.expected.get(self.next).copied())
    }

    fn advance(&mut self) {
        if self.residue.take().is_none() {
            self.next += 1;
        }
    }

    fn check(&mut self, claimed: FreeExtent, source: ClaimSource, findings: &mut Vec<Finding>) {
        // Expected extents that end before the claim were skipped by the index.
        while let Some(head) = self.head() {
            if head.end() > claimed.start {
                break;
            }
            findings.push(Finding::MissingFreeSpace { expected: head });
            self.advance();
        }
        let Some(head) = self.head() else {
            findings.push(Finding::ExtraFreeSpace { claimed, source });
            return;
        };
        if head == claimed {
            self.advance();
            return;
        }
        if head.start >= claimed.end() {
            findings.push(Finding::ExtraFreeSpace { claimed, source });
            return;
        }
        findings.push(Finding::FreeSpaceMismatch {
            claimed,
            expected: head,
            source,
        });
        let mut last_skipped = None;
        while let Some(head) = self.head() {
            if head.start > claimed.start {
                break;
            }
            last_skipped = Some(head);
            self.advance();
        }
        if let Some(last) = last_skipped {
            if claimed.end() < last.end() {
                self.residue = Some(FreeExtent::new(claimed.end(), last.end() - claimed.end()));
            }
        }
    }

    fn remaining(&self) -> Vec<FreeExtent> {
        self.residue
            .into_iter()
            .chain(self.expected.get(self.next..).unwrap_or_default().iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsc_error::CheckError;
    use bsc_harness::FsImage;

    const SECTOR: u32 = 1;

    fn sectorsize() -> SectorSize {
        SectorSize::new(SECTOR).expect("sector size")
    }

    fn image() -> FsImage {
        FsImage::new().sectorsize(SECTOR)
    }

    fn validate(image: FsImage, expected: &[FreeExtent]) -> Verdict {
        let fs = image.build();
        let validator = FreeSpaceTreeValidator::new(&fs, sectorsize(), 2);
        validator
            .validate(&BlockGroup::new(0, 1000), expected, &CancelFlag::new())
            .expect("validate")
    }

    fn expected() -> Vec<FreeExtent> {
        vec![FreeExtent::new(100, 400), FreeExtent::new(600, 400)]
    }

    #[test]
    fn matching_extent_encoding_is_clean() {
        let image = image()
            .free_space_info(0, 1000, 2, false)
            .free_space_extent(100, 400)
            .free_space_extent(600, 400);
        assert_eq!(validate(image, &expected()), Verdict::Clean);
    }

    #[test]
    fn short_tail_extent_reports_mismatch_and_missing_tail() {
        let image = image()
            .free_space_info(0, 1000, 2, false)
            .free_space_extent(100, 400)
            .free_space_extent(600, 399);
        let verdict = validate(image, &expected());
        assert_eq!(
            verdict.findings(),
            &[
                Finding::FreeSpaceMismatch {
                    claimed: FreeExtent::new(600, 399),
                    expected: FreeExtent::new(600, 400),
                    source: ClaimSource::Extent,
                },
                Finding::MissingFreeSpace {
                    expected: FreeExtent::new(999, 1)
                },
            ]
        );
    }

    #[test]
    fn split_claim_is_a_single_mismatch() {
        let image = image()
            .free_space_info(0, 1000, 3, false)
            .free_space_extent(100, 200)
            .free_space_extent(300, 200)
            .free_space_extent(600, 400);
        let verdict = validate(image, &expected());
        assert_eq!(verdict.findings().len(), 1);
        assert!(matches!(
            verdict.findings()[0],
            Finding::FreeSpaceMismatch { .. }
        ));
    }

    #[test]
    fn missing_record_and_extra_record() {
        let missing = image()
            .free_space_info(0, 1000, 1, false)
            .free_space_extent(600, 400);
        assert_eq!(
            validate(missing, &expected()).findings(),
            &[Finding::MissingFreeSpace {
                expected: FreeExtent::new(100, 400)
            }]
        );

        let extra = image()
            .free_space_info(0, 1000, 3, false)
            .free_space_extent(10, 20)
            .free_space_extent(100, 400)
            .free_space_extent(600, 400);
        assert_eq!(
            validate(extra, &expected()).findings(),
            &[Finding::ExtraFreeSpace {
                claimed: FreeExtent::new(10, 20),
                source: ClaimSource::Extent,
            }]
        );
    }

    #[test]
    fn extent_count_must_match_info() {
        let image = image()
            .free_space_info(0, 1000, 5, false)
            .free_space_extent(100, 400)
            .free_space_extent(600, 400);
        assert!(matches!(
            validate(image, &expected()).findings(),
            [Finding::ExtentCountMismatch {
                recorded: 5,
                observed: 2,
                ..
            }]
        ));
    }

    #[test]
    fn info_problems() {
        let missing = image().free_space_extent(100, 400);
        assert_eq!(
            validate(missing, &expected()).findings(),
            &[Finding::MissingInfo {
                start: 0,
                length: 1000
            }]
        );

        let absent = image();
        assert!(matches!(
            validate(absent, &[]).findings(),
            [Finding::MissingInfo { .. }]
        ));

        let truncated = image()
            .raw_free_space_item(0, BTRFS_FREE_SPACE_INFO_KEY, 1000, vec![1, 0, 0])
            .free_space_extent(100, 400);
        assert!(matches!(
            validate(truncated, &expected()).findings(),
            [Finding::InfoTruncated { .. }]
        ));
    }

    #[test]
    fn extent_under_bitmap_flag_is_counted_and_reported() {
        let image = image()
            .free_space_info(0, 1000, 1, true)
            .free_space_extent(100, 400)
            .free_space_bitmap(0, 1000, &[]);
        let verdict = validate(image, &[]);
        assert!(matches!(
            verdict.findings(),
            [Finding::ExtentWithBitmapFlag { .. }]
        ));
    }

    #[test]
    fn matching_bitmap_encoding_is_clean() {
        let free = [(100, 400), (600, 400)];
        let image = image()
            .free_space_info(0, 1000, 2, true)
            .free_space_bitmap(0, 512, &free)
            .free_space_bitmap(512, 488, &free);
        assert_eq!(validate(image, &expected()), Verdict::Clean);
    }

    #[test]
    fn bitmap_coverage_gaps_stop_validation() {
        let free = [(100, 400), (600, 400)];
        let late_start = image()
            .free_space_info(0, 1000, 2, true)
            .free_space_bitmap(8, 992, &free);
        assert!(matches!(
            validate(late_start, &expected()).findings(),
            [Finding::BitmapGapAtStart { .. }]
        ));

        let hole = image()
            .free_space_info(0, 1000, 2, true)
            .free_space_bitmap(0, 400, &free)
            .free_space_bitmap(408, 592, &free);
        assert!(matches!(
            validate(hole, &expected()).findings(),
            [Finding::BitmapGap { .. }]
        ));

        let short = image()
            .free_space_info(0, 1000, 2, true)
            .free_space_bitmap(0, 992, &free);
        assert!(matches!(
            validate(short, &expected()).findings(),
            [Finding::BitmapGapAtEnd { .. }]
        ));

        let none = image().free_space_info(0, 1000, 0, true);
        assert_eq!(validate(none, &[]).findings(), &[Finding::NoBitmaps]);
    }

    #[test]
    fn truncated_bitmap_stops_validation() {
        let image = image()
            .free_space_info(0, 1000, 0, true)
            .raw_free_space_item(0, BTRFS_FREE_SPACE_BITMAP_KEY, 1000, vec![0; 10]);
        assert!(matches!(
            validate(image, &[]).findings(),
            [Finding::BitmapTruncated { .. }]
        ));
    }

    #[test]
    fn bitmap_without_flag_is_reported() {
        let image = image()
            .free_space_info(0, 1000, 2, false)
            .free_space_extent(100, 400)
            .free_space_extent(600, 400)
            .free_space_bitmap(0, 1000, &[]);
        assert!(matches!(
            validate(image, &expected()).findings(),
            [Finding::BitmapWithoutBitmapFlag { .. }]
        ));
    }

    #[test]
    fn duplicate_and_mismatched_info_are_recorded() {
        let image = image()
            .free_space_info(0, 1000, 2, false)
            .raw_free_space_item(0, BTRFS_FREE_SPACE_INFO_KEY, 1001, vec![0; 8])
            .free_space_extent(100, 400)
            .free_space_extent(600, 400);
        assert!(matches!(
            validate(image, &expected()).findings(),
            [Finding::DuplicateInfo { .. }]
        ));

        let wrong = self::image()
            .free_space_info(50, 950, 2, false)
            .free_space_extent(100, 400)
            .free_space_extent(600, 400);
        assert!(matches!(
            validate(wrong, &expected()).findings(),
            [Finding::InfoMismatch { .. }, Finding::MissingInfo { .. }]
        ));
    }

    #[test]
    fn records_of_other_groups_are_ignored() {
        let image = image()
            .free_space_info(0, 1000, 2, false)
            .free_space_extent(100, 400)
            .free_space_extent(600, 400)
            .free_space_info(1000, 1000, 1, false)
            .free_space_extent(1000, 1000);
        assert_eq!(validate(image, &expected()), Verdict::Clean);
    }

    #[test]
    fn cancellation_is_an_error() {
        let fs = image()
            .free_space_info(0, 1000, 2, false)
            .free_space_extent(100, 400)
            .build();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let validator = FreeSpaceTreeValidator::new(&fs, sectorsize(), 2);
        let err = validator
            .validate(&BlockGroup::new(0, 1000), &expected(), &cancel)
            .unwrap_err();
        assert!(matches!(err, CheckError::Cancelled));
    }

    #[test]
    fn query_failure_is_an_error() {
        let fs = image().free_space_info(0, 1000, 0, false).build();
        fs.fail_searches_after(0);
        let validator = FreeSpaceTreeValidator::new(&fs, sectorsize(), 2);
        let err = validator
            .validate(&BlockGroup::new(0, 1000), &[], &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, CheckError::Query { tree: 10, .. }));
    }
}
