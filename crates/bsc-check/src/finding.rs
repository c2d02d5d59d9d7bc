//! Corruption findings.
//!
//! A finding is a value, not an error: the scan keeps going after recording
//! one. Findings are collected per block group and per attempt; only the
//! findings of a group's final attempt are shown to the user.

use bsc_ondisk::{BtrfsKey, FreeExtent};
use bsc_types::{
    BTRFS_BLOCK_GROUP_ITEM_KEY, BTRFS_FREE_SPACE_EXTENT_KEY, BTRFS_FREE_SPACE_INFO_KEY,
};
use serde::Serialize;
use std::fmt;

/// Which on-disk structure a finding incriminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Structure {
    ExtentTree,
    FreeSpaceTree,
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExtentTree => write!(f, "extent_tree"),
            Self::FreeSpaceTree => write!(f, "free_space_tree"),
        }
    }
}

/// Encoding of a free space tree record that claimed some free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimSource {
    /// One `FREE_SPACE_EXTENT` item.
    Extent,
    /// A run of set bits in one or more `FREE_SPACE_BITMAP` items.
    Bitmap,
}

/// One inconsistency observed during a single attempt on a block group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    // ── Extent tree ─────────────────────────────────────────────────────────
    /// An extent starts before the end of the previous extent.
    Overlap { item: BtrfsKey, previous: BtrfsKey },
    /// Two consecutive extents lie past the end of the current block group.
    OutsideBlockGroup { first: BtrfsKey, second: BtrfsKey },
    /// An extent past the previous block group does not start at the next one.
    BeforeBlockGroup { item: BtrfsKey, block_group: BtrfsKey },
    /// An extent lies past the end of the last block group.
    AfterLastBlockGroup { item: BtrfsKey, block_group: BtrfsKey },

    // ── Free space tree ─────────────────────────────────────────────────────
    DuplicateInfo { info: BtrfsKey },
    InfoMismatch { info: BtrfsKey, block_group: BtrfsKey },
    InfoTruncated { info: BtrfsKey },
    MissingInfo { start: u64, length: u64 },
    ExtentWithBitmapFlag { item: BtrfsKey, info: BtrfsKey },
    BitmapWithoutBitmapFlag { item: BtrfsKey, info: BtrfsKey },
    BitmapGapAtStart { info: BtrfsKey, first: BtrfsKey },
    BitmapGap { previous: BtrfsKey, next: BtrfsKey },
    BitmapGapAtEnd { last: BtrfsKey, info: BtrfsKey },
    NoBitmaps,
    BitmapTruncated { item: BtrfsKey },
    /// The index claims free space past the last expected free extent.
    ExtraFreeSpace {
        claimed: FreeExtent,
        source: ClaimSource,
    },
    FreeSpaceMismatch {
        claimed: FreeExtent,
        expected: FreeExtent,
        source: ClaimSource,
    },
    /// Expected free space that no index record claimed.
    MissingFreeSpace { expected: FreeExtent },
    ExtentCountMismatch {
        info: BtrfsKey,
        recorded: u32,
        observed: u32,
    },
}

impl Finding {
    #[must_use]
    pub fn structure(&self) -> Structure {
        match self {
            Self::Overlap { .. }
            | Self::OutsideBlockGroup { .. }
            | Self::BeforeBlockGroup { .. }
            | Self::AfterLastBlockGroup { .. } => Structure::ExtentTree,
            Self::DuplicateInfo { .. }
            | Self::InfoMismatch { .. }
            | Self::InfoTruncated { .. }
            | Self::MissingInfo { .. }
            | Self::ExtentWithBitmapFlag { .. }
            | Self::BitmapWithoutBitmapFlag { .. }
            | Self::BitmapGapAtStart { .. }
            | Self::BitmapGap { .. }
            | Self::BitmapGapAtEnd { .. }
            | Self::NoBitmaps
            | Self::BitmapTruncated { .. }
            | Self::ExtraFreeSpace { .. }
            | Self::FreeSpaceMismatch { .. }
            | Self::MissingFreeSpace { .. }
            | Self::ExtentCountMismatch { .. } => Structure::FreeSpaceTree,
        }
    }
}

struct Claim(FreeExtent, ClaimSource);

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.1 {
            ClaimSource::Extent => write!(
                f,
                "{}",
                BtrfsKey::new(self.0.start, BTRFS_FREE_SPACE_EXTENT_KEY, self.0.size)
            ),
            ClaimSource::Bitmap => write!(f, "{} in FREE_SPACE_BITMAP", self.0),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlap { item, previous } => write!(f, "{item} overlaps previous {previous}"),
            Self::OutsideBlockGroup { first, second } => {
                write!(f, "{first} and {second} outside of block group")
            }
            Self::BeforeBlockGroup { item, block_group } => write!(f, "{item} before {block_group}"),
            Self::AfterLastBlockGroup { item, block_group } => {
                write!(f, "{item} after last block group {block_group}")
            }
            Self::DuplicateInfo { info } => write!(f, "duplicate {info}"),
            Self::InfoMismatch { info, block_group } => {
                write!(f, "{info} does not match {block_group}")
            }
            Self::InfoTruncated { info } => write!(f, "{info} item is truncated"),
            Self::MissingInfo { start, length } => write!(
                f,
                "missing {}",
                BtrfsKey::new(*start, BTRFS_FREE_SPACE_INFO_KEY, *length)
            ),
            Self::ExtentWithBitmapFlag { item, info } => {
                write!(f, "got {item} but {info} has bitmap flag")
            }
            Self::BitmapWithoutBitmapFlag { item, info } => {
                write!(f, "got {item} but {info} does not have bitmap flag")
            }
            Self::BitmapGapAtStart { info, first } => {
                write!(f, "gap between start of {info} and first {first}")
            }
            Self::BitmapGap { previous, next } => write!(f, "gap between {previous} and {next}"),
            Self::BitmapGapAtEnd { last, info } => {
                write!(f, "gap between {last} and end of {info}")
            }
            Self::NoBitmaps => write!(f, "no bitmaps"),
            Self::BitmapTruncated { item } => write!(f, "{item} is truncated"),
            Self::ExtraFreeSpace { claimed, source } => {
                write!(f, "extra {}", Claim(*claimed, *source))
            }
            Self::FreeSpaceMismatch {
                claimed,
                expected,
                source,
            } => write!(
                f,
                "{} does not match expected free space {expected}",
                Claim(*claimed, *source)
            ),
            Self::MissingFreeSpace { expected } => {
                write!(f, "missing expected free space {expected}")
            }
            Self::ExtentCountMismatch {
                info,
                recorded,
                observed,
            } => write!(f, "{info} should have {recorded} extents, got {observed}"),
        }
    }
}

/// Outcome of validating one block group's free space index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Corrupted(Vec<Finding>),
}

impl Verdict {
    #[must_use]
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        if findings.is_empty() {
            Self::Clean
        } else {
            Self::Corrupted(findings)
        }
    }

    #[must_use]
    pub fn is_corrupted(&self) -> bool {
        matches!(self, Self::Corrupted(_))
    }

    #[must_use]
    pub fn findings(&self) -> &[Finding] {
        match self {
            Self::Clean => &[],
            Self::Corrupted(findings) => findings,
        }
    }

    #[must_use]
    pub fn into_findings(self) -> Vec<Finding> {
        match self {
            Self::Clean => Vec::new(),
            Self::Corrupted(findings) => findings,
        }
    }
}

pub(crate) fn block_group_key(start: u64, length: u64) -> BtrfsKey {
    BtrfsKey::new(start, BTRFS_BLOCK_GROUP_ITEM_KEY, length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsc_types::{
        BTRFS_EXTENT_ITEM_KEY, BTRFS_FREE_SPACE_BITMAP_KEY, BTRFS_METADATA_ITEM_KEY,
    };

    #[test]
    fn extent_tree_messages() {
        let finding = Finding::Overlap {
            item: BtrfsKey::new(4096, BTRFS_METADATA_ITEM_KEY, 0),
            previous: BtrfsKey::new(0, BTRFS_EXTENT_ITEM_KEY, 8192),
        };
        assert_eq!(
            finding.to_string(),
            "(4096 METADATA_ITEM 0) overlaps previous (0 EXTENT_ITEM 8192)"
        );
        assert_eq!(finding.structure(), Structure::ExtentTree);

        let finding = Finding::BeforeBlockGroup {
            item: BtrfsKey::new(50, BTRFS_EXTENT_ITEM_KEY, 10),
            block_group: block_group_key(100, 1000),
        };
        assert_eq!(
            finding.to_string(),
            "(50 EXTENT_ITEM 10) before (100 BLOCK_GROUP_ITEM 1000)"
        );
    }

    #[test]
    fn free_space_tree_messages() {
        let claimed = FreeExtent::new(600, 399);
        let expected = FreeExtent::new(600, 400);
        let by_extent = Finding::FreeSpaceMismatch {
            claimed,
            expected,
            source: ClaimSource::Extent,
        };
        assert_eq!(
            by_extent.to_string(),
            "(600 FREE_SPACE_EXTENT 399) does not match expected free space 600+400"
        );
        let by_bitmap = Finding::ExtraFreeSpace {
            claimed,
            source: ClaimSource::Bitmap,
        };
        assert_eq!(by_bitmap.to_string(), "extra 600+399 in FREE_SPACE_BITMAP");
        assert_eq!(
            Finding::MissingInfo {
                start: 0,
                length: 1000
            }
            .to_string(),
            "missing (0 FREE_SPACE_INFO 1000)"
        );
        let truncated = Finding::BitmapTruncated {
            item: BtrfsKey::new(0, BTRFS_FREE_SPACE_BITMAP_KEY, 1 << 20),
        };
        assert_eq!(
            truncated.to_string(),
            "(0 FREE_SPACE_BITMAP 1048576) is truncated"
        );
        assert_eq!(truncated.structure(), Structure::FreeSpaceTree);
    }

    #[test]
    fn verdict_from_findings() {
        assert_eq!(Verdict::from_findings(Vec::new()), Verdict::Clean);
        let verdict = Verdict::from_findings(vec![Finding::NoBitmaps]);
        assert!(verdict.is_corrupted());
        assert_eq!(verdict.findings(), &[Finding::NoBitmaps]);
        assert_eq!(verdict.into_findings().len(), 1);
    }

    #[test]
    fn findings_serialize_with_kind_tag() {
        let json = serde_json::to_value(Finding::MissingFreeSpace {
            expected: FreeExtent::new(999, 1),
        })
        .expect("serialize");
        assert_eq!(json["kind"], "missing_free_space");
        assert_eq!(json["expected"]["start"], 999);
    }
}
