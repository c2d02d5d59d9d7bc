//! Extent tree walk: per-block-group free space derived from allocations.
//!
//! The extent tree holds `BLOCK_GROUP_ITEM`s interleaved with the
//! `EXTENT_ITEM`s and `METADATA_ITEM`s allocated inside them, all in key
//! order. The walker keeps a cursor at the end of the last allocation seen in
//! the open block group; every gap between the cursor and the next
//! allocation is free space. A block group closes when the next group header
//! (or the end of the tree) arrives.
//!
//! Key order puts an allocation starting exactly at a block group's start
//! *before* that group's header, so an allocation past the end of the open
//! group is held back as pending until the next header shows whether it
//! belongs there.

use crate::guard::CancelFlag;
use crate::finding::{Finding, block_group_key};
use bsc_error::{CheckError, Result};
use bsc_ondisk::{BlockGroupItem, BtrfsKey, FreeExtent, SearchItem};
use bsc_search::{SearchKey, TreeIterator, TreeSearch};
use bsc_types::{
    BTRFS_BLOCK_GROUP_DATA, BTRFS_BLOCK_GROUP_ITEM_KEY, BTRFS_BLOCK_GROUP_METADATA,
    BTRFS_BLOCK_GROUP_SYSTEM, BTRFS_EXTENT_ITEM_KEY, BTRFS_METADATA_ITEM_KEY, TreeId,
};
use serde::Serialize;
use std::fmt;
use tracing::{debug, trace};

/// A contiguous range of the logical address space, keyed
/// `(start, BLOCK_GROUP_ITEM, length)` in the extent tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockGroup {
    pub start: u64,
    pub length: u64,
    /// Allocation profile and type bits; zero when the item payload is short.
    pub flags: u64,
}

impl BlockGroup {
    #[must_use]
    pub fn new(start: u64, length: u64) -> Self {
        Self {
            start,
            length,
            flags: 0,
        }
    }

    fn from_item(item: &SearchItem) -> Self {
        let flags = match BlockGroupItem::parse(&item.data) {
            Ok(parsed) => parsed.flags,
            Err(err) => {
                debug!(key = %item.key, error = %err, "short block group item");
                0
            }
        };
        Self {
            start: item.key.objectid,
            length: item.key.offset,
            flags,
        }
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    #[must_use]
    pub fn key(&self) -> BtrfsKey {
        block_group_key(self.start, self.length)
    }

    /// `data`, `metadata`, `system`, a combination joined by `|`, or `unknown`.
    #[must_use]
    pub fn kind(&self) -> String {
        let names: Vec<&str> = [
            (BTRFS_BLOCK_GROUP_DATA, "data"),
            (BTRFS_BLOCK_GROUP_METADATA, "metadata"),
            (BTRFS_BLOCK_GROUP_SYSTEM, "system"),
        ]
        .into_iter()
        .filter(|(bit, _)| self.flags & bit != 0)
        .map(|(_, name)| name)
        .collect();
        if names.is_empty() {
            "unknown".to_owned()
        } else {
            names.join("|")
        }
    }
}

impl fmt::Display for BlockGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Result of walking one block group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionScan {
    pub block_group: BlockGroup,
    /// Gaps between allocations, ascending and non-overlapping.
    pub free: Vec<FreeExtent>,
    /// Extent tree inconsistencies attributed to this group.
    pub findings: Vec<Finding>,
    /// Where a re-examination of this group must resume: the group's first
    /// key, or the allocation held back in front of its header.
    pub replay_from: BtrfsKey,
}

#[derive(Debug)]
struct OpenRegion {
    block_group: BlockGroup,
    replay_from: BtrfsKey,
    cursor: u64,
    free: Vec<FreeExtent>,
}

/// An allocation past the end of the open block group.
#[derive(Debug, Clone, Copy)]
struct Pending {
    key: BtrfsKey,
    end: u64,
}

/// Single-pass, restartable walk over the extent tree.
pub struct ExtentTreeWalker<'a, S: TreeSearch + ?Sized> {
    items: TreeIterator<'a, S>,
    nodesize: u32,
    open: Option<OpenRegion>,
    pending: Option<Pending>,
    previous: Option<BtrfsKey>,
    findings: Vec<Finding>,
    exhausted: bool,
}

impl<'a, S: TreeSearch + ?Sized> ExtentTreeWalker<'a, S> {
    /// `nodesize` is the implicit length of every `METADATA_ITEM`.
    #[must_use]
    pub fn new(search: &'a S, nodesize: u32, batch_items: u32) -> Self {
        Self {
            items: TreeIterator::with_batch(
                search,
                SearchKey::whole_tree(TreeId::EXTENT),
                batch_items,
            ),
            nodesize,
            open: None,
            pending: None,
            previous: None,
            findings: Vec::new(),
            exhausted: false,
        }
    }

    /// Walk until the next block group closes.
    ///
    /// Returns `Ok(None)` once the tree is exhausted and the last group has
    /// been returned.
    pub fn next_region(&mut self, cancel: &CancelFlag) -> Result<Option<RegionScan>> {
        if self.exhausted {
            return Ok(None);
        }
        while let Some(item) = self.items.next() {
            let item = item?;
            cancel.check()?;
            match item.key.item_type {
                BTRFS_BLOCK_GROUP_ITEM_KEY => {
                    let closed = self.close_region()?;
                    self.open_region(BlockGroup::from_item(&item));
                    self.previous = Some(item.key);
                    if closed.is_some() {
                        return Ok(closed);
                    }
                }
                BTRFS_EXTENT_ITEM_KEY | BTRFS_METADATA_ITEM_KEY => {
                    self.on_allocation(item.key)?;
                    self.previous = Some(item.key);
                }
                _ => {}
            }
        }
        self.exhausted = true;
        if let Some(pending) = self.pending.take() {
            match &self.open {
                Some(open) => self.findings.push(Finding::AfterLastBlockGroup {
                    item: pending.key,
                    block_group: open.block_group.key(),
                }),
                None => debug!(key = %pending.key, "allocation without any block group"),
            }
        }
        debug!(
            pages = self.items.pages_fetched(),
            items = self.items.items_returned(),
            "extent tree exhausted"
        );
        self.close_region()
    }

    /// Discard all walk state and resume at `from`.
    ///
    /// Used with [`RegionScan::replay_from`] to re-examine a block group
    /// from scratch on a retry, including an allocation stranded in front of
    /// its header.
    pub fn restart_at(&mut self, from: BtrfsKey) {
        self.items.reset(from);
        self.open = None;
        self.pending = None;
        self.previous = None;
        self.findings.clear();
        self.exhausted = false;
        trace!(from = %from, "extent tree walk restarted");
    }

    fn open_region(&mut self, block_group: BlockGroup) {
        let mut cursor = block_group.start;
        let mut replay_from = BtrfsKey::new(block_group.start, 0, 0);
        if let Some(pending) = self.pending.take() {
            replay_from = replay_from.min(pending.key);
            if pending.key.objectid == block_group.start {
                cursor = pending.end;
            } else {
                self.findings.push(Finding::BeforeBlockGroup {
                    item: pending.key,
                    block_group: block_group.key(),
                });
            }
        }
        trace!(start = block_group.start, length = block_group.length, "block group opened");
        self.open = Some(OpenRegion {
            block_group,
            replay_from,
            cursor,
            free: Vec::new(),
        });
    }

    fn close_region(&mut self) -> Result<Option<RegionScan>> {
        let Some(mut open) = self.open.take() else {
            return Ok(None);
        };
        let end = open.block_group.end();
        if open.cursor < end {
            push_free(&mut open.free, FreeExtent::new(open.cursor, end - open.cursor))?;
        }
        Ok(Some(RegionScan {
            block_group: open.block_group,
            free: open.free,
            findings: std::mem::take(&mut self.findings),
            replay_from: open.replay_from,
        }))
    }

    fn on_allocation(&mut self, key: BtrfsKey) -> Result<()> {
        let start = key.objectid;
        let size = if key.item_type == BTRFS_METADATA_ITEM_KEY {
            u64::from(self.nodesize)
        } else {
            key.offset
        };
        let end = start.saturating_add(size);

        match self.open.as_mut() {
            Some(open) if start < open.block_group.end() => {
                if start < open.cursor {
                    self.findings.push(Finding::Overlap {
                        item: key,
                        previous: self.previous.unwrap_or_else(|| open.block_group.key()),
                    });
                } else if start > open.cursor {
                    push_free(&mut open.free, FreeExtent::new(open.cursor, start - open.cursor))?;
                }
                // Taken literally, even when it moves the cursor backwards.
                open.cursor = end;
            }
            _ => {
                if let Some(previous) = self.pending {
                    self.findings.push(Finding::OutsideBlockGroup {
                        first: previous.key,
                        second: key,
                    });
                }
                self.pending = Some(Pending { key, end });
            }
        }
        Ok(())
    }
}

fn push_free(free: &mut Vec<FreeExtent>, extent: FreeExtent) -> Result<()> {
    free.try_reserve(1).map_err(|_| CheckError::Allocation {
        entries: free.len() + 1,
    })?;
    free.push(extent);
    Ok(())
}
