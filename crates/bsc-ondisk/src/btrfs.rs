#![forbid(unsafe_code)]

use bsc_types::{
    BTRFS_BLOCK_GROUP_ITEM_KEY, BTRFS_EXTENT_ITEM_KEY, BTRFS_FREE_SPACE_BITMAP_KEY,
    BTRFS_FREE_SPACE_EXTENT_KEY, BTRFS_FREE_SPACE_INFO_KEY, BTRFS_FREE_SPACE_USING_BITMAPS,
    BTRFS_METADATA_ITEM_KEY, ParseError, ensure_slice, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a `btrfs_ioctl_search_header` (transid, objectid, offset, type, len).
pub const SEARCH_HEADER_SIZE: usize = 32;
/// Size of a `btrfs_block_group_item` (used, chunk_objectid, flags).
const BLOCK_GROUP_ITEM_SIZE: usize = 24;
/// Size of a `btrfs_free_space_info` (extent_count, flags).
const FREE_SPACE_INFO_SIZE: usize = 8;

// ── Keys ────────────────────────────────────────────────────────────────────

/// A btrfs item key.
///
/// Field order matters: the derived `Ord` is the lexicographic
/// (objectid, type, offset) order that every btrfs tree is sorted by.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BtrfsKey {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl BtrfsKey {
    pub const MIN: Self = Self::new(0, 0, 0);
    pub const MAX: Self = Self::new(u64::MAX, u8::MAX, u64::MAX);

    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// The smallest key strictly greater than `self`.
    ///
    /// Increments `offset`, carrying into `item_type` and then `objectid`.
    /// Returns `None` for [`BtrfsKey::MAX`].
    #[must_use]
    pub const fn successor(self) -> Option<Self> {
        if let Some(offset) = self.offset.checked_add(1) {
            return Some(Self::new(self.objectid, self.item_type, offset));
        }
        if let Some(item_type) = self.item_type.checked_add(1) {
            return Some(Self::new(self.objectid, item_type, 0));
        }
        match self.objectid.checked_add(1) {
            Some(objectid) => Some(Self::new(objectid, 0, 0)),
            None => None,
        }
    }
}

impl fmt::Display for BtrfsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match key_type_name(self.item_type) {
            Some(name) => write!(f, "({} {} {})", self.objectid, name, self.offset),
            None => write!(
                f,
                "({} UNKNOWN.{} {})",
                self.objectid, self.item_type, self.offset
            ),
        }
    }
}

/// Symbolic name of the item types this checker interprets.
#[must_use]
pub fn key_type_name(item_type: u8) -> Option<&'static str> {
    match item_type {
        BTRFS_EXTENT_ITEM_KEY => Some("EXTENT_ITEM"),
        BTRFS_METADATA_ITEM_KEY => Some("METADATA_ITEM"),
        BTRFS_BLOCK_GROUP_ITEM_KEY => Some("BLOCK_GROUP_ITEM"),
        BTRFS_FREE_SPACE_INFO_KEY => Some("FREE_SPACE_INFO"),
        BTRFS_FREE_SPACE_EXTENT_KEY => Some("FREE_SPACE_EXTENT"),
        BTRFS_FREE_SPACE_BITMAP_KEY => Some("FREE_SPACE_BITMAP"),
        _ => None,
    }
}

// ── Extents ─────────────────────────────────────────────────────────────────

/// A byte range `[start, start + size)` of the logical address space.
///
/// Used both for free space derived from the extent tree and for free space
/// claimed by the free space tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FreeExtent {
    pub start: u64,
    pub size: u64,
}

impl FreeExtent {
    #[must_use]
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }
}

impl fmt::Display for FreeExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.start, self.size)
    }
}

// ── Search results ──────────────────────────────────────────────────────────

/// One item returned by a tree search: key, owning transaction and payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchItem {
    pub transid: u64,
    pub key: BtrfsKey,
    pub data: Vec<u8>,
}

impl SearchItem {
    #[must_use]
    pub fn new(key: BtrfsKey, data: Vec<u8>) -> Self {
        Self {
            transid: 0,
            key,
            data,
        }
    }
}

/// Decode the `buf` of a `BTRFS_IOC_TREE_SEARCH` result holding `nr_items` items.
///
/// Each item is a 32-byte search header followed by `len` payload bytes.
/// Items are returned in buffer order, which the kernel guarantees to be
/// ascending key order.
pub fn parse_search_buffer(buf: &[u8], nr_items: u32) -> Result<Vec<SearchItem>, ParseError> {
    let count = usize::try_from(nr_items)
        .map_err(|_| ParseError::IntegerConversion { field: "nr_items" })?;
    // A corrupt count must not turn into a huge up-front allocation.
    let mut items = Vec::with_capacity(count.min(buf.len() / SEARCH_HEADER_SIZE));
    let mut cur = 0_usize;
    for _ in 0..count {
        let header = ensure_slice(buf, cur, SEARCH_HEADER_SIZE)?;
        let transid = read_le_u64(header, 0)?;
        let objectid = read_le_u64(header, 8)?;
        let offset = read_le_u64(header, 16)?;
        let item_type = u8::try_from(read_le_u32(header, 24)?)
            .map_err(|_| ParseError::IntegerConversion { field: "type" })?;
        let len = usize::try_from(read_le_u32(header, 28)?)
            .map_err(|_| ParseError::IntegerConversion { field: "len" })?;
        cur += SEARCH_HEADER_SIZE;

        let data = ensure_slice(buf, cur, len)?.to_vec();
        cur += len;

        items.push(SearchItem {
            transid,
            key: BtrfsKey::new(objectid, item_type, offset),
            data,
        });
    }
    Ok(items)
}

// ── Item payloads ───────────────────────────────────────────────────────────

/// Payload of a `BLOCK_GROUP_ITEM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGroupItem {
    pub used: u64,
    pub chunk_objectid: u64,
    pub flags: u64,
}

impl BlockGroupItem {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < BLOCK_GROUP_ITEM_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BLOCK_GROUP_ITEM_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }
        Ok(Self {
            used: read_le_u64(data, 0)?,
            chunk_objectid: read_le_u64(data, 8)?,
            flags: read_le_u64(data, 16)?,
        })
    }
}

/// Payload of a `FREE_SPACE_INFO` item: the per-block-group summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpaceInfo {
    pub extent_count: u32,
    pub flags: u32,
}

impl FreeSpaceInfo {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < FREE_SPACE_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: FREE_SPACE_INFO_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }
        Ok(Self {
            extent_count: read_le_u32(data, 0)?,
            flags: read_le_u32(data, 4)?,
        })
    }

    /// Whether free space for this block group is stored as bitmaps.
    #[must_use]
    pub fn uses_bitmaps(&self) -> bool {
        self.flags & BTRFS_FREE_SPACE_USING_BITMAPS != 0
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; FREE_SPACE_INFO_SIZE] {
        let mut out = [0_u8; FREE_SPACE_INFO_SIZE];
        out[0..4].copy_from_slice(&self.extent_count.to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.to_le_bytes());
        out
    }
}
