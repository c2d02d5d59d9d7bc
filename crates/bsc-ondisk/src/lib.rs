#![forbid(unsafe_code)]
//! Item decoding for the extent tree and free space tree.
//!
//! Pure parsing crate: no I/O, no side effects. Turns the raw result buffer
//! of a tree search into typed items and decodes the payloads the checker
//! cares about (block group items, free space info, free space bitmaps).

pub mod bitmap;
pub mod btrfs;

pub use bitmap::{BitRunCollector, bitmap_get};
pub use btrfs::{
    BlockGroupItem, BtrfsKey, FreeExtent, FreeSpaceInfo, SEARCH_HEADER_SIZE, SearchItem,
    key_type_name, parse_search_buffer,
};
