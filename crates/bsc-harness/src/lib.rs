#![forbid(unsafe_code)]
//! In-memory filesystem images for the space cache checker.
//!
//! [`FsImage`] builds extent tree and free space tree contents item by item;
//! [`MemFs`] serves them through the same [`TreeSearch`] and [`FsControl`]
//! traits the ioctl backend implements, and counts every control request so
//! tests can assert on freeze, thaw and sync traffic. Hooks let a test change
//! the trees when a transaction "commits" (on sync or freeze) or run code on
//! every search call, which is how concurrent writers and signals are
//! simulated.

use bsc_error::{CheckError, Result};
use bsc_ondisk::{BtrfsKey, FreeSpaceInfo, SearchItem};
use bsc_search::{FeatureFlags, FsControl, FsInfo, SearchKey, TreeSearch};
use bsc_types::{
    BTRFS_BLOCK_GROUP_DATA, BTRFS_BLOCK_GROUP_ITEM_KEY, BTRFS_EXTENT_ITEM_KEY,
    BTRFS_FEATURE_COMPAT_RO_BLOCK_GROUP_TREE, BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
    BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE_VALID, BTRFS_FREE_SPACE_BITMAP_KEY,
    BTRFS_FREE_SPACE_EXTENT_KEY, BTRFS_FREE_SPACE_INFO_KEY, BTRFS_FREE_SPACE_USING_BITMAPS,
    BTRFS_METADATA_ITEM_KEY, SectorSize, TreeId,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Sectors covered by one bitmap item built by
/// [`FsImage::matching_free_space_bitmaps`].
pub const BITMAP_SECTORS: u64 = 1024;

const DEFAULT_SECTORSIZE: u32 = 4096;
const DEFAULT_NODESIZE: u32 = 16384;

type Tree = BTreeMap<BtrfsKey, Vec<u8>>;

/// Mutable view of the trees of an image, handed to hooks.
#[derive(Debug, Default, Clone)]
pub struct TreeEdit {
    trees: BTreeMap<u64, Tree>,
}

impl TreeEdit {
    pub fn insert(&mut self, tree: TreeId, key: BtrfsKey, data: Vec<u8>) {
        self.trees.entry(tree.0).or_default().insert(key, data);
    }

    pub fn remove(&mut self, tree: TreeId, key: &BtrfsKey) -> Option<Vec<u8>> {
        self.trees.get_mut(&tree.0).and_then(|t| t.remove(key))
    }

    #[must_use]
    pub fn contains(&self, tree: TreeId, key: &BtrfsKey) -> bool {
        self.trees.get(&tree.0).is_some_and(|t| t.contains_key(key))
    }

    #[must_use]
    pub fn len(&self, tree: TreeId) -> usize {
        self.trees.get(&tree.0).map_or(0, BTreeMap::len)
    }

    fn items(&self, tree: TreeId) -> impl Iterator<Item = (&BtrfsKey, &Vec<u8>)> {
        self.trees.get(&tree.0).into_iter().flatten()
    }
}

/// Builder for the contents of an in-memory filesystem.
#[derive(Debug, Clone)]
pub struct FsImage {
    sectorsize: u32,
    nodesize: u32,
    compat_ro: u64,
    edit: TreeEdit,
}

impl Default for FsImage {
    fn default() -> Self {
        Self::new()
    }
}

impl FsImage {
    /// An empty image with 4 KiB sectors, 16 KiB nodes and a valid free
    /// space tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sectorsize: DEFAULT_SECTORSIZE,
            nodesize: DEFAULT_NODESIZE,
            compat_ro: BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE
                | BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE_VALID,
            edit: TreeEdit::default(),
        }
    }

    /// Panics if `sectorsize` is not a power of two.
    #[must_use]
    pub fn sectorsize(mut self, sectorsize: u32) -> Self {
        assert!(SectorSize::new(sectorsize).is_ok(), "bad sector size {sectorsize}");
        self.sectorsize = sectorsize;
        self
    }

    #[must_use]
    pub fn nodesize(mut self, nodesize: u32) -> Self {
        self.nodesize = nodesize;
        self
    }

    #[must_use]
    pub fn without_free_space_tree(mut self) -> Self {
        self.compat_ro &= !(BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE
            | BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE_VALID);
        self
    }

    #[must_use]
    pub fn block_group_tree(mut self) -> Self {
        self.compat_ro |= BTRFS_FEATURE_COMPAT_RO_BLOCK_GROUP_TREE;
        self
    }

    /// A data block group `[start, start + length)`.
    #[must_use]
    pub fn block_group(mut self, start: u64, length: u64) -> Self {
        let mut item = vec![0_u8; 24];
        item[16..24].copy_from_slice(&BTRFS_BLOCK_GROUP_DATA.to_le_bytes());
        self.edit.insert(
            TreeId::EXTENT,
            BtrfsKey::new(start, BTRFS_BLOCK_GROUP_ITEM_KEY, length),
            item,
        );
        self
    }

    /// An `EXTENT_ITEM` allocating `[start, start + size)`.
    #[must_use]
    pub fn data_extent(mut self, start: u64, size: u64) -> Self {
        self.edit.insert(
            TreeId::EXTENT,
            BtrfsKey::new(start, BTRFS_EXTENT_ITEM_KEY, size),
            vec![0; 24],
        );
        self
    }

    /// A `METADATA_ITEM` allocating one node at `start`.
    #[must_use]
    pub fn metadata_extent(mut self, start: u64) -> Self {
        self.edit.insert(
            TreeId::EXTENT,
            BtrfsKey::new(start, BTRFS_METADATA_ITEM_KEY, 0),
            vec![0; 24],
        );
        self
    }

    #[must_use]
    pub fn free_space_info(mut self, start: u64, length: u64, extent_count: u32, bitmaps: bool) -> Self {
        let info = FreeSpaceInfo {
            extent_count,
            flags: if bitmaps {
                BTRFS_FREE_SPACE_USING_BITMAPS
            } else {
                0
            },
        };
        self.edit.insert(
            TreeId::FREE_SPACE,
            BtrfsKey::new(start, BTRFS_FREE_SPACE_INFO_KEY, length),
            info.to_bytes().to_vec(),
        );
        self
    }

    #[must_use]
    pub fn free_space_extent(mut self, start: u64, size: u64) -> Self {
        self.edit.insert(
            TreeId::FREE_SPACE,
            BtrfsKey::new(start, BTRFS_FREE_SPACE_EXTENT_KEY, size),
            Vec::new(),
        );
        self
    }

    /// A bitmap item for `[start, start + length)` with a bit set for every
    /// sector that begins inside one of the `free` `(start, size)` ranges.
    #[must_use]
    pub fn free_space_bitmap(mut self, start: u64, length: u64, free: &[(u64, u64)]) -> Self {
        let bits = bitmap_bytes(start, length, u64::from(self.sectorsize), free);
        self.edit.insert(
            TreeId::FREE_SPACE,
            BtrfsKey::new(start, BTRFS_FREE_SPACE_BITMAP_KEY, length),
            bits,
        );
        self
    }

    /// Any free space tree item, payload verbatim.
    #[must_use]
    pub fn raw_free_space_item(mut self, objectid: u64, item_type: u8, offset: u64, data: Vec<u8>) -> Self {
        self.edit.insert(
            TreeId::FREE_SPACE,
            BtrfsKey::new(objectid, item_type, offset),
            data,
        );
        self
    }

    /// Extent-encoded free space tree entries agreeing with the extent tree.
    #[must_use]
    pub fn matching_free_space_tree(mut self) -> Self {
        for (start, length) in self.block_groups() {
            let free = self.derived_free(start, length);
            let count = u32::try_from(free.len()).unwrap_or(u32::MAX);
            self = self.free_space_info(start, length, count, false);
            for (extent_start, size) in free {
                self = self.free_space_extent(extent_start, size);
            }
        }
        self
    }

    /// Bitmap-encoded free space tree entries agreeing with the extent tree.
    #[must_use]
    pub fn matching_free_space_bitmaps(mut self) -> Self {
        let span = BITMAP_SECTORS * u64::from(self.sectorsize);
        for (start, length) in self.block_groups() {
            let free = self.derived_free(start, length);
            let count = u32::try_from(free.len()).unwrap_or(u32::MAX);
            self = self.free_space_info(start, length, count, true);
            let end = start + length;
            let mut offset = start;
            while offset < end {
                let chunk = span.min(end - offset);
                self = self.free_space_bitmap(offset, chunk, &free);
                offset += chunk;
            }
        }
        self
    }

    /// `(start, length)` of every block group, in key order.
    #[must_use]
    pub fn block_groups(&self) -> Vec<(u64, u64)> {
        self.edit
            .items(TreeId::EXTENT)
            .filter(|(key, _)| key.item_type == BTRFS_BLOCK_GROUP_ITEM_KEY)
            .map(|(key, _)| (key.objectid, key.offset))
            .collect()
    }

    /// Free space of a block group computed straight from its allocations.
    #[must_use]
    pub fn derived_free(&self, start: u64, length: u64) -> Vec<(u64, u64)> {
        let end = start + length;
        let mut cursor = start;
        let mut free = Vec::new();
        for (key, _) in self.edit.items(TreeId::EXTENT) {
            let size = match key.item_type {
                BTRFS_EXTENT_ITEM_KEY => key.offset,
                BTRFS_METADATA_ITEM_KEY => u64::from(self.nodesize),
                _ => continue,
            };
            if key.objectid < start || key.objectid >= end {
                continue;
            }
            if key.objectid > cursor {
                free.push((cursor, key.objectid - cursor));
            }
            cursor = cursor.max(key.objectid + size);
        }
        if cursor < end {
            free.push((cursor, end - cursor));
        }
        free
    }

    #[must_use]
    pub fn build(self) -> MemFs {
        MemFs {
            fs_info: FsInfo {
                sectorsize: SectorSize::new(self.sectorsize)
                    .unwrap_or_else(|_| unreachable!("validated by FsImage::sectorsize")),
                nodesize: self.nodesize,
                num_devices: 1,
                generation: 1,
            },
            features: FeatureFlags {
                compat_ro: self.compat_ro,
                ..FeatureFlags::default()
            },
            state: Mutex::new(State {
                edit: self.edit,
                frozen: false,
                counters: ControlCounters::default(),
                fail_searches_after: None,
                search_hook: None,
                commit_hook: None,
            }),
        }
    }
}

fn bitmap_bytes(start: u64, length: u64, sectorsize: u64, free: &[(u64, u64)]) -> Vec<u8> {
    let num_bits = length / sectorsize;
    let len = usize::try_from(num_bits.div_ceil(8)).unwrap_or(usize::MAX);
    let mut bits = vec![0_u8; len];
    for (idx, byte) in (0..num_bits).map(|i| (i, i / 8)) {
        let sector = start + idx * sectorsize;
        if free
            .iter()
            .any(|&(free_start, size)| sector >= free_start && sector < free_start + size)
        {
            if let Ok(byte) = usize::try_from(byte) {
                bits[byte] |= 1 << (idx % 8);
            }
        }
    }
    bits
}

/// Control requests served so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlCounters {
    pub searches: u64,
    pub freezes: u64,
    pub thaws: u64,
    pub wait_syncs: u64,
}

type SearchHook = Box<dyn FnMut(u64) + Send>;
type CommitHook = Box<dyn FnMut(&mut TreeEdit) + Send>;

struct State {
    edit: TreeEdit,
    frozen: bool,
    counters: ControlCounters,
    fail_searches_after: Option<u64>,
    search_hook: Option<SearchHook>,
    commit_hook: Option<CommitHook>,
}

impl State {
    fn commit(&mut self) {
        let Self {
            edit, commit_hook, ..
        } = self;
        if let Some(hook) = commit_hook.as_mut() {
            hook(edit);
        }
    }
}

/// A mounted filesystem made of in-memory trees.
pub struct MemFs {
    fs_info: FsInfo,
    features: FeatureFlags,
    state: Mutex<State>,
}

impl std::fmt::Debug for MemFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemFs")
            .field("fs_info", &self.fs_info)
            .field("features", &self.features)
            .field("frozen", &state.frozen)
            .field("counters", &state.counters)
            .finish_non_exhaustive()
    }
}

impl MemFs {
    #[must_use]
    pub fn counters(&self) -> ControlCounters {
        self.state.lock().counters
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.state.lock().frozen
    }

    /// Fail every search call after the first `n`.
    pub fn fail_searches_after(&self, n: u64) {
        self.state.lock().fail_searches_after = Some(n);
    }

    /// Run `hook` with the 1-based number of every search call.
    pub fn on_search(&self, hook: impl FnMut(u64) + Send + 'static) {
        self.state.lock().search_hook = Some(Box::new(hook));
    }

    /// Run `hook` whenever a transaction would commit: on every sync wait
    /// and every freeze.
    pub fn on_commit(&self, hook: impl FnMut(&mut TreeEdit) + Send + 'static) {
        self.state.lock().commit_hook = Some(Box::new(hook));
    }

    /// Change the trees right now.
    pub fn edit(&self, f: impl FnOnce(&mut TreeEdit)) {
        f(&mut self.state.lock().edit);
    }
}

impl TreeSearch for MemFs {
    fn search(&self, key: &SearchKey, nr_items: u32) -> std::io::Result<Vec<SearchItem>> {
        let mut state = self.state.lock();
        state.counters.searches += 1;
        let call = state.counters.searches;
        if state.fail_searches_after.is_some_and(|n| call > n) {
            return Err(std::io::Error::other("injected search failure"));
        }
        if let Some(hook) = state.search_hook.as_mut() {
            hook(call);
        }
        if key.min > key.max {
            return Ok(Vec::new());
        }
        let limit = usize::try_from(nr_items).unwrap_or(usize::MAX);
        Ok(state
            .edit
            .trees
            .get(&key.tree.0)
            .map(|tree| {
                tree.range(key.min..=key.max)
                    .take(limit)
                    .map(|(k, v)| SearchItem::new(*k, v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl FsControl for MemFs {
    fn fs_info(&self) -> Result<FsInfo> {
        Ok(self.fs_info)
    }

    fn features(&self) -> Result<FeatureFlags> {
        Ok(self.features)
    }

    fn freeze(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.counters.freezes += 1;
        if state.frozen {
            return Err(CheckError::Ioctl {
                op: "FIFREEZE",
                source: std::io::Error::other("already frozen"),
            });
        }
        state.frozen = true;
        state.commit();
        Ok(())
    }

    fn thaw(&self) -> Result<bool> {
        let mut state = self.state.lock();
        state.counters.thaws += 1;
        Ok(std::mem::replace(&mut state.frozen, false))
    }

    fn wait_sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.counters.wait_syncs += 1;
        state.commit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsc_search::TreeIterator;

    #[test]
    fn matching_tree_mirrors_allocations() {
        let image = FsImage::new()
            .block_group(0, 1 << 20)
            .data_extent(0, 8192)
            .metadata_extent(65536);
        assert_eq!(
            image.derived_free(0, 1 << 20),
            vec![(8192, 65536 - 8192), (65536 + 16384, (1 << 20) - 65536 - 16384)]
        );
        let fs = image.matching_free_space_tree().build();
        let items: Vec<_> = TreeIterator::new(&fs, SearchKey::whole_tree(TreeId::FREE_SPACE))
            .map(|item| item.expect("item").key)
            .collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], BtrfsKey::new(0, BTRFS_FREE_SPACE_INFO_KEY, 1 << 20));
    }

    #[test]
    fn bitmaps_tile_the_group() {
        let fs = FsImage::new()
            .block_group(0, 5 * 1024 * 4096)
            .matching_free_space_bitmaps()
            .build();
        let bitmaps: Vec<_> = TreeIterator::new(&fs, SearchKey::whole_tree(TreeId::FREE_SPACE))
            .map(|item| item.expect("item"))
            .filter(|item| item.key.item_type == BTRFS_FREE_SPACE_BITMAP_KEY)
            .collect();
        assert_eq!(bitmaps.len(), 5);
        assert!(bitmaps.iter().all(|b| b.data.len() == 128));
        assert!(bitmaps.iter().all(|b| b.data.iter().all(|&byte| byte == 0xFF)));
    }

    #[test]
    fn bitmap_bits_follow_sectors() {
        let bits = bitmap_bytes(0, 16, 1, &[(1, 2), (15, 1)]);
        assert_eq!(bits, vec![0b0000_0110, 0b1000_0000]);
    }

    #[test]
    fn control_requests_are_counted() {
        let fs = FsImage::new().build();
        fs.freeze().expect("freeze");
        assert!(fs.freeze().is_err());
        assert!(fs.thaw().expect("thaw"));
        assert!(!fs.thaw().expect("thaw again"));
        fs.wait_sync().expect("sync");
        let counters = fs.counters();
        assert_eq!(counters.freezes, 2);
        assert_eq!(counters.thaws, 2);
        assert_eq!(counters.wait_syncs, 1);
    }

    #[test]
    fn commit_hook_runs_on_sync_and_freeze() {
        let fs = FsImage::new().build();
        fs.on_commit(|edit| edit.insert(TreeId::EXTENT, BtrfsKey::new(7, 168, 1), Vec::new()));
        fs.wait_sync().expect("sync");
        fs.edit(|edit| {
            assert!(edit.contains(TreeId::EXTENT, &BtrfsKey::new(7, 168, 1)));
            edit.remove(TreeId::EXTENT, &BtrfsKey::new(7, 168, 1));
        });
        fs.freeze().expect("freeze");
        fs.edit(|edit| assert_eq!(edit.len(TreeId::EXTENT), 1));
    }

    #[test]
    fn inverted_range_is_empty() {
        let fs = FsImage::new().block_group(0, 10).build();
        let key = SearchKey::range(TreeId::EXTENT, BtrfsKey::new(5, 0, 0), BtrfsKey::new(4, 0, 0));
        assert!(fs.search(&key, 10).expect("search").is_empty());
    }
}
