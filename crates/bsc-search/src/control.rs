//! Filesystem-wide services consumed by the checker.
//!
//! These are opaque collaborators: the checker never reimplements them, it
//! only asks the mounted filesystem for its geometry and feature bits, and
//! toggles the freeze state.

use crate::TreeSearch;
use bsc_error::Result;
use bsc_types::{
    BTRFS_FEATURE_COMPAT_RO_BLOCK_GROUP_TREE, BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE,
    BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE_VALID, SectorSize,
};
use serde::Serialize;

/// Geometry of a mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsInfo {
    /// Unit of a free space bitmap bit.
    pub sectorsize: SectorSize,
    /// Size of a tree block; the implicit length of every `METADATA_ITEM`.
    pub nodesize: u32,
    pub num_devices: u64,
    pub generation: u64,
}

/// Feature flags as reported by the mounted filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeatureFlags {
    pub compat: u64,
    pub compat_ro: u64,
    pub incompat: u64,
}

impl FeatureFlags {
    /// The free space tree exists and the kernel trusts it.
    ///
    /// Both `FREE_SPACE_TREE` and `FREE_SPACE_TREE_VALID` must be set; a tree
    /// without the valid bit is being rebuilt and is not checked.
    #[must_use]
    pub fn free_space_tree_enabled(&self) -> bool {
        let required =
            BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE | BTRFS_FEATURE_COMPAT_RO_FREE_SPACE_TREE_VALID;
        self.compat_ro & required == required
    }

    /// Block group items live in their own tree instead of the extent tree.
    #[must_use]
    pub fn block_group_tree(&self) -> bool {
        self.compat_ro & BTRFS_FEATURE_COMPAT_RO_BLOCK_GROUP_TREE != 0
    }
}

/// Control surface of a mounted filesystem.
pub trait FsControl: TreeSearch {
    /// Sector size, node size and related geometry.
    fn fs_info(&self) -> Result<FsInfo>;

    /// Compat, compat_ro and incompat feature bits.
    fn features(&self) -> Result<FeatureFlags>;

    /// Block new write transactions until [`FsControl::thaw`].
    fn freeze(&self) -> Result<()>;

    /// Release a freeze.
    ///
    /// Returns `Ok(false)` when the filesystem was not frozen; that case is
    /// a no-op, not an error.
    fn thaw(&self) -> Result<bool>;

    /// Wait for a transaction commit in progress, if any, to finish.
    fn wait_sync(&self) -> Result<()>;
}
