//! Raw ioctl definitions.
//!
//! The only `unsafe` code in the workspace. Every wrapper passes a pointer to
//! a live, correctly sized `#[repr(C)]` value owned by the caller, which is
//! all the kernel requires of these requests.
#![allow(unsafe_code)]

use bsc_ondisk::BtrfsKey;
use std::mem::size_of;
use std::os::fd::RawFd;

const BTRFS_IOCTL_MAGIC: u8 = 0x94;
const FS_IOCTL_MAGIC: u8 = b'X';

/// `struct btrfs_ioctl_search_key`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchKeyArgs {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
    unused: u32,
    unused1: u64,
    unused2: u64,
    unused3: u64,
    unused4: u64,
}

/// Size of the result buffer of `BTRFS_IOC_TREE_SEARCH`.
pub const SEARCH_BUF_SIZE: usize = 4096 - size_of::<SearchKeyArgs>();

/// `struct btrfs_ioctl_search_args`.
#[repr(C)]
pub struct SearchArgs {
    pub key: SearchKeyArgs,
    pub buf: [u8; SEARCH_BUF_SIZE],
}

impl SearchArgs {
    pub fn new(
        tree_id: u64,
        min: BtrfsKey,
        max: BtrfsKey,
        transids: (u64, u64),
        nr_items: u32,
    ) -> Self {
        Self {
            key: SearchKeyArgs {
                tree_id,
                min_objectid: min.objectid,
                max_objectid: max.objectid,
                min_offset: min.offset,
                max_offset: max.offset,
                min_transid: transids.0,
                max_transid: transids.1,
                min_type: u32::from(min.item_type),
                max_type: u32::from(max.item_type),
                nr_items,
                ..SearchKeyArgs::default()
            },
            buf: [0; SEARCH_BUF_SIZE],
        }
    }
}

/// `struct btrfs_ioctl_fs_info_args`.
#[repr(C)]
pub struct FsInfoArgs {
    pub max_id: u64,
    pub num_devices: u64,
    pub fsid: [u8; 16],
    pub nodesize: u32,
    pub sectorsize: u32,
    pub clone_alignment: u32,
    pub csum_type: u16,
    pub csum_size: u16,
    pub flags: u64,
    pub generation: u64,
    pub metadata_uuid: [u8; 16],
    reserved: [u8; 944],
}

impl Default for FsInfoArgs {
    fn default() -> Self {
        Self {
            max_id: 0,
            num_devices: 0,
            fsid: [0; 16],
            nodesize: 0,
            sectorsize: 0,
            clone_alignment: 0,
            csum_type: 0,
            csum_size: 0,
            flags: 0,
            generation: 0,
            metadata_uuid: [0; 16],
            reserved: [0; 944],
        }
    }
}

/// `struct btrfs_ioctl_feature_flags`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureFlagsArgs {
    pub compat_flags: u64,
    pub compat_ro_flags: u64,
    pub incompat_flags: u64,
}

mod raw {
    use super::{BTRFS_IOCTL_MAGIC, FS_IOCTL_MAGIC, FeatureFlagsArgs, FsInfoArgs, SearchArgs};

    nix::ioctl_readwrite!(btrfs_tree_search, BTRFS_IOCTL_MAGIC, 17, SearchArgs);
    nix::ioctl_write_ptr!(btrfs_wait_sync, BTRFS_IOCTL_MAGIC, 22, u64);
    nix::ioctl_read!(btrfs_fs_info, BTRFS_IOCTL_MAGIC, 31, FsInfoArgs);
    nix::ioctl_read!(btrfs_get_features, BTRFS_IOCTL_MAGIC, 57, FeatureFlagsArgs);
    nix::ioctl_readwrite!(fifreeze, FS_IOCTL_MAGIC, 119, libc::c_int);
    nix::ioctl_readwrite!(fithaw, FS_IOCTL_MAGIC, 120, libc::c_int);
}

pub fn tree_search(fd: RawFd, args: &mut SearchArgs) -> nix::Result<()> {
    // SAFETY: `args` is an exclusively borrowed `btrfs_ioctl_search_args`.
    unsafe { raw::btrfs_tree_search(fd, args) }.map(drop)
}

pub fn fs_info(fd: RawFd, args: &mut FsInfoArgs) -> nix::Result<()> {
    // SAFETY: `args` is an exclusively borrowed `btrfs_ioctl_fs_info_args`.
    unsafe { raw::btrfs_fs_info(fd, args) }.map(drop)
}

pub fn get_features(fd: RawFd, args: &mut FeatureFlagsArgs) -> nix::Result<()> {
    // SAFETY: `args` is an exclusively borrowed `btrfs_ioctl_feature_flags`.
    unsafe { raw::btrfs_get_features(fd, args) }.map(drop)
}

pub fn wait_sync(fd: RawFd) -> nix::Result<()> {
    // SAFETY: a null argument asks the kernel to wait for the current
    // transaction; it never dereferences the pointer in that case.
    unsafe { raw::btrfs_wait_sync(fd, std::ptr::null()) }.map(drop)
}

pub fn freeze(fd: RawFd) -> nix::Result<()> {
    let mut unused: libc::c_int = 0;
    // SAFETY: the argument is ignored by the kernel; it points to a live int.
    unsafe { raw::fifreeze(fd, &mut unused) }.map(drop)
}

pub fn thaw(fd: RawFd) -> nix::Result<()> {
    let mut unused: libc::c_int = 0;
    // SAFETY: the argument is ignored by the kernel; it points to a live int.
    unsafe { raw::fithaw(fd, &mut unused) }.map(drop)
}
