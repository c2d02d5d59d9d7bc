//! Linux backend for the filesystem services the checker consumes.
//!
//! [`IoctlFs`] holds a read-only descriptor of any path inside a mounted
//! btrfs filesystem and implements [`TreeSearch`] with
//! `BTRFS_IOC_TREE_SEARCH` and [`FsControl`] with `BTRFS_IOC_FS_INFO`,
//! `BTRFS_IOC_GET_FEATURES`, `FIFREEZE`, `FITHAW` and `BTRFS_IOC_WAIT_SYNC`.
//!
//! All `unsafe` is confined to the private `sys` module.

mod sys;

use bsc_error::{CheckError, Result};
use bsc_ondisk::{SearchItem, parse_search_buffer};
use bsc_search::{FeatureFlags, FsControl, FsInfo, SearchKey, TreeSearch};
use bsc_types::SectorSize;
use nix::errno::Errno;
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A mounted btrfs filesystem, reached through one of its paths.
#[derive(Debug)]
pub struct IoctlFs {
    file: File,
    path: PathBuf,
}

impl IoctlFs {
    /// Open `path` read-only. Directories are fine (and typical).
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        debug!(path = %path.display(), "opened filesystem handle");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

fn ioctl_error(op: &'static str, errno: Errno) -> CheckError {
    CheckError::Ioctl {
        op,
        source: std::io::Error::from(errno),
    }
}

impl TreeSearch for IoctlFs {
    fn search(&self, key: &SearchKey, nr_items: u32) -> std::io::Result<Vec<SearchItem>> {
        let mut args = Box::new(sys::SearchArgs::new(
            key.tree.0,
            key.min,
            key.max,
            (key.min_transid, key.max_transid),
            nr_items,
        ));
        sys::tree_search(self.fd(), &mut args)?;
        decode_results(&args.buf, args.key.nr_items)
    }
}

/// A result buffer that does not decode is reported like any other failed
/// search, as `InvalidData`.
fn decode_results(buf: &[u8], nr_items: u32) -> std::io::Result<Vec<SearchItem>> {
    parse_search_buffer(buf, nr_items)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}

impl FsControl for IoctlFs {
    fn fs_info(&self) -> Result<FsInfo> {
        let mut args = Box::<sys::FsInfoArgs>::default();
        match sys::fs_info(self.fd(), &mut args) {
            Ok(()) => {}
            Err(Errno::ENOTTY) => {
                return Err(CheckError::NotBtrfs(self.path.display().to_string()));
            }
            Err(errno) => return Err(ioctl_error("BTRFS_IOC_FS_INFO", errno)),
        }
        let sectorsize = SectorSize::new(args.sectorsize)
            .map_err(|err| CheckError::Parse(format!("fs info: {err}")))?;
        debug!(
            sectorsize = args.sectorsize,
            nodesize = args.nodesize,
            num_devices = args.num_devices,
            csum_type = args.csum_type,
            "queried filesystem info"
        );
        Ok(FsInfo {
            sectorsize,
            nodesize: args.nodesize,
            num_devices: args.num_devices,
            generation: args.generation,
        })
    }

    fn features(&self) -> Result<FeatureFlags> {
        let mut args = sys::FeatureFlagsArgs::default();
        sys::get_features(self.fd(), &mut args)
            .map_err(|errno| ioctl_error("BTRFS_IOC_GET_FEATURES", errno))?;
        Ok(FeatureFlags {
            compat: args.compat_flags,
            compat_ro: args.compat_ro_flags,
            incompat: args.incompat_flags,
        })
    }

    fn freeze(&self) -> Result<()> {
        sys::freeze(self.fd()).map_err(|errno| ioctl_error("FIFREEZE", errno))
    }

    fn thaw(&self) -> Result<bool> {
        match sys::thaw(self.fd()) {
            Ok(()) => Ok(true),
            // The kernel reports EINVAL when the filesystem is not frozen.
            Err(Errno::EINVAL) => Ok(false),
            Err(errno) => Err(ioctl_error("FITHAW", errno)),
        }
    }

    fn wait_sync(&self) -> Result<()> {
        sys::wait_sync(self.fd()).map_err(|errno| ioctl_error("BTRFS_IOC_WAIT_SYNC", errno))
    }
}

/// `"<sysname> <release> <version> <machine>"` of the running kernel.
pub fn kernel_description() -> Result<String> {
    let uts = nix::sys::utsname::uname().map_err(|errno| ioctl_error("uname", errno))?;
    Ok(format!(
        "{} {} {} {}",
        uts.sysname().to_string_lossy(),
        uts.release().to_string_lossy(),
        uts.version().to_string_lossy(),
        uts.machine().to_string_lossy(),
    ))
}
