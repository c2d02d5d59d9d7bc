//! Run summary and the closing advice printed to the user.

use crate::retry::{GroupOutcome, RunState};
use bsc_error::ExitStatus;
use serde::Serialize;
use std::fmt;
use std::io::{self, Write};

/// Everything a finished run established.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub free_space_tree_enabled: bool,
    pub freeze: bool,
    pub retries: u32,
    pub block_groups_checked: u64,
    pub retries_performed: u64,
    pub freezes: u32,
    pub extent_tree_corrupted: bool,
    pub free_space_tree_corrupted: bool,
    /// Final outcomes of the block groups that stayed corrupted.
    pub corrupted_groups: Vec<GroupOutcome>,
}

impl RunSummary {
    pub(crate) fn record(&mut self, outcome: GroupOutcome) {
        self.block_groups_checked += 1;
        if outcome.is_corrupted() {
            self.corrupted_groups.push(outcome);
        }
    }

    pub(crate) fn absorb(&mut self, run: RunState) {
        self.extent_tree_corrupted |= run.extent_tree_corrupted;
        self.free_space_tree_corrupted |= run.free_space_tree_corrupted;
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.extent_tree_corrupted && !self.free_space_tree_corrupted
    }

    #[must_use]
    pub fn exit_status(&self) -> ExitStatus {
        if self.is_clean() {
            ExitStatus::Clean
        } else {
            ExitStatus::CorruptionDetected
        }
    }

    /// Every corrupted group's final observation was made while frozen.
    #[must_use]
    pub fn confirmed(&self) -> bool {
        !self.corrupted_groups.is_empty() && self.corrupted_groups.iter().all(|g| g.frozen)
    }

    /// Write the closing advice for this outcome.
    pub fn write_remediation(&self, out: &mut dyn Write) -> io::Result<()> {
        if self.is_clean() {
            return self.write_clean_advice(out);
        }
        let certainty = if self.confirmed() {
            "detected"
        } else {
            "suspected"
        };
        writeln!(out)?;
        if self.extent_tree_corrupted {
            writeln!(out, "Extent tree corruption {certainty}.")?;
        }
        if self.free_space_tree_corrupted {
            writeln!(out, "Free space tree corruption {certainty}.")?;
        }
        if !self.confirmed() {
            writeln!(out)?;
            if self.freeze {
                out.write_all(FROZEN_RETRY_HINT.as_bytes())?;
            } else {
                out.write_all(FREEZE_HINT.as_bytes())?;
            }
        }
        writeln!(out)?;
        out.write_all(DATA_LOSS.as_bytes())?;
        writeln!(out)?;
        if self.extent_tree_corrupted {
            out.write_all(REFORMAT_ADVICE.as_bytes())?;
        } else {
            out.write_all(CLEAR_CACHE_ADVICE.as_bytes())?;
        }
        Ok(())
    }

    fn write_clean_advice(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out)?;
        out.write_all(CLEAN.as_bytes())?;
        if !self.free_space_tree_enabled {
            writeln!(out)?;
            out.write_all(CLEAR_V1_CACHE_ADVICE.as_bytes())?;
        }
        Ok(())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checked {} block groups ({} retries, {} freezes): {}",
            self.block_groups_checked,
            self.retries_performed,
            self.freezes,
            self.exit_status()
        )
    }
}

const CLEAN: &str = "\
No corruption detected :)

You should install a kernel with the fix as soon as possible and avoid
rebooting until then.

Once you are running a kernel with the fix:

1. Run this program again.
2. Run btrfs scrub.
";

const CLEAR_V1_CACHE_ADVICE: &str = "\
If you want to be extra cautious, you can also clear the v1 space cache.
There are two ways to do this. The first is:

1. Add the clear_cache mount option to this filesystem in fstab.
2. Unmount then mount the filesystem. Note that `mount -o remount` is
   not sufficient; you need a full unmount/mount cycle. You can also
   reboot instead.
3. Remove the clear_cache mount option from fstab.

The second way to clear the space cache is:

1. Unmount the filesystem.
2. Run `btrfs check --clear-space-cache v1 <device>`.
3. Mount the filesystem.
";

const FREEZE_HINT: &str = "\
Consider re-running with --freeze for a more confident diagnosis. Note
that this may block write operations for intervals of up to a few
milliseconds.
";

const FROZEN_RETRY_HINT: &str = "\
The final observation was not made while frozen. Re-run with --freeze and
--retries of at least 1 for a more confident diagnosis.
";

const DATA_LOSS: &str = "\
File data or metadata may have been lost. You will most likely still be
able to access most of the data on this filesystem for now. Files with
checksums enabled will be unreadable if they were corrupted. Files with
checksums disabled may have been silently corrupted.
";

const REFORMAT_ADVICE: &str = "\
As soon as possible, you should back up any files that you wish to keep.

Then, when you are able to:

1. Unmount the filesystem.
2. Reformat the filesystem. Do not mount it yet.
3. Install a kernel with the fix.
4. Reboot into the fixed kernel.
5. Mount the filesystem and restore it from backups.
";

const CLEAR_CACHE_ADVICE: &str = "\
You may be able to recover this filesystem by clearing the space cache.
Do the following as soon as possible:

1. Back up any files that you wish to keep if this recovery fails.
2. Unmount the filesystem.
3. Clear the space cache with
  `btrfs check --clear-space-cache v2 <device>`.
4. Install a kernel with the fix.
5. Reboot into the fixed kernel.
6. Run this program again and follow the instructions.
";
