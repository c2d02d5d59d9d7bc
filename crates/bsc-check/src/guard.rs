//! Cancellation and freeze guards.
//!
//! A [`CancelFlag`] is set asynchronously by a termination signal and polled
//! by the scan loops between records. A [`FreezeGuard`] owns the frozen state
//! of the filesystem: it issues at most one thaw per freeze, and its `Drop`
//! thaws on every exit path, including errors and cancellation.

use bsc_error::{CheckError, Result};
use bsc_search::FsControl;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGPIPE, SIGQUIT, SIGTERM};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Signals that abandon the scan.
pub const TERMINATION_SIGNALS: [i32; 5] = [SIGHUP, SIGINT, SIGQUIT, SIGPIPE, SIGTERM];

/// Cooperative cancellation flag shared with signal handlers.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag on any of [`TERMINATION_SIGNALS`].
    ///
    /// The handlers only store to the flag; all cleanup happens on the main
    /// thread once the scan notices.
    pub fn register_signals(&self) -> Result<()> {
        for signal in TERMINATION_SIGNALS {
            signal_hook::flag::register(signal, Arc::clone(&self.0))?;
        }
        Ok(())
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CheckError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Scoped ownership of the frozen state of a filesystem.
pub struct FreezeGuard<'a, F: FsControl + ?Sized> {
    fs: &'a F,
    frozen: bool,
    freezes: u32,
}

impl<'a, F: FsControl + ?Sized> FreezeGuard<'a, F> {
    #[must_use]
    pub fn new(fs: &'a F) -> Self {
        Self {
            fs,
            frozen: false,
            freezes: 0,
        }
    }

    /// Freeze the filesystem. A no-op while already frozen.
    pub fn freeze(&mut self) -> Result<()> {
        if self.frozen {
            return Ok(());
        }
        self.fs.freeze()?;
        self.frozen = true;
        self.freezes += 1;
        info!(target: "bsc::guard", "filesystem frozen");
        Ok(())
    }

    /// Thaw if this guard froze the filesystem.
    ///
    /// Returns whether the filesystem reported a thaw. Only the first call
    /// after a freeze reaches the filesystem.
    pub fn thaw(&mut self) -> Result<bool> {
        if !self.frozen {
            return Ok(false);
        }
        self.frozen = false;
        let thawed = self.fs.thaw()?;
        info!(target: "bsc::guard", thawed, "filesystem thawed");
        Ok(thawed)
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of successful freezes over the guard's lifetime.
    #[must_use]
    pub fn freezes(&self) -> u32 {
        self.freezes
    }
}

impl<F: FsControl + ?Sized> Drop for FreezeGuard<'_, F> {
    fn drop(&mut self) {
        if !self.frozen {
            return;
        }
        self.frozen = false;
        match self.fs.thaw() {
            Ok(_) => warn!(target: "bsc::guard", "thawed filesystem on early exit"),
            Err(err) => warn!(
                target: "bsc::guard",
                error = %err,
                "thaw on early exit failed; run `fsfreeze --unfreeze` on the mount point"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsc_harness::FsImage;

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(flag.check().is_ok());
        clone.cancel();
        assert!(flag.is_cancelled());
        assert!(matches!(flag.check(), Err(CheckError::Cancelled)));
    }

    #[test]
    fn thaw_without_freeze_does_not_reach_filesystem() {
        let fs = FsImage::new().build();
        let mut guard = FreezeGuard::new(&fs);
        assert!(!guard.thaw().expect("thaw"));
        drop(guard);
        assert_eq!(fs.counters().thaws, 0);
    }

    #[test]
    fn one_thaw_per_freeze() {
        let fs = FsImage::new().build();
        let mut guard = FreezeGuard::new(&fs);
        guard.freeze().expect("freeze");
        guard.freeze().expect("second freeze is a no-op");
        assert!(guard.is_frozen());
        assert!(guard.thaw().expect("thaw"));
        assert!(!guard.thaw().expect("second thaw"));
        drop(guard);
        let counters = fs.counters();
        assert_eq!(counters.freezes, 1);
        assert_eq!(counters.thaws, 1);
    }

    #[test]
    fn drop_thaws_a_frozen_filesystem() {
        let fs = FsImage::new().build();
        {
            let mut guard = FreezeGuard::new(&fs);
            guard.freeze().expect("freeze");
            assert!(fs.is_frozen());
        }
        assert!(!fs.is_frozen());
        assert_eq!(fs.counters().thaws, 1);
    }
}
