//! Per-block-group retry protocol.
//!
//! The filesystem is mounted and live, so an inconsistency seen once may just
//! be a transaction caught half-committed. A block group that looks corrupted
//! is re-examined up to `retries` more times: after a short pause and a wait
//! for the running transaction on ordinary retries, and with the filesystem
//! frozen on the final retry when freezing is enabled. Only the final
//! attempt's verdict counts, and only its findings are shown.
//!
//! ```text
//!   CHECKING ──corrupted, retries left──▶ RETRY_WAIT ──▶ CHECKING
//!       │                                    (final retry with --freeze)
//!       │                              └───▶ FROZEN ─────▶ CHECKING
//!       └──clean, or no retries left──▶ group concluded (counter reset)
//! ```

use crate::config::CheckConfig;
use crate::finding::{Finding, Verdict};
use crate::guard::{CancelFlag, FreezeGuard};
use crate::walker::BlockGroup;
use bsc_error::Result;
use bsc_search::FsControl;
use serde::Serialize;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info};

/// Run-wide corruption flags. Once set, never cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub extent_tree_corrupted: bool,
    pub free_space_tree_corrupted: bool,
}

impl RunState {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.extent_tree_corrupted && !self.free_space_tree_corrupted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Checking,
    RetryWait,
    Frozen,
}

/// What one examination of a block group found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub extent_tree: Vec<Finding>,
    pub free_space_tree: Verdict,
}

impl Attempt {
    #[must_use]
    pub fn extent_tree_corrupted(&self) -> bool {
        !self.extent_tree.is_empty()
    }

    #[must_use]
    pub fn free_space_tree_corrupted(&self) -> bool {
        self.free_space_tree.is_corrupted()
    }

    #[must_use]
    pub fn is_corrupted(&self) -> bool {
        self.extent_tree_corrupted() || self.free_space_tree_corrupted()
    }

    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.extent_tree
            .iter()
            .chain(self.free_space_tree.findings())
    }
}

/// Final verdict on one block group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupOutcome {
    pub block_group: BlockGroup,
    /// Examinations performed, including the first.
    pub attempts: u32,
    /// Whether the final examination ran with the filesystem frozen.
    pub frozen: bool,
    pub extent_tree_corrupted: bool,
    pub free_space_tree_corrupted: bool,
    /// Findings of the final examination.
    pub findings: Vec<Finding>,
}

impl GroupOutcome {
    #[must_use]
    pub fn is_corrupted(&self) -> bool {
        self.extent_tree_corrupted || self.free_space_tree_corrupted
    }
}

#[derive(Debug)]
pub enum Decision {
    /// Re-examine the same block group from its start.
    Retry,
    /// The group is done; move on.
    Concluded(GroupOutcome),
}

/// Drives retries and freezing for one block group at a time.
pub struct RetryController<'a, F: FsControl + ?Sized> {
    fs: &'a F,
    retries: u32,
    freeze: bool,
    retry_delay: Duration,
    cancel: CancelFlag,
    guard: FreezeGuard<'a, F>,
    retry: u32,
    state: RetryState,
    run: RunState,
    retries_performed: u64,
}

impl<'a, F: FsControl + ?Sized> RetryController<'a, F> {
    #[must_use]
    pub fn new(fs: &'a F, config: &CheckConfig, cancel: CancelFlag) -> Self {
        Self {
            fs,
            retries: config.retries,
            freeze: config.freeze,
            retry_delay: config.retry_delay,
            cancel,
            guard: FreezeGuard::new(fs),
            retry: 0,
            state: RetryState::Checking,
            run: RunState::default(),
            retries_performed: 0,
        }
    }

    /// Whether the current attempt's findings are the ones that count.
    #[must_use]
    pub fn is_final_attempt(&self) -> bool {
        self.retry == self.retries
    }

    #[must_use]
    pub fn state(&self) -> RetryState {
        self.state
    }

    #[must_use]
    pub fn retries_performed(&self) -> u64 {
        self.retries_performed
    }

    #[must_use]
    pub fn freezes(&self) -> u32 {
        self.guard.freezes()
    }

    /// Conclude one attempt on `group`: thaw, show findings when they
    /// count, and either prepare a retry or fold the verdict into the run.
    pub fn conclude(
        &mut self,
        group: &BlockGroup,
        attempt: Attempt,
        out: &mut dyn Write,
    ) -> Result<Decision> {
        let frozen = self.guard.is_frozen();
        if self.guard.thaw()? {
            writeln!(out, "Un-froze filesystem")?;
        }
        self.state = RetryState::Checking;

        if self.is_final_attempt() {
            for finding in attempt.findings() {
                writeln!(out, "{finding}")?;
            }
        } else {
            for finding in attempt.findings() {
                debug!(group = group.start, retry = self.retry, %finding, "unconfirmed finding");
            }
        }

        if attempt.is_corrupted() && self.retry < self.retries {
            self.retry += 1;
            self.retries_performed += 1;
            writeln!(out, "Retry {} for {}", self.retry, group.start)?;
            info!(group = group.start, retry = self.retry, "retrying block group");
            self.begin_retry(out)?;
            return Ok(Decision::Retry);
        }

        let outcome = GroupOutcome {
            block_group: *group,
            attempts: self.retry + 1,
            frozen,
            extent_tree_corrupted: attempt.extent_tree_corrupted(),
            free_space_tree_corrupted: attempt.free_space_tree_corrupted(),
            findings: attempt.findings().cloned().collect(),
        };
        self.run.extent_tree_corrupted |= outcome.extent_tree_corrupted;
        self.run.free_space_tree_corrupted |= outcome.free_space_tree_corrupted;
        self.retry = 0;
        Ok(Decision::Concluded(outcome))
    }

    fn begin_retry(&mut self, out: &mut dyn Write) -> Result<()> {
        if self.is_final_attempt() && self.freeze {
            writeln!(out, "Freezing filesystem")?;
            self.guard.freeze()?;
            self.state = RetryState::Frozen;
            return Ok(());
        }
        self.state = RetryState::RetryWait;
        std::thread::sleep(self.retry_delay);
        self.cancel.check()?;
        // A commit in flight is the usual cause of a transient mismatch.
        self.fs.wait_sync()?;
        self.state = RetryState::Checking;
        Ok(())
    }

    /// Release the freeze, if held, and return the run-wide flags.
    pub fn finish(mut self, out: &mut dyn Write) -> Result<RunState> {
        if self.guard.thaw()? {
            writeln!(out, "Un-froze filesystem")?;
        }
        Ok(self.run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsc_harness::FsImage;

    fn config(retries: u32, freeze: bool) -> CheckConfig {
        CheckConfig {
            retries,
            freeze,
            retry_delay: Duration::ZERO,
            ..CheckConfig::default()
        }
    }

    fn corrupted() -> Attempt {
        Attempt {
            extent_tree: Vec::new(),
            free_space_tree: Verdict::Corrupted(vec![Finding::NoBitmaps]),
        }
    }

    fn clean() -> Attempt {
        Attempt {
            extent_tree: Vec::new(),
            free_space_tree: Verdict::Clean,
        }
    }

    fn group() -> BlockGroup {
        BlockGroup::new(4096, 1 << 20)
    }

    #[test]
    fn persistent_corruption_uses_all_retries() {
        let fs = FsImage::new().build();
        let config = config(2, false);
        let mut controller = RetryController::new(&fs, &config, CancelFlag::new());
        let mut out = Vec::new();
        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            match controller.conclude(&group(), corrupted(), &mut out).expect("conclude") {
                Decision::Retry => {}
                Decision::Concluded(outcome) => break outcome,
            }
        };
        assert_eq!(attempts, 3);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.free_space_tree_corrupted);
        assert!(!outcome.frozen);
        assert_eq!(fs.counters().wait_syncs, 2);
        assert_eq!(fs.counters().freezes, 0);
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(text, "Retry 1 for 4096\nRetry 2 for 4096\nno bitmaps\n");
        assert!(!controller.is_final_attempt());
        let run = controller.finish(&mut Vec::new()).expect("finish");
        assert!(run.free_space_tree_corrupted);
    }

    #[test]
    fn transient_corruption_is_forgotten() {
        let fs = FsImage::new().build();
        let config = config(2, false);
        let mut controller = RetryController::new(&fs, &config, CancelFlag::new());
        let mut out = Vec::new();
        assert!(matches!(
            controller.conclude(&group(), corrupted(), &mut out),
            Ok(Decision::Retry)
        ));
        let Ok(Decision::Concluded(outcome)) = controller.conclude(&group(), clean(), &mut out)
        else {
            panic!("expected conclusion");
        };
        assert!(!outcome.is_corrupted());
        assert_eq!(outcome.attempts, 2);
        assert!(controller.finish(&mut Vec::new()).expect("finish").is_clean());
        // The corrupted first attempt was not final; its finding stays hidden.
        assert_eq!(String::from_utf8(out).expect("utf8"), "Retry 1 for 4096\n");
    }

    #[test]
    fn final_retry_is_frozen_and_thawed_once() {
        let fs = FsImage::new().build();
        let config = config(2, true);
        let mut controller = RetryController::new(&fs, &config, CancelFlag::new());
        let mut out = Vec::new();
        controller.conclude(&group(), corrupted(), &mut out).expect("first");
        assert_eq!(controller.state(), RetryState::Checking);
        controller.conclude(&group(), corrupted(), &mut out).expect("second");
        assert_eq!(controller.state(), RetryState::Frozen);
        assert!(fs.is_frozen());
        let Ok(Decision::Concluded(outcome)) =
            controller.conclude(&group(), corrupted(), &mut out)
        else {
            panic!("expected conclusion");
        };
        assert!(outcome.frozen);
        assert!(!fs.is_frozen());
        let counters = fs.counters();
        assert_eq!(counters.freezes, 1);
        assert_eq!(counters.thaws, 1);
        assert_eq!(counters.wait_syncs, 1);
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("Freezing filesystem\n"));
        assert!(text.contains("Un-froze filesystem\n"));
        assert_eq!(controller.freezes(), 1);
    }

    #[test]
    fn zero_retries_concludes_immediately() {
        let fs = FsImage::new().build();
        let config = config(0, true);
        let mut controller = RetryController::new(&fs, &config, CancelFlag::new());
        let mut out = Vec::new();
        assert!(controller.is_final_attempt());
        let decision = controller.conclude(&group(), corrupted(), &mut out).expect("conclude");
        assert!(matches!(decision, Decision::Concluded(ref o) if o.attempts == 1 && !o.frozen));
        assert_eq!(fs.counters().freezes, 0);
        assert_eq!(String::from_utf8(out).expect("utf8"), "no bitmaps\n");
    }

    #[test]
    fn dropping_a_frozen_controller_thaws() {
        let fs = FsImage::new().build();
        let config = config(1, true);
        {
            let mut controller = RetryController::new(&fs, &config, CancelFlag::new());
            let mut out = Vec::new();
            controller.conclude(&group(), corrupted(), &mut out).expect("conclude");
            assert!(fs.is_frozen());
        }
        assert!(!fs.is_frozen());
        assert_eq!(fs.counters().thaws, 1);
    }

    #[test]
    fn cancellation_during_wait_aborts_retry() {
        let fs = FsImage::new().build();
        let config = config(2, false);
        let cancel = CancelFlag::new();
        let mut controller = RetryController::new(&fs, &config, cancel.clone());
        cancel.cancel();
        let err = controller
            .conclude(&group(), corrupted(), &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, bsc_error::CheckError::Cancelled));
        assert_eq!(fs.counters().wait_syncs, 0);
    }
}
