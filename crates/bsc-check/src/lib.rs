#![forbid(unsafe_code)]
//! Online consistency check of the btrfs extent tree against the free space
//! tree.
//!
//! For every block group, free space is derived from the allocations in the
//! extent tree ([`walker`]) and compared with what the free space tree
//! claims ([`validator`]). Suspicious groups are re-examined under the
//! [`retry`] protocol, optionally with the filesystem frozen ([`guard`]).
//! The run ends with a [`RunSummary`] whose exit status is 0 (clean) or 3
//! (corruption); failures of the check itself are [`CheckError`]s.

pub mod config;
pub mod finding;
pub mod guard;
pub mod report;
pub mod retry;
pub mod validator;
pub mod walker;

pub use bsc_error::{CheckError, ExitStatus, Result};
pub use config::{CheckConfig, DEFAULT_RETRIES, MAX_RETRIES};
pub use finding::{ClaimSource, Finding, Structure, Verdict};
pub use guard::{CancelFlag, FreezeGuard, TERMINATION_SIGNALS};
pub use report::RunSummary;
pub use retry::{Attempt, Decision, GroupOutcome, RetryController, RetryState, RunState};
pub use validator::FreeSpaceTreeValidator;
pub use walker::{BlockGroup, ExtentTreeWalker, RegionScan};

use bsc_search::FsControl;
use std::io::Write;
use tracing::{debug, info, warn};

/// One check run over a mounted filesystem.
pub struct Checker<'a, F: FsControl + ?Sized> {
    fs: &'a F,
    config: CheckConfig,
    cancel: CancelFlag,
}

impl<'a, F: FsControl + ?Sized> Checker<'a, F> {
    #[must_use]
    pub fn new(fs: &'a F, config: CheckConfig, cancel: CancelFlag) -> Self {
        Self { fs, config, cancel }
    }

    /// Walk every block group, writing user-facing diagnostics to `out`.
    ///
    /// The filesystem is never left frozen when this returns, whether with a
    /// summary or an error.
    pub fn run(&self, out: &mut dyn Write) -> Result<RunSummary> {
        self.config.validate()?;
        let fs_info = self.fs.fs_info()?;
        let features = self.fs.features()?;
        debug!(?fs_info, ?features, "filesystem geometry");
        if features.block_group_tree() {
            return Err(CheckError::Unsupported(
                "block group items are stored in the block group tree".into(),
            ));
        }
        let free_space_tree_enabled = features.free_space_tree_enabled();
        writeln!(
            out,
            "Free space tree is {}enabled",
            if free_space_tree_enabled { "" } else { "not " }
        )?;

        let batch = self.config.batch_items;
        let mut walker = ExtentTreeWalker::new(self.fs, fs_info.nodesize, batch);
        let validator = free_space_tree_enabled
            .then(|| FreeSpaceTreeValidator::new(self.fs, fs_info.sectorsize, batch));
        let mut controller = RetryController::new(self.fs, &self.config, self.cancel.clone());
        let mut summary = RunSummary {
            free_space_tree_enabled,
            freeze: self.config.freeze,
            retries: self.config.retries,
            ..RunSummary::default()
        };

        while let Some(region) = walker.next_region(&self.cancel)? {
            let free_space_tree = match &validator {
                Some(validator) => {
                    validator.validate(&region.block_group, &region.free, &self.cancel)?
                }
                None => Verdict::Clean,
            };
            let attempt = Attempt {
                extent_tree: region.findings,
                free_space_tree,
            };
            match controller.conclude(&region.block_group, attempt, out)? {
                Decision::Retry => walker.restart_at(region.replay_from),
                Decision::Concluded(outcome) => {
                    if outcome.is_corrupted() {
                        warn!(
                            group = %outcome.block_group,
                            kind = %outcome.block_group.kind(),
                            findings = outcome.findings.len(),
                            frozen = outcome.frozen,
                            "block group corrupted"
                        );
                    }
                    summary.record(outcome);
                }
            }
        }

        summary.retries_performed = controller.retries_performed();
        summary.freezes = controller.freezes();
        summary.absorb(controller.finish(out)?);
        info!(%summary, "check finished");
        Ok(summary)
    }
}
