#![forbid(unsafe_code)]

mod cli;
mod tracing_setup;

use anyhow::{Context, Result};
use bsc_check::{CancelFlag, Checker, RunSummary};
use bsc_error::{CheckError, ExitStatus};
use bsc_ioctl::IoctlFs;
use cli::{Command, Options};
use std::env;
use std::io::{self, Write};
use std::process::ExitCode;
use tracing::info;
use tracing_setup::Verbosity;

const PROGRAM: &str = "btrfs-spacecheck";

fn main() -> ExitCode {
    match run() {
        Ok(status) => ExitCode::from(status.code()),
        Err(error) => {
            let cause = error.downcast_ref::<CheckError>();
            let status = cause.map_or(ExitStatus::InternalError, CheckError::exit_status);
            eprintln!("error: {error:#}");
            if matches!(cause, Some(CheckError::Usage(_))) {
                eprint!("\n{}", cli::usage(PROGRAM));
            }
            ExitCode::from(status.code())
        }
    }
}

fn run() -> Result<ExitStatus> {
    match cli::parse(env::args().skip(1))? {
        Command::Help => {
            write!(io::stdout().lock(), "{}", cli::usage(PROGRAM))?;
            Ok(ExitStatus::Clean)
        }
        Command::Version => {
            writeln!(io::stdout().lock(), "{PROGRAM} {}", env!("CARGO_PKG_VERSION"))?;
            Ok(ExitStatus::Clean)
        }
        Command::Check(options) => check(&options),
    }
}

fn check(options: &Options) -> Result<ExitStatus> {
    tracing_setup::init_subscriber(Verbosity::from_flags(options.verbose, options.quiet));

    let mut stderr = io::stderr().lock();
    writeln!(stderr, "Space cache checker {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(
        stderr,
        "retries = {}, freeze = {}",
        options.config.retries,
        u8::from(options.config.freeze)
    )?;
    writeln!(stderr, "Running on {}", bsc_ioctl::kernel_description()?)?;

    let cancel = CancelFlag::new();
    cancel.register_signals()?;
    let fs = IoctlFs::open(&options.path)?;
    info!(path = %fs.path().display(), "checking filesystem");

    let summary = Checker::new(&fs, options.config.clone(), cancel).run(&mut stderr)?;
    summary
        .write_remediation(&mut stderr)
        .context("failed to write report")?;
    drop(stderr);

    if options.json {
        write_json(&mut io::stdout().lock(), &summary)?;
    }
    Ok(summary.exit_status())
}

fn write_json(out: &mut dyn Write, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("failed to serialize summary")?;
    writeln!(out, "{json}").context("failed to write summary")?;
    out.flush().context("failed to write summary")?;
    Ok(())
}
