//! Command-line parsing for `btrfs-spacecheck`.

use bsc_check::{CheckConfig, DEFAULT_RETRIES, MAX_RETRIES};
use bsc_error::{CheckError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// What the invocation asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Version,
    Check(Options),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub path: PathBuf,
    pub config: CheckConfig,
    pub json: bool,
    pub verbose: bool,
    pub quiet: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/"),
            config: CheckConfig::default(),
            json: false,
            verbose: false,
            quiet: false,
        }
    }
}

pub fn parse<I>(args: I) -> Result<Command>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut options = Options::default();
    let mut path: Option<PathBuf> = None;
    let mut args = args.into_iter().map(Into::into);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "--version" => return Ok(Command::Version),
            "--freeze" => options.config.freeze = true,
            "--json" => options.json = true,
            "-v" | "--verbose" => options.verbose = true,
            "-q" | "--quiet" => options.quiet = true,
            "--retries" => {
                let value = args.next().ok_or_else(|| missing_value("--retries"))?;
                options.config.retries = parse_retries(&value)?;
            }
            "--retry-delay-ms" => {
                let value = args
                    .next()
                    .ok_or_else(|| missing_value("--retry-delay-ms"))?;
                let millis = parse_number(&value, "--retry-delay-ms")?;
                options.config.retry_delay = Duration::from_millis(millis);
            }
            other if other.starts_with("--retries=") => {
                options.config.retries = parse_retries(&other["--retries=".len()..])?;
            }
            other if other.starts_with('-') && other != "-" => {
                return Err(CheckError::Usage(format!("unrecognized option '{other}'")));
            }
            other => {
                if path.is_some() {
                    return Err(CheckError::Usage(format!(
                        "unexpected argument '{other}'; at most one PATH"
                    )));
                }
                path = Some(PathBuf::from(other));
            }
        }
    }

    if let Some(path) = path {
        options.path = path;
    }
    options.config.validate()?;
    Ok(Command::Check(options))
}

fn missing_value(flag: &str) -> CheckError {
    CheckError::Usage(format!("option '{flag}' requires an argument"))
}

fn parse_number(value: &str, flag: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| CheckError::Usage(format!("invalid value '{value}' for {flag}")))
}

fn parse_retries(value: &str) -> Result<u32> {
    let retries = parse_number(value, "--retries")?;
    u32::try_from(retries)
        .ok()
        .filter(|&n| n <= MAX_RETRIES)
        .ok_or_else(|| {
            CheckError::Usage(format!("--retries must be at most {MAX_RETRIES}, got {value}"))
        })
}

pub fn usage(program: &str) -> String {
    format!(
        "\
usage: {program} [OPTION]... [PATH]

Check the extent tree and free space tree on a mounted Btrfs filesystem.
PATH defaults to /.

Options:
  --retries N         how many times to retry checking a block group
                      (default: {DEFAULT_RETRIES}, max: {MAX_RETRIES}). The check runs while the
                      filesystem is online, so it may race with concurrent
                      modifications; retrying reduces the chance of mistaking
                      an in-progress update for corruption.
  --freeze            freeze the filesystem on the final retry of a block
                      group. Writes block for up to a few milliseconds at a
                      time, and only when corruption is suspected. If the
                      program is killed while frozen, run
                      fsfreeze --unfreeze PATH.
  --retry-delay-ms N  pause before each retry (default: 1000)
  --json              print a JSON summary on stdout
  -v, --verbose       debug logging on stderr
  -q, --quiet         errors only in the log
  -h, --help          display this help and exit
  --version           print the version and exit

Exit status:
  0  success; no corruption detected
  1  internal error
  2  usage error
  3  corruption detected
"
    )
}
