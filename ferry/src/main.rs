use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::progress::{ProgressSettings, ProgressType, ProgressWatch, Summary};
use common::resource::{Resource, Session};
use common::transfer::finished;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ferry",
    version,
    about = "Move files and directory trees between storage endpoints",
    long_about = "`ferry` transfers a file or a directory tree through the ferry engine: every file is \
streamed from the source endpoint to the destination endpoint with a bounded number of transfers \
in flight.

EXAMPLES:
    # Copy a directory tree with progress and a summary
    ferry /data/in /data/out --progress --summary

    # Copy every matching file into an existing directory
    ferry '/data/logs/*.log' /backup/logs/ --overwrite"
)]
struct Args {
    // Transfer options
    /// Maximum number of files transferred at the same time
    #[arg(
        short = 'j',
        long,
        default_value = "16",
        value_name = "N",
        help_heading = "Transfer options"
    )]
    concurrency: usize,

    /// Exit on first error
    #[arg(short = 'e', long = "fail-early", help_heading = "Transfer options")]
    fail_early: bool,

    /// Reuse existing directories and replace existing files at the destination
    #[arg(short = 'o', long, help_heading = "Transfer options")]
    overwrite: bool,

    /// Largest slice read from a file at once, e.g. "64KiB" or "1MiB"
    #[arg(
        long,
        default_value = "128KiB",
        value_name = "SIZE",
        help_heading = "Transfer options"
    )]
    read_size: bytesize::ByteSize,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Print the summary as JSON (implies "summary")
    #[arg(long, help_heading = "Progress & output")]
    json: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of open files, 0 or unspecified means no limit
    #[arg(long, value_name = "N", help_heading = "Performance & throttling")]
    max_open_files: Option<usize>,

    /// Throttle the number of operations per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    /// Throttle the number of I/O operations per second, 0 means no throttle
    ///
    /// I/O is calculated based on provided chunk size -- number of I/O operations for a slice is
    /// calculated as: ((slice size - 1) / chunk size) + 1
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    /// Chunk size used to calculate number of I/O per slice
    ///
    /// Modifying this setting to a value > 0 is REQUIRED when using --iops-throttle.
    #[arg(
        long,
        default_value = "0",
        value_name = "SIZE",
        help_heading = "Performance & throttling"
    )]
    chunk_size: u64,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source path; a wildcard in the last component selects matching entries
    #[arg()]
    src: String,

    /// Destination path; a trailing slash places the source inside it
    #[arg()]
    dst: String,
}

impl Args {
    fn progress_settings(&self) -> Option<ProgressSettings> {
        if !self.progress && self.progress_type.is_none() && self.progress_delay.is_none() {
            return None;
        }
        Some(ProgressSettings {
            progress_type: self.progress_type.unwrap_or_default(),
            progress_delay: self.progress_delay.clone(),
        })
    }

    fn throttle(&self) -> common::ThrottleConfig {
        common::ThrottleConfig {
            max_open_files: self.max_open_files,
            ops_throttle: self.ops_throttle,
            iops_throttle: self.iops_throttle,
            chunk_size: self.chunk_size,
        }
    }

    fn transfer(&self) -> common::TransferConfig {
        common::TransferConfig {
            concurrency: self.concurrency,
            fail_early: self.fail_early,
            overwrite: self.overwrite,
            read_size: usize::try_from(self.read_size.as_u64()).unwrap_or(usize::MAX),
        }
    }
}

struct Report {
    summary: Summary,
    json: bool,
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.json {
            let json = serde_json::to_string_pretty(&self.summary).map_err(|_| std::fmt::Error)?;
            return write!(f, "{json}");
        }
        write!(f, "{}", self.summary)
    }
}

/// Resolves the destination the way `cp` does: a trailing slash means "inside".
fn destination_path(src: &std::path::Path, dst: &str) -> Result<std::path::PathBuf> {
    let absolute = std::path::absolute(dst)
        .with_context(|| format!("invalid destination path {dst:?}"))?;
    if !dst.ends_with('/') || src.file_name().is_none() {
        return Ok(absolute);
    }
    let is_pattern = src
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains(['*', '?', '[']));
    match src.file_name() {
        Some(name) if !is_pattern => Ok(absolute.join(name)),
        _ => Ok(absolute),
    }
}

#[instrument]
async fn async_main(args: Args) -> Result<Report> {
    let config = args.transfer();
    let session = common::local::LocalSession::current(config.local_settings(&args.throttle()))?;
    let src = std::path::absolute(&args.src)
        .with_context(|| format!("invalid source path {:?}", args.src))?;
    let dst = destination_path(&src, &args.dst)?;
    let source = session.select(&src);
    let transfer = source.transfer_to(&session.select(&dst), config.options());
    let watch = match args.progress_settings() {
        Some(settings) => Some(ProgressWatch::spawn(
            transfer.control().progress().clone(),
            &settings,
        )?),
        None => None,
    };
    transfer.start();
    let outcome = tokio::select! {
        outcome = finished(transfer.as_ref()) => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, cancelling the transfer");
            transfer.cancel();
            finished(transfer.as_ref()).await
        }
    };
    if let Some(watch) = watch {
        watch.stop().await;
    }
    match outcome {
        Ok(summary) => Ok(Report {
            summary,
            json: args.json,
        }),
        Err(error) => {
            if args.summary || args.json {
                return Err(anyhow!("{}\n\n{}", error, error.summary));
            }
            Err(anyhow!("{}", error))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary || args.json,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, args.throttle(), func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
