//! Asynchronous transfer engine behind the `ferry` tool.
//!
//! The building blocks, leaves first:
//!
//! - [`dispatch`]: the injected scheduler every callback runs on,
//! - [`bell`]: single-assignment asynchronous results with chaining, cancellation and deadlines,
//! - [`emitter`]: bell-based asynchronous sequences,
//! - [`pipe`]: backpressured tap → pipe → sink streaming,
//! - [`resource`]: endpoints addressed by session and path,
//! - [`transfer`] and [`proxy`]: controllable transfers and the generic tree transfer.
//!
//! Two endpoints ship with the engine: [`local`] for the local file system and [`memory`] for
//! an in-process tree with fault injection.
//!
//! # Example
//!
//! ```rust,no_run
//! use common::resource::{Resource, Session};
//! use common::transfer::{Transfer, TransferOptions};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let session = common::local::LocalSession::current(Default::default())?;
//! let transfer = session.select("/data/in".as_ref()).transfer_to(
//!     &session.select("/data/out".as_ref()),
//!     TransferOptions::default().with_concurrency(16),
//! );
//! transfer.start();
//! let summary = common::transfer::finished(transfer.as_ref()).await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

pub mod bell;
pub mod config;
pub mod dispatch;
pub mod emitter;
pub mod error;
pub mod local;
pub mod memory;
pub mod pipe;
pub mod progress;
pub mod proxy;
pub mod resource;
pub mod slice;
pub mod stat;
pub mod transfer;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig, TransferConfig};
pub use error::{Error, Result};
pub use progress::{ProgressSettings, ProgressType};

fn init_tracing(output: &OutputConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.level()));
    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("failed to install the tracing subscriber: {error}");
    }
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    Ok(builder.build()?)
}

/// Applies the limits of `throttle` and starts the token replenishing tasks.
///
/// Must be called from within a tokio runtime.
pub fn setup_throttle(throttle: &ThrottleConfig) {
    if let Some(max_open_files) = throttle.max_open_files.filter(|&limit| limit > 0) {
        tracing::info!("limiting open files to {}", max_open_files);
        throttle::set_max_open_files(max_open_files);
    }
    let interval = std::time::Duration::from_secs(1);
    if throttle.ops_throttle > 0 {
        throttle::init_ops_tokens(throttle.ops_throttle);
        tokio::spawn(throttle::run_ops_replenish_thread(
            throttle.ops_throttle,
            interval,
        ));
    }
    if throttle.iops_throttle > 0 {
        throttle::init_iops_tokens(throttle.iops_throttle);
        tokio::spawn(throttle::run_iops_replenish_thread(
            throttle.iops_throttle,
            interval,
        ));
    }
}

/// Runs `func` on a runtime built from `runtime` with logging and throttling set up.
///
/// Errors are printed to stderr unless `output.quiet` is set; the summary is printed to stdout
/// when requested. Returns `None` when setup or `func` failed.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle: ThrottleConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    init_tracing(&output);
    if let Err(error) = throttle.validate() {
        if !output.quiet {
            eprintln!("{error}");
        }
        return None;
    }
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start the runtime: {error:#}");
            }
            return None;
        }
    };
    let res = runtime.block_on(async {
        setup_throttle(&throttle);
        func().await
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
