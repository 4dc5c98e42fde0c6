//! Process-wide throttling for ferry endpoints
//!
//! Endpoints that touch real storage (the local-disk endpoint in particular) call into this
//! crate before doing I/O so that a large tree transfer does not exhaust file descriptors or
//! saturate a disk. Every limit starts out disabled and only takes effect once configured.
//!
//! # Limits
//!
//! 1. **Open files** - a permit is held for as long as a tap keeps its source file open
//! 2. **Operations** - one token per metadata operation (`stat`, `list`, `mkdir`, `delete`)
//! 3. **Slice I/O** - tokens per slice moved, proportional to the slice length
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! # async fn example() {
//! throttle::set_max_open_files(1024);
//! throttle::init_ops_tokens(50);
//! tokio::spawn(throttle::run_ops_replenish_thread(50, Duration::from_millis(100)));
//!
//! let _guard = throttle::open_file_permit().await;
//! throttle::get_ops_token().await;
//! throttle::get_slice_tokens(64 * 1024, 1024 * 1024).await;
//! # }
//! ```
//!
//! Slice tokens are computed as `⌈slice_len / chunk_size⌉`, so a throttle of N tokens per
//! interval with a chunk size of C bounds the transfer rate at roughly `N * C` bytes per
//! interval.

mod semaphore;

static OPEN_FILES_LIMIT: std::sync::LazyLock<semaphore::Semaphore> =
    std::sync::LazyLock::new(semaphore::Semaphore::new);
static OPS_THROTTLE: std::sync::LazyLock<semaphore::Semaphore> =
    std::sync::LazyLock::new(semaphore::Semaphore::new);
static IOPS_THROTTLE: std::sync::LazyLock<semaphore::Semaphore> =
    std::sync::LazyLock::new(semaphore::Semaphore::new);

pub fn set_max_open_files(max_open_files: usize) {
    OPEN_FILES_LIMIT.setup(max_open_files);
}

/// Held by an endpoint for as long as it keeps a file open.
pub struct OpenFileGuard {
    permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

impl std::fmt::Debug for OpenFileGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFileGuard")
            .field("limited", &self.permit.is_some())
            .finish()
    }
}

pub async fn open_file_permit() -> OpenFileGuard {
    OpenFileGuard {
        permit: OPEN_FILES_LIMIT.acquire().await,
    }
}

pub fn init_ops_tokens(ops_tokens: usize) {
    OPS_THROTTLE.setup(ops_tokens);
}

pub fn init_iops_tokens(iops_tokens: usize) {
    IOPS_THROTTLE.setup(iops_tokens);
}

pub async fn get_ops_token() {
    OPS_THROTTLE.consume().await;
}

/// Number of I/O tokens needed to move `len` bytes in units of `chunk_size`.
///
/// Returns `None` when throttling is off (`chunk_size == 0`) or the count does not fit the
/// semaphore's token type.
pub fn slice_tokens(chunk_size: u64, len: u64) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    let tokens = 1 + (std::cmp::max(1, len) - 1) / chunk_size;
    u32::try_from(tokens).ok()
}

pub async fn get_slice_tokens(chunk_size: u64, len: u64) {
    if !IOPS_THROTTLE.is_enabled() {
        return;
    }
    match slice_tokens(chunk_size, len) {
        Some(tokens) => IOPS_THROTTLE.consume_many(tokens).await,
        None if chunk_size > 0 => {
            tracing::error!(
                "chunk size: {} is too small to limit throughput for slices this big, size: {}",
                chunk_size,
                len,
            );
        }
        None => {}
    }
}

pub async fn run_ops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    OPS_THROTTLE.run_replenish_thread(replenish, interval).await;
}

pub async fn run_iops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    IOPS_THROTTLE
        .run_replenish_thread(replenish, interval)
        .await;
}
