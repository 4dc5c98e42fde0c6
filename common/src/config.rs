//! Configuration types for runtime and execution settings

use crate::transfer::TransferOptions;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of open files (None or 0 = no limit)
    pub max_open_files: Option<usize>,
    /// Operations per second throttle (0 = no throttle)
    pub ops_throttle: usize,
    /// I/O operations per second throttle (0 = no throttle)
    pub iops_throttle: usize,
    /// Chunk size for I/O operations (bytes)
    pub chunk_size: u64,
}

impl ThrottleConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.iops_throttle > 0 && self.chunk_size == 0 {
            return Err("chunk_size must be specified when using iops_throttle".to_string());
        }
        Ok(())
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    /// Filter directive for the log level selected by `quiet` and `verbose`.
    pub fn level(&self) -> &'static str {
        if self.quiet {
            return "off";
        }
        match self.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Settings of a single tree transfer
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Maximum number of files moved at the same time
    pub concurrency: usize,
    pub fail_early: bool,
    pub overwrite: bool,
    /// Largest slice read from a local file at once (bytes)
    pub read_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            fail_early: false,
            overwrite: false,
            read_size: crate::local::Settings::default().read_size,
        }
    }
}

impl TransferConfig {
    pub fn options(&self) -> TransferOptions {
        TransferOptions::default()
            .with_concurrency(self.concurrency)
            .with_fail_early(self.fail_early)
            .with_overwrite(self.overwrite)
    }

    /// Local endpoint settings; `throttle` supplies the unit for slice tokens.
    pub fn local_settings(&self, throttle: &ThrottleConfig) -> crate::local::Settings {
        crate::local::Settings {
            read_size: std::cmp::max(1, self.read_size),
            chunk_size: throttle.chunk_size,
        }
    }
}
