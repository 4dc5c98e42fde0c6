use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{event, instrument, Level};

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| Mutex::new(0));
        *mutex.lock() += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| x + *y.lock())
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts operations that were started and finished; the difference is what's in flight.
#[derive(Debug)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

impl Default for ProgressCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self {
            started: TlsCounter::new(),
            finished: TlsCounter::new(),
        }
    }

    /// Marks one operation started; [`finish`](Self::finish) marks it done from whichever
    /// callback ends it.
    pub fn start(&self) {
        self.started.inc();
    }

    pub fn finish(&self) {
        self.finished.inc();
    }

    #[instrument]
    pub fn get(&self) -> Status {
        let mut status = Status {
            started: self.started.get(),
            finished: self.finished.get(),
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Counters accumulated by one transfer.
#[derive(Debug, Default)]
pub struct Progress {
    /// Paths picked up by the transfer.
    pub ops: ProgressCounter,
    pub bytes_transferred: TlsCounter,
    pub files_transferred: TlsCounter,
    pub directories_created: TlsCounter,
    pub directories_reused: TlsCounter,
    pub errors: TlsCounter,
    started: OnceLock<Instant>,
    stopped: OnceLock<Instant>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the clock; later calls are ignored.
    pub fn mark_started(&self) {
        let _ = self.started.set(Instant::now());
    }

    /// Freezes the clock; later calls are ignored.
    pub fn mark_stopped(&self) {
        let _ = self.stopped.set(Instant::now());
    }

    /// Time between start and stop, or since start while still running.
    pub fn get_duration(&self) -> Duration {
        match (self.started.get(), self.stopped.get()) {
            (Some(started), Some(stopped)) => stopped.saturating_duration_since(*started),
            (Some(started), None) => started.elapsed(),
            (None, _) => Duration::ZERO,
        }
    }

    /// Average bytes per second since start.
    pub fn throughput(&self) -> f64 {
        let secs = self.get_duration().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_transferred.get() as f64 / secs
    }

    pub fn summary(&self) -> Summary {
        Summary {
            bytes_transferred: self.bytes_transferred.get(),
            files_transferred: self.files_transferred.get(),
            directories_created: self.directories_created.get(),
            directories_reused: self.directories_reused.get(),
            errors: self.errors.get(),
            elapsed: self.get_duration(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub bytes_transferred: u64,
    pub files_transferred: u64,
    pub directories_created: u64,
    pub directories_reused: u64,
    pub errors: u64,
    pub elapsed: Duration,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_transferred: self.bytes_transferred + other.bytes_transferred,
            files_transferred: self.files_transferred + other.files_transferred,
            directories_created: self.directories_created + other.directories_created,
            directories_reused: self.directories_reused + other.directories_reused,
            errors: self.errors + other.errors,
            elapsed: std::cmp::max(self.elapsed, other.elapsed),
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes transferred: {}\n\
            files transferred: {}\n\
            directories created: {}\n\
            directories reused: {}\n\
            errors: {}\n\
            elapsed: {}",
            bytesize::ByteSize(self.bytes_transferred),
            self.files_transferred,
            self.directories_created,
            self.directories_reused,
            self.errors,
            humantime::format_duration(Duration::from_millis(self.elapsed.as_millis() as u64)),
        )
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_ops: u64,
    last_bytes: u64,
    last_update: Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_ops: progress.ops.get().finished,
            last_bytes: progress.bytes_transferred.get(),
            last_update: Instant::now(),
        }
    }

    /// One-line status for a progress bar.
    pub fn status_line(&self) -> String {
        let ops = self.progress.ops.get();
        format!(
            "{} transferred, {} files, {} directories, {} in flight, {} errors",
            bytesize::ByteSize(self.progress.bytes_transferred.get()),
            self.progress.files_transferred.get(),
            self.progress.directories_created.get() + self.progress.directories_reused.get(),
            ops.started - ops.finished,
            self.progress.errors.get(),
        )
    }

    pub fn print(&mut self) -> anyhow::Result<String> {
        let time_now = Instant::now();
        let ops = self.progress.ops.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64().max(f64::EPSILON);
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64().max(f64::EPSILON);
        let average_ops_rate = ops.finished as f64 / total_duration_secs;
        let current_ops_rate = (ops.finished - self.last_ops) as f64 / curr_duration_secs;
        let bytes = self.progress.bytes_transferred.get();
        let average_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = (bytes - self.last_bytes) as f64 / curr_duration_secs;
        // update self
        self.last_ops = ops.finished;
        self.last_bytes = bytes;
        self.last_update = time_now;
        Ok(format!(
            "---------------------\n\
            PATHS:\n\
            pending: {:>10}\n\
            average: {:>10.2} items/s\n\
            current: {:>10.2} items/s\n\
            -----------------------\n\
            TRANSFERRED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            \n\
            files:       {:>10}\n\
            directories: {:>10}\n\
            reused:      {:>10}\n\
            errors:      {:>10}",
            ops.started - ops.finished, // pending
            average_ops_rate,
            current_ops_rate,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
            self.progress.files_transferred.get(),
            self.progress.directories_created.get(),
            self.progress.directories_reused.get(),
            self.progress.errors.get(),
        ))
    }
}

/// How progress is shown while a transfer runs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar when stderr is a terminal, text updates otherwise
    #[default]
    #[value(name = "Auto", alias = "auto")]
    Auto,
    /// Animated progress bar
    #[value(name = "ProgressBar", alias = "progress-bar")]
    ProgressBar,
    /// Periodic text updates, appropriate for logging
    #[value(name = "TextUpdates", alias = "text-updates")]
    TextUpdates,
}

impl ProgressType {
    fn resolve(self) -> Self {
        match self {
            ProgressType::Auto if std::io::IsTerminal::is_terminal(&std::io::stderr()) => {
                ProgressType::ProgressBar
            }
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human readable delay between updates, e.g. "200ms" or "10s".
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    /// Delay between updates: the configured one or a default suited to the display.
    pub fn delay(&self) -> anyhow::Result<Duration> {
        match &self.progress_delay {
            Some(delay) => Ok(humantime::parse_duration(delay)?),
            None => match self.progress_type.resolve() {
                ProgressType::ProgressBar => Ok(Duration::from_millis(200)),
                _ => Ok(Duration::from_secs(10)),
            },
        }
    }
}

/// Background task displaying a transfer's progress until stopped.
#[derive(Debug)]
pub struct ProgressWatch {
    stop: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ProgressWatch {
    /// Spawns the display on the current tokio runtime.
    pub fn spawn(progress: Arc<Progress>, settings: &ProgressSettings) -> anyhow::Result<Self> {
        let delay = settings.delay()?;
        let progress_type = settings.progress_type.resolve();
        let (stop, mut stopped) = tokio::sync::watch::channel(false);
        let bar = match progress_type {
            ProgressType::ProgressBar => {
                let bar = indicatif::ProgressBar::new_spinner();
                bar.set_style(indicatif::ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] {msg}",
                )?);
                bar.enable_steady_tick(delay);
                Some(bar)
            }
            _ => None,
        };
        let task = tokio::spawn(async move {
            let mut printer = ProgressPrinter::new(&progress);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stopped.changed() => break,
                }
                match &bar {
                    Some(bar) => bar.set_message(printer.status_line()),
                    None => match printer.print() {
                        Ok(text) => eprintln!("{text}"),
                        Err(error) => tracing::warn!("failed rendering progress: {:#}", error),
                    },
                }
            }
            if let Some(bar) = bar {
                bar.finish_and_clear();
            }
        });
        Ok(Self { stop, task })
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(error) = self.task.await {
            tracing::warn!("progress display failed: {}", error);
        }
    }
}
