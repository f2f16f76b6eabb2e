//! Common library for the blob copy tools.
//!
//! - [`tree`] and [`namespace`]: the backend-agnostic container/blob model and the mapping from
//!   native keys into it
//! - [`handler`]: the [`handler::Handler`] trait and one implementation per backend family
//! - [`copy`]: the copy engine driving a source and a destination handler
//!
//! Binaries call [`run`] which sets up logging, the tokio runtime, throttling and progress
//! reporting around an async entry point.
//!
//! # Logging
//!
//! Logs go to stderr through `tracing`. `-v`, `-vv` and `-vvv` select INFO, DEBUG and TRACE;
//! without them the `RUST_LOG` environment variable is honored, defaulting to ERROR.

use std::io::IsTerminal;
use std::sync::{Arc, LazyLock};

pub mod cache;
pub mod config;
pub mod copy;
pub mod error;
pub mod handler;
pub mod namespace;
pub mod progress;
pub mod tree;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig};

/// Upper bound on cache file permits when the open files limit is unlimited.
const MAX_CACHE_FILES: usize = 1 << 20;
const REFILL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

static PROGRESS: LazyLock<Arc<progress::Progress>> =
    LazyLock::new(|| Arc::new(progress::Progress::new()));

/// Process-wide progress counters, the ones [`run`] reports on.
#[must_use]
pub fn get_progress() -> Arc<progress::Progress> {
    PROGRESS.clone()
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar if stderr is a terminal, text updates otherwise
    #[default]
    Auto,
    ProgressBar,
    TextUpdates,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human readable duration between updates, e.g. "200ms" or "10s".
    pub progress_delay: Option<String>,
}

struct ProgressTracker {
    done: Arc<(std::sync::Mutex<bool>, std::sync::Condvar)>,
    printer: Option<std::thread::JoinHandle<()>>,
}

impl ProgressTracker {
    fn start(settings: ProgressSettings) -> anyhow::Result<Self> {
        let bar = match settings.progress_type {
            ProgressType::Auto => std::io::stderr().is_terminal(),
            ProgressType::ProgressBar => true,
            ProgressType::TextUpdates => false,
        };
        let delay = match settings.progress_delay {
            Some(delay) => humantime::parse_duration(&delay)?,
            None if bar => std::time::Duration::from_millis(200),
            None => std::time::Duration::from_secs(10),
        };
        let done = Arc::new((std::sync::Mutex::new(false), std::sync::Condvar::new()));
        let printer = {
            let done = done.clone();
            std::thread::spawn(move || {
                let counters = get_progress();
                let mut printer = progress::ProgressPrinter::new(&counters);
                let spinner = bar.then(indicatif::ProgressBar::new_spinner);
                let (lock, cvar) = &*done;
                let mut finished = lock
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                while !*finished {
                    let report = printer.print();
                    match &spinner {
                        Some(spinner) => {
                            spinner.set_message(report);
                            spinner.tick();
                        }
                        None => eprintln!("{report}"),
                    }
                    finished = cvar
                        .wait_timeout(finished, delay)
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .0;
                }
                if let Some(spinner) = spinner {
                    spinner.finish_and_clear();
                }
            })
        };
        Ok(Self {
            done,
            printer: Some(printer),
        })
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.done;
        *lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = true;
        cvar.notify_one();
        let joined = self.printer.take().map(std::thread::JoinHandle::join);
        if joined.is_some_and(|joined| joined.is_err()) {
            tracing::error!("progress printer thread panicked");
        }
    }
}

fn init_logging(output: &OutputConfig) {
    let filter = match output.verbose {
        0 if output.quiet => tracing_subscriber::EnvFilter::new("off"),
        0 => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        1 => tracing_subscriber::EnvFilter::new("info"),
        2 => tracing_subscriber::EnvFilter::new("debug"),
        _ => tracing_subscriber::EnvFilter::new("trace"),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber was already installed");
    }
}

fn default_cache_files() -> usize {
    match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) => usize::try_from(soft)
            .unwrap_or(MAX_CACHE_FILES)
            .min(MAX_CACHE_FILES)
            / 10
            * 8,
        Err(error) => {
            tracing::warn!("cannot read the open files limit: {}, not limiting", &error);
            0
        }
    }
}

fn setup_throttle(config: &ThrottleConfig) -> anyhow::Result<()> {
    config.validate().map_err(|error| anyhow::anyhow!(error))?;
    let max_cache_files = config.max_cache_files.unwrap_or_else(default_cache_files);
    tracing::debug!("cache files limit: {}", max_cache_files);
    throttle::set_max_cache_files(max_cache_files);
    if config.request_throttle > 0 {
        let per_interval = (config.request_throttle / 10).max(1);
        throttle::init_request_tokens(per_interval);
        tokio::spawn(throttle::run_request_refill(per_interval, REFILL_INTERVAL));
    }
    if config.chunk_throttle > 0 {
        let per_interval = (config.chunk_throttle / 10).max(1);
        throttle::init_chunk_tokens(per_interval);
        tokio::spawn(throttle::run_chunk_refill(per_interval, REFILL_INTERVAL));
    }
    Ok(())
}

/// Runs `func` on a freshly built runtime and reports the outcome.
///
/// Returns `None` if anything failed; errors have been logged (and printed unless `quiet`).
pub fn run<Fut, Summary, Error>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle: ThrottleConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    init_logging(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            tracing::error!("failed to build the tokio runtime: {}", &error);
            if !output.quiet {
                eprintln!("{error:#}");
            }
            return None;
        }
    };
    let result = tokio_runtime.block_on(async {
        setup_throttle(&throttle)?;
        let _tracker = match progress {
            Some(settings) => Some(ProgressTracker::start(settings)?),
            None => None,
        };
        func().await.map_err(|error| anyhow::anyhow!("{error:#}"))
    });
    match result {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_files_default_is_bounded() {
        let limit = default_cache_files();
        assert!(limit <= MAX_CACHE_FILES);
    }

    #[test]
    fn bad_progress_delay_is_rejected() {
        let settings = ProgressSettings {
            progress_type: ProgressType::TextUpdates,
            progress_delay: Some("soon".to_string()),
        };
        assert!(ProgressTracker::start(settings).is_err());
    }

    #[test]
    fn shared_progress_is_a_singleton() {
        assert!(Arc::ptr_eq(&get_progress(), &get_progress()));
    }
}
