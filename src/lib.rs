//! Reactive value streams.
//!
//! A stream is described once as an [`Rx`](rx::Rx) graph and instantiated
//! on every subscription. Asynchronous nodes run on a pluggable
//! [`Scheduler`](scheduler::Scheduler).

pub mod cancel;
pub mod config;
pub mod error;
pub mod event;
pub mod prelude;
pub mod rx;
pub mod scheduler;
mod test;
pub mod utils;

use config::RxConfig;
use tracing_appender::non_blocking::WorkerGuard;

/// Initializes logging (when `cfg.logger` is set) and installs the
/// process-wide schedulers. Keep the returned guard alive while file
/// logging should flush.
pub fn bootstrap(cfg: &RxConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let guard = match &cfg.logger {
        Some(logger) => logger.init()?,
        None => None,
    };
    if scheduler::install(cfg)? {
        tracing::info!(
            "[Rx] schedulers installed: {} workers, prefix {}",
            cfg.worker_threads(),
            cfg.thread_name_prefix()
        );
    }
    Ok(guard)
}
