//! Pluggable execution policies.
//!
//! Every asynchronous hop of a stream (timers, intervals, future bridges,
//! throttle windows, blocking calls) goes through a [`Scheduler`]. Which
//! policy backs the process-wide default depends on the target:
//!
//! - thread-capable targets: [`WorkStealingScheduler`] sized to the
//!   available parallelism, with a [`BlockingScheduler`] for blocking calls;
//! - `wasm32`: [`SingleThreadScheduler`], a microtask queue driven by the
//!   host loop (parallelism 1).

mod blocking;
mod pool;
mod single;
mod timer;

pub use blocking::BlockingScheduler;
pub use pool::WorkStealingScheduler;
pub use single::SingleThreadScheduler;

use crate::cancel::Cancelable;
use crate::config::RxConfig;
use crate::error::{ErrorKind, RxError, ScheduleError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

pub type Task = Box<dyn FnOnce() + Send + 'static>;
pub type PeriodicTask = Arc<dyn Fn() + Send + Sync + 'static>;

pub trait Scheduler: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Number of tasks that may run at the same time.
    fn parallelism(&self) -> usize;

    /// Runs `task` as soon as possible.
    fn execute(&self, task: Task) -> Result<(), ScheduleError>;

    /// Runs `task` once after `delay`. Cancelling the handle before the
    /// deadline drops the task without running it.
    fn schedule(&self, delay: Duration, task: Task) -> Result<Cancelable, ScheduleError>;

    /// Runs `task` every `period`, starting after `initial_delay`.
    /// Deadlines are computed from the previous deadline, not from the end
    /// of the previous run.
    fn schedule_at_fixed_rate(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: PeriodicTask,
    ) -> Result<Cancelable, ScheduleError>;

    /// Stops accepting work and drops everything still pending.
    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;

    /// True when tasks only run while someone calls [`run_pending`](Self::run_pending).
    fn is_driven(&self) -> bool {
        false
    }

    /// Runs every task that is ready now; returns how many ran.
    fn run_pending(&self) -> usize {
        0
    }

    /// Earliest timed deadline, for driven schedulers.
    fn next_wake(&self) -> Option<Instant> {
        None
    }
}

impl std::fmt::Debug for dyn Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name())
            .field("parallelism", &self.parallelism())
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}

static DEFAULT: OnceLock<Arc<dyn Scheduler>> = OnceLock::new();
static BLOCKING: OnceLock<Arc<dyn Scheduler>> = OnceLock::new();

/// Installs the process-wide schedulers built from `cfg`.
/// Returns false if they were already installed (by an earlier call or by
/// first use), in which case `cfg` is ignored.
pub fn install(cfg: &RxConfig) -> anyhow::Result<bool> {
    let mut installed = false;
    if DEFAULT.get().is_none() {
        let sched = build_default(cfg)?;
        installed = DEFAULT.set(sched).is_ok();
    }
    if BLOCKING.get().is_none() {
        let sched = build_blocking(cfg);
        installed = BLOCKING.set(sched).is_ok() || installed;
    }
    if !installed {
        tracing::warn!("[RxScheduler] schedulers already installed, config ignored");
    }
    Ok(installed)
}

/// The process-wide default scheduler; built from [`RxConfig::from_env`] on
/// first use unless [`install`] ran before.
pub fn default_scheduler() -> Arc<dyn Scheduler> {
    DEFAULT
        .get_or_init(|| {
            let cfg = RxConfig::from_env();
            build_default(&cfg).unwrap_or_else(|err| {
                tracing::error!(
                    "[RxScheduler] cannot build default pool, falling back to single thread: {err:#}"
                );
                Arc::new(SingleThreadScheduler::new("rx-default"))
            })
        })
        .clone()
}

/// The process-wide scheduler for blocking calls.
pub fn blocking_scheduler() -> Arc<dyn Scheduler> {
    BLOCKING
        .get_or_init(|| build_blocking(&RxConfig::from_env()))
        .clone()
}

#[cfg(not(target_arch = "wasm32"))]
fn build_default(cfg: &RxConfig) -> anyhow::Result<Arc<dyn Scheduler>> {
    if cfg.single_threaded {
        return Ok(Arc::new(SingleThreadScheduler::new("rx-default")));
    }
    Ok(Arc::new(WorkStealingScheduler::from_config(cfg)?))
}

#[cfg(target_arch = "wasm32")]
fn build_default(_cfg: &RxConfig) -> anyhow::Result<Arc<dyn Scheduler>> {
    Ok(Arc::new(SingleThreadScheduler::new("rx-default")))
}

#[cfg(not(target_arch = "wasm32"))]
fn build_blocking(cfg: &RxConfig) -> Arc<dyn Scheduler> {
    if cfg.single_threaded {
        return default_for_single(cfg);
    }
    Arc::new(BlockingScheduler::from_config(cfg))
}

#[cfg(target_arch = "wasm32")]
fn build_blocking(cfg: &RxConfig) -> Arc<dyn Scheduler> {
    default_for_single(cfg)
}

// without threads there is nothing better than the loop itself
fn default_for_single(_cfg: &RxConfig) -> Arc<dyn Scheduler> {
    match DEFAULT.get() {
        Some(sched) if sched.is_driven() => sched.clone(),
        _ => Arc::new(SingleThreadScheduler::new("rx-blocking")),
    }
}

/// Runs a task, keeping the calling worker alive if it panics.
pub(crate) fn run_task(scheduler: &str, task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let err = RxError::from_panic(ErrorKind::Operator, payload);
        tracing::error!("[RxScheduler] {} task panicked: {}", scheduler, err);
    }
}

/// Shortest period accepted by `schedule_at_fixed_rate`; shorter ones are
/// raised to it.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

pub(crate) fn clamp_period(scheduler: &str, period: Duration) -> Duration {
    if period >= MIN_PERIOD {
        return period;
    }
    tracing::debug!(
        "[RxScheduler] {} raised period {:?} to {:?}",
        scheduler,
        period,
        MIN_PERIOD
    );
    MIN_PERIOD
}

pub(crate) fn rejected(scheduler: &str) -> ScheduleError {
    crate::warn_throttled!(
        Duration::from_secs(5),
        "[RxScheduler] {} rejected a task after shutdown",
        scheduler
    );
    ScheduleError::rejected(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn short_periods_are_raised() {
        assert_eq!(clamp_period("test", Duration::ZERO), MIN_PERIOD);
        assert_eq!(clamp_period("test", Duration::from_millis(7)), Duration::from_millis(7));
    }

    #[test]
    fn run_task_swallows_panics() {
        run_task("test", Box::new(|| panic!("boom")));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        run_task(
            "test",
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_scheduler_is_shared() {
        let a = default_scheduler();
        let b = default_scheduler();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.parallelism() >= 1);
    }
}
