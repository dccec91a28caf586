use super::timer::{TimerJob, TimerThread};
use super::{PeriodicTask, Scheduler, Task, clamp_period, rejected, run_task};
use crate::cancel::Cancelable;
use crate::config::RxConfig;
use crate::error::ScheduleError;
use crate::utils::health_flag::HealthFlag;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use crossbeam::select;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const POLL_TICK: Duration = Duration::from_millis(100);

struct BlockingShared {
    name: String,
    // zero capacity: a send succeeds only if a thread is waiting for it
    handoff_tx: Sender<Task>,
    handoff_rx: Receiver<Task>,
    // used only once max_threads are busy
    overflow_tx: Sender<Task>,
    overflow_rx: Receiver<Task>,
    threads: AtomicUsize,
    spawned: AtomicU64,
    max_threads: Option<usize>,
    keep_alive: Duration,
    alive: HealthFlag,
}

/// Cached pool for blocking calls.
///
/// A task is handed to a waiting thread if there is one, otherwise a new
/// thread is spawned for it (up to `max_threads`). Threads idle for longer
/// than `keep_alive` retire.
pub struct BlockingScheduler {
    shared: Arc<BlockingShared>,
    timer: Option<TimerThread>,
}

impl BlockingScheduler {
    pub fn new(name: impl Into<String>, max_threads: Option<usize>, keep_alive: Duration) -> Self {
        let name = name.into();
        let (handoff_tx, handoff_rx) = channel::bounded(0);
        let (overflow_tx, overflow_rx) = channel::unbounded();
        let shared = Arc::new(BlockingShared {
            name: name.clone(),
            handoff_tx,
            handoff_rx,
            overflow_tx,
            overflow_rx,
            threads: AtomicUsize::new(0),
            spawned: AtomicU64::new(0),
            max_threads: max_threads.filter(|n| *n > 0),
            keep_alive,
            alive: HealthFlag::new(true),
        });

        let dispatch = Arc::downgrade(&shared);
        let timer_name = name.clone();
        let timer = TimerThread::spawn(format!("{name}-timer"), move |task| {
            match dispatch.upgrade() {
                Some(shared) => submit(&shared, task),
                None => Err(ScheduleError::rejected(&timer_name)),
            }
        });
        let timer = match timer {
            Ok(timer) => Some(timer),
            Err(e) => {
                tracing::error!("[RxScheduler] {} has no timer thread: {}", name, e);
                None
            }
        };

        Self { shared, timer }
    }

    pub fn from_config(cfg: &RxConfig) -> Self {
        Self::new(
            format!("{}-blocking", cfg.thread_name_prefix()),
            cfg.blocking_max_threads,
            cfg.blocking_keep_alive(),
        )
    }

    pub fn live_threads(&self) -> usize {
        self.shared.threads.load(Ordering::Acquire)
    }

    fn timer(&self) -> Result<&TimerThread, ScheduleError> {
        match &self.timer {
            Some(timer) if self.shared.alive.get() => Ok(timer),
            _ => Err(rejected(&self.shared.name)),
        }
    }
}

fn submit(shared: &Arc<BlockingShared>, task: Task) -> Result<(), ScheduleError> {
    if !shared.alive.get() {
        return Err(rejected(&shared.name));
    }
    let task = match shared.handoff_tx.try_send(task) {
        Ok(()) => return Ok(()),
        Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => task,
    };

    let below_max = shared
        .max_threads
        .is_none_or(|max| shared.threads.load(Ordering::Acquire) < max);
    if below_max {
        spawn_worker(shared, task);
    } else if shared.overflow_tx.send(task).is_err() {
        return Err(rejected(&shared.name));
    }
    Ok(())
}

fn spawn_worker(shared: &Arc<BlockingShared>, first: Task) {
    let n = shared.spawned.fetch_add(1, Ordering::Relaxed);
    shared.threads.fetch_add(1, Ordering::AcqRel);

    // the task comes back if the spawn fails
    let slot = Arc::new(parking_lot::Mutex::new(Some(first)));
    let worker_slot = slot.clone();
    let worker_shared = shared.clone();
    let spawned = thread::Builder::new()
        .name(format!("{}-{}", shared.name, n))
        .spawn(move || {
            let first = worker_slot.lock().take();
            blocking_loop(worker_shared, first)
        });

    if let Err(e) = spawned {
        shared.threads.fetch_sub(1, Ordering::AcqRel);
        tracing::error!("[RxScheduler] {} cannot spawn thread: {}", shared.name, e);
        if let Some(task) = slot.lock().take() {
            let _ = shared.overflow_tx.send(task);
        }
    }
}

fn blocking_loop(shared: Arc<BlockingShared>, first: Option<Task>) {
    if let Some(task) = first {
        run_task(&shared.name, task);
    }

    let tick = POLL_TICK.min(shared.keep_alive);
    let mut idle_for = Duration::ZERO;

    while shared.alive.get() {
        if let Ok(task) = shared.overflow_rx.try_recv() {
            idle_for = Duration::ZERO;
            run_task(&shared.name, task);
            continue;
        }

        let received = select! {
            recv(shared.handoff_rx) -> msg => msg.ok(),
            recv(shared.overflow_rx) -> msg => msg.ok(),
            default(tick) => None,
        };
        match received {
            Some(task) => {
                idle_for = Duration::ZERO;
                run_task(&shared.name, task);
            }
            None => {
                idle_for += tick;
                if idle_for >= shared.keep_alive {
                    break;
                }
            }
        }
    }

    shared.threads.fetch_sub(1, Ordering::AcqRel);
}

impl Scheduler for BlockingScheduler {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn parallelism(&self) -> usize {
        self.shared.max_threads.unwrap_or(usize::MAX)
    }

    fn execute(&self, task: Task) -> Result<(), ScheduleError> {
        submit(&self.shared, task)
    }

    fn schedule(&self, delay: Duration, task: Task) -> Result<Cancelable, ScheduleError> {
        self.timer()?.schedule(delay, TimerJob::Once(task))
    }

    fn schedule_at_fixed_rate(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: PeriodicTask,
    ) -> Result<Cancelable, ScheduleError> {
        let period = clamp_period(&self.shared.name, period);
        self.timer()?
            .schedule(initial_delay, TimerJob::Periodic { task, period })
    }

    fn shutdown(&self) {
        if !self.shared.alive.take_down() {
            return;
        }
        if let Some(timer) = &self.timer {
            timer.stop();
        }
        let dropped = self.shared.overflow_rx.try_iter().count();
        tracing::info!(
            "[RxScheduler] {} shut down, {} queued tasks dropped",
            self.shared.name,
            dropped
        );
    }

    fn is_shutdown(&self) -> bool {
        !self.shared.alive.get()
    }
}

impl Drop for BlockingScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BlockingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingScheduler")
            .field("name", &self.shared.name)
            .field("threads", &self.live_threads())
            .field("max_threads", &self.shared.max_threads)
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}
