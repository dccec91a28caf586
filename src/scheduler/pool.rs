use super::timer::{TimerJob, TimerThread};
use super::{PeriodicTask, Scheduler, Task, clamp_period, rejected, run_task};
use crate::cancel::Cancelable;
use crate::config::RxConfig;
use crate::error::ScheduleError;
use crate::utils::core_pinner::{CoreCursor, try_pin_core};
use crate::utils::health_flag::HealthFlag;
use anyhow::Context;
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::hint::spin_loop;
use std::iter;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 256;
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

static POOL_IDS: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    // (pool id, local deque) of the pool worker running on this thread
    static LOCAL: RefCell<Option<(usize, Worker<Task>)>> = const { RefCell::new(None) };
}

struct PoolShared {
    id: usize,
    name: String,
    injector: Injector<Task>,
    stealers: Vec<Stealer<Task>>,
    alive: HealthFlag,
    sleepers: AtomicUsize,
    sleep_lock: Mutex<()>,
    wake: Condvar,
}

impl PoolShared {
    fn has_work(&self) -> bool {
        !self.injector.is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }

    fn notify_one(&self) {
        if self.sleepers.load(Ordering::Acquire) > 0 {
            let _guard = self.sleep_lock.lock();
            self.wake.notify_one();
        }
    }

    fn push(&self, task: Task) -> Result<(), ScheduleError> {
        if !self.alive.get() {
            return Err(rejected(&self.name));
        }

        // workers of this pool push to their own deque, everyone else injects
        let mut task = Some(task);
        LOCAL.with(|local| {
            if let Some((pool, worker)) = local.borrow().as_ref()
                && *pool == self.id
                && let Some(task) = task.take()
            {
                worker.push(task);
            }
        });
        if let Some(task) = task {
            self.injector.push(task);
        }

        self.notify_one();
        Ok(())
    }
}

/// Fixed-size work-stealing pool.
///
/// Each worker owns a FIFO deque; tasks submitted from a worker stay on
/// that worker, tasks from other threads go through a global injector, and
/// idle workers steal from each other. Idle workers spin, then yield, then
/// park on a condvar. Timed work is kept by a separate timer thread that
/// feeds due tasks back into the pool.
pub struct WorkStealingScheduler {
    shared: Arc<PoolShared>,
    timer: TimerThread,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
}

impl WorkStealingScheduler {
    pub fn new(name: impl Into<String>, threads: usize) -> anyhow::Result<Self> {
        Self::build(name.into(), threads, None)
    }

    pub fn from_config(cfg: &RxConfig) -> anyhow::Result<Self> {
        let cores = if cfg.pin_workers {
            match CoreCursor::from_system() {
                Ok(cursor) => Some(Arc::new(cursor)),
                Err(e) => {
                    tracing::error!("[RxScheduler] cannot pin workers: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self::build(cfg.thread_name_prefix().to_string(), cfg.worker_threads(), cores)
    }

    fn build(name: String, threads: usize, cores: Option<Arc<CoreCursor>>) -> anyhow::Result<Self> {
        let threads = threads.max(1);
        let locals: Vec<Worker<Task>> = (0..threads).map(|_| Worker::new_fifo()).collect();
        let shared = Arc::new(PoolShared {
            id: POOL_IDS.fetch_add(1, Ordering::Relaxed),
            name: name.clone(),
            injector: Injector::new(),
            stealers: locals.iter().map(Worker::stealer).collect(),
            alive: HealthFlag::new(true),
            sleepers: AtomicUsize::new(0),
            sleep_lock: Mutex::new(()),
            wake: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for (idx, local) in locals.into_iter().enumerate() {
            let shared = shared.clone();
            let cores = cores.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{idx}"))
                .spawn(move || worker_loop(shared, local, cores))
                .with_context(|| format!("failed to spawn worker {idx} of {name}"))?;
            workers.push(handle);
        }
        let worker_ids = workers.iter().map(|h| h.thread().id()).collect();

        let dispatch = Arc::downgrade(&shared);
        let timer_name = name.clone();
        let timer = TimerThread::spawn(format!("{name}-timer"), move |task| {
            match dispatch.upgrade() {
                Some(shared) => shared.push(task),
                None => Err(ScheduleError::rejected(&timer_name)),
            }
        })
        .with_context(|| format!("failed to spawn timer of {name}"))?;

        tracing::info!("[RxScheduler] {} started with {} workers", name, threads);

        Ok(Self {
            shared,
            timer,
            workers: Mutex::new(workers),
            worker_ids,
        })
    }

    fn on_worker_thread(&self) -> bool {
        let me = thread::current().id();
        self.worker_ids.contains(&me)
    }
}

impl Scheduler for WorkStealingScheduler {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn parallelism(&self) -> usize {
        self.worker_ids.len()
    }

    fn execute(&self, task: Task) -> Result<(), ScheduleError> {
        self.shared.push(task)
    }

    fn schedule(&self, delay: Duration, task: Task) -> Result<Cancelable, ScheduleError> {
        if !self.shared.alive.get() {
            return Err(rejected(&self.shared.name));
        }
        self.timer.schedule(delay, TimerJob::Once(task))
    }

    fn schedule_at_fixed_rate(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: PeriodicTask,
    ) -> Result<Cancelable, ScheduleError> {
        if !self.shared.alive.get() {
            return Err(rejected(&self.shared.name));
        }
        let period = clamp_period(&self.shared.name, period);
        self.timer.schedule(initial_delay, TimerJob::Periodic { task, period })
    }

    fn shutdown(&self) {
        if !self.shared.alive.take_down() {
            return;
        }
        tracing::info!("[RxScheduler] {} shutting down", self.shared.name);

        self.timer.stop();
        {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.wake.notify_all();
        }

        // a worker cannot join itself; the others exit on their own
        if self.on_worker_thread() {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }

        let mut dropped = 0usize;
        while let Steal::Success(_) = self.shared.injector.steal() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!("[RxScheduler] {} dropped {} queued tasks", self.shared.name, dropped);
        }
    }

    fn is_shutdown(&self) -> bool {
        !self.shared.alive.get()
    }
}

impl Drop for WorkStealingScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkStealingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkStealingScheduler")
            .field("name", &self.shared.name)
            .field("workers", &self.worker_ids.len())
            .field("timers", &self.timer.pending())
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}

fn find_task(local: &Worker<Task>, shared: &PoolShared) -> Option<Task> {
    local.pop().or_else(|| {
        iter::repeat_with(|| {
            shared
                .injector
                .steal_batch_and_pop(local)
                .or_else(|| shared.stealers.iter().map(|s| s.steal()).collect())
        })
        .find(|s| !s.is_retry())
        .and_then(|s| s.success())
    })
}

fn worker_loop(shared: Arc<PoolShared>, local: Worker<Task>, cores: Option<Arc<CoreCursor>>) {
    if let Some(cores) = cores {
        let core_id = cores.next_core();
        match try_pin_core(core_id) {
            Ok(core_id) => tracing::info!("[RxScheduler] worker pinned to core: {}", core_id),
            Err(e) => tracing::error!("[RxScheduler] cannot pin core: {}", e),
        }
    }

    LOCAL.with(|slot| *slot.borrow_mut() = Some((shared.id, local)));

    let mut idle = 0u32;
    while shared.alive.get() {
        let task = LOCAL.with(|slot| {
            slot.borrow()
                .as_ref()
                .and_then(|(_, local)| find_task(local, &shared))
        });

        match task {
            Some(task) => {
                idle = 0;
                run_task(&shared.name, task);
            }
            None => {
                idle = idle.saturating_add(1);
                if idle < SPIN_LIMIT {
                    spin_loop();
                } else if idle < YIELD_LIMIT {
                    thread::yield_now();
                } else {
                    let mut guard = shared.sleep_lock.lock();
                    shared.sleepers.fetch_add(1, Ordering::AcqRel);
                    if shared.alive.get() && !shared.has_work() {
                        shared.wake.wait_for(&mut guard, PARK_TIMEOUT);
                    }
                    shared.sleepers.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }

    // drop whatever is still queued locally before the thread goes away
    LOCAL.with(|slot| slot.borrow_mut().take());
}
