use super::timer::{TimerJob, TimerQueue, guarded_job};
use super::{PeriodicTask, Scheduler, Task, clamp_period, rejected, run_task};
use crate::cancel::{CancelToken, Cancelable};
use crate::error::ScheduleError;
use crate::utils::health_flag::HealthFlag;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct SingleState {
    microtasks: VecDeque<Task>,
    timers: TimerQueue,
}

/// Cooperative scheduler with no threads of its own.
///
/// Tasks queue up as microtasks and timers until the host calls
/// [`run_pending`](Scheduler::run_pending) (or one of the `run_*`
/// helpers). This is the default on `wasm32`, where the host event loop
/// drives it.
pub struct SingleThreadScheduler {
    name: String,
    state: Arc<Mutex<SingleState>>,
    root: CancelToken,
    alive: HealthFlag,
}

impl SingleThreadScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(SingleState::default())),
            root: CancelToken::new_root(),
            alive: HealthFlag::new(true),
        }
    }

    /// Runs batches until one comes back empty.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.run_pending() {
                0 => return ran,
                n => ran += n,
            }
        }
    }

    /// Drives the scheduler for `budget`, sleeping between deadlines.
    pub fn run_for(&self, budget: Duration) -> usize {
        let end = Instant::now() + budget;
        self.drive_until(end, || false)
    }

    /// Drives the scheduler until `done` returns true or `timeout` passes.
    /// Returns whether `done` was reached.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + timeout;
        self.drive_until(end, &mut done);
        done()
    }

    fn drive_until(&self, end: Instant, mut done: impl FnMut() -> bool) -> usize {
        let mut ran = 0;
        loop {
            ran += self.run_pending();
            if done() {
                return ran;
            }
            let now = Instant::now();
            if now >= end {
                return ran;
            }
            let wake = self.next_wake().map_or(end, |at| at.min(end));
            if wake > now {
                std::thread::sleep(wake - now);
            }
        }
    }

    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.microtasks.len() + state.timers.len()
    }

    fn push_timer(&self, delay: Duration, job: TimerJob) -> Result<Cancelable, ScheduleError> {
        if !self.alive.get() {
            return Err(rejected(&self.name));
        }
        let token = self.root.new_child();
        let id = self
            .state
            .lock()
            .timers
            .push(Instant::now() + delay, token.clone(), job);

        let state = Arc::downgrade(&self.state);
        Ok(Cancelable::new(move || {
            token.cancel();
            if let Some(state) = state.upgrade() {
                state.lock().timers.remove(id);
            }
        }))
    }
}

impl Scheduler for SingleThreadScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn parallelism(&self) -> usize {
        1
    }

    fn execute(&self, task: Task) -> Result<(), ScheduleError> {
        if !self.alive.get() {
            return Err(rejected(&self.name));
        }
        self.state.lock().microtasks.push_back(task);
        Ok(())
    }

    fn schedule(&self, delay: Duration, task: Task) -> Result<Cancelable, ScheduleError> {
        self.push_timer(delay, TimerJob::Once(task))
    }

    fn schedule_at_fixed_rate(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: PeriodicTask,
    ) -> Result<Cancelable, ScheduleError> {
        let period = clamp_period(&self.name, period);
        self.push_timer(initial_delay, TimerJob::Periodic { task, period })
    }

    fn shutdown(&self) {
        if !self.alive.take_down() {
            return;
        }
        self.root.cancel();
        let mut state = self.state.lock();
        let dropped = state.microtasks.len() + state.timers.len();
        // drop outside the lock: tasks may own handles that lock it again
        let microtasks = std::mem::take(&mut state.microtasks);
        let timers = std::mem::take(&mut state.timers);
        drop(state);
        drop(microtasks);
        drop(timers);
        tracing::debug!("[RxScheduler] {} shut down, {} tasks dropped", self.name, dropped);
    }

    fn is_shutdown(&self) -> bool {
        !self.alive.get()
    }

    fn is_driven(&self) -> bool {
        true
    }

    /// Runs one batch: the timers due now and the microtasks queued before
    /// the call. Work queued by the batch itself waits for the next call,
    /// so a fast periodic task cannot keep the host loop from returning.
    fn run_pending(&self) -> usize {
        let batch = {
            let mut state = self.state.lock();
            let due = state.timers.pop_due(Instant::now());
            for job in due {
                state.microtasks.push_back(guarded_job(job));
            }
            state.microtasks.len()
        };

        let mut ran = 0;
        while ran < batch && self.alive.get() {
            let Some(task) = self.state.lock().microtasks.pop_front() else {
                break;
            };
            run_task(&self.name, task);
            ran += 1;
        }
        ran
    }

    fn next_wake(&self) -> Option<Instant> {
        let mut state = self.state.lock();
        if !state.microtasks.is_empty() {
            return Some(Instant::now());
        }
        state.timers.next_deadline()
    }
}

impl std::fmt::Debug for SingleThreadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleThreadScheduler")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn nothing_runs_until_driven() {
        let sched = SingleThreadScheduler::new("rx-test-single");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            sched.execute(Box::new(move || order.lock().push(i))).unwrap();
        }
        assert!(order.lock().is_empty());
        assert_eq!(sched.run_pending(), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let sched = SingleThreadScheduler::new("rx-test-single-timers");
        let order = Arc::new(Mutex::new(Vec::new()));
        for (i, ms) in [40u64, 10, 20].into_iter().enumerate() {
            let order = order.clone();
            sched
                .schedule(Duration::from_millis(ms), Box::new(move || order.lock().push(i)))
                .unwrap();
        }
        sched.run_for(Duration::from_millis(80));
        assert_eq!(*order.lock(), vec![1, 2, 0]);
    }

    #[test]
    fn periodic_task_ticks_until_cancelled() {
        let sched = SingleThreadScheduler::new("rx-test-single-periodic");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let c = sched
            .schedule_at_fixed_rate(
                Duration::from_millis(5),
                Duration::from_millis(5),
                Arc::new(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let reached = sched.run_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) >= 3);
        assert!(reached);
        c.cancel();
        let seen = hits.load(Ordering::SeqCst);
        sched.run_for(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), seen);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn zero_period_does_not_trap_the_caller() {
        let sched = SingleThreadScheduler::new("rx-test-single-zero");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let c = sched
            .schedule_at_fixed_rate(
                Duration::ZERO,
                Duration::ZERO,
                Arc::new(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        // each call returns after a single batch
        for _ in 0..3 {
            assert!(sched.run_pending() <= 1);
        }
        let reached = sched.run_until(Duration::from_secs(1), || hits.load(Ordering::SeqCst) >= 3);
        assert!(reached);
        c.cancel();
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn work_queued_by_a_batch_waits_for_the_next_call() {
        let sched = Arc::new(SingleThreadScheduler::new("rx-test-single-batch"));
        let hits = Arc::new(AtomicUsize::new(0));
        let (s, h) = (sched.clone(), hits.clone());
        sched
            .execute(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
                let h = h.clone();
                let _ = s.execute(Box::new(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                }));
            }))
            .unwrap();

        assert_eq!(sched.run_pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sched.run_pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rejects_after_shutdown() {
        let sched = SingleThreadScheduler::new("rx-test-single-down");
        sched.execute(Box::new(|| {})).unwrap();
        sched.shutdown();
        assert_eq!(sched.run_pending(), 0);
        assert!(sched.execute(Box::new(|| {})).is_err());
    }
}
