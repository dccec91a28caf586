use super::{PeriodicTask, Task};
use crate::cancel::{CancelToken, Cancelable};
use crate::error::ScheduleError;
use crate::utils::health_flag::HealthFlag;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub(crate) enum TimerJob {
    Once(Task),
    Periodic { task: PeriodicTask, period: Duration },
}

struct TimerEntry {
    deadline: Instant,
    id: u64,
    token: CancelToken,
    job: TimerJob,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // reversed: BinaryHeap is a max-heap, the earliest deadline must pop first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A due job, ready to be handed to an executor.
pub(crate) struct DueJob {
    pub token: CancelToken,
    pub task: Task,
}

/// Deadline-ordered timer storage. Not synchronized; owners wrap it in a lock.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_id: u64,
}

impl TimerQueue {
    pub fn push(&mut self, deadline: Instant, token: CancelToken, job: TimerJob) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(TimerEntry {
            deadline,
            id,
            token,
            job,
        });
        id
    }

    /// Drops the entry with `id`, releasing whatever its task captured.
    pub fn remove(&mut self, id: u64) {
        self.heap.retain(|e| e.id != id);
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(head) = self.heap.peek() {
            if head.token.is_cancelled() {
                self.heap.pop();
                continue;
            }
            return Some(head.deadline);
        }
        None
    }

    /// Pops every entry due at `now`. Periodic entries are re-armed at their
    /// next deadline before being returned.
    pub fn pop_due(&mut self, now: Instant) -> Vec<DueJob> {
        let mut due = Vec::new();
        let mut rearm = Vec::new();

        while let Some(head) = self.heap.peek() {
            if head.deadline > now {
                break;
            }
            let Some(entry) = self.heap.pop() else {
                break;
            };
            if entry.token.is_cancelled() {
                continue;
            }
            match entry.job {
                TimerJob::Once(task) => due.push(DueJob {
                    token: entry.token,
                    task,
                }),
                TimerJob::Periodic { task, period } => {
                    let tick = task.clone();
                    due.push(DueJob {
                        token: entry.token.clone(),
                        task: Box::new(move || tick()),
                    });
                    let mut next = entry.deadline + period;
                    // after a long stall skip missed ticks instead of bursting
                    if next + period < now {
                        next = now + period;
                    }
                    rearm.push(TimerEntry {
                        deadline: next,
                        id: entry.id,
                        token: entry.token,
                        job: TimerJob::Periodic { task, period },
                    });
                }
            }
        }

        for entry in rearm {
            self.heap.push(entry);
        }
        due
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Wraps a due job so it re-checks its token right before running.
pub(crate) fn guarded_job(job: DueJob) -> Task {
    let DueJob { token, task } = job;
    Box::new(move || {
        if !token.is_cancelled() {
            task();
        }
    })
}

type Dispatch = Box<dyn Fn(Task) -> Result<(), ScheduleError> + Send + 'static>;

struct TimerShared {
    queue: Mutex<TimerQueue>,
    wake: Condvar,
    alive: HealthFlag,
    root: CancelToken,
}

/// Dedicated thread that sleeps until the earliest deadline and hands due
/// tasks to a dispatch function (usually a pool's `execute`).
pub(crate) struct TimerThread {
    name: String,
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub fn spawn<D>(name: String, dispatch: D) -> std::io::Result<Self>
    where
        D: Fn(Task) -> Result<(), ScheduleError> + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(TimerQueue::default()),
            wake: Condvar::new(),
            alive: HealthFlag::new(true),
            root: CancelToken::new_root(),
        });

        let thread_shared = shared.clone();
        let thread_name = name.clone();
        let dispatch: Dispatch = Box::new(dispatch);
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || timer_loop(&thread_name, &thread_shared, dispatch))?;

        Ok(Self {
            name,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn schedule(&self, delay: Duration, job: TimerJob) -> Result<Cancelable, ScheduleError> {
        if !self.shared.alive.get() {
            return Err(super::rejected(&self.name));
        }
        let token = self.shared.root.new_child();
        let deadline = Instant::now() + delay;

        let id = {
            let mut queue = self.shared.queue.lock();
            let id = queue.push(deadline, token.clone(), job);
            // wake the thread only when the new entry became the head
            if queue.next_deadline() == Some(deadline) {
                self.shared.wake.notify_one();
            }
            id
        };

        let shared = Arc::downgrade(&self.shared);
        Ok(Cancelable::new(move || {
            token.cancel();
            if let Some(shared) = shared.upgrade() {
                shared.queue.lock().remove(id);
                shared.wake.notify_one();
            }
        }))
    }

    pub fn stop(&self) {
        if !self.shared.alive.take_down() {
            return;
        }
        self.shared.root.cancel();
        {
            let mut queue = self.shared.queue.lock();
            queue.clear();
            self.shared.wake.notify_all();
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != std::thread::current().id()
        {
            let _ = handle.join();
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn timer_loop(name: &str, shared: &TimerShared, dispatch: Dispatch) {
    tracing::debug!("[RxTimer] {} started", name);
    let mut queue = shared.queue.lock();

    while shared.alive.get() {
        let now = Instant::now();
        match queue.next_deadline() {
            None => {
                shared.wake.wait(&mut queue);
            }
            Some(deadline) if deadline > now => {
                shared.wake.wait_until(&mut queue, deadline);
            }
            Some(_) => {
                let due = queue.pop_due(now);
                drop(queue);
                for job in due {
                    if let Err(err) = dispatch(guarded_job(job)) {
                        tracing::debug!("[RxTimer] {} dispatch failed: {}", name, err);
                    }
                }
                queue = shared.queue.lock();
            }
        }
    }

    tracing::debug!("[RxTimer] {} stopped", name);
}

/// Runs due tasks inline on the timer thread; used by tests.
#[cfg(test)]
pub(crate) fn inline_dispatch(name: &'static str) -> impl Fn(Task) -> Result<(), ScheduleError> {
    move |task| {
        super::run_task(name, task);
        Ok(())
    }
}
