use super::{Node, NodeInfo, NodeKind, RunCtx, Rx, Subscriber, Value};
use crate::cancel::Cancelable;
use crate::error::RxError;
use crate::event::Event;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

struct TimerNode {
    delay: Duration,
}

impl Node<()> for TimerNode {
    fn describe(&self) -> NodeInfo {
        NodeInfo::leaf(NodeKind::Timer)
    }

    fn subscribe(&self, ctx: &RunCtx, sink: Subscriber<()>) {
        let s = sink.clone();
        let fired = ctx.scheduler().schedule(
            self.delay,
            Box::new(move || {
                s.next(());
                s.complete();
            }),
        );
        match fired {
            Ok(handle) => {
                sink.register(handle);
            }
            Err(rejected) => sink.error(rejected.into()),
        }
    }
}

struct IntervalNode {
    period: Duration,
}

impl Node<u64> for IntervalNode {
    fn describe(&self) -> NodeInfo {
        NodeInfo::leaf(NodeKind::Interval)
    }

    fn subscribe(&self, ctx: &RunCtx, sink: Subscriber<u64>) {
        let s = sink.clone();
        // held across the emission so overlapping ticks stay ordered
        let counter = Mutex::new(0u64);
        let ticking = ctx.scheduler().schedule_at_fixed_rate(
            self.period,
            self.period,
            Arc::new(move || {
                let mut n = counter.lock();
                if s.next(*n) {
                    *n += 1;
                }
            }),
        );
        match ticking {
            Ok(handle) => {
                sink.register(handle);
            }
            Err(rejected) => sink.error(rejected.into()),
        }
    }
}

struct ThrottleFirstNode<A: Value> {
    source: Rx<A>,
    window: Duration,
}

impl<A: Value> Node<A> for ThrottleFirstNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::ThrottleFirst, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<A>) {
        let window = self.window;
        let open_at: Mutex<Option<Instant>> = Mutex::new(None);
        let d = down.clone();
        let up = Subscriber::linked(&down, move |event: Event<A>| match event {
            Event::Next(v) => {
                let now = Instant::now();
                let pass = {
                    let mut open_at = open_at.lock();
                    let pass = open_at.is_none_or(|at| now >= at);
                    if pass {
                        *open_at = Some(now + window);
                    }
                    pass
                };
                if pass {
                    d.next(v);
                }
            }
            other => {
                d.emit(other);
            }
        });
        self.source.subscribe_node(ctx, up);
    }
}

struct ThrottleLastNode<A: Value> {
    source: Rx<A>,
    window: Duration,
}

impl<A: Value> Node<A> for ThrottleLastNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::ThrottleLast, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<A>) {
        let pending: Arc<ReentrantMutex<RefCell<Option<A>>>> =
            Arc::new(ReentrantMutex::new(RefCell::new(None)));

        let (p, d) = (pending.clone(), down.clone());
        let ticking = ctx.scheduler().schedule_at_fixed_rate(
            self.window,
            self.window,
            Arc::new(move || {
                let guard = p.lock();
                let latest = guard.borrow_mut().take();
                if let Some(v) = latest {
                    d.next(v);
                }
            }),
        );
        match ticking {
            Ok(handle) => {
                down.register(handle);
            }
            Err(rejected) => {
                down.error(rejected.into());
                return;
            }
        }

        let (p, d) = (pending, down.clone());
        let up = Subscriber::linked(&down, move |event: Event<A>| {
            let guard = p.lock();
            match event {
                Event::Next(v) => {
                    *guard.borrow_mut() = Some(v);
                }
                Event::Complete => {
                    let latest = guard.borrow_mut().take();
                    if let Some(v) = latest {
                        d.next(v);
                    }
                    d.complete();
                }
                Event::Error(e) => {
                    guard.borrow_mut().take();
                    d.error(e);
                }
            }
        });
        self.source.subscribe_node(ctx, up);
    }
}

struct TimeoutNode<A: Value> {
    source: Rx<A>,
    after: Duration,
}

impl<A: Value> Node<A> for TimeoutNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::Timeout, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<A>) {
        // whoever flips `decided` first wins the race
        let decided = Arc::new(AtomicBool::new(false));
        let timer = Arc::new(Mutex::new(Cancelable::empty()));

        let (dec, tm, d) = (decided.clone(), timer.clone(), down.clone());
        let up = Subscriber::linked(&down, move |event: Event<A>| match event {
            Event::Next(v) => {
                if !dec.load(Ordering::Acquire) {
                    d.next(v);
                }
            }
            terminal => {
                if !dec.swap(true, Ordering::AcqRel) {
                    tm.lock().cancel();
                    d.emit(terminal);
                }
            }
        });

        let after = self.after;
        let (dec, upstream, d) = (decided, up.as_cancelable(), down.clone());
        let fired = ctx.scheduler().schedule(
            after,
            Box::new(move || {
                if !dec.swap(true, Ordering::AcqRel) {
                    upstream.cancel();
                    d.error(RxError::timeout(after));
                }
            }),
        );
        match fired {
            Ok(handle) => {
                *timer.lock() = handle.clone();
                down.register(handle);
            }
            Err(rejected) => {
                down.error(rejected.into());
                return;
            }
        }

        self.source.subscribe_node(ctx, up);
    }
}

impl Rx<()> {
    /// Emits `()` once after `delay`, then completes.
    pub fn timer(delay: Duration) -> Self {
        Self::from_node(TimerNode { delay })
    }
}

impl Rx<u64> {
    /// Emits 0, 1, 2, ... every `period`, starting one period after
    /// subscription. Never completes on its own.
    pub fn interval(period: Duration) -> Self {
        Self::from_node(IntervalNode { period })
    }
}

impl<A: Value> Rx<A> {
    /// Forwards a value, then drops everything else for `window`.
    pub fn throttle_first(&self, window: Duration) -> Rx<A> {
        Rx::from_node(ThrottleFirstNode {
            source: self.clone(),
            window,
        })
    }

    /// Emits the latest value seen in each `window`. A value still pending
    /// when the upstream completes is emitted before `Complete`.
    pub fn throttle_last(&self, window: Duration) -> Rx<A> {
        Rx::from_node(ThrottleLastNode {
            source: self.clone(),
            window,
        })
    }

    /// Alias of [`throttle_last`](Self::throttle_last).
    pub fn sample(&self, window: Duration) -> Rx<A> {
        self.throttle_last(window)
    }

    /// Fails with a timeout error unless the upstream terminates within
    /// `after`.
    pub fn timeout(&self, after: Duration) -> Rx<A> {
        Rx::from_node(TimeoutNode {
            source: self.clone(),
            after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, TimeoutError};
    use crate::scheduler::SingleThreadScheduler;
    use crate::scheduler::Scheduler;

    fn local() -> (Arc<SingleThreadScheduler>, RunCtx) {
        let sched = Arc::new(SingleThreadScheduler::new("rx-test-timed"));
        (sched.clone(), RunCtx::on(sched))
    }

    #[test]
    fn timer_cancelled_before_firing_is_silent() {
        let (sched, ctx) = local();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let sub = Rx::timer(Duration::from_millis(20)).subscribe_with(&ctx, move |_| *h.lock() += 1);
        sub.cancel();
        assert_eq!(sched.pending(), 0);
        sched.run_for(Duration::from_millis(50));
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn interval_counts_up() {
        let (_, ctx) = local();
        let out = Rx::interval(Duration::from_millis(2))
            .take(4)
            .collect_with(&ctx)
            .unwrap();
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    #[test]
    fn zero_period_interval_still_terminates() {
        let (sched, ctx) = local();
        let out = Rx::interval(Duration::ZERO).take(3).collect_with(&ctx).unwrap();
        assert_eq!(out, vec![0, 1, 2]);
        assert_eq!(sched.pending(), 0);

        let pool = Arc::new(crate::scheduler::WorkStealingScheduler::new("rx-test-zero", 2).unwrap());
        let out = Rx::interval(Duration::ZERO)
            .take(3)
            .collect_with(&RunCtx::on(pool.clone()))
            .unwrap();
        assert_eq!(out, vec![0, 1, 2]);
        pool.shutdown();
    }

    #[test]
    fn throttle_first_drops_inside_window() {
        let (_, ctx) = local();
        let out = Rx::from_seq(1..=5)
            .throttle_first(Duration::from_secs(60))
            .collect_with(&ctx)
            .unwrap();
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn throttle_last_flushes_on_complete() {
        let (sched, ctx) = local();
        let out = Rx::from_seq(1..=5)
            .throttle_last(Duration::from_secs(60))
            .collect_with(&ctx)
            .unwrap();
        assert_eq!(out, vec![5]);
        // the window task went away with the subscription
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn sample_emits_latest_per_window() {
        let (sched, ctx) = local();
        let var = Rx::variable(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = var
            .rx()
            .sample(Duration::from_millis(20))
            .subscribe_with(&ctx, move |ev| {
                if let Some(v) = ev.into_value() {
                    s.lock().push(v);
                }
            });

        var.set(1);
        var.set(2);
        sched.run_for(Duration::from_millis(30));
        var.set(3);
        sched.run_for(Duration::from_millis(30));
        sub.cancel();

        assert_eq!(*seen.lock(), vec![2, 3]);
    }

    #[test]
    fn timeout_fires_on_slow_upstream() {
        let (sched, ctx) = local();
        let err = Rx::timer(Duration::from_secs(60))
            .timeout(Duration::from_millis(10))
            .await_with(&ctx)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is::<TimeoutError>());
        // the slow timer was cancelled by the winner
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn fast_upstream_cancels_timeout() {
        let (sched, ctx) = local();
        let out = Rx::from_seq(vec![1, 2])
            .timeout(Duration::from_secs(60))
            .collect_with(&ctx)
            .unwrap();
        assert_eq!(out, vec![1, 2]);
        assert_eq!(sched.pending(), 0);
    }
}
