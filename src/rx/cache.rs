use super::{Node, NodeInfo, NodeKind, RunCtx, Rx, Subscriber, Value};
use crate::cancel::Cancelable;
use crate::error::RxError;
use crate::event::Event;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

enum Stage {
    Idle,
    Running { upstream: Cancelable },
    Done { error: Option<RxError>, at: Instant },
}

struct CacheState<A> {
    stage: Stage,
    latest: Option<A>,
    waiters: Vec<(u64, Subscriber<A>)>,
    next_id: u64,
}

impl<A> CacheState<A> {
    fn reset(&mut self) {
        self.stage = Stage::Idle;
        self.latest = None;
    }
}

type SharedCache<A> = Arc<ReentrantMutex<RefCell<CacheState<A>>>>;

/// Replays the terminal outcome of a finished run.
fn replay<A: Value>(sink: &Subscriber<A>, latest: Option<A>, error: Option<RxError>) {
    if let Some(v) = latest
        && !sink.next(v)
    {
        return;
    }
    match error {
        Some(e) => sink.error(e),
        None => sink.complete(),
    }
}

struct CacheNode<A: Value> {
    source: Rx<A>,
    ttl: Option<Duration>,
    state: SharedCache<A>,
}

impl<A: Value> CacheNode<A> {
    fn new(source: Rx<A>, ttl: Option<Duration>) -> Self {
        Self {
            source,
            ttl,
            state: Arc::new(ReentrantMutex::new(RefCell::new(CacheState {
                stage: Stage::Idle,
                latest: None,
                waiters: Vec::new(),
                next_id: 0,
            }))),
        }
    }

    fn upstream_handler(state: Weak<ReentrantMutex<RefCell<CacheState<A>>>>) -> impl Fn(Event<A>) + Send + Sync + 'static {
        move |event: Event<A>| {
            let Some(state) = state.upgrade() else {
                return;
            };
            let guard = state.lock();
            if !matches!(guard.borrow().stage, Stage::Running { .. }) {
                return;
            }
            match event {
                Event::Next(v) => {
                    let waiters: Vec<Subscriber<A>> = {
                        let mut s = guard.borrow_mut();
                        s.latest = Some(v.clone());
                        s.waiters.iter().map(|(_, w)| w.clone()).collect()
                    };
                    for w in waiters {
                        w.next(v.clone());
                    }
                }
                terminal => {
                    let waiters = {
                        let mut s = guard.borrow_mut();
                        s.stage = Stage::Done {
                            error: terminal.error().cloned(),
                            at: Instant::now(),
                        };
                        std::mem::take(&mut s.waiters)
                    };
                    for (_, w) in waiters {
                        w.emit(terminal.clone());
                    }
                }
            }
        }
    }
}

impl<A: Value> Node<A> for CacheNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::Cache, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, sink: Subscriber<A>) {
        // held for the whole call: concurrent first subscribers queue up
        // here instead of starting a second upstream
        let guard = self.state.lock();

        let expired = {
            let s = guard.borrow();
            match (&s.stage, self.ttl) {
                (Stage::Done { at, .. }, Some(ttl)) => at.elapsed() >= ttl,
                _ => false,
            }
        };
        if expired {
            guard.borrow_mut().reset();
        }

        let done = {
            let s = guard.borrow();
            match &s.stage {
                Stage::Done { error, .. } => Some((s.latest.clone(), error.clone())),
                _ => None,
            }
        };
        if let Some((latest, error)) = done {
            replay(&sink, latest, error);
            return;
        }

        let (id, latest, start) = {
            let mut s = guard.borrow_mut();
            let id = s.next_id;
            s.next_id += 1;
            s.waiters.push((id, sink.clone()));
            (id, s.latest.clone(), matches!(s.stage, Stage::Idle))
        };

        let weak = Arc::downgrade(&self.state);
        sink.register(Cancelable::new(move || {
            let Some(state) = weak.upgrade() else {
                return;
            };
            let guard = state.lock();
            let orphaned = {
                let mut s = guard.borrow_mut();
                s.waiters.retain(|(w, _)| *w != id);
                let upstream = match &s.stage {
                    Stage::Running { upstream } if s.waiters.is_empty() => Some(upstream.clone()),
                    _ => None,
                };
                // last waiter left mid-run: keep what was produced, start
                // over next time only if nothing was
                if upstream.is_some() {
                    if s.latest.is_some() {
                        s.stage = Stage::Done {
                            error: None,
                            at: Instant::now(),
                        };
                    } else {
                        s.reset();
                    }
                }
                upstream
            };
            if let Some(upstream) = orphaned {
                upstream.cancel();
            }
        }));

        if let Some(v) = latest
            && !sink.next(v)
        {
            return;
        }

        if start {
            let up = Subscriber::new(Self::upstream_handler(Arc::downgrade(&self.state)));
            guard.borrow_mut().stage = Stage::Running {
                upstream: up.as_cancelable(),
            };
            self.source.subscribe_node(ctx, up);
        }
    }
}

/// A cached stream; see [`Rx::cache`].
pub struct CachedRx<A: Value> {
    source: Rx<A>,
    rx: Rx<A>,
}

impl<A: Value> CachedRx<A> {
    /// A cache over the same upstream whose completed result is discarded
    /// `ttl` after it was produced. The next subscriber after that runs the
    /// upstream again.
    pub fn expire_after(&self, ttl: Duration) -> Rx<A> {
        Rx::from_node(CacheNode::new(self.source.clone(), Some(ttl)))
    }

    pub fn into_rx(self) -> Rx<A> {
        self.rx
    }
}

impl<A: Value> Deref for CachedRx<A> {
    type Target = Rx<A>;

    fn deref(&self) -> &Rx<A> {
        &self.rx
    }
}

impl<A: Value> From<CachedRx<A>> for Rx<A> {
    fn from(cached: CachedRx<A>) -> Self {
        cached.rx
    }
}

impl<A: Value> std::fmt::Debug for CachedRx<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.rx)
    }
}

impl<A: Value> Rx<A> {
    /// Shares one upstream run between all subscribers.
    ///
    /// The first subscription starts the upstream; later ones join it and
    /// get the latest value right away. Once the upstream terminated, every
    /// new subscriber gets the latest value and the terminal event replayed
    /// without running the upstream again.
    pub fn cache(&self) -> CachedRx<A> {
        CachedRx {
            source: self.clone(),
            rx: Rx::from_node(CacheNode::new(self.clone(), None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SingleThreadScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn local() -> (Arc<SingleThreadScheduler>, RunCtx) {
        let sched = Arc::new(SingleThreadScheduler::new("rx-test-cache"));
        (sched.clone(), RunCtx::on(sched))
    }

    fn counting() -> (Arc<AtomicUsize>, Rx<usize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let rx = Rx::from_seq(vec![()]).map(move |_| r.fetch_add(1, Ordering::SeqCst) + 1);
        (runs, rx)
    }

    #[test]
    fn upstream_runs_once() {
        let (_, ctx) = local();
        let (runs, rx) = counting();
        let cached = rx.cache();
        for _ in 0..5 {
            assert_eq!(cached.collect_with(&ctx).unwrap(), vec![1]);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn errors_are_replayed() {
        let (_, ctx) = local();
        let cached = Rx::<u8>::exception(RxError::msg("once")).cache();
        for _ in 0..2 {
            assert!(cached.await_with(&ctx).is_err());
        }
    }

    #[test]
    fn ttl_expires_completed_result() {
        let (_, ctx) = local();
        let (runs, rx) = counting();
        let cached = rx.cache().expire_after(Duration::from_millis(20));
        assert_eq!(cached.collect_with(&ctx).unwrap(), vec![1]);
        assert_eq!(cached.collect_with(&ctx).unwrap(), vec![1]);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cached.collect_with(&ctx).unwrap(), vec![2]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn late_subscriber_joins_running_upstream() {
        let (sched, ctx) = local();
        let cached = Rx::timer(Duration::from_millis(10)).map(|_| 5).cache();

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let (f, s) = (first.clone(), second.clone());
        cached.subscribe_with(&ctx, move |ev| {
            if ev.value().is_some() {
                f.fetch_add(1, Ordering::SeqCst);
            }
        });
        cached.subscribe_with(&ctx, move |ev| {
            if ev.value().is_some() {
                s.fetch_add(1, Ordering::SeqCst);
            }
        });

        sched.run_for(Duration::from_millis(40));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn early_leavers_keep_the_produced_value() {
        let (_, ctx) = local();
        let (runs, rx) = counting();
        let cached = rx.cache();
        for _ in 0..5 {
            cached.run_once_with(&ctx, |_| {});
        }
        for _ in 0..5 {
            assert_eq!(cached.take(1).collect_with(&ctx).unwrap(), vec![1]);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn last_waiter_leaving_resets() {
        let (sched, ctx) = local();
        let (runs, rx) = counting();
        let cached = Rx::timer(Duration::from_millis(10))
            .flat_map(move |_| rx.clone())
            .cache();

        let sub = cached.subscribe_with(&ctx, |_| {});
        sub.cancel();
        // the pending timer went away with the upstream
        assert_eq!(sched.pending(), 0);

        assert_eq!(cached.collect_with(&ctx).unwrap(), vec![1]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
