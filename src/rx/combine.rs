use super::{Node, NodeInfo, NodeKind, RunCtx, Rx, Subscriber, Value, guarded};
use crate::error::ErrorKind;
use crate::event::Event;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

// Two-input operators keep their state behind a reentrant lock: the state
// is updated inside a short RefCell borrow, the borrow is dropped, and the
// downstream emission happens while the lock is still held. Emissions stay
// ordered across threads and a synchronous upstream can re-enter on the
// same thread.
type Shared<S> = Arc<ReentrantMutex<RefCell<S>>>;

fn shared<S>(state: S) -> Shared<S> {
    Arc::new(ReentrantMutex::new(RefCell::new(state)))
}

struct FlatState {
    active: usize,
    outer_done: bool,
}

impl FlatState {
    fn inner_done(&mut self) -> bool {
        self.active -= 1;
        self.active == 0 && self.outer_done
    }

    fn outer_done(&mut self) -> bool {
        self.outer_done = true;
        self.active == 0
    }
}

struct FlatMapNode<A: Value, B: Value> {
    source: Rx<A>,
    f: Arc<dyn Fn(A) -> Rx<B> + Send + Sync>,
}

impl<A: Value, B: Value> Node<B> for FlatMapNode<A, B> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::FlatMap, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<B>) {
        let f = self.f.clone();
        let d = down.clone();
        let inner_ctx = ctx.clone();
        let state = Arc::new(Mutex::new(FlatState {
            active: 0,
            outer_done: false,
        }));

        let up = Subscriber::linked(&down, move |event: Event<A>| match event {
            Event::Next(v) => {
                let inner = match guarded(ErrorKind::Operator, || f(v)) {
                    Ok(inner) => inner,
                    Err(e) => return d.error(e),
                };
                state.lock().active += 1;

                let key = Arc::new(OnceLock::new());
                let inner_key = key.clone();
                let inner_state = state.clone();
                let id = d.clone();
                let sub = Subscriber::new(move |event: Event<B>| match event {
                    Event::Next(v) => {
                        id.next(v);
                    }
                    Event::Error(e) => id.error(e),
                    Event::Complete => {
                        if let Some(key) = inner_key.get() {
                            id.unregister(*key);
                        }
                        let done = inner_state.lock().inner_done();
                        if done {
                            id.complete();
                        }
                    }
                });
                let _ = key.set(d.register(sub.as_cancelable()));
                inner.subscribe_node(&inner_ctx, sub);
            }
            Event::Error(e) => d.error(e),
            Event::Complete => {
                let done = state.lock().outer_done();
                if done {
                    d.complete();
                }
            }
        });
        self.source.subscribe_node(ctx, up);
    }
}

struct ZipState<A, B> {
    left: VecDeque<A>,
    right: VecDeque<B>,
    left_done: bool,
    right_done: bool,
}

struct ZipNode<A: Value, B: Value> {
    left: Rx<A>,
    right: Rx<B>,
}

impl<A: Value, B: Value> Node<(A, B)> for ZipNode<A, B> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(
            NodeKind::Zip,
            vec![self.left.describe(), self.right.describe()],
        )
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<(A, B)>) {
        let state = shared(ZipState {
            left: VecDeque::new(),
            right: VecDeque::new(),
            left_done: false,
            right_done: false,
        });

        let (st, d) = (state.clone(), down.clone());
        let left = Subscriber::linked(&down, move |event: Event<A>| {
            let guard = st.lock();
            match event {
                Event::Next(a) => {
                    let (pair, finished) = {
                        let mut s = guard.borrow_mut();
                        match s.right.pop_front() {
                            Some(b) => (Some((a, b)), s.right_done && s.right.is_empty()),
                            None => {
                                s.left.push_back(a);
                                (None, false)
                            }
                        }
                    };
                    if let Some(pair) = pair {
                        d.next(pair);
                    }
                    if finished {
                        d.complete();
                    }
                }
                Event::Error(e) => d.error(e),
                Event::Complete => {
                    let finished = {
                        let mut s = guard.borrow_mut();
                        s.left_done = true;
                        s.left.is_empty()
                    };
                    if finished {
                        d.complete();
                    }
                }
            }
        });

        let (st, d) = (state, down.clone());
        let right = Subscriber::linked(&down, move |event: Event<B>| {
            let guard = st.lock();
            match event {
                Event::Next(b) => {
                    let (pair, finished) = {
                        let mut s = guard.borrow_mut();
                        match s.left.pop_front() {
                            Some(a) => (Some((a, b)), s.left_done && s.left.is_empty()),
                            None => {
                                s.right.push_back(b);
                                (None, false)
                            }
                        }
                    };
                    if let Some(pair) = pair {
                        d.next(pair);
                    }
                    if finished {
                        d.complete();
                    }
                }
                Event::Error(e) => d.error(e),
                Event::Complete => {
                    let finished = {
                        let mut s = guard.borrow_mut();
                        s.right_done = true;
                        s.right.is_empty()
                    };
                    if finished {
                        d.complete();
                    }
                }
            }
        });

        self.left.subscribe_node(ctx, left);
        self.right.subscribe_node(ctx, right);
    }
}

struct JoinState<A, B> {
    left: Option<A>,
    right: Option<B>,
    left_done: bool,
    right_done: bool,
}

struct JoinNode<A: Value, B: Value> {
    left: Rx<A>,
    right: Rx<B>,
}

impl<A: Value, B: Value> Node<(A, B)> for JoinNode<A, B> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(
            NodeKind::Join,
            vec![self.left.describe(), self.right.describe()],
        )
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<(A, B)>) {
        let state = shared(JoinState {
            left: None,
            right: None,
            left_done: false,
            right_done: false,
        });

        let (st, d) = (state.clone(), down.clone());
        let left = Subscriber::linked(&down, move |event: Event<A>| {
            let guard = st.lock();
            match event {
                Event::Next(a) => {
                    let pair = {
                        let mut s = guard.borrow_mut();
                        s.left = Some(a.clone());
                        s.right.clone().map(|b| (a, b))
                    };
                    if let Some(pair) = pair {
                        d.next(pair);
                    }
                }
                Event::Error(e) => d.error(e),
                Event::Complete => {
                    let finished = {
                        let mut s = guard.borrow_mut();
                        s.left_done = true;
                        s.right_done || s.left.is_none()
                    };
                    if finished {
                        d.complete();
                    }
                }
            }
        });

        let (st, d) = (state, down.clone());
        let right = Subscriber::linked(&down, move |event: Event<B>| {
            let guard = st.lock();
            match event {
                Event::Next(b) => {
                    let pair = {
                        let mut s = guard.borrow_mut();
                        s.right = Some(b.clone());
                        s.left.clone().map(|a| (a, b))
                    };
                    if let Some(pair) = pair {
                        d.next(pair);
                    }
                }
                Event::Error(e) => d.error(e),
                Event::Complete => {
                    let finished = {
                        let mut s = guard.borrow_mut();
                        s.right_done = true;
                        s.left_done || s.right.is_none()
                    };
                    if finished {
                        d.complete();
                    }
                }
            }
        });

        self.left.subscribe_node(ctx, left);
        self.right.subscribe_node(ctx, right);
    }
}

struct ConcatNode<A: Value> {
    first: Rx<A>,
    second: Rx<A>,
}

impl<A: Value> Node<A> for ConcatNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(
            NodeKind::Concat,
            vec![self.first.describe(), self.second.describe()],
        )
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<A>) {
        let d = down.clone();
        let second = self.second.clone();
        let next_ctx = ctx.clone();
        let first = Subscriber::linked(&down, move |event: Event<A>| match event {
            Event::Next(v) => {
                d.next(v);
            }
            Event::Error(e) => d.error(e),
            Event::Complete => {
                let sd = d.clone();
                let tail = Subscriber::linked(&d, move |event: Event<A>| {
                    sd.emit(event);
                });
                second.subscribe_node(&next_ctx, tail);
            }
        });
        self.first.subscribe_node(ctx, first);
    }
}

impl<A: Value> Rx<A> {
    /// Subscribes to `f(v)` for every upstream value and merges the inner
    /// streams. Completes once the upstream and every inner stream did.
    pub fn flat_map<B, F>(&self, f: F) -> Rx<B>
    where
        B: Value,
        F: Fn(A) -> Rx<B> + Send + Sync + 'static,
    {
        Rx::from_node(FlatMapNode {
            source: self.clone(),
            f: Arc::new(f),
        })
    }

    /// Pairs values by index: the n-th value of `self` with the n-th value
    /// of `other`.
    pub fn zip<B: Value>(&self, other: &Rx<B>) -> Rx<(A, B)> {
        Rx::from_node(ZipNode {
            left: self.clone(),
            right: other.clone(),
        })
    }

    /// Emits the latest pair whenever either side changes, once both sides
    /// have a value.
    pub fn join<B: Value>(&self, other: &Rx<B>) -> Rx<(A, B)> {
        Rx::from_node(JoinNode {
            left: self.clone(),
            right: other.clone(),
        })
    }

    /// Everything from `self`, then everything from `other`.
    pub fn concat(&self, other: &Rx<A>) -> Rx<A> {
        Rx::from_node(ConcatNode {
            first: self.clone(),
            second: other.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RxError;
    use crate::scheduler::{Scheduler, SingleThreadScheduler};
    use std::time::Duration;

    fn local() -> (Arc<SingleThreadScheduler>, RunCtx) {
        let sched = Arc::new(SingleThreadScheduler::new("rx-test-combine"));
        (sched.clone(), RunCtx::on(sched))
    }

    #[test]
    fn zip_pairs_by_index() {
        let (_, ctx) = local();
        let out = Rx::from_seq(vec![1, 2, 3])
            .zip(&Rx::from_seq(vec!["a", "b", "c", "d"]))
            .collect_with(&ctx)
            .unwrap();
        assert_eq!(out, vec![(1, "a"), (2, "b"), (3, "c")]);
    }

    #[test]
    fn zip_with_empty_side_completes() {
        let (_, ctx) = local();
        let out = Rx::<u8>::empty()
            .zip(&Rx::from_seq(vec![1u8, 2]))
            .collect_with(&ctx)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn join_waits_for_both_then_tracks_latest() {
        let (_, ctx) = local();
        let out = Rx::from_seq(vec![1, 2])
            .join(&Rx::just("x"))
            .collect_with(&ctx)
            .unwrap();
        // left is drained before right subscribes
        assert_eq!(out, vec![(2, "x")]);
    }

    #[test]
    fn join_completes_when_a_side_never_emitted() {
        let (_, ctx) = local();
        let var = Rx::variable(1);
        let out = Rx::<u8>::empty()
            .join(&var.rx())
            .collect_with(&ctx)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn concat_runs_in_sequence_and_aborts_on_error() {
        let (_, ctx) = local();
        let out = Rx::from_seq(vec![1, 2])
            .concat(&Rx::from_seq(vec![3]))
            .collect_with(&ctx)
            .unwrap();
        assert_eq!(out, vec![1, 2, 3]);

        let err = Rx::<u8>::exception(RxError::msg("first"))
            .concat(&Rx::just(1))
            .collect_with(&ctx)
            .unwrap_err();
        assert!(err.to_string().contains("first"));
    }

    #[test]
    fn flat_map_completes_after_inner_streams() {
        let (sched, ctx) = local();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        Rx::from_seq(vec![30u64, 10])
            .flat_map(|ms| Rx::timer(Duration::from_millis(ms)).map(move |_| ms))
            .subscribe_with(&ctx, move |ev| e.lock().push(ev));

        // outer completed synchronously, inners still pending
        assert!(events.lock().is_empty());
        sched.run_for(Duration::from_millis(100));

        let events = events.lock();
        let values: Vec<u64> = events.iter().filter_map(|ev| ev.value().copied()).collect();
        assert_eq!(values, vec![10, 30]);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], Event::Complete));
        assert_eq!(sched.pending(), 0);
        assert!(!sched.is_shutdown());
    }

    #[test]
    fn flat_map_keeps_inner_order() {
        let (_, ctx) = local();
        let out = Rx::from_seq(vec![1, 2])
            .flat_map(|v| Rx::from_seq(vec![v * 10, v * 10 + 1]))
            .collect_with(&ctx)
            .unwrap();
        assert_eq!(out, vec![10, 11, 20, 21]);
    }
}
