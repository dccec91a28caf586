use super::subscriber::WeakSubscriber;
use super::{Node, NodeInfo, NodeKind, RunCtx, Rx, Subscriber, Value, guarded};
use crate::error::{ErrorKind, RxError};
use crate::event::Event;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Forwards a terminal event unchanged.
fn forward_terminal<A: Value, B: Value>(down: &Subscriber<B>, event: Event<A>) {
    match event {
        Event::Error(e) => down.error(e),
        Event::Complete => down.complete(),
        Event::Next(_) => {}
    }
}

struct MapNode<A: Value, B> {
    source: Rx<A>,
    f: Arc<dyn Fn(A) -> B + Send + Sync>,
}

impl<A: Value, B: Value> Node<B> for MapNode<A, B> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::Map, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<B>) {
        let f = self.f.clone();
        let d = down.clone();
        let up = Subscriber::linked(&down, move |event| match event {
            Event::Next(v) => match guarded(ErrorKind::Operator, || f(v)) {
                Ok(out) => {
                    d.next(out);
                }
                Err(e) => d.error(e),
            },
            other => forward_terminal(&d, other),
        });
        self.source.subscribe_node(ctx, up);
    }
}

struct TryMapNode<A: Value, B> {
    source: Rx<A>,
    f: Arc<dyn Fn(A) -> anyhow::Result<B> + Send + Sync>,
}

impl<A: Value, B: Value> Node<B> for TryMapNode<A, B> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::TryMap, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<B>) {
        let f = self.f.clone();
        let d = down.clone();
        let up = Subscriber::linked(&down, move |event| match event {
            Event::Next(v) => match guarded(ErrorKind::Operator, || f(v)) {
                Ok(Ok(out)) => {
                    d.next(out);
                }
                Ok(Err(e)) => d.error(RxError::failed_operator(e)),
                Err(e) => d.error(e),
            },
            other => forward_terminal(&d, other),
        });
        self.source.subscribe_node(ctx, up);
    }
}

struct FilterNode<A: Value> {
    source: Rx<A>,
    p: Arc<dyn Fn(&A) -> bool + Send + Sync>,
}

impl<A: Value> Node<A> for FilterNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::Filter, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<A>) {
        let p = self.p.clone();
        let d = down.clone();
        let up = Subscriber::linked(&down, move |event| match event {
            Event::Next(v) => match guarded(ErrorKind::Operator, || p(&v)) {
                Ok(true) => {
                    d.next(v);
                }
                Ok(false) => {}
                Err(e) => d.error(e),
            },
            other => forward_terminal(&d, other),
        });
        self.source.subscribe_node(ctx, up);
    }
}

struct TapNode<A: Value> {
    source: Rx<A>,
    f: Arc<dyn Fn(&A) + Send + Sync>,
}

impl<A: Value> Node<A> for TapNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::Tap, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<A>) {
        let f = self.f.clone();
        let d = down.clone();
        let up = Subscriber::linked(&down, move |event| match event {
            Event::Next(v) => match guarded(ErrorKind::Operator, || f(&v)) {
                Ok(()) => {
                    d.next(v);
                }
                Err(e) => d.error(e),
            },
            other => forward_terminal(&d, other),
        });
        self.source.subscribe_node(ctx, up);
    }
}

struct TapOnNode<A: Value> {
    source: Rx<A>,
    f: Arc<dyn Fn(&Event<A>) + Send + Sync>,
}

impl<A: Value> Node<A> for TapOnNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::TapOn, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<A>) {
        let f = self.f.clone();
        let d = down.clone();
        let up = Subscriber::linked(&down, move |event| {
            match guarded(ErrorKind::Operator, || f(&event)) {
                Ok(()) => {
                    d.emit(event);
                }
                // a failing tap on a terminal event keeps the original outcome
                Err(_) if event.is_terminal() => {
                    d.emit(event);
                }
                Err(e) => d.error(e),
            }
        });
        self.source.subscribe_node(ctx, up);
    }
}

struct TakeNode<A: Value> {
    source: Rx<A>,
    n: usize,
}

impl<A: Value> Node<A> for TakeNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::Take, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<A>) {
        if self.n == 0 {
            down.complete();
            return;
        }

        let n = self.n;
        let taken = AtomicUsize::new(0);
        let d = down.clone();
        let up = Subscriber::<A>::new_cyclic(move |me: WeakSubscriber<A>| {
            move |event: Event<A>| match event {
                Event::Next(v) => {
                    let count = taken.fetch_add(1, Ordering::AcqRel) + 1;
                    if count > n {
                        return;
                    }
                    d.next(v);
                    if count == n {
                        me.cancel();
                        d.complete();
                    }
                }
                other => forward_terminal(&d, other),
            }
        });
        down.register(up.as_cancelable());
        self.source.subscribe_node(ctx, up);
    }
}

struct StartWithNode<A: Value> {
    source: Rx<A>,
    prefix: Arc<[A]>,
}

impl<A: Value> Node<A> for StartWithNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::StartWith, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<A>) {
        for v in self.prefix.iter() {
            if !down.next(v.clone()) {
                return;
            }
        }
        let d = down.clone();
        let up = Subscriber::linked(&down, move |event| {
            d.emit(event);
        });
        self.source.subscribe_node(ctx, up);
    }
}

type RecoverFn<A> = dyn Fn(&RxError) -> Option<A> + Send + Sync;

struct RecoverNode<A: Value> {
    source: Rx<A>,
    pf: Arc<RecoverFn<A>>,
}

impl<A: Value> Node<A> for RecoverNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::Recover, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<A>) {
        let pf = self.pf.clone();
        let d = down.clone();
        let up = Subscriber::linked(&down, move |event| match event {
            Event::Error(e) => match guarded(ErrorKind::Operator, || pf(&e)) {
                Ok(Some(v)) => {
                    d.next(v);
                    d.complete();
                }
                Ok(None) => d.error(e),
                Err(pe) => d.error(pe),
            },
            other => {
                d.emit(other);
            }
        });
        self.source.subscribe_node(ctx, up);
    }
}

type RecoverWithFn<A> = dyn Fn(&RxError) -> Option<Rx<A>> + Send + Sync;

struct RecoverWithNode<A: Value> {
    source: Rx<A>,
    pf: Arc<RecoverWithFn<A>>,
}

impl<A: Value> Node<A> for RecoverWithNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::RecoverWith, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<A>) {
        let pf = self.pf.clone();
        let d = down.clone();
        let ctx2 = ctx.clone();
        let up = Subscriber::linked(&down, move |event| match event {
            Event::Error(e) => match guarded(ErrorKind::Operator, || pf(&e)) {
                Ok(Some(fallback)) => {
                    let fd = d.clone();
                    let next = Subscriber::linked(&d, move |event| {
                        fd.emit(event);
                    });
                    fallback.subscribe_node(&ctx2, next);
                }
                Ok(None) => d.error(e),
                Err(pe) => d.error(pe),
            },
            other => {
                d.emit(other);
            }
        });
        self.source.subscribe_node(ctx, up);
    }
}

type TransformFn<A, B> = dyn Fn(Result<A, RxError>) -> B + Send + Sync;

struct TransformNode<A: Value, B> {
    source: Rx<A>,
    f: Arc<TransformFn<A, B>>,
}

impl<A: Value, B: Value> Node<B> for TransformNode<A, B> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::Transform, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<B>) {
        let f = self.f.clone();
        let d = down.clone();
        let up = Subscriber::linked(&down, move |event| match event {
            Event::Next(v) => match guarded(ErrorKind::Operator, || f(Ok(v))) {
                Ok(out) => {
                    d.next(out);
                }
                Err(e) => d.error(e),
            },
            // the failure branch produces the last value of the stream
            Event::Error(e) => match guarded(ErrorKind::Operator, || f(Err(e))) {
                Ok(out) => {
                    d.next(out);
                    d.complete();
                }
                Err(pe) => d.error(pe),
            },
            Event::Complete => d.complete(),
        });
        self.source.subscribe_node(ctx, up);
    }
}

type TransformTryFn<A, B> = dyn Fn(Result<A, RxError>) -> Result<B, RxError> + Send + Sync;

struct TransformTryNode<A: Value, B> {
    source: Rx<A>,
    f: Arc<TransformTryFn<A, B>>,
}

impl<A: Value, B: Value> Node<B> for TransformTryNode<A, B> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::TransformTry, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<B>) {
        let f = self.f.clone();
        let d = down.clone();
        let up = Subscriber::linked(&down, move |event| match event {
            Event::Next(v) => match guarded(ErrorKind::Operator, || f(Ok(v))) {
                Ok(Ok(out)) => {
                    d.next(out);
                }
                Ok(Err(e)) | Err(e) => d.error(e),
            },
            Event::Error(e) => match guarded(ErrorKind::Operator, || f(Err(e))) {
                Ok(Ok(out)) => {
                    d.next(out);
                    d.complete();
                }
                Ok(Err(e)) | Err(e) => d.error(e),
            },
            Event::Complete => d.complete(),
        });
        self.source.subscribe_node(ctx, up);
    }
}

type FailureFn = dyn Fn(&RxError) -> Option<RxError> + Send + Sync;

struct TransformFailureNode<A: Value> {
    source: Rx<A>,
    pf: Arc<FailureFn>,
}

impl<A: Value> Node<A> for TransformFailureNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::TransformFailure, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<A>) {
        let pf = self.pf.clone();
        let d = down.clone();
        let up = Subscriber::linked(&down, move |event| match event {
            Event::Error(e) => match guarded(ErrorKind::Operator, || pf(&e)) {
                Ok(Some(mapped)) => d.error(mapped),
                Ok(None) => d.error(e),
                Err(pe) => d.error(pe),
            },
            other => {
                d.emit(other);
            }
        });
        self.source.subscribe_node(ctx, up);
    }
}

struct LastOptionNode<A: Value> {
    source: Rx<A>,
}

impl<A: Value> Node<Option<A>> for LastOptionNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::with(NodeKind::LastOption, vec![self.source.describe()])
    }

    fn subscribe(&self, ctx: &RunCtx, down: Subscriber<Option<A>>) {
        let last = Mutex::new(None);
        let d = down.clone();
        let up = Subscriber::linked(&down, move |event| match event {
            Event::Next(v) => {
                *last.lock() = Some(v);
            }
            Event::Error(e) => d.error(e),
            Event::Complete => {
                let last = last.lock().take();
                d.next(last);
                d.complete();
            }
        });
        self.source.subscribe_node(ctx, up);
    }
}

impl<A: Value> Rx<A> {
    pub fn map<B, F>(&self, f: F) -> Rx<B>
    where
        B: Value,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        Rx::from_node(MapNode {
            source: self.clone(),
            f: Arc::new(f),
        })
    }

    /// Like [`map`](Self::map), but an `Err` from `f` terminates the stream
    /// with an operator error.
    pub fn try_map<B, F>(&self, f: F) -> Rx<B>
    where
        B: Value,
        F: Fn(A) -> anyhow::Result<B> + Send + Sync + 'static,
    {
        Rx::from_node(TryMapNode {
            source: self.clone(),
            f: Arc::new(f),
        })
    }

    pub fn filter<P>(&self, p: P) -> Rx<A>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        Rx::from_node(FilterNode {
            source: self.clone(),
            p: Arc::new(p),
        })
    }

    pub fn tap<F>(&self, f: F) -> Rx<A>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        Rx::from_node(TapNode {
            source: self.clone(),
            f: Arc::new(f),
        })
    }

    /// Observes every event, terminal ones included.
    pub fn tap_on<F>(&self, f: F) -> Rx<A>
    where
        F: Fn(&Event<A>) + Send + Sync + 'static,
    {
        Rx::from_node(TapOnNode {
            source: self.clone(),
            f: Arc::new(f),
        })
    }

    /// Forwards the first `n` values, then cancels the upstream and
    /// completes.
    pub fn take(&self, n: usize) -> Rx<A> {
        Rx::from_node(TakeNode {
            source: self.clone(),
            n,
        })
    }

    pub fn start_with(&self, value: A) -> Rx<A> {
        self.start_with_seq([value])
    }

    pub fn start_with_seq<I>(&self, values: I) -> Rx<A>
    where
        I: IntoIterator<Item = A>,
    {
        Rx::from_node(StartWithNode {
            source: self.clone(),
            prefix: values.into_iter().collect(),
        })
    }

    /// Replaces an error with a final value when `pf` returns `Some`.
    pub fn recover<F>(&self, pf: F) -> Rx<A>
    where
        F: Fn(&RxError) -> Option<A> + Send + Sync + 'static,
    {
        Rx::from_node(RecoverNode {
            source: self.clone(),
            pf: Arc::new(pf),
        })
    }

    /// Continues with another stream when `pf` returns `Some`.
    pub fn recover_with<F>(&self, pf: F) -> Rx<A>
    where
        F: Fn(&RxError) -> Option<Rx<A>> + Send + Sync + 'static,
    {
        Rx::from_node(RecoverWithNode {
            source: self.clone(),
            pf: Arc::new(pf),
        })
    }

    /// Recovers only errors whose cause is an `E`.
    ///
    /// ```ignore
    /// let rx = fetch().recover_on(|e: &NetworkError| default_for(e));
    /// ```
    pub fn recover_on<E, F>(&self, f: F) -> Rx<A>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
        F: Fn(&E) -> A + Send + Sync + 'static,
    {
        self.recover(move |err| err.downcast_ref::<E>().map(&f))
    }

    pub fn transform<B, F>(&self, f: F) -> Rx<B>
    where
        B: Value,
        F: Fn(Result<A, RxError>) -> B + Send + Sync + 'static,
    {
        Rx::from_node(TransformNode {
            source: self.clone(),
            f: Arc::new(f),
        })
    }

    pub fn transform_try<B, F>(&self, f: F) -> Rx<B>
    where
        B: Value,
        F: Fn(Result<A, RxError>) -> Result<B, RxError> + Send + Sync + 'static,
    {
        Rx::from_node(TransformTryNode {
            source: self.clone(),
            f: Arc::new(f),
        })
    }

    /// Rewrites errors matched by `pf`; values pass through.
    pub fn transform_failure<F>(&self, pf: F) -> Rx<A>
    where
        F: Fn(&RxError) -> Option<RxError> + Send + Sync + 'static,
    {
        Rx::from_node(TransformFailureNode {
            source: self.clone(),
            pf: Arc::new(pf),
        })
    }

    /// Emits `Some(last value)` (or `None`) once the upstream completes.
    pub fn last_option(&self) -> Rx<Option<A>> {
        Rx::from_node(LastOptionNode {
            source: self.clone(),
        })
    }
}
