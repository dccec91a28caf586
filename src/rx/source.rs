use super::{Node, NodeInfo, NodeKind, RunCtx, Rx, Subscriber, Value, guarded};
use crate::error::{ErrorKind, RxError};
use crate::scheduler::Scheduler;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, OnceLock};

struct SingleNode<A> {
    init: Box<dyn Fn() -> A + Send + Sync>,
    memo: OnceLock<Result<A, RxError>>,
}

impl<A: Value> Node<A> for SingleNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::leaf(NodeKind::Single)
    }

    fn subscribe(&self, _ctx: &RunCtx, sink: Subscriber<A>) {
        // concurrent first subscribers block here until the value exists
        let result = self
            .memo
            .get_or_init(|| guarded(ErrorKind::Source, || (self.init)()));
        match result {
            Ok(v) => {
                sink.next(v.clone());
                sink.complete();
            }
            Err(e) => sink.error(e.clone()),
        }
    }
}

struct JustNode<A> {
    value: A,
}

impl<A: Value> Node<A> for JustNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::leaf(NodeKind::Just)
    }

    fn subscribe(&self, _ctx: &RunCtx, sink: Subscriber<A>) {
        sink.next(self.value.clone());
        sink.complete();
    }
}

struct FromSeqNode<A> {
    items: Arc<[A]>,
}

impl<A: Value> Node<A> for FromSeqNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::leaf(NodeKind::FromSeq)
    }

    fn subscribe(&self, _ctx: &RunCtx, sink: Subscriber<A>) {
        for item in self.items.iter() {
            if !sink.next(item.clone()) {
                return;
            }
        }
        sink.complete();
    }
}

struct OptionNode<A> {
    value: Option<A>,
}

impl<A: Value> Node<A> for OptionNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::leaf(NodeKind::Option)
    }

    fn subscribe(&self, _ctx: &RunCtx, sink: Subscriber<A>) {
        if let Some(v) = &self.value {
            sink.next(v.clone());
        }
        sink.complete();
    }
}

struct EmptyNode;

impl<A: Value> Node<A> for EmptyNode {
    fn describe(&self) -> NodeInfo {
        NodeInfo::leaf(NodeKind::Empty)
    }

    fn subscribe(&self, _ctx: &RunCtx, sink: Subscriber<A>) {
        sink.complete();
    }
}

struct ExceptionNode {
    err: RxError,
}

impl<A: Value> Node<A> for ExceptionNode {
    fn describe(&self) -> NodeInfo {
        NodeInfo::leaf(NodeKind::Exception)
    }

    fn subscribe(&self, _ctx: &RunCtx, sink: Subscriber<A>) {
        sink.error(self.err.clone());
    }
}

struct CallbackSlot<A: Value> {
    sink: Mutex<Option<Subscriber<A>>>,
    scheduler: Arc<dyn Scheduler>,
}

/// One-shot completion handle handed to the `register` function of
/// [`Rx::future`].
///
/// Exactly one outcome is delivered. Dropping the callback without calling
/// any of its methods delivers an error, so a forgotten callback never
/// leaves the subscriber hanging.
pub struct Callback<A: Value> {
    slot: Arc<CallbackSlot<A>>,
}

impl<A: Value> Callback<A> {
    pub fn success(self, value: A) {
        self.complete_with(Ok(value));
    }

    pub fn failure(self, err: impl Into<RxError>) {
        self.complete_with(Err(err.into()));
    }

    pub fn complete_with(self, result: Result<A, RxError>) {
        self.deliver(result);
    }

    /// True once the subscriber went away; the result would be dropped.
    pub fn is_cancelled(&self) -> bool {
        self.slot.sink.lock().as_ref().is_none_or(Subscriber::is_closed)
    }

    fn deliver(&self, result: Result<A, RxError>) {
        let Some(sink) = self.slot.sink.lock().take() else {
            return;
        };

        let task_sink = sink.clone();
        let task = Box::new(move || match result {
            Ok(v) => {
                task_sink.next(v);
                task_sink.complete();
            }
            Err(e) => task_sink.error(e),
        });
        if let Err(rejected) = self.slot.scheduler.execute(task) {
            sink.error(rejected.into());
        }
    }
}

impl<A: Value> Drop for Callback<A> {
    fn drop(&mut self) {
        if self.slot.sink.lock().is_some() {
            self.deliver(Err(RxError::not_completed()));
        }
    }
}

impl<A: Value> fmt::Debug for Callback<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("pending", &self.slot.sink.lock().is_some())
            .finish()
    }
}

type Register<A> = dyn Fn(Callback<A>) + Send + Sync;

struct FutureNode<A: Value> {
    register: Arc<Register<A>>,
}

impl<A: Value> Node<A> for FutureNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::leaf(NodeKind::Future)
    }

    fn subscribe(&self, ctx: &RunCtx, sink: Subscriber<A>) {
        let slot = Arc::new(CallbackSlot {
            sink: Mutex::new(Some(sink.clone())),
            scheduler: ctx.scheduler().clone(),
        });

        // cancelling forgets the sink so a late callback holds nothing
        let weak = Arc::downgrade(&slot);
        sink.register(crate::cancel::Cancelable::new(move || {
            if let Some(slot) = weak.upgrade() {
                slot.sink.lock().take();
            }
        }));

        let callback = Callback { slot };
        let register = self.register.clone();
        if let Err(e) = guarded(ErrorKind::Source, move || register(callback)) {
            sink.error(e);
        }
    }
}

type BlockingCall<A> = dyn Fn() -> anyhow::Result<A> + Send + Sync;

struct BlockingNode<A> {
    call: Arc<BlockingCall<A>>,
}

impl<A: Value> Node<A> for BlockingNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::leaf(NodeKind::Blocking)
    }

    fn subscribe(&self, ctx: &RunCtx, sink: Subscriber<A>) {
        let call = self.call.clone();
        let task_sink = sink.clone();
        let task = Box::new(move || {
            if task_sink.is_closed() {
                return;
            }
            match guarded(ErrorKind::Source, || call()) {
                Ok(Ok(v)) => {
                    task_sink.next(v);
                    task_sink.complete();
                }
                Ok(Err(e)) => task_sink.error(RxError::with_kind(ErrorKind::Upstream, e)),
                Err(e) => task_sink.error(e),
            }
        });
        if let Err(rejected) = ctx.blocking().execute(task) {
            sink.error(rejected.into());
        }
    }
}

impl<A: Value> Rx<A> {
    /// Lazily computed single value. `init` runs on the first subscription
    /// only; its value (or the failure it raised) is replayed to every
    /// later subscriber.
    pub fn single<F>(init: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::from_node(SingleNode {
            init: Box::new(init),
            memo: OnceLock::new(),
        })
    }

    pub fn just(value: A) -> Self {
        Self::from_node(JustNode { value })
    }

    /// Emits every item in order, then completes. Each subscription starts
    /// over from the first item.
    pub fn from_seq<I>(items: I) -> Self
    where
        I: IntoIterator<Item = A>,
    {
        Self::from_node(FromSeqNode {
            items: items.into_iter().collect(),
        })
    }

    pub fn option(value: Option<A>) -> Self {
        Self::from_node(OptionNode { value })
    }

    pub fn empty() -> Self {
        Self::from_node(EmptyNode)
    }

    pub fn exception(err: impl Into<RxError>) -> Self {
        Self::from_node(ExceptionNode { err: err.into() })
    }

    /// Bridges a callback based API.
    ///
    /// `register` runs once per subscription and receives a [`Callback`];
    /// whatever it is completed with is delivered through the context
    /// scheduler, from any thread.
    ///
    /// ```ignore
    /// let rx = Rx::future(|cb: Callback<u32>| {
    ///     std::thread::spawn(move || cb.success(42));
    /// });
    /// ```
    pub fn future<F>(register: F) -> Self
    where
        F: Fn(Callback<A>) + Send + Sync + 'static,
    {
        Self::from_node(FutureNode {
            register: Arc::new(register),
        })
    }

    /// Runs `call` on the blocking scheduler and emits its result.
    pub fn blocking<F>(call: F) -> Self
    where
        F: Fn() -> anyhow::Result<A> + Send + Sync + 'static,
    {
        Self::from_node(BlockingNode {
            call: Arc::new(call),
        })
    }
}
