//! Stream node algebra.
//!
//! An [`Rx`] is an immutable description of a stream. Building one runs
//! nothing; every `subscribe` instantiates fresh run-time state for each
//! node and wires the stages together through [`Subscriber`]s.

mod cache;
mod combine;
mod queue;
mod runner;
mod source;
mod subscriber;
mod subscription;
mod timed;
mod transform;
mod variable;

pub use cache::CachedRx;
pub use queue::RxQueue;
pub use source::Callback;
pub use subscription::{Subscription, SubscriptionId};
pub use variable::RxVar;

pub(crate) use subscriber::Subscriber;

use crate::error::{ErrorKind, RxError};
use crate::scheduler::{self, Scheduler};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Anything a stream can carry.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Send + Sync + 'static {}

/// Schedulers a subscription runs on.
#[derive(Clone)]
pub struct RunCtx {
    scheduler: Arc<dyn Scheduler>,
    blocking: Arc<dyn Scheduler>,
}

impl RunCtx {
    pub fn new(scheduler: Arc<dyn Scheduler>, blocking: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            blocking,
        }
    }

    /// Uses `scheduler` for everything, blocking calls included.
    pub fn on(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            blocking: scheduler.clone(),
            scheduler,
        }
    }

    /// The process-wide pair.
    pub fn global() -> Self {
        Self::new(
            scheduler::default_scheduler(),
            scheduler::blocking_scheduler(),
        )
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    #[inline]
    pub fn blocking(&self) -> &Arc<dyn Scheduler> {
        &self.blocking
    }
}

impl Default for RunCtx {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Debug for RunCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunCtx")
            .field("scheduler", &self.scheduler.name())
            .field("blocking", &self.blocking.name())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Single,
    Just,
    FromSeq,
    Variable,
    Option,
    Empty,
    Exception,
    Future,
    Blocking,
    Timer,
    Interval,
    Queue,
    Map,
    TryMap,
    FlatMap,
    Filter,
    Zip,
    Join,
    Concat,
    Recover,
    RecoverWith,
    Transform,
    TransformTry,
    TransformFailure,
    Tap,
    TapOn,
    ThrottleFirst,
    ThrottleLast,
    Take,
    Cache,
    StartWith,
    Timeout,
    LastOption,
}

impl NodeKind {
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            NodeKind::Single
                | NodeKind::Just
                | NodeKind::FromSeq
                | NodeKind::Variable
                | NodeKind::Option
                | NodeKind::Empty
                | NodeKind::Exception
                | NodeKind::Future
                | NodeKind::Blocking
                | NodeKind::Timer
                | NodeKind::Interval
                | NodeKind::Queue
        )
    }
}

/// Shape of a node graph, for debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub kind: NodeKind,
    pub inputs: Vec<NodeInfo>,
}

impl NodeInfo {
    pub(crate) fn leaf(kind: NodeKind) -> Self {
        Self {
            kind,
            inputs: Vec::new(),
        }
    }

    pub(crate) fn with(kind: NodeKind, inputs: Vec<NodeInfo>) -> Self {
        Self { kind, inputs }
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if self.inputs.is_empty() {
            return Ok(());
        }
        write!(f, "(")?;
        for (i, input) in self.inputs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{input}")?;
        }
        write!(f, ")")
    }
}

pub(crate) trait Node<A: Value>: Send + Sync + 'static {
    fn describe(&self) -> NodeInfo;

    /// Starts producing into `sink`. Must not panic and must not deliver
    /// anything once `sink` is closed.
    fn subscribe(&self, ctx: &RunCtx, sink: Subscriber<A>);
}

/// A stream description. Cheap to clone; clones share the node.
pub struct Rx<A: Value> {
    node: Arc<dyn Node<A>>,
}

impl<A: Value> Clone for Rx<A> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<A: Value> Rx<A> {
    pub(crate) fn from_node<N: Node<A>>(node: N) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    pub(crate) fn subscribe_node(&self, ctx: &RunCtx, sink: Subscriber<A>) {
        if sink.is_closed() {
            return;
        }
        self.node.subscribe(ctx, sink);
    }

    pub fn kind(&self) -> NodeKind {
        self.node.describe().kind
    }

    pub fn describe(&self) -> NodeInfo {
        self.node.describe()
    }
}

impl<A: Value> fmt::Debug for Rx<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rx({})", self.describe())
    }
}

/// Runs a user callback, turning a panic into an error of `kind`.
pub(crate) fn guarded<R>(kind: ErrorKind, f: impl FnOnce() -> R) -> Result<R, RxError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| RxError::from_panic(kind, payload))
}
