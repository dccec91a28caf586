use super::{Node, NodeInfo, NodeKind, RunCtx, Rx, Subscriber, Value};
use crate::cancel::Cancelable;
use crate::utils::state::SnapshotCell;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Weak};

struct Listeners<A> {
    next_id: u64,
    subs: Vec<(u64, Subscriber<A>)>,
    stopped: bool,
}

struct VarInner<A> {
    cell: SnapshotCell<A>,
    // serializes set/subscribe/stop; reentrant so a subscriber may set the
    // variable from inside its own handler
    listeners: ReentrantMutex<RefCell<Listeners<A>>>,
}

/// Observable mutable value.
///
/// Every subscriber first gets the current value, then each later `set`.
/// Reads through [`get`](Self::get) never block writers. The variable
/// never completes on its own; [`stop`](Self::stop) completes it.
pub struct RxVar<A: Value> {
    inner: Arc<VarInner<A>>,
}

impl<A: Value> Clone for RxVar<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Value> RxVar<A> {
    pub fn new(initial: A) -> Self {
        Self {
            inner: Arc::new(VarInner {
                cell: SnapshotCell::new(initial),
                listeners: ReentrantMutex::new(RefCell::new(Listeners {
                    next_id: 0,
                    subs: Vec::new(),
                    stopped: false,
                })),
            }),
        }
    }

    pub fn get(&self) -> A {
        (**self.inner.cell.peek()).clone()
    }

    /// Version of the current value: 1 for the initial one, bumped on every
    /// `set`.
    pub fn seq(&self) -> u64 {
        self.inner.cell.seq()
    }

    /// Stores `value` and delivers it to every live subscriber, in
    /// subscription order. After `stop` the value is stored but not
    /// delivered.
    pub fn set(&self, value: A) {
        let guard = self.inner.listeners.lock();
        self.inner.cell.publish(value.clone());

        let subs: Vec<Subscriber<A>> = {
            let l = guard.borrow();
            if l.stopped {
                return;
            }
            l.subs.iter().map(|(_, s)| s.clone()).collect()
        };
        for sub in subs {
            sub.next(value.clone());
        }

        guard.borrow_mut().subs.retain(|(_, s)| !s.is_closed());
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&A) -> A,
    {
        let _guard = self.inner.listeners.lock();
        let next = f(&self.inner.cell.peek());
        self.set(next);
    }

    /// Completes every current subscriber. Later subscribers get the
    /// current value followed by `Complete`.
    pub fn stop(&self) {
        let guard = self.inner.listeners.lock();
        let subs = {
            let mut l = guard.borrow_mut();
            l.stopped = true;
            std::mem::take(&mut l.subs)
        };
        for (_, sub) in subs {
            sub.complete();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.listeners.lock().borrow().stopped
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.lock().borrow().subs.len()
    }

    pub fn rx(&self) -> Rx<A> {
        Rx::from_node(VarNode {
            inner: self.inner.clone(),
        })
    }
}

impl<A: Value + fmt::Debug> fmt::Debug for RxVar<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxVar")
            .field("value", &self.get())
            .field("seq", &self.seq())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<A: Value> From<&RxVar<A>> for Rx<A> {
    fn from(var: &RxVar<A>) -> Self {
        var.rx()
    }
}

struct VarNode<A> {
    inner: Arc<VarInner<A>>,
}

fn remove_listener<A: Value>(inner: &Weak<VarInner<A>>, id: u64) {
    if let Some(inner) = inner.upgrade() {
        let guard = inner.listeners.lock();
        guard.borrow_mut().subs.retain(|(sid, _)| *sid != id);
    }
}

impl<A: Value> Node<A> for VarNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::leaf(NodeKind::Variable)
    }

    fn subscribe(&self, _ctx: &RunCtx, sink: Subscriber<A>) {
        let guard = self.inner.listeners.lock();
        let current = (*self.inner.cell.load()).clone();

        let id = {
            let mut l = guard.borrow_mut();
            if l.stopped {
                None
            } else {
                let id = l.next_id;
                l.next_id += 1;
                l.subs.push((id, sink.clone()));
                Some(id)
            }
        };

        let Some(id) = id else {
            sink.next(current);
            sink.complete();
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        sink.register(Cancelable::new(move || remove_listener(&weak, id)));
        sink.next(current);
    }
}

impl<A: Value> Rx<A> {
    pub fn variable(initial: A) -> RxVar<A> {
        RxVar::new(initial)
    }
}
