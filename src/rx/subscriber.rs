use crate::cancel::Cancelable;
use crate::error::RxError;
use crate::event::Event;
use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, ReentrantMutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Handler<A> = Box<dyn Fn(Event<A>) + Send + Sync + 'static>;

/// Key of a resource registered on a [`Subscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResourceKey(u64);

struct Inner<A> {
    // serializes delivery; reentrant so a handler may emit into the same
    // subscriber again from its own thread
    gate: ReentrantMutex<()>,
    closed: AtomicBool,
    handler: ArcSwapOption<Handler<A>>,
    resources: Mutex<Option<Vec<(u64, Cancelable)>>>,
    next_key: AtomicU64,
}

/// The receiving end of one subscription at one stage of a pipeline.
///
/// Guarantees:
/// - events are delivered one at a time;
/// - nothing is delivered after a terminal event or after `cancel`;
/// - closing releases every registered resource exactly once.
///
/// `cancel` does not take the delivery gate: upstream stages deliver
/// downstream while downstream stages cancel upstream, and taking the gate
/// from both directions would deadlock. An event already inside the handler
/// when `cancel` runs may still finish; [`wait_idle`](Self::wait_idle)
/// waits for it.
pub(crate) struct Subscriber<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for Subscriber<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Non-owning handle, for handlers that need to close their own subscriber.
pub(crate) struct WeakSubscriber<A> {
    inner: Weak<Inner<A>>,
}

impl<A> Clone for WeakSubscriber<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Send + 'static> WeakSubscriber<A> {
    pub fn upgrade(&self) -> Option<Subscriber<A>> {
        self.inner.upgrade().map(|inner| Subscriber { inner })
    }

    pub fn cancel(&self) {
        if let Some(sub) = self.upgrade() {
            sub.cancel();
        }
    }
}

fn inner_with<A>(handler: Handler<A>) -> Inner<A> {
    Inner {
        gate: ReentrantMutex::new(()),
        closed: AtomicBool::new(false),
        handler: ArcSwapOption::from_pointee(handler),
        resources: Mutex::new(Some(Vec::new())),
        next_key: AtomicU64::new(0),
    }
}

impl<A: Send + 'static> Subscriber<A> {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Event<A>) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(inner_with(Box::new(handler))),
        }
    }

    /// Builds a subscriber whose handler can reach the subscriber itself.
    pub fn new_cyclic<F, M>(make: M) -> Self
    where
        M: FnOnce(WeakSubscriber<A>) -> F,
        F: Fn(Event<A>) + Send + Sync + 'static,
    {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<A>>| {
            let handler = make(WeakSubscriber {
                inner: weak.clone(),
            });
            inner_with(Box::new(handler))
        });
        Self { inner }
    }

    /// Creates a subscriber and registers it as a resource of `down`, so
    /// closing `down` cancels it.
    pub fn linked<B, F>(down: &Subscriber<B>, handler: F) -> Self
    where
        B: Send + 'static,
        F: Fn(Event<A>) + Send + Sync + 'static,
    {
        let up = Self::new(handler);
        down.register(up.as_cancelable());
        up
    }

    pub fn downgrade(&self) -> WeakSubscriber<A> {
        WeakSubscriber {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers one event; returns whether the subscriber is still open.
    pub fn emit(&self, event: Event<A>) -> bool {
        let gate = self.inner.gate.lock();
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }

        let terminal = event.is_terminal();
        let handler = if terminal {
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            self.inner.handler.swap(None)
        } else {
            self.inner.handler.load_full()
        };

        if let Some(handler) = handler {
            (*handler)(event);
        }
        drop(gate);

        if terminal {
            self.release();
            return false;
        }
        !self.is_closed()
    }

    #[inline]
    pub fn next(&self, value: A) -> bool {
        self.emit(Event::Next(value))
    }

    #[inline]
    pub fn error(&self, err: RxError) {
        self.emit(Event::Error(err));
    }

    #[inline]
    pub fn complete(&self) {
        self.emit(Event::Complete);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes without delivering anything and releases resources.
    pub fn cancel(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.handler.store(None);
        self.release();
    }

    /// Blocks until no event is being delivered on another thread.
    pub fn wait_idle(&self) {
        drop(self.inner.gate.lock());
    }

    /// Ties `resource` to this subscriber's lifetime. If the subscriber is
    /// already closed the resource is cancelled right away.
    pub fn register(&self, resource: Cancelable) -> ResourceKey {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let mut resources = self.inner.resources.lock();
        match resources.as_mut() {
            Some(list) => list.push((key, resource)),
            None => {
                drop(resources);
                resource.cancel();
            }
        }
        ResourceKey(key)
    }

    /// Forgets a resource that finished on its own.
    pub fn unregister(&self, key: ResourceKey) {
        if let Some(list) = self.inner.resources.lock().as_mut() {
            list.retain(|(k, _)| *k != key.0);
        }
    }

    /// Handle that cancels this subscriber without keeping it alive.
    pub fn as_cancelable(&self) -> Cancelable {
        let weak = self.downgrade();
        Cancelable::new(move || weak.cancel())
    }

    fn release(&self) {
        let resources = self.inner.resources.lock().take();
        if let Some(list) = resources {
            for (_, resource) in list {
                resource.cancel();
            }
        }
    }

    #[cfg(test)]
    pub fn resource_count(&self) -> usize {
        self.inner.resources.lock().as_ref().map_or(0, Vec::len)
    }
}

impl<A> fmt::Debug for Subscriber<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recording() -> (Arc<Mutex<Vec<String>>>, Subscriber<i32>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let sub = Subscriber::new(move |ev: Event<i32>| {
            l.lock().push(match ev {
                Event::Next(v) => format!("next {v}"),
                Event::Error(e) => format!("error {e}"),
                Event::Complete => "complete".to_string(),
            })
        });
        (log, sub)
    }

    #[test]
    fn nothing_after_terminal() {
        let (log, sub) = recording();
        assert!(sub.next(1));
        sub.complete();
        assert!(!sub.next(2));
        sub.error(RxError::msg("late"));
        sub.complete();
        assert_eq!(*log.lock(), vec!["next 1", "complete"]);
    }

    #[test]
    fn cancel_is_silent_and_releases_once() {
        let (log, sub) = recording();
        let released = Arc::new(AtomicUsize::new(0));
        let r = released.clone();
        sub.register(Cancelable::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));

        sub.cancel();
        sub.cancel();
        assert!(!sub.next(1));
        assert!(log.lock().is_empty());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_after_close_cancels_immediately() {
        let (_, sub) = recording();
        sub.complete();
        let c = Cancelable::new(|| {});
        sub.register(c.clone());
        assert!(c.is_cancelled());
    }

    #[test]
    fn terminal_releases_resources() {
        let (_, sub) = recording();
        let c = Cancelable::new(|| {});
        let key = sub.register(c.clone());
        let kept = Cancelable::new(|| {});
        sub.register(kept.clone());
        sub.unregister(key);
        assert_eq!(sub.resource_count(), 1);
        sub.complete();
        assert!(!c.is_cancelled());
        assert!(kept.is_cancelled());
    }

    #[test]
    fn handler_can_close_itself() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let sub = Subscriber::new_cyclic(move |me: WeakSubscriber<i32>| {
            move |_ev: Event<i32>| {
                s.fetch_add(1, Ordering::SeqCst);
                me.cancel();
            }
        });
        assert!(!sub.next(1));
        assert!(!sub.next(2));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
