use super::subscriber::Subscriber;
use crate::cancel::Cancelable;
use crate::utils::health_flag::HealthFlag;
use std::fmt::{self, Display};
use std::sync::Arc;
use uuid::Uuid;
use uuid::fmt::Simple;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SubscriptionId {
    raw: Simple,
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionId {
    pub fn new() -> Self {
        Self {
            raw: Uuid::new_v4().simple(),
        }
    }

    #[inline]
    pub fn raw(&self) -> Simple {
        self.raw
    }
}

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Type-erased view of a root subscriber.
pub(crate) trait RootControl: Send + Sync {
    fn cancel(&self);
    fn wait_idle(&self);
}

impl<A: Send + 'static> RootControl for Subscriber<A> {
    fn cancel(&self) {
        Subscriber::cancel(self);
    }

    fn wait_idle(&self) {
        Subscriber::wait_idle(self);
    }
}

/// Handle of a running subscription.
///
/// Dropping the handle does not cancel the subscription; call
/// [`cancel`](Self::cancel) for that.
pub struct Subscription {
    id: SubscriptionId,
    root: Arc<dyn RootControl>,
    active: HealthFlag,
}

impl Subscription {
    pub(crate) fn new(root: Arc<dyn RootControl>, active: HealthFlag) -> Self {
        Self {
            id: SubscriptionId::new(),
            root,
            active,
        }
    }

    #[inline]
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// False once a terminal event was delivered or `cancel` was called.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Stops delivery and releases every resource of the pipeline.
    ///
    /// Idempotent. When it returns, no event is being delivered to the
    /// handler on another thread and none will be delivered afterwards.
    pub fn cancel(&self) {
        cancel_root(&self.root, &self.active);
        tracing::trace!("[Rx] subscription {} cancelled", self.id);
    }

    pub fn as_cancelable(&self) -> Cancelable {
        let root = self.root.clone();
        let active = self.active.clone();
        Cancelable::new(move || cancel_root(&root, &active))
    }
}

fn cancel_root(root: &Arc<dyn RootControl>, active: &HealthFlag) {
    root.cancel();
    root.wait_idle();
    active.down();
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_deactivates_and_silences() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let root = Subscriber::new(move |_ev: Event<u8>| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let sub = Subscription::new(Arc::new(root.clone()), HealthFlag::new(true));
        assert!(sub.is_active());

        root.next(1);
        sub.cancel();
        sub.cancel();
        root.next(2);

        assert!(!sub.is_active());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(SubscriptionId::new(), SubscriptionId::new());
    }
}
