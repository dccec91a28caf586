use parking_lot::Mutex;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type CancelAction = Box<dyn FnOnce() + Send + 'static>;

struct CancelableState {
    cancelled: AtomicBool,
    action: Mutex<Option<CancelAction>>,
}

/// Composable, idempotent cancellation handle.
///
/// Wraps a cancellation action that runs at most once, no matter how
/// many clones call [`cancel`](Self::cancel) or from which thread.
#[derive(Clone)]
pub struct Cancelable {
    state: Option<Arc<CancelableState>>,
}

impl Cancelable {
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            state: Some(Arc::new(CancelableState {
                cancelled: AtomicBool::new(false),
                action: Mutex::new(Some(Box::new(action))),
            })),
        }
    }

    /// A cancelable with nothing to cancel.
    #[inline]
    pub fn empty() -> Self {
        Self { state: None }
    }

    /// Cancels both `a` and `b`, in that order.
    pub fn compose(a: Cancelable, b: Cancelable) -> Self {
        match (&a.state, &b.state) {
            (None, _) => b,
            (_, None) => a,
            _ => Self::new(move || {
                a.cancel();
                b.cancel();
            }),
        }
    }

    pub fn all<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Cancelable>,
    {
        let items: Vec<Cancelable> = items.into_iter().filter(|c| c.state.is_some()).collect();
        match items.len() {
            0 => Self::empty(),
            1 => items.into_iter().next().unwrap_or_else(Self::empty),
            _ => Self::new(move || {
                for c in items {
                    c.cancel();
                }
            }),
        }
    }

    pub fn cancel(&self) {
        let Some(state) = &self.state else {
            return;
        };
        if state.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let action = state.action.lock().take();
        if let Some(action) = action {
            action();
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        match &self.state {
            Some(state) => state.cancelled.load(Ordering::Acquire),
            None => false,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
    }
}

impl Default for Cancelable {
    fn default() -> Self {
        Self::empty()
    }
}

impl Debug for Cancelable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancelable")
            .field("empty", &self.is_empty())
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

impl From<CancelToken> for Cancelable {
    fn from(token: CancelToken) -> Self {
        Cancelable::new(move || token.cancel())
    }
}

/// Internal cancellation state, shared via [`Arc`].
/// Cancelling a parent cancels all of its descendants.
struct CancelState {
    cancelled: AtomicBool,
    parent: Option<Arc<CancelState>>,
}

impl CancelState {
    #[inline]
    fn new_root() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            parent: None,
        })
    }

    #[inline]
    fn child_of(parent: Arc<CancelState>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            parent: Some(parent),
        })
    }

    #[inline]
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        if let Some(ref p) = self.parent {
            return p.is_cancelled();
        }
        false
    }
}

/// Hierarchical cancellation flag.
///
/// Schedulers hand every pending task a child of their root token, so a
/// single `cancel` on the root drops all queued and timed work at shutdown.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    #[inline]
    pub fn new_root() -> Self {
        Self {
            state: CancelState::new_root(),
        }
    }

    /// Cancel this token (and, transitively, all of its children).
    #[inline]
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Check if this token (or any ancestor) has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    #[inline]
    pub fn new_child(&self) -> Self {
        Self {
            state: CancelState::child_of(self.state.clone()),
        }
    }
}
