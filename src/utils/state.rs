use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free snapshot cell with versioning.
///
/// Internally uses [`ArcSwap`] for atomic snapshot replacement and an
/// `AtomicU64` sequence counter. Readers never block writers.
pub struct SnapshotCell<T> {
    snap: ArcSwap<T>,
    seq: CachePadded<AtomicU64>,
}

impl<T> SnapshotCell<T> {
    pub fn new(init: T) -> Self {
        Self {
            snap: ArcSwap::from(Arc::new(init)),
            seq: CachePadded::new(AtomicU64::new(1)),
        }
    }

    /// Publish a new snapshot and return its sequence number.
    #[inline]
    pub fn publish(&self, next: T) -> u64 {
        self.snap.store(Arc::new(next));
        self.seq.fetch_add(1, Ordering::Release) + 1
    }

    /// Temporary borrow of the current snapshot; keep it on the stack.
    #[inline]
    pub fn peek(&self) -> arc_swap::Guard<Arc<T>> {
        self.snap.load()
    }

    #[inline]
    pub fn load(&self) -> Arc<T> {
        self.snap.load_full()
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }
}

impl<T: fmt::Debug> fmt::Debug for SnapshotCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCell")
            .field("value", &**self.peek())
            .field("seq", &self.seq())
            .finish()
    }
}
