use super::{Node, NodeInfo, NodeKind, RunCtx, Rx, Subscriber, Value};
use crate::cancel::Cancelable;
use crate::error::RxError;
use crate::event::Event;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

struct QueueState<A> {
    buffer: VecDeque<A>,
    subs: Vec<(u64, Subscriber<A>)>,
    next_id: u64,
    // Some(None) = completed, Some(Some(e)) = failed
    terminal: Option<Option<RxError>>,
}

type SharedQueue<A> = Arc<ReentrantMutex<RefCell<QueueState<A>>>>;

/// Source fed from the outside.
///
/// Values added while nobody is subscribed are buffered and flushed to the
/// next subscriber.
pub struct RxQueue<A: Value> {
    state: SharedQueue<A>,
}

impl<A: Value> Clone for RxQueue<A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<A: Value> Default for RxQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Value> RxQueue<A> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ReentrantMutex::new(RefCell::new(QueueState {
                buffer: VecDeque::new(),
                subs: Vec::new(),
                next_id: 0,
                terminal: None,
            }))),
        }
    }

    pub fn add(&self, value: A) {
        let guard = self.state.lock();
        let subs: Vec<Subscriber<A>> = {
            let mut s = guard.borrow_mut();
            if s.terminal.is_some() {
                tracing::debug!("[Rx] value added to a finished queue was dropped");
                return;
            }
            s.subs.retain(|(_, sub)| !sub.is_closed());
            if s.subs.is_empty() {
                s.buffer.push_back(value);
                return;
            }
            s.subs.iter().map(|(_, sub)| sub.clone()).collect()
        };
        for sub in subs {
            sub.next(value.clone());
        }
    }

    pub fn complete(&self) {
        self.finish(None);
    }

    pub fn error(&self, err: impl Into<RxError>) {
        self.finish(Some(err.into()));
    }

    /// Values waiting for a subscriber.
    pub fn buffered(&self) -> usize {
        self.state.lock().borrow().buffer.len()
    }

    pub fn rx(&self) -> Rx<A> {
        Rx::from_node(QueueNode {
            state: self.state.clone(),
        })
    }

    fn finish(&self, error: Option<RxError>) {
        let guard = self.state.lock();
        let subs = {
            let mut s = guard.borrow_mut();
            if s.terminal.is_some() {
                return;
            }
            s.terminal = Some(error.clone());
            std::mem::take(&mut s.subs)
        };
        let event = match error {
            Some(e) => Event::Error(e),
            None => Event::Complete,
        };
        for (_, sub) in subs {
            sub.emit(event.clone());
        }
    }
}

struct QueueNode<A> {
    state: SharedQueue<A>,
}

fn remove_sub<A: Value>(state: &Weak<ReentrantMutex<RefCell<QueueState<A>>>>, id: u64) {
    if let Some(state) = state.upgrade() {
        let guard = state.lock();
        guard.borrow_mut().subs.retain(|(sid, _)| *sid != id);
    }
}

impl<A: Value> Node<A> for QueueNode<A> {
    fn describe(&self) -> NodeInfo {
        NodeInfo::leaf(NodeKind::Queue)
    }

    fn subscribe(&self, _ctx: &RunCtx, sink: Subscriber<A>) {
        let guard = self.state.lock();

        let buffered: Vec<A> = guard.borrow_mut().buffer.drain(..).collect();
        for v in buffered {
            if !sink.next(v) {
                return;
            }
        }

        let terminal = guard.borrow().terminal.clone();
        if let Some(error) = terminal {
            match error {
                Some(e) => sink.error(e),
                None => sink.complete(),
            }
            return;
        }

        let id = {
            let mut s = guard.borrow_mut();
            let id = s.next_id;
            s.next_id += 1;
            s.subs.push((id, sink.clone()));
            id
        };
        let weak = Arc::downgrade(&self.state);
        sink.register(Cancelable::new(move || remove_sub(&weak, id)));
    }
}

impl<A: Value> Rx<A> {
    pub fn queue() -> RxQueue<A> {
        RxQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SingleThreadScheduler;
    use parking_lot::Mutex;

    fn ctx() -> RunCtx {
        RunCtx::on(Arc::new(SingleThreadScheduler::new("rx-test-queue")))
    }

    #[test]
    fn buffered_values_flush_to_first_subscriber() {
        let queue = Rx::queue();
        queue.add(1);
        queue.add(2);
        assert_eq!(queue.buffered(), 2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = queue.rx().subscribe_with(&ctx(), move |ev| s.lock().push(ev.into_value()));
        queue.add(3);
        queue.complete();
        assert_eq!(*seen.lock(), vec![Some(1), Some(2), Some(3), None]);
        assert_eq!(queue.buffered(), 0);
        assert!(!sub.is_active());
    }

    #[test]
    fn late_subscriber_sees_terminal() {
        let queue: RxQueue<u8> = Rx::queue();
        queue.error(RxError::msg("closed"));
        queue.add(1);
        assert!(queue.rx().collect_with(&ctx()).is_err());
    }

    #[test]
    fn cancelled_subscriber_is_removed() {
        let queue = Rx::queue();
        let sub = queue.rx().subscribe_with(&ctx(), |_| {});
        sub.cancel();
        queue.add(5);
        // nobody listens anymore, so the value waits for the next one
        assert_eq!(queue.buffered(), 1);
        let out = queue.rx().take(1).collect_with(&ctx()).unwrap();
        assert_eq!(out, vec![5]);
    }
}
