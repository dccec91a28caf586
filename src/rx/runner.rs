use super::subscriber::WeakSubscriber;
use super::{RunCtx, Rx, Subscriber, Subscription, Value};
use crate::error::RxError;
use crate::event::Event;
use crate::scheduler::Scheduler;
use crate::utils::health_flag::HealthFlag;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest a blocked caller sleeps before polling a driven scheduler again.
const IDLE_WAIT: Duration = Duration::from_millis(20);

fn call_guarded(what: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!("[Rx] {what} panicked: {msg}");
    }
}

impl<A: Value> Rx<A> {
    /// Subscribes on the process-wide schedulers.
    pub fn subscribe<F>(&self, on_event: F) -> Subscription
    where
        F: Fn(Event<A>) + Send + Sync + 'static,
    {
        self.subscribe_with(&RunCtx::global(), on_event)
    }

    /// Instantiates the pipeline and starts it. `on_event` sees every value
    /// and at most one terminal event; a panic inside it is logged and
    /// swallowed.
    pub fn subscribe_with<F>(&self, ctx: &RunCtx, on_event: F) -> Subscription
    where
        F: Fn(Event<A>) + Send + Sync + 'static,
    {
        let active = HealthFlag::new(true);
        let flag = active.clone();
        let root = Subscriber::new(move |event: Event<A>| {
            let terminal = event.is_terminal();
            call_guarded("subscriber handler", || on_event(event));
            if terminal {
                flag.down();
            }
        });

        let sub = Subscription::new(Arc::new(root.clone()), active);
        tracing::trace!(
            "[Rx] subscription {} started: {} on {}",
            sub.id(),
            self.describe(),
            ctx.scheduler().name()
        );
        self.subscribe_node(ctx, root);
        sub
    }

    /// Runs for the values only. An error nobody handled is logged.
    pub fn run<F>(&self, on_value: F) -> Subscription
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        self.run_with(&RunCtx::global(), on_value)
    }

    pub fn run_with<F>(&self, ctx: &RunCtx, on_value: F) -> Subscription
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        self.subscribe_with(ctx, move |event| match event {
            Event::Next(v) => on_value(v),
            Event::Error(e) => tracing::error!("[Rx] unhandled error: {e}"),
            Event::Complete => {}
        })
    }

    /// Calls `handler` with the first outcome, be it a value, an error or
    /// completion, then tears the subscription down.
    pub fn run_once<F>(&self, handler: F) -> Subscription
    where
        F: FnOnce(Event<A>) + Send + 'static,
    {
        self.run_once_with(&RunCtx::global(), handler)
    }

    pub fn run_once_with<F>(&self, ctx: &RunCtx, handler: F) -> Subscription
    where
        F: FnOnce(Event<A>) + Send + 'static,
    {
        let active = HealthFlag::new(true);
        let flag = active.clone();
        let slot = Mutex::new(Some(handler));
        let root = Subscriber::new_cyclic(move |me: WeakSubscriber<A>| {
            move |event: Event<A>| {
                let Some(handler) = slot.lock().take() else {
                    return;
                };
                flag.down();
                me.cancel();
                call_guarded("run_once handler", || handler(event));
            }
        });

        let sub = Subscription::new(Arc::new(root.clone()), active);
        tracing::trace!("[Rx] run_once {} started: {}", sub.id(), self.describe());
        self.subscribe_node(ctx, root);
        sub
    }

    /// Blocks until the stream terminates and returns its last value.
    pub fn await_result(&self) -> Result<Option<A>, RxError> {
        self.await_with(&RunCtx::global())
    }

    /// Like [`await_result`](Self::await_result). If the context scheduler
    /// is driven by its caller, the waiting thread drives it.
    pub fn await_with(&self, ctx: &RunCtx) -> Result<Option<A>, RxError> {
        let mut last = None;
        self.drain(ctx, |v| last = Some(v))?;
        Ok(last)
    }

    /// Blocks until the stream terminates and returns every value.
    pub fn collect(&self) -> Result<Vec<A>, RxError> {
        self.collect_with(&RunCtx::global())
    }

    pub fn collect_with(&self, ctx: &RunCtx) -> Result<Vec<A>, RxError> {
        let mut out = Vec::new();
        self.drain(ctx, |v| out.push(v))?;
        Ok(out)
    }

    fn drain(&self, ctx: &RunCtx, mut on_value: impl FnMut(A)) -> Result<(), RxError> {
        let (tx, events) = channel::unbounded();
        let root = Subscriber::new(move |event: Event<A>| {
            let _ = tx.send(event);
        });
        self.subscribe_node(ctx, root);
        // the pipeline now owns the only sender: if every producer goes away
        // without a terminal event, the channel disconnects

        let scheduler = ctx.scheduler();
        loop {
            let event = if scheduler.is_driven() {
                next_driven(&events, scheduler.as_ref())
            } else {
                events.recv().map_err(|_| RxError::not_completed())
            }?;
            match event {
                Event::Next(v) => on_value(v),
                Event::Error(e) => return Err(e),
                Event::Complete => return Ok(()),
            }
        }
    }
}

fn next_driven<A>(events: &Receiver<Event<A>>, scheduler: &dyn Scheduler) -> Result<Event<A>, RxError> {
    loop {
        match events.try_recv() {
            Ok(event) => return Ok(event),
            Err(TryRecvError::Disconnected) => return Err(RxError::not_completed()),
            Err(TryRecvError::Empty) => {}
        }

        if scheduler.run_pending() > 0 {
            continue;
        }

        let wait = scheduler.next_wake().map_or(IDLE_WAIT, |at| {
            at.saturating_duration_since(Instant::now()).min(IDLE_WAIT)
        });
        match events.recv_timeout(wait) {
            Ok(event) => return Ok(event),
            Err(RecvTimeoutError::Disconnected) => return Err(RxError::not_completed()),
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{SingleThreadScheduler, WorkStealingScheduler};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn local() -> (Arc<SingleThreadScheduler>, RunCtx) {
        let sched = Arc::new(SingleThreadScheduler::new("rx-test-runner"));
        (sched.clone(), RunCtx::on(sched))
    }

    #[test]
    fn subscription_goes_inactive_on_complete() {
        let (_, ctx) = local();
        let sub = Rx::from_seq(vec![1, 2]).subscribe_with(&ctx, |_| {});
        assert!(!sub.is_active());
    }

    #[test]
    fn handler_panic_is_contained() {
        let (_, ctx) = local();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        Rx::from_seq(1..=3).subscribe_with(&ctx, move |ev| {
            s.fetch_add(1, Ordering::SeqCst);
            if ev.value() == Some(&2) {
                panic!("boom");
            }
        });
        // three values and the completion
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn run_sees_values_only() {
        let (_, ctx) = local();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        Rx::from_seq(vec![1, 2])
            .concat(&Rx::exception(RxError::msg("tail")))
            .run_with(&ctx, move |v| s.lock().push(v));
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn run_once_takes_first_outcome() {
        let (sched, ctx) = local();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();
        let sub = Rx::interval(Duration::from_millis(2)).run_once_with(&ctx, move |ev| {
            c.lock().push(ev.into_value());
        });
        sched.run_for(Duration::from_millis(30));
        assert_eq!(*calls.lock(), vec![Some(0)]);
        assert!(!sub.is_active());
        assert_eq!(sched.pending(), 0);

        let c = calls.clone();
        Rx::<u64>::empty().run_once_with(&ctx, move |ev| c.lock().push(ev.into_value()));
        assert_eq!(*calls.lock(), vec![Some(0), None]);
    }

    #[test]
    fn await_on_a_pool() {
        let pool = Arc::new(WorkStealingScheduler::new("rx-test-await", 2).unwrap());
        let ctx = RunCtx::on(pool.clone());
        let got = Rx::timer(Duration::from_millis(5)).map(|_| 9).await_with(&ctx).unwrap();
        assert_eq!(got, Some(9));
        assert_eq!(Rx::<u8>::empty().await_with(&ctx).unwrap(), None);
        pool.shutdown();
    }

    #[test]
    fn dropped_callback_unblocks_waiter() {
        let (_, ctx) = local();
        let err = Rx::<u8>::future(|cb| drop(cb)).await_with(&ctx).unwrap_err();
        assert!(err.to_string().contains("dropped"));
    }
}
