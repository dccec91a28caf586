#[cfg(test)]
mod tests {
    use crate::config::RxConfig;
    use crate::error::{ErrorKind, RxError};
    use crate::event::Event;
    use crate::rx::{RunCtx, Rx};
    use crate::scheduler::{Scheduler, SingleThreadScheduler, WorkStealingScheduler};
    use crossbeam::channel;
    use parking_lot::Mutex;
    use std::fmt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn local() -> (Arc<SingleThreadScheduler>, RunCtx) {
        let sched = Arc::new(SingleThreadScheduler::new("rx-e2e"));
        (sched.clone(), RunCtx::on(sched))
    }

    fn pool(name: &str) -> (Arc<WorkStealingScheduler>, RunCtx) {
        let sched = Arc::new(WorkStealingScheduler::new(name, 2).unwrap());
        (sched.clone(), RunCtx::on(sched))
    }

    #[derive(Debug)]
    struct NetworkError;

    impl fmt::Display for NetworkError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "network unreachable")
        }
    }

    impl std::error::Error for NetworkError {}

    // ---- sources and plain operators

    #[test]
    fn from_seq_is_identity() {
        let (_, ctx) = local();
        for seq in [vec![], vec![7], vec![3, 1, 2], (0..100).collect::<Vec<i32>>()] {
            assert_eq!(Rx::from_seq(seq.clone()).collect_with(&ctx).unwrap(), seq);
        }
    }

    #[test]
    fn filter_then_map() {
        let (_, ctx) = local();
        let out = Rx::from_seq(1..=10)
            .filter(|v| v % 2 == 0)
            .map(|v| v * 10)
            .collect_with(&ctx)
            .unwrap();
        assert_eq!(out, vec![20, 40, 60, 80, 100]);
    }

    #[test]
    fn zip_pairs_in_order() {
        let (_, ctx) = local();
        let out = Rx::from_seq(vec![1, 2, 3])
            .zip(&Rx::from_seq(vec!["a", "b", "c"]))
            .collect_with(&ctx)
            .unwrap();
        assert_eq!(out, vec![(1, "a"), (2, "b"), (3, "c")]);
    }

    #[test]
    fn joined_variables_track_latest() {
        let (_, ctx) = local();
        let x = Rx::variable(1);
        let y = Rx::variable(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = x.rx().join(&y.rx()).subscribe_with(&ctx, move |ev| {
            if let Some(pair) = ev.into_value() {
                s.lock().push(pair);
            }
        });
        assert_eq!(*seen.lock(), vec![(1, 2)]);
        x.set(10);
        y.set(20);
        assert_eq!(*seen.lock(), vec![(1, 2), (10, 2), (10, 20)]);
        sub.cancel();
        assert_eq!(x.subscriber_count(), 0);
        assert_eq!(y.subscriber_count(), 0);
    }

    #[test]
    fn typed_recover_only_catches_its_type() {
        let (_, ctx) = local();
        let recovered = Rx::<u32>::exception(RxError::new(NetworkError))
            .recover_on(|_: &NetworkError| 0)
            .collect_with(&ctx)
            .unwrap();
        assert_eq!(recovered, vec![0]);

        let err = Rx::<u32>::exception(RxError::msg("disk full"))
            .recover_on(|_: &NetworkError| 0)
            .collect_with(&ctx)
            .unwrap_err();
        assert!(!err.is::<NetworkError>());
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn panicking_map_yields_one_error() {
        let (_, ctx) = local();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        Rx::from_seq(1..=5)
            .map(|v| if v == 3 { panic!("bad value {v}") } else { v })
            .subscribe_with(&ctx, move |ev| e.lock().push(ev));

        let events = events.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].value(), Some(&1));
        assert_eq!(events[1].value(), Some(&2));
        match &events[2] {
            Event::Error(err) => assert_eq!(err.kind(), ErrorKind::Operator),
            other => panic!("expected an error, got {other:?}"),
        }
    }

    // ---- cancellation

    #[test]
    fn cancel_twice_is_cancel_once() {
        let (sched, ctx) = pool("rx-e2e-cancel");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = Rx::interval(Duration::from_millis(2)).subscribe_with(&ctx, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        sub.cancel();
        let after_first = hits.load(Ordering::SeqCst);
        sub.cancel();
        thread::sleep(Duration::from_millis(30));

        assert!(after_first > 0);
        assert_eq!(hits.load(Ordering::SeqCst), after_first);
        assert!(!sub.is_active());
        sched.shutdown();
    }

    #[test]
    fn take_stops_an_infinite_source() {
        let (sched, ctx) = local();
        let produced = Arc::new(AtomicUsize::new(0));
        let p = produced.clone();
        let out = Rx::interval(Duration::from_millis(1))
            .tap(move |_| {
                p.fetch_add(1, Ordering::SeqCst);
            })
            .take(3)
            .collect_with(&ctx)
            .unwrap();
        sched.run_for(Duration::from_millis(10));

        assert_eq!(out, vec![0, 1, 2]);
        assert_eq!(produced.load(Ordering::SeqCst), 3);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn timer_cancelled_before_firing() {
        let (sched, ctx) = pool("rx-e2e-timer");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let sub = Rx::timer(Duration::from_millis(30)).subscribe_with(&ctx, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        sub.cancel();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sched.shutdown();
    }

    // ---- sharing

    #[test]
    fn cache_runs_side_effect_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let cached = Rx::from_seq(vec![()])
            .map(move |_| c.fetch_add(1, Ordering::SeqCst) + 1)
            .cache();

        let (sched, ctx) = pool("rx-e2e-cache");
        for _ in 0..5 {
            assert_eq!(cached.await_with(&ctx).unwrap(), Some(1));
        }
        for _ in 0..5 {
            cached.run_once_with(&ctx, |_| {});
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        sched.shutdown();
    }

    #[test]
    fn cache_concurrent_first_subscribers_share_one_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let cached = Rx::timer(Duration::from_millis(20))
            .map(move |_| c.fetch_add(1, Ordering::SeqCst) + 1)
            .cache()
            .into_rx();

        let (sched, ctx) = pool("rx-e2e-cache-race");
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (cached, ctx, barrier) = (cached.clone(), ctx.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    cached.await_with(&ctx).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), Some(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        sched.shutdown();
    }

    #[test]
    fn variable_under_concurrent_set_and_cancel() {
        let (sched, ctx) = pool("rx-e2e-var-race");
        let var = Rx::variable(0u64);

        // a steady subscriber sees every value, in order
        let steady = Arc::new(Mutex::new(Vec::new()));
        let s = steady.clone();
        let steady_sub = var.rx().subscribe_with(&ctx, move |ev| {
            if let Some(v) = ev.into_value() {
                s.lock().push(v);
            }
        });

        let writer = {
            let var = var.clone();
            thread::spawn(move || {
                for v in 1..=2_000u64 {
                    var.set(v);
                }
            })
        };

        // churning subscribers must go quiet once cancel returns
        let churn = {
            let (var, ctx) = (var.clone(), ctx.clone());
            thread::spawn(move || {
                for _ in 0..200 {
                    let hits = Arc::new(AtomicUsize::new(0));
                    let h = hits.clone();
                    let sub = var.rx().subscribe_with(&ctx, move |_| {
                        h.fetch_add(1, Ordering::SeqCst);
                    });
                    sub.cancel();
                    let after = hits.load(Ordering::SeqCst);
                    thread::yield_now();
                    assert_eq!(hits.load(Ordering::SeqCst), after);
                }
            })
        };

        writer.join().unwrap();
        churn.join().unwrap();
        steady_sub.cancel();

        let steady = steady.lock();
        assert_eq!(steady.len(), 2_001);
        assert!(steady.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(var.subscriber_count(), 0);
        sched.shutdown();
    }

    // ---- time

    #[test]
    fn interval_take_five_on_the_default_pool() {
        let (tx, rx) = channel::unbounded();
        let start = Instant::now();
        Rx::interval(Duration::from_millis(100))
            .take(5)
            .subscribe(move |ev| {
                let _ = tx.send((Instant::now(), ev));
            });

        let mut stamps = Vec::new();
        let mut values = Vec::new();
        let mut completed = false;
        while let Ok((at, ev)) = rx.recv_timeout(Duration::from_millis(600)) {
            match ev {
                Event::Next(v) => {
                    values.push(v);
                    stamps.push(at);
                }
                Event::Complete => {
                    completed = true;
                    break;
                }
                Event::Error(e) => panic!("unexpected error: {e}"),
            }
        }

        assert!(completed);
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert!(stamps[0].duration_since(start) >= Duration::from_millis(90));
        for pair in stamps.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= Duration::from_millis(50), "gap too short: {gap:?}");
            assert!(gap <= Duration::from_millis(250), "gap too long: {gap:?}");
        }
    }

    #[test]
    fn timeout_race_both_ways() {
        let (sched, ctx) = pool("rx-e2e-timeout");
        let err = Rx::timer(Duration::from_millis(300))
            .timeout(Duration::from_millis(20))
            .await_with(&ctx)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let ok = Rx::timer(Duration::from_millis(5))
            .map(|_| "fast")
            .timeout(Duration::from_secs(5))
            .await_with(&ctx)
            .unwrap();
        assert_eq!(ok, Some("fast"));
        sched.shutdown();
    }

    #[test]
    fn throttle_first_spaces_values() {
        let (_, ctx) = local();
        let out = Rx::interval(Duration::from_millis(5))
            .throttle_first(Duration::from_millis(30))
            .take(3)
            .collect_with(&ctx)
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], 0);
        for pair in out.windows(2) {
            assert!(pair[1] - pair[0] >= 3, "values too close: {out:?}");
        }
    }

    #[test]
    fn flat_map_completes_after_every_inner() {
        let (_, ctx) = local();
        let out = Rx::from_seq(vec![1u64, 2, 3])
            .flat_map(|v| Rx::timer(Duration::from_millis((4 - v) * 10)).map(move |_| v))
            .collect_with(&ctx)
            .unwrap();
        assert_eq!(out, vec![3, 2, 1]);
    }

    // ---- runner and schedulers

    #[test]
    fn run_once_sees_a_single_outcome() {
        let (sched, ctx) = pool("rx-e2e-once");
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = calls.clone();
        let sub = Rx::from_seq(vec![1, 2, 3]).run_once_with(&ctx, move |ev| {
            c.lock().push(ev.into_value());
        });
        assert_eq!(*calls.lock(), vec![Some(1)]);
        assert!(!sub.is_active());

        let c = calls.clone();
        Rx::<i32>::exception(RxError::msg("nope")).run_once_with(&ctx, move |ev| {
            c.lock().push(ev.into_value());
        });
        assert_eq!(*calls.lock(), vec![Some(1), None]);
        sched.shutdown();
    }

    #[test]
    fn shut_down_scheduler_rejects() {
        let (sched, ctx) = local();
        sched.shutdown();
        assert!(sched.is_shutdown());
        assert!(sched.execute(Box::new(|| {})).is_err());

        let err = Rx::timer(Duration::from_millis(1)).await_with(&ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);

        let (workers, ctx) = pool("rx-e2e-reject");
        workers.shutdown();
        let err = Rx::interval(Duration::from_millis(1)).await_with(&ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
    }

    #[test]
    fn bootstrap_without_logger() {
        let cfg = RxConfig::default();
        assert!(crate::bootstrap(&cfg).unwrap().is_none());
        assert!(crate::scheduler::default_scheduler().parallelism() >= 1);
    }
}
