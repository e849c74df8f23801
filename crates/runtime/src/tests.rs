use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    error::{ChainError, ReactorError},
    reactor::{Reactor, ReactorConfig},
    worker::TaskId,
};

fn new_reactor() -> Reactor {
    let reactor = Reactor::new(ReactorConfig::default());
    reactor.start().unwrap();
    reactor
}

fn settle<T>(rx: std::sync::mpsc::Receiver<T>) -> T {
    rx.recv_timeout(Duration::from_secs(2))
        .expect("handler should have run within the timeout")
}

#[test]
fn deferred_chain_runs_handlers_in_order_after_terminate() {
    let reactor = new_reactor();
    let (tx, rx) = std::sync::mpsc::channel();

    let d: crate::Deferred<i32> = reactor.new_deferred();
    let chained = d
        .add_value_handler(|v| v + 1)
        .unwrap()
        .add_value_handler(move |v| {
            tx.send(v).unwrap();
            v
        })
        .unwrap();
    chained.terminate().unwrap();

    d.callback(41).unwrap();
    d.terminate().unwrap();

    assert_eq!(settle(rx), 42);
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn error_leg_is_skipped_until_a_handler_recovers() {
    let reactor = new_reactor();
    let (tx, rx) = std::sync::mpsc::channel();

    let d: crate::Deferred<i32> = reactor.new_deferred();
    let chained = d
        .add_value_handler(|v: i32| v * 2) // should be skipped, chain is in error state
        .unwrap()
        .add_error_handler(|_e| -7)
        .unwrap()
        .add_value_handler(move |v| tx.send(v).unwrap())
        .unwrap();
    chained.terminate().unwrap();

    d.errback(ChainError::TimedOut).unwrap();
    d.terminate().unwrap();

    assert_eq!(settle(rx), -7);
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn second_callback_after_triggered_is_rejected() {
    let reactor = new_reactor();
    let d: crate::Deferred<i32> = reactor.new_deferred();
    d.callback(1).unwrap();
    let err = d.callback(2).unwrap_err();
    assert_eq!(err, ReactorError::AlreadyTriggered);
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn restricted_view_rejects_producer_operations_but_forwards_the_rest() {
    let reactor = new_reactor();
    let d: crate::Deferred<i32> = reactor.new_deferred();
    let view = d.restricted();
    assert_eq!(view.callback(1).unwrap_err(), ReactorError::Restricted);
    assert_eq!(view.errback(ChainError::TimedOut).unwrap_err(), ReactorError::Restricted);
    // terminate and set_timeout are consumer-side operations and pass through.
    view.set_timeout(10_000).unwrap();
    view.terminate().unwrap();
    // the unrestricted handle still works
    d.callback(1).unwrap();
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn timeout_fires_before_producer_and_absorbs_late_trigger() {
    let reactor = new_reactor();
    let (tx, rx) = std::sync::mpsc::channel();

    let d: crate::Deferred<i32> = reactor.new_deferred();
    d.set_timeout(10).unwrap();
    let chained = d
        .add_error_handler(move |e| {
            tx.send(format!("{e}")).unwrap();
            0
        })
        .unwrap();
    chained.terminate().unwrap();

    assert_eq!(settle(rx), "timed out");

    // the producer's late trigger is absorbed, not rejected
    d.callback(99).unwrap();
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn splitter_fans_a_value_out_to_every_output_in_request_order() {
    let reactor = new_reactor();
    let splitter = reactor.new_splitter::<i32>();
    let input: crate::Deferred<i32> = reactor.new_deferred();
    splitter.attach_input(input.clone()).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for n in 0..3 {
        let order = order.clone();
        let output = splitter.new_output();
        output
            .add_value_handler(move |v| order.lock().unwrap().push((n, v)))
            .unwrap()
            .terminate()
            .unwrap();
    }

    input.callback(7).unwrap();

    std::thread::sleep(Duration::from_millis(100));
    let collected = order.lock().unwrap().clone();
    assert_eq!(collected, vec![(0, 7), (1, 7), (2, 7)]);
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn splitter_output_requested_after_settling_fires_immediately() {
    let reactor = new_reactor();
    let splitter = reactor.new_splitter::<i32>();
    let input: crate::Deferred<i32> = reactor.new_deferred();
    splitter.attach_input(input.clone()).unwrap();
    input.callback(5).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let (tx, rx) = std::sync::mpsc::channel();
    let late_output = splitter.new_output();
    late_output
        .add_value_handler(move |v| tx.send(v).unwrap())
        .unwrap()
        .terminate()
        .unwrap();

    assert_eq!(settle(rx), 5);
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn concentrator_collects_values_in_attach_order() {
    let reactor = new_reactor();
    let concentrator = reactor.new_concentrator::<i32>();
    let inputs: Vec<crate::Deferred<i32>> = (0..3).map(|_| reactor.new_deferred()).collect();
    for input in &inputs {
        concentrator.add_input(input.clone()).unwrap();
    }
    let output = concentrator.output().unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    output
        .add_value_handler(move |values| tx.send(values).unwrap())
        .unwrap()
        .terminate()
        .unwrap();

    inputs[2].callback(30).unwrap();
    inputs[0].callback(10).unwrap();
    inputs[1].callback(20).unwrap();

    assert_eq!(settle(rx), vec![10, 20, 30]);
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn concentrator_first_error_wins_over_later_success() {
    let reactor = new_reactor();
    let concentrator = reactor.new_concentrator::<i32>();
    let inputs: Vec<crate::Deferred<i32>> = (0..2).map(|_| reactor.new_deferred()).collect();
    for input in &inputs {
        concentrator.add_input(input.clone()).unwrap();
    }
    let output = concentrator.output().unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    output
        .add_error_handler(move |e| {
            tx.send(format!("{e}")).unwrap();
            Vec::new()
        })
        .unwrap()
        .terminate()
        .unwrap();

    let boom = std::io::Error::new(std::io::ErrorKind::Other, "boom");
    inputs[0].errback(ChainError::user(boom)).unwrap();
    inputs[1].callback(1).unwrap();

    assert_eq!(settle(rx), "boom");
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn signal_delivers_to_subscribers_in_priority_order() {
    let reactor = new_reactor();
    let signal = reactor.new_signal::<i32>();
    let order = Arc::new(Mutex::new(Vec::new()));

    let a = order.clone();
    signal.subscribe(0, move |v| a.lock().unwrap().push(("low", *v))).unwrap();
    let b = order.clone();
    signal.subscribe(10, move |v| b.lock().unwrap().push(("high", *v))).unwrap();

    signal.signal(1).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(*order.lock().unwrap(), vec![("high", 1), ("low", 1)]);
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn signal_final_latches_closed() {
    let reactor = new_reactor();
    let signal = reactor.new_signal::<i32>();
    let count = Arc::new(AtomicU64::new(0));
    let c = count.clone();
    signal.subscribe(0, move |_| { c.fetch_add(1, Ordering::SeqCst); }).unwrap();

    signal.signal_final(1).unwrap();
    signal.signal(2).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(count.load(Ordering::SeqCst), 1);
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn run_thread_delivers_its_result_through_a_deferred() {
    let reactor = new_reactor();
    let out = reactor.run_thread(TaskId(1), 6, |input, _cancel| input * 7).unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    out.add_value_handler(move |v| tx.send(v).unwrap())
        .unwrap()
        .terminate()
        .unwrap();

    assert_eq!(settle(rx), 42);
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn run_thread_rejects_resubmission_of_an_in_flight_task_id() {
    let reactor = new_reactor();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let release_rx = Arc::new(Mutex::new(release_rx));
    let rx_for_task = release_rx.clone();
    let first = reactor.run_thread(TaskId(9), (), move |_, _cancel| {
        rx_for_task.lock().unwrap().recv().ok();
    });
    assert!(first.is_ok());

    let second = reactor.run_thread(TaskId(9), (), |_, _cancel| {});
    assert_eq!(second.unwrap_err(), ReactorError::TaskAlreadyRunning);

    release_tx.send(()).unwrap();
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn defer_blocks_until_the_chain_settles() {
    let reactor = new_reactor();
    let d: crate::Deferred<i32> = reactor.new_deferred();
    let handle = reactor.run_thread(TaskId(2), (), {
        let d = d.clone();
        move |_, _cancel| {
            std::thread::sleep(Duration::from_millis(50));
            d.callback(5).ok();
        }
    });
    handle.unwrap().discard();

    assert_eq!(d.defer().unwrap(), 5);
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn defer_from_the_reactor_thread_is_rejected() {
    let reactor = new_reactor();
    let d: crate::Deferred<i32> = reactor.new_deferred();
    let probe: crate::Deferred<()> = reactor.new_deferred();
    let (tx, rx) = std::sync::mpsc::channel();
    let inner = d.clone();
    probe
        .add_value_handler(move |_: ()| {
            tx.send(inner.defer().is_err()).unwrap();
        })
        .unwrap()
        .terminate()
        .unwrap();
    probe.callback(()).unwrap();
    probe.terminate().unwrap();

    assert!(settle(rx));
    d.callback(1).ok();
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn timer_registry_merges_missed_intervals_and_warns_once() {
    use crate::{logging::Logger, timer::TimerRegistry};

    let mut registry = TimerRegistry::default();
    let logger = Logger::new("test");
    let fired = Arc::new(AtomicU64::new(0));
    let f = fired.clone();
    registry.schedule(0, 10, 10, Arc::new(parking_lot::Mutex::new(move || {
        f.fetch_add(1, Ordering::SeqCst);
    })));

    // Far past several missed intervals: should fire once and reschedule
    // past `now`, not once per missed interval.
    let callbacks = registry.drain_expired(105, &logger);
    assert_eq!(callbacks.len(), 1);
    (callbacks[0].lock())();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(registry.next_trigger().unwrap() > 105);
}

#[test]
fn reactor_uptime_is_none_until_started_and_some_after() {
    let reactor = Reactor::new(ReactorConfig::default());
    assert!(reactor.uptime_millis().is_none());
    reactor.start().unwrap();
    assert!(reactor.uptime_millis().is_some());
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn starting_an_already_running_reactor_fails() {
    let reactor = new_reactor();
    assert_eq!(reactor.start().unwrap_err(), ReactorError::AlreadyRunning);
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn run_thread_can_be_resubmitted_once_its_completion_has_drained() {
    let reactor = new_reactor();
    let out = reactor.run_thread(TaskId(11), 1, |input, _cancel| input + 1).unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    out.add_value_handler(move |v| tx.send(v).unwrap())
        .unwrap()
        .terminate()
        .unwrap();
    assert_eq!(settle(rx), 2);

    // give the reactor thread a moment to drain the completion and clear
    // the in-flight marker before resubmitting the same task id.
    std::thread::sleep(Duration::from_millis(50));
    let second = reactor.run_thread(TaskId(11), 10, |input, _cancel| input + 1);
    assert!(second.is_ok());
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn run_thread_with_timeout_errbacks_and_cancels_the_worker() {
    let reactor = new_reactor();
    let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let c = cancelled.clone();
    let out = reactor
        .run_thread_with_timeout(TaskId(12), (), 30, move |_, cancel| {
            for _ in 0..50 {
                if cancel.is_cancelled() {
                    c.store(true, Ordering::SeqCst);
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        })
        .unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    out.add_error_handler(move |e| {
        tx.send(format!("{e}")).unwrap();
    })
    .unwrap()
    .terminate()
    .unwrap();

    assert_eq!(settle(rx), "timed out");
    std::thread::sleep(Duration::from_millis(200));
    assert!(cancelled.load(Ordering::SeqCst));
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn one_shot_timers_fire_within_tolerance_of_their_requested_delay() {
    let reactor = new_reactor();
    let start = std::time::Instant::now();
    let (tx, rx) = std::sync::mpsc::channel();

    for delay in [0u64, 60, 120, 220] {
        let tx = tx.clone();
        reactor
            .run_timer_once(delay, move || {
                tx.send((delay, start.elapsed())).unwrap();
            })
            .unwrap();
    }
    drop(tx);

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }

    for (delay, elapsed) in seen {
        let delta = elapsed.as_millis() as i64 - delay as i64;
        assert!(delta.abs() <= 250, "delay {delay}ms fired with drift {delta}ms");
    }
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn one_shot_timers_fire_in_trigger_order_regardless_of_submission_order() {
    let reactor = new_reactor();
    let (tx, rx) = std::sync::mpsc::channel();

    for delay in [150u64, 20, 80] {
        let tx = tx.clone();
        reactor.run_timer_once(delay, move || tx.send(delay).unwrap()).unwrap();
    }
    drop(tx);

    let order: Vec<u64> = rx.iter().collect();
    assert_eq!(order, vec![20, 80, 150]);
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn cancelling_a_repeating_timer_stops_further_fires() {
    let reactor = new_reactor();
    let count = Arc::new(AtomicU64::new(0));
    let c = count.clone();
    let handle = reactor.run_timer_repeating(20, move || { c.fetch_add(1, Ordering::SeqCst); }).unwrap();

    // let a handful of fires land, then cancel.
    std::thread::sleep(Duration::from_millis(90));
    reactor.cancel_timer(handle);
    let fired_before_cancel = count.load(Ordering::SeqCst);
    assert!(fired_before_cancel >= 2, "expected several fires before cancel, got {fired_before_cancel}");

    // confirm no further fires arrive in a subsequent window.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(count.load(Ordering::SeqCst), fired_before_cancel);
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn restricting_a_restricted_view_is_a_no_op() {
    let reactor = new_reactor();
    let d: crate::Deferred<i32> = reactor.new_deferred();
    let once = d.restricted();
    let twice = once.restricted();
    assert_eq!(twice.callback(1).unwrap_err(), ReactorError::Restricted);
    d.callback(1).unwrap();
    d.terminate().unwrap();
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn setting_a_second_timeout_replaces_the_first() {
    let reactor = new_reactor();
    let d: crate::Deferred<i32> = reactor.new_deferred();
    d.set_timeout(10).unwrap();
    d.set_timeout(10_000).unwrap();
    let chained = d.add_value_handler(|v| v).unwrap();
    chained.terminate().unwrap();

    // the short first timeout must not have fired; the real value wins.
    std::thread::sleep(Duration::from_millis(60));
    d.callback(1).unwrap();
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn cancel_timeout_on_an_untimed_deferred_is_a_no_op() {
    let reactor = new_reactor();
    let d: crate::Deferred<i32> = reactor.new_deferred();
    d.cancel_timeout();
    d.callback(1).unwrap();
    d.terminate().unwrap();
    reactor.stop().unwrap();
    reactor.join();
}

#[test]
fn shutdown_signal_fires_exactly_once_on_stop() {
    let reactor = new_reactor();
    let shutdown = reactor.shutdown_signal();
    let (tx, rx) = std::sync::mpsc::channel();
    shutdown.subscribe(0, move |_| tx.send(()).unwrap()).unwrap();

    reactor.stop().unwrap();
    reactor.join();

    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
}
