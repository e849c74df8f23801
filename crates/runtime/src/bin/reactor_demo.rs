//! A small runnable demonstration of the reactor: schedules a repeating
//! timer, runs a worker task, and fans a value out through a splitter,
//! logging each step as it happens.

use std::time::Duration;

use reactor_runtime::{worker::TaskId, Reactor, ReactorConfig};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let reactor = Reactor::new(ReactorConfig::default());
    reactor.start().expect("reactor should start cleanly");

    let shutdown = reactor.shutdown_signal();
    shutdown
        .subscribe(0, |_| tracing::info!("reactor shutdown signal fired"))
        .expect("subscribing before any broadcast must succeed");

    let mut ticks = 0u32;
    reactor
        .run_timer_repeating(200, move || {
            ticks += 1;
            tracing::info!(ticks, "tick");
        })
        .expect("reactor is running");

    let worker_result = reactor
        .run_thread(TaskId(1), 21, |input, _cancel| input * 2)
        .expect("reactor is running");
    worker_result
        .add_value_handler(|value| tracing::info!(value, "worker task produced a value"))
        .expect("chain not yet terminated")
        .terminate()
        .expect("chain not yet terminated");

    let splitter = reactor.new_splitter::<&'static str>();
    let input: reactor_runtime::Deferred<&'static str> = reactor.new_deferred();
    splitter.attach_input(input.clone()).expect("first input attach");
    for n in 0..3 {
        let output = splitter.new_output();
        output
            .add_value_handler(move |v| tracing::info!(branch = n, value = v, "splitter output"))
            .expect("chain not yet terminated")
            .terminate()
            .expect("chain not yet terminated");
    }
    input.callback("hello").expect("input not yet triggered");

    std::thread::sleep(Duration::from_millis(900));
    reactor.stop().expect("reactor is running");
    reactor.join();
}
