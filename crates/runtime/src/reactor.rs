//! reactor

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    clock::{Clock, MonotonicClock},
    concentrator::DeferredConcentrator,
    deferred::{AnyBox, Deferred, DeferredCore},
    error::ReactorError,
    logging::{Logger, Severity},
    signal::Signal,
    splitter::DeferredSplitter,
    timer::{TimerHandle, TimerRegistry},
    worker::{CancelToken, TaskId, TaskResult, WorkerSlot},
};

static LOGGER: Logger = Logger::new("reactor.core");

const STOPPED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;

/// Tunables for the reactor's worker pool.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// How many idle worker threads the pool keeps alive between tasks
    /// before killing the thread outright. Matches the design's default of
    /// five idle workers.
    pub idle_worker_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            idle_worker_capacity: 5,
        }
    }
}

struct Shared {
    signal_queue: VecDeque<Box<dyn FnOnce() + Send>>,
    deferred_queue: VecDeque<Arc<DeferredCore>>,
    timers: TimerRegistry,
    idle_workers: VecDeque<Arc<WorkerSlot>>,
    running_workers: HashMap<TaskId, Arc<WorkerSlot>>,
    in_flight: HashSet<TaskId>,
    completed: VecDeque<(TaskId, Arc<DeferredCore>, TaskResult, Arc<WorkerSlot>)>,
    next_worker_slot: usize,
    worker_join_handles: Vec<JoinHandle<()>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            signal_queue: VecDeque::new(),
            deferred_queue: VecDeque::new(),
            timers: TimerRegistry::default(),
            idle_workers: VecDeque::new(),
            running_workers: HashMap::new(),
            in_flight: HashSet::new(),
            completed: VecDeque::new(),
            next_worker_slot: 0,
            worker_join_handles: Vec::new(),
        }
    }

    fn is_quiescent(&self) -> bool {
        self.signal_queue.is_empty()
            && self.deferred_queue.is_empty()
            && self.completed.is_empty()
            && self.running_workers.is_empty()
    }
}

struct ReactorCore {
    shared: Mutex<Shared>,
    cond: Condvar,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    reactor_thread_id: Mutex<Option<ThreadId>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    config: ReactorConfig,
    started_at_millis: AtomicU64,
    shutdown_signal: Signal<i32>,
    shutdown_signal_fired: std::sync::atomic::AtomicBool,
}

/// A cheap, cloneable reference to the reactor, handed to every `Deferred`,
/// `Signal`, splitter and concentrator so they can schedule work without
/// holding the reactor alive themselves. Holds only a `Weak` reference: a
/// `Deferred` that outlives its reactor simply finds it gone and treats any
/// further scheduling as a no-op, rather than keeping the reactor pinned in
/// memory.
#[derive(Clone)]
pub struct ReactorHandle(Weak<ReactorCore>);

impl ReactorHandle {
    fn upgrade(&self) -> Option<Arc<ReactorCore>> {
        self.0.upgrade()
    }

    pub(crate) fn enqueue_deferred(&self, core: Arc<DeferredCore>) {
        let Some(reactor) = self.upgrade() else { return };
        let mut shared = reactor.shared.lock();
        shared.deferred_queue.push_back(core);
        drop(shared);
        reactor.cond.notify_all();
    }

    pub(crate) fn enqueue_signal(&self, broadcast: Box<dyn FnOnce() + Send>) {
        let Some(reactor) = self.upgrade() else { return };
        let mut shared = reactor.shared.lock();
        shared.signal_queue.push_back(broadcast);
        drop(shared);
        reactor.cond.notify_all();
    }

    pub(crate) fn schedule_one_shot(
        &self,
        delay_millis: u64,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerHandle {
        let Some(reactor) = self.upgrade() else {
            return TimerHandle(u64::MAX);
        };
        let now = reactor.clock.now_millis();
        let mut shared = reactor.shared.lock();
        let handle = shared
            .timers
            .schedule(now, delay_millis, 0, Arc::new(Mutex::new(callback)));
        drop(shared);
        reactor.cond.notify_all();
        handle
    }

    pub(crate) fn cancel_timer(&self, handle: TimerHandle) {
        let Some(reactor) = self.upgrade() else { return };
        let mut shared = reactor.shared.lock();
        shared.timers.cancel(handle);
    }

    pub(crate) fn cancel_task(&self, task_id: TaskId) {
        let Some(reactor) = self.upgrade() else { return };
        let shared = reactor.shared.lock();
        if let Some(slot) = shared.running_workers.get(&task_id) {
            slot.request_cancel();
        }
    }

    pub(crate) fn is_reactor_thread(&self) -> bool {
        let Some(reactor) = self.upgrade() else {
            return false;
        };
        reactor
            .reactor_thread_id
            .lock()
            .map(|id| id == thread::current().id())
            .unwrap_or(false)
    }

    /// Called by a worker thread (never the reactor thread) when its task
    /// finishes. Workers only ever touch the shared monitor for this single
    /// handshake; everything else about a task runs lock-free on the worker
    /// thread.
    pub(crate) fn worker_completed(
        &self,
        task_id: TaskId,
        sink: Arc<DeferredCore>,
        result: TaskResult,
        slot: Arc<WorkerSlot>,
    ) {
        let Some(reactor) = self.upgrade() else { return };
        let mut shared = reactor.shared.lock();
        shared.running_workers.remove(&task_id);
        shared.completed.push_back((task_id, sink, result, slot));
        drop(shared);
        reactor.cond.notify_all();
    }
}

/// The single-threaded event-processing core: a reactor drains, in fixed
/// order each iteration, its signal broadcast queue, its ready-deferred
/// queue, its completed-worker queue, and any timers that have expired,
/// with every user callback running serialized on one dedicated reactor
/// thread.
pub struct Reactor {
    core: Arc<ReactorCore>,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()), config)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, config: ReactorConfig) -> Self {
        let core = Arc::new_cyclic(|weak: &Weak<ReactorCore>| ReactorCore {
            shared: Mutex::new(Shared::new()),
            cond: Condvar::new(),
            clock,
            state: AtomicU8::new(STOPPED),
            reactor_thread_id: Mutex::new(None),
            loop_handle: Mutex::new(None),
            config,
            started_at_millis: AtomicU64::new(0),
            shutdown_signal: Signal::new(ReactorHandle(weak.clone())),
            shutdown_signal_fired: std::sync::atomic::AtomicBool::new(false),
        });
        Self { core }
    }

    fn handle(&self) -> ReactorHandle {
        ReactorHandle(Arc::downgrade(&self.core))
    }

    pub fn is_running(&self) -> bool {
        self.core.state.load(Ordering::Acquire) == RUNNING
    }

    pub fn uptime_millis(&self) -> Option<u64> {
        if self.is_running() {
            let started = self.core.started_at_millis.load(Ordering::Acquire);
            Some(self.core.clock.now_millis().saturating_sub(started))
        } else {
            None
        }
    }

    /// A signal that fires exactly once, with an unused payload, when the
    /// reactor finishes stopping. Only a restricted view is returned: only
    /// the reactor itself may broadcast on it.
    pub fn shutdown_signal(&self) -> Signal<i32> {
        self.core.shutdown_signal.restricted()
    }

    pub fn start(&self) -> Result<(), ReactorError> {
        if self
            .core
            .state
            .compare_exchange(STOPPED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ReactorError::AlreadyRunning);
        }
        self.core
            .started_at_millis
            .store(self.core.clock.now_millis(), Ordering::Release);
        let core = self.core.clone();
        let join = thread::Builder::new()
            .name("reactor-loop".to_string())
            .spawn(move || run_loop(core))
            .expect("failed to spawn reactor thread");
        *self.core.loop_handle.lock() = Some(join);
        LOGGER.log(Severity::Info, "reactor started");
        Ok(())
    }

    /// Requests an orderly shutdown. Returns immediately; call [`Reactor::join`]
    /// to block until the reactor thread has fully drained its queues and
    /// exited.
    pub fn stop(&self) -> Result<(), ReactorError> {
        if self
            .core
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ReactorError::NotRunning);
        }
        let mut shared = self.core.shared.lock();
        for slot in shared.running_workers.values() {
            slot.request_cancel();
        }
        let idle: Vec<_> = shared.idle_workers.drain(..).collect();
        drop(shared);
        for slot in idle {
            slot.kill();
        }
        self.core.cond.notify_all();
        Ok(())
    }

    pub fn join(&self) {
        let handle = self.core.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn new_deferred<T: Send + 'static>(&self) -> Deferred<T> {
        Deferred::new_internal(self.handle())
    }

    pub fn new_splitter<T: Clone + Send + 'static>(&self) -> DeferredSplitter<T> {
        DeferredSplitter::new(self.handle())
    }

    pub fn new_concentrator<T: Send + 'static>(&self) -> DeferredConcentrator<T> {
        DeferredConcentrator::new(self.handle())
    }

    pub fn new_signal<T: Clone + Send + 'static>(&self) -> Signal<T> {
        Signal::new(self.handle())
    }

    pub fn run_timer_once(
        &self,
        delay_millis: u64,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerHandle, ReactorError> {
        if !self.is_running() {
            return Err(ReactorError::NotRunning);
        }
        Ok(self.handle().schedule_one_shot(delay_millis, callback))
    }

    pub fn run_timer_repeating(
        &self,
        interval_millis: u32,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerHandle, ReactorError> {
        if !self.is_running() {
            return Err(ReactorError::NotRunning);
        }
        let now = self.core.clock.now_millis();
        let mut shared = self.core.shared.lock();
        let handle = shared.timers.schedule(
            now,
            interval_millis as u64,
            interval_millis,
            Arc::new(Mutex::new(callback)),
        );
        drop(shared);
        self.core.cond.notify_all();
        Ok(handle)
    }

    pub fn cancel_timer(&self, handle: TimerHandle) {
        self.handle().cancel_timer(handle);
    }

    /// Submits `task` to the worker pool, identified by `task_id`. Fails if
    /// a task with the same id is still running, or its completion has not
    /// yet been drained onto the reactor thread.
    pub fn run_thread<I, O, F>(
        &self,
        task_id: TaskId,
        input: I,
        task: F,
    ) -> Result<Deferred<O>, ReactorError>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: FnOnce(I, CancelToken) -> O + Send + 'static,
    {
        if !self.is_running() {
            return Err(ReactorError::NotRunning);
        }
        let mut shared = self.core.shared.lock();
        if shared.in_flight.contains(&task_id) {
            return Err(ReactorError::TaskAlreadyRunning);
        }
        shared.in_flight.insert(task_id);

        let slot = match shared.idle_workers.pop_front() {
            Some(slot) => slot,
            None => {
                let index = shared.next_worker_slot;
                shared.next_worker_slot += 1;
                let (slot, join) = WorkerSlot::spawn(index, self.handle());
                shared.worker_join_handles.push(join);
                slot
            }
        };
        shared.running_workers.insert(task_id, slot.clone());
        drop(shared);

        let out = Deferred::<O>::new_internal(self.handle());
        let sink = out.core().clone();
        let boxed_task: Box<dyn FnOnce(CancelToken) -> TaskResult + Send> =
            Box::new(move |cancel| {
                let value = task(input, cancel.clone());
                if cancel.is_cancelled() {
                    Err(crate::error::ChainError::Interrupted)
                } else {
                    Ok(Box::new(value) as AnyBox)
                }
            });
        slot.dispatch(task_id, sink, boxed_task);
        Ok(out)
    }

    /// Like [`Reactor::run_thread`], but attaches a timeout: if the task has
    /// not completed by `timeout_millis`, the returned deferred's error leg
    /// sees [`crate::error::ChainError::TimedOut`] and the worker carrying
    /// `task_id` is sent a cooperative cancellation request.
    pub fn run_thread_with_timeout<I, O, F>(
        &self,
        task_id: TaskId,
        input: I,
        timeout_millis: u64,
        task: F,
    ) -> Result<Deferred<O>, ReactorError>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: FnOnce(I, CancelToken) -> O + Send + 'static,
    {
        let out = self.run_thread(task_id, input, task)?;
        out.set_timeout(timeout_millis)?;
        let reactor = self.handle();
        out.add_handler(Ok, move |e| {
            if matches!(e, crate::error::ChainError::TimedOut) {
                reactor.cancel_task(task_id);
            }
            Err(e)
        })
    }

    /// Cooperatively requests cancellation of a running task. Has no effect
    /// if `task_id` is not currently running; the task itself decides
    /// whether and how quickly to honor [`CancelToken::is_cancelled`].
    pub fn cancel_thread(&self, task_id: TaskId) -> Result<(), ReactorError> {
        let shared = self.core.shared.lock();
        match shared.running_workers.get(&task_id) {
            Some(slot) => {
                slot.request_cancel();
                Ok(())
            }
            None => Err(ReactorError::NotRunning),
        }
    }
}

fn run_loop(core: Arc<ReactorCore>) {
    *core.reactor_thread_id.lock() = Some(thread::current().id());

    loop {
        let (signals, deferreds, completed, expired_timers, running, should_exit, worker_handles) = {
            let mut shared = core.shared.lock();
            loop {
                let stopping = core.state.load(Ordering::Acquire) == STOPPING;
                let has_work =
                    !shared.signal_queue.is_empty() || !shared.deferred_queue.is_empty() || !shared.completed.is_empty();
                if has_work {
                    break;
                }
                if stopping {
                    // Bounded poll while winding down: wake at least every
                    // 100ms to notice running workers finishing cancellation,
                    // rather than busy-spinning the reactor thread.
                    core.cond.wait_for(&mut shared, Duration::from_millis(100));
                    break;
                }
                match shared.timers.next_trigger() {
                    Some(trigger) => {
                        let now = core.clock.now_millis();
                        if trigger <= now {
                            break;
                        }
                        core.cond.wait_for(&mut shared, Duration::from_millis(trigger - now));
                    }
                    None => core.cond.wait(&mut shared),
                }
            }

            let signals: Vec<_> = shared.signal_queue.drain(..).collect();
            let deferreds: Vec<_> = shared.deferred_queue.drain(..).collect();
            let completed: Vec<_> = shared.completed.drain(..).collect();
            for (task_id, ..) in &completed {
                shared.in_flight.remove(task_id);
            }
            let now = core.clock.now_millis();
            let expired_timers = shared.timers.drain_expired(now, &LOGGER);
            let running = core.state.load(Ordering::Acquire) == RUNNING;
            let stopping = core.state.load(Ordering::Acquire) == STOPPING;
            let quiescent = shared.is_quiescent();
            if stopping
                && quiescent
                && core
                    .shutdown_signal_fired
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                // Queue the shutdown broadcast rather than deliver it inline:
                // it must still go out through the normal signal queue so it
                // is serialized with everything else on this thread. One
                // more iteration drains it before the loop actually exits.
                shared.signal_queue.push_back(Box::new({
                    let signal = core.shutdown_signal.clone();
                    move || {
                        let _ = signal.signal_final(0);
                    }
                }));
            }
            let should_exit = stopping && quiescent && core.shutdown_signal_fired.load(Ordering::Acquire)
                && shared.signal_queue.is_empty();
            // Every worker thread has by now been killed (idle workers in
            // `stop()`, running-turned-idle ones via `recycle_worker`'s
            // stopping check below) — collect their handles so we can wait
            // for the OS threads to actually exit before this loop returns.
            let worker_handles = if should_exit {
                std::mem::take(&mut shared.worker_join_handles)
            } else {
                Vec::new()
            };
            (signals, deferreds, completed, expired_timers, running, should_exit, worker_handles)
        };

        for broadcast in signals {
            broadcast();
        }
        for deferred in deferreds {
            deferred.process(running);
        }
        for (task_id, sink, result, slot) in completed {
            recycle_worker(&core, slot);
            let _ = match result {
                Ok(value) => sink.fire(Ok(value)),
                Err(error) => sink.fire(Err(error)),
            };
            let _ = task_id;
        }
        for callback in expired_timers {
            (callback.lock())();
        }

        if should_exit {
            for handle in worker_handles {
                let _ = handle.join();
            }
            break;
        }
    }

    core.state.store(STOPPED, Ordering::Release);
    LOGGER.log(Severity::Info, "reactor stopped");
}

fn recycle_worker(core: &ReactorCore, slot: Arc<WorkerSlot>) {
    let stopping = core.state.load(Ordering::Acquire) != RUNNING;
    let mut shared = core.shared.lock();
    if !stopping && shared.idle_workers.len() < core.config.idle_worker_capacity {
        shared.idle_workers.push_back(slot);
    } else {
        drop(shared);
        slot.kill();
    }
}
