//! deferred

use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    marker::PhantomData,
    sync::Arc,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{ChainError, DeferError, ReactorError},
    logging::Severity,
    reactor::ReactorHandle,
    timer::TimerHandle,
};

static LOGGER: crate::logging::Logger = crate::logging::Logger::new("reactor.deferred");

pub(crate) type AnyBox = Box<dyn Any + Send>;

type OnValue = Box<dyn FnOnce(AnyBox) -> Result<AnyBox, ChainError> + Send>;
type OnError = Box<dyn FnOnce(ChainError) -> Result<AnyBox, ChainError> + Send>;

struct ChainEntry {
    on_value: OnValue,
    on_error: OnError,
}

enum State {
    Pending,
    HasValue(AnyBox),
    HasError(ChainError),
    Completed,
}

static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

struct Inner {
    state: State,
    chain: VecDeque<ChainEntry>,
    terminated: bool,
    ignore_next: bool,
    timeout: Option<TimerHandle>,
    id: u64,
    #[cfg(feature = "leak-detection")]
    backtrace: Option<backtrace::Backtrace>,
}

/// The type-erased core of a deferred: everything that does not depend on
/// the chain's current value type `T`. [`Deferred<T>`] is a thin typed view
/// over a shared `Arc<DeferredCore>`, the same split the reactor uses for
/// worker results and timer callbacks that must cross the type-erasure
/// boundary.
pub struct DeferredCore {
    lock: Mutex<Inner>,
    cond: Condvar,
    pub(crate) reactor: ReactorHandle,
}

impl fmt::Debug for DeferredCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.lock.lock();
        f.debug_struct("DeferredCore").field("id", &guard.id).finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !matches!(self.state, State::Completed) {
            #[cfg(feature = "leak-detection")]
            if let Some(bt) = &self.backtrace {
                LOGGER.log(
                    Severity::Warning,
                    format_args!(
                        "deferred {} dropped without completing its chain, created at:\n{:?}",
                        self.id, bt
                    ),
                );
                return;
            }
            LOGGER.log(
                Severity::Warning,
                format_args!(
                    "deferred {} dropped without completing its chain (enable the \
                     leak-detection feature for a creation backtrace)",
                    self.id
                ),
            );
        }
    }
}

impl DeferredCore {
    fn new(reactor: ReactorHandle) -> Arc<Self> {
        let id = NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        #[cfg(feature = "leak-detection")]
        let backtrace = Some(backtrace::Backtrace::new());
        Arc::new(Self {
            lock: Mutex::new(Inner {
                state: State::Pending,
                chain: VecDeque::new(),
                terminated: false,
                ignore_next: false,
                timeout: None,
                id,
                #[cfg(feature = "leak-detection")]
                backtrace,
            }),
            cond: Condvar::new(),
            reactor,
        })
    }

    fn cancel_timeout_locked(&self, inner: &mut Inner) {
        if let Some(handle) = inner.timeout.take() {
            self.reactor.cancel_timer(handle);
        }
    }

    /// Latches a value or error outcome from a typed `Deferred<T>::callback`/
    /// `errback`, or from a worker/timer completion that only ever holds an
    /// `Arc<DeferredCore>`. Returns `Err(AlreadyTriggered)` unless a pending
    /// timeout is absorbing exactly one more trigger.
    pub(crate) fn fire(self: &Arc<Self>, result: Result<AnyBox, ChainError>) -> Result<(), ReactorError> {
        let mut guard = self.lock.lock();
        if guard.ignore_next {
            guard.ignore_next = false;
            return Ok(());
        }
        if !matches!(guard.state, State::Pending) {
            return Err(ReactorError::AlreadyTriggered);
        }
        self.cancel_timeout_locked(&mut guard);
        guard.state = match result {
            Ok(v) => State::HasValue(v),
            Err(e) => State::HasError(e),
        };
        let terminated = guard.terminated;
        drop(guard);
        self.cond.notify_all();
        if terminated {
            self.reactor.enqueue_deferred(self.clone());
        }
        Ok(())
    }

    fn terminate(self: &Arc<Self>) -> Result<(), ReactorError> {
        let mut guard = self.lock.lock();
        if guard.terminated {
            return Err(ReactorError::Terminated);
        }
        guard.terminated = true;
        let has_outcome = matches!(guard.state, State::HasValue(_) | State::HasError(_));
        drop(guard);
        if has_outcome {
            self.reactor.enqueue_deferred(self.clone());
        }
        Ok(())
    }

    fn push_raw(&self, on_value: OnValue, on_error: OnError) -> Result<(), ReactorError> {
        let mut guard = self.lock.lock();
        if guard.terminated {
            return Err(ReactorError::Terminated);
        }
        guard.chain.push_back(ChainEntry { on_value, on_error });
        Ok(())
    }

    /// Invoked by the reactor on its own thread when this deferred is popped
    /// off the ready queue. Drains the whole chain: if `reactor_running` is
    /// false the current outcome is first forced to a not-running error, per
    /// the shutdown drain contract.
    pub(crate) fn process(self: &Arc<Self>, reactor_running: bool) {
        let mut guard = self.lock.lock();
        if !reactor_running {
            guard.state = State::HasError(ChainError::NotRunning);
        }
        while let Some(entry) = guard.chain.pop_front() {
            let current = std::mem::replace(&mut guard.state, State::Pending);
            let outcome = match current {
                State::HasValue(v) => (entry.on_value)(v),
                State::HasError(e) => (entry.on_error)(e),
                other => {
                    guard.state = other;
                    guard.chain.push_front(entry);
                    break;
                }
            };
            guard.state = match outcome {
                Ok(v) => State::HasValue(v),
                Err(e) => State::HasError(e),
            };
        }
        if let State::HasError(ref e) = guard.state {
            LOGGER.log(
                Severity::Warning,
                format_args!("deferred {} reached end of chain with unhandled error: {e}", guard.id),
            );
        }
        guard.state = State::Completed;
        drop(guard);
        self.cond.notify_all();
    }
}

/// A one-shot, chainable future-like value. Roughly Twisted's `Deferred`:
/// producers call [`Deferred::callback`]/[`Deferred::errback`] exactly once;
/// consumers append handler pairs with [`Deferred::add_handler`] and friends
/// before [`Deferred::terminate`] hands the chain to the reactor thread for
/// processing.
pub struct Deferred<T> {
    core: Arc<DeferredCore>,
    restricted: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            restricted: self.restricted,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").field("core", &self.core).finish()
    }
}

impl<T: Send + 'static> Deferred<T> {
    pub(crate) fn new_internal(reactor: ReactorHandle) -> Self {
        Self {
            core: DeferredCore::new(reactor),
            restricted: false,
            _marker: PhantomData,
        }
    }

    pub(crate) fn core(&self) -> &Arc<DeferredCore> {
        &self.core
    }

    /// Returns a view of this deferred that can only append handlers: the
    /// restricted capability handed to code that should not be able to
    /// trigger or terminate the chain it is consuming.
    pub fn restricted(&self) -> Self {
        Self {
            core: self.core.clone(),
            restricted: true,
            _marker: PhantomData,
        }
    }

    fn push<U, FV, FE>(&self, on_value: FV, on_error: FE) -> Result<Deferred<U>, ReactorError>
    where
        U: Send + 'static,
        FV: FnOnce(T) -> Result<U, ChainError> + Send + 'static,
        FE: FnOnce(ChainError) -> Result<U, ChainError> + Send + 'static,
    {
        let boxed_value: OnValue = Box::new(move |boxed: AnyBox| {
            let value = *boxed
                .downcast::<T>()
                .expect("deferred value type mismatch between chain links");
            on_value(value).map(|v| Box::new(v) as AnyBox)
        });
        let boxed_error: OnError = Box::new(move |err| on_error(err).map(|v| Box::new(v) as AnyBox));
        self.core.push_raw(boxed_value, boxed_error)?;
        Ok(Deferred {
            core: self.core.clone(),
            restricted: self.restricted,
            _marker: PhantomData,
        })
    }

    /// Appends a full handler pair, each leg able to transform the value,
    /// recover from or propagate an error, or substitute a new error.
    pub fn add_handler<U, FV, FE>(&self, on_value: FV, on_error: FE) -> Result<Deferred<U>, ReactorError>
    where
        U: Send + 'static,
        FV: FnOnce(T) -> Result<U, ChainError> + Send + 'static,
        FE: FnOnce(ChainError) -> Result<U, ChainError> + Send + 'static,
    {
        self.push(on_value, on_error)
    }

    /// Appends a value-leg-only handler; errors pass through unchanged.
    pub fn add_value_handler<U, F>(&self, f: F) -> Result<Deferred<U>, ReactorError>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.push(move |v| Ok(f(v)), Err)
    }

    /// Appends an error-leg-only handler that recovers a value of the same
    /// type, clearing the error.
    pub fn add_error_handler<F>(&self, f: F) -> Result<Deferred<T>, ReactorError>
    where
        F: FnOnce(ChainError) -> T + Send + 'static,
    {
        self.push(Ok, move |e| Ok(f(e)))
    }

    /// Latches a value outcome. Fails if the chain already has an outcome
    /// latched, unless a pending timeout is absorbing exactly one more
    /// trigger, in which case the value is silently discarded.
    pub fn callback(&self, value: T) -> Result<(), ReactorError> {
        if self.restricted {
            return Err(ReactorError::Restricted);
        }
        self.core.fire(Ok(Box::new(value)))
    }

    /// Latches an error outcome. See [`Deferred::callback`].
    pub fn errback(&self, error: ChainError) -> Result<(), ReactorError> {
        if self.restricted {
            return Err(ReactorError::Restricted);
        }
        self.core.fire(Err(error))
    }

    /// Closes the chain to further `add_handler` calls and, if a value or
    /// error is already latched, hands the chain to the reactor thread for
    /// processing.
    pub fn terminate(&self) -> Result<(), ReactorError> {
        self.core.terminate()
    }

    /// Equivalent to appending a handler that logs (rather than silently
    /// drops) any unhandled error, then terminating. For callers that have
    /// no further use for the result but still want errors observed.
    pub fn discard(&self) {
        let mut guard = self.core.lock.lock();
        if !guard.terminated {
            guard.chain.push_back(ChainEntry {
                on_value: Box::new(Ok),
                on_error: Box::new(|e| {
                    LOGGER.log(Severity::Warning, format_args!("discarded deferred observed error: {e}"));
                    Err(e)
                }),
            });
        }
        drop(guard);
        let _ = self.core.terminate();
    }

    /// Schedules a one-shot timeout. If the producer has not settled the
    /// chain by the time it fires, the chain is errored with
    /// [`ChainError::TimedOut`] and exactly one subsequent producer trigger
    /// is silently absorbed rather than rejected as already-triggered.
    pub fn set_timeout(&self, delay_millis: u64) -> Result<(), ReactorError> {
        let mut guard = self.core.lock.lock();
        if !matches!(guard.state, State::Pending) {
            return Ok(());
        }
        self.core.cancel_timeout_locked(&mut guard);
        let core = self.core.clone();
        let handle = self
            .core
            .reactor
            .schedule_one_shot(delay_millis, move || {
                let mut g = core.lock.lock();
                if matches!(g.state, State::Pending) {
                    g.state = State::HasError(ChainError::TimedOut);
                    g.ignore_next = true;
                    let terminated = g.terminated;
                    drop(g);
                    core.cond.notify_all();
                    if terminated {
                        core.reactor.enqueue_deferred(core.clone());
                    }
                }
            });
        guard.timeout = Some(handle);
        Ok(())
    }

    /// Cancels a pending timeout set with [`Deferred::set_timeout`]. No-op
    /// if none is pending or it already fired.
    pub fn cancel_timeout(&self) {
        let mut guard = self.core.lock.lock();
        self.core.cancel_timeout_locked(&mut guard);
    }

    /// Blocks the calling thread until this deferred settles, bypassing the
    /// handler chain entirely. Must not be called from the reactor thread,
    /// which would deadlock against itself.
    pub fn defer(&self) -> Result<T, DeferError> {
        if self.core.reactor.is_reactor_thread() {
            return Err(DeferError::Context(ReactorError::DeferredContext));
        }
        let mut guard = self.core.lock.lock();
        loop {
            match guard.state {
                State::Pending => self.core.cond.wait(&mut guard),
                _ => break,
            }
        }
        match std::mem::replace(&mut guard.state, State::Completed) {
            State::HasValue(v) => Ok(*v
                .downcast::<T>()
                .expect("deferred value type mismatch")),
            State::HasError(e) => Err(DeferError::Failed(e)),
            State::Completed => panic!("defer() called twice on the same deferred"),
            State::Pending => unreachable!(),
        }
    }
}
