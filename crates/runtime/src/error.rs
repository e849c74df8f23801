//! error

use std::{error, fmt, sync::Arc};

/// Programming errors raised synchronously to the caller of a reactor API.
///
/// These mirror the exception taxonomy of section 5/7 of the design: each
/// variant is a misuse of the API detected at the call site, as opposed to a
/// [`ChainError`] which travels through a deferred's error leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorError {
    /// `start()` called while already `Running`.
    AlreadyRunning,
    /// A scheduling operation was attempted while the reactor is not `Running`.
    NotRunning,
    /// A second `callback`/`errback` landed on a deferred that already has a
    /// latched outcome, and no timeout absorbed it.
    AlreadyTriggered,
    /// `addHandler`/`terminate` called on a chain that is already terminated.
    Terminated,
    /// A producer-only operation (`callback`/`errback`, `signal`/`signalFinal`)
    /// was attempted through a restricted capability view.
    Restricted,
    /// A subscriber attempted to mutate a signal's subscriber list from
    /// within that signal's own broadcast.
    SignalContext,
    /// `defer()` was called from the reactor thread, which would deadlock.
    DeferredContext,
    /// `runThread` was called again for a task id that is still running or
    /// whose completion has not yet been drained.
    TaskAlreadyRunning,
    /// `attachInput` called on a splitter that already has an input.
    AlreadyHasInput,
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::AlreadyRunning => "reactor already running",
            Self::NotRunning => "reactor not running",
            Self::AlreadyTriggered => "deferred already triggered",
            Self::Terminated => "deferred chain already terminated",
            Self::Restricted => "operation forbidden on restricted capability",
            Self::SignalContext => "signal subscriber list mutated during broadcast",
            Self::DeferredContext => "defer() called from the reactor thread",
            Self::TaskAlreadyRunning => "task already running",
            Self::AlreadyHasInput => "splitter already has an input",
        };
        f.write_str(msg)
    }
}

impl error::Error for ReactorError {}

/// Errors that flow through a deferred chain's error leg.
///
/// Unlike [`ReactorError`], these are recoverable: any error-leg handler in
/// the chain may observe and recover from them. `User` carries an
/// `Arc` rather than a `Box` so a single error can be fanned out to a
/// splitter's outputs or a concentrator's first-error latch without cloning
/// the underlying error.
#[derive(Debug, Clone)]
pub enum ChainError {
    /// A `setTimeout` fired before the producer triggered the deferred.
    TimedOut,
    /// A worker thread observed a cooperative interruption request.
    Interrupted,
    /// The deferred was forced into an error state because the reactor
    /// stopped running before the chain could be processed.
    NotRunning,
    /// An application-defined error produced by a handler or a worker task.
    User(Arc<dyn error::Error + Send + Sync>),
}

impl ChainError {
    pub fn user<E>(err: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        ChainError::User(Arc::new(err))
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => write!(f, "timed out"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::NotRunning => write!(f, "reactor not running"),
            Self::User(e) => write!(f, "{e}"),
        }
    }
}

impl error::Error for ChainError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::User(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// The outcome of [`crate::deferred::Deferred::defer`]: either the caller
/// misused the API (a [`ReactorError`]) or the deferred settled with an
/// error (a [`ChainError`]).
#[derive(Debug, Clone)]
pub enum DeferError {
    Context(ReactorError),
    Failed(ChainError),
}

impl fmt::Display for DeferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Context(e) => fmt::Display::fmt(e, f),
            Self::Failed(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl error::Error for DeferError {}
