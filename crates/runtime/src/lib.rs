//! Single-threaded reactor core built around deferreds, timers, signals and
//! a worker thread pool, in the style of Twisted's `Deferred`/reactor split.

pub mod clock;
pub mod concentrator;
pub mod deferred;
pub mod error;
pub mod logging;
pub mod reactor;
pub mod signal;
pub mod splitter;
pub mod timer;
pub mod worker;

pub use clock::{Clock, MonotonicClock};
pub use concentrator::DeferredConcentrator;
pub use deferred::Deferred;
pub use error::{ChainError, DeferError, ReactorError};
pub use reactor::{Reactor, ReactorConfig};
pub use signal::{Signal, SubscriptionId};
pub use splitter::DeferredSplitter;
pub use timer::TimerHandle;
pub use worker::{CancelToken, TaskId};

#[cfg(test)]
mod tests;
