//! splitter

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    deferred::Deferred,
    error::{ChainError, ReactorError},
    reactor::ReactorHandle,
};

struct Inner<T> {
    input_attached: bool,
    result: Option<Result<T, ChainError>>,
    outputs: Vec<Deferred<T>>,
}

/// Fans a single deferred's outcome out to any number of outputs, each
/// receiving an independent copy of the value (or the same error). Outputs
/// requested before the input settles are queued and fired in the order
/// they were requested; outputs requested afterward fire immediately.
pub struct DeferredSplitter<T: Clone + Send + 'static> {
    inner: Arc<Mutex<Inner<T>>>,
    reactor: ReactorHandle,
}

impl<T: Clone + Send + 'static> DeferredSplitter<T> {
    pub(crate) fn new(reactor: ReactorHandle) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                input_attached: false,
                result: None,
                outputs: Vec::new(),
            })),
            reactor,
        }
    }

    /// Attaches the deferred whose outcome will be fanned out. May only be
    /// called once; the input's own chain is terminated by this call.
    pub fn attach_input(&self, input: Deferred<T>) -> Result<(), ReactorError> {
        let mut guard = self.inner.lock();
        if guard.input_attached {
            return Err(ReactorError::AlreadyHasInput);
        }
        guard.input_attached = true;
        drop(guard);

        let inner_value = self.inner.clone();
        let inner_error = self.inner.clone();
        let chained = input.add_handler(
            move |value: T| {
                Self::deliver(&inner_value, Ok(value.clone()));
                Ok(value)
            },
            move |error: ChainError| {
                Self::deliver(&inner_error, Err(error.clone()));
                Err(error)
            },
        )?;
        chained.terminate()
    }

    fn deliver(inner: &Arc<Mutex<Inner<T>>>, result: Result<T, ChainError>) {
        let mut guard = inner.lock();
        guard.result = Some(result.clone());
        let pending = std::mem::take(&mut guard.outputs);
        drop(guard);
        for output in pending {
            Self::fire(&output, result.clone());
        }
    }

    fn fire(output: &Deferred<T>, result: Result<T, ChainError>) {
        match result {
            Ok(v) => {
                let _ = output.callback(v);
            }
            Err(e) => {
                let _ = output.errback(e);
            }
        }
    }

    /// Requests a new output. If the input has already settled, the output
    /// fires before this call returns (on the calling thread, not the
    /// reactor thread); otherwise it fires when the input does.
    pub fn new_output(&self) -> Deferred<T> {
        let mut guard = self.inner.lock();
        let output = Deferred::new_internal(self.reactor.clone());
        match guard.result.clone() {
            Some(result) => {
                drop(guard);
                Self::fire(&output, result);
            }
            None => guard.outputs.push(output.clone()),
        }
        output
    }
}
