//! concentrator

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    deferred::Deferred,
    error::{ChainError, ReactorError},
    reactor::ReactorHandle,
};

struct Inner<T> {
    slots: Vec<Option<T>>,
    remaining: usize,
    error: Option<ChainError>,
    output: Option<Deferred<Vec<T>>>,
    output_requested: bool,
    closed_to_input: bool,
}

/// Fans a set of inputs in to a single output deferred carrying a `Vec` of
/// their values, in the order the inputs were attached. The first input to
/// error wins: later results (success or error) are dropped once an error
/// has latched.
pub struct DeferredConcentrator<T: Send + 'static> {
    inner: Arc<Mutex<Inner<T>>>,
    reactor: ReactorHandle,
}

impl<T: Send + 'static> DeferredConcentrator<T> {
    pub(crate) fn new(reactor: ReactorHandle) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slots: Vec::new(),
                remaining: 0,
                error: None,
                output: None,
                output_requested: false,
                closed_to_input: false,
            })),
            reactor,
        }
    }

    /// Attaches another input. Fails once [`DeferredConcentrator::output`]
    /// has been requested.
    pub fn add_input(&self, input: Deferred<T>) -> Result<(), ReactorError> {
        let mut guard = self.inner.lock();
        if guard.closed_to_input {
            return Err(ReactorError::Terminated);
        }
        let index = guard.slots.len();
        guard.slots.push(None);
        guard.remaining += 1;
        drop(guard);

        let inner_value = self.inner.clone();
        let inner_error = self.inner.clone();
        let chained = input.add_handler(
            move |value: T| {
                Self::complete(&inner_value, index, Ok(value));
                Ok(())
            },
            move |error: ChainError| {
                Self::complete(&inner_error, index, Err(error.clone()));
                Err(error)
            },
        )?;
        chained.terminate()
    }

    fn complete(inner: &Arc<Mutex<Inner<T>>>, index: usize, result: Result<T, ChainError>) {
        let mut guard = inner.lock();
        if guard.error.is_none() {
            match result {
                Ok(v) => {
                    guard.slots[index] = Some(v);
                    guard.remaining -= 1;
                }
                Err(e) => guard.error = Some(e),
            }
        }
        Self::maybe_fire(&mut guard);
    }

    fn maybe_fire(guard: &mut Inner<T>) {
        if !guard.output_requested || guard.output.is_none() {
            return;
        }
        if let Some(error) = guard.error.clone() {
            let output = guard.output.take().unwrap();
            let _ = output.errback(error);
        } else if guard.remaining == 0 {
            let output = guard.output.take().unwrap();
            let slots = std::mem::take(&mut guard.slots);
            let values: Vec<T> = slots
                .into_iter()
                .map(|slot| slot.expect("all slots filled once remaining reaches zero"))
                .collect();
            let _ = output.callback(values);
        }
    }

    /// Requests the fan-in output. May only be called once; after this call
    /// no further inputs may be attached.
    pub fn output(&self) -> Result<Deferred<Vec<T>>, ReactorError> {
        let mut guard = self.inner.lock();
        if guard.output_requested {
            return Err(ReactorError::Terminated);
        }
        guard.output_requested = true;
        guard.closed_to_input = true;
        let output = Deferred::new_internal(self.reactor.clone());
        guard.output = Some(output.clone());
        Self::maybe_fire(&mut guard);
        drop(guard);
        Ok(output)
    }
}
