//! timer

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::logging::{Logger, Severity};

/// Opaque handle to a scheduled timer, returned by `run_timer*` and accepted
/// by `cancel_timer`. Also doubles as the identity key used to replace a
/// timer in place, folding the design's separate "handler identity index"
/// into the same id rather than tracking handler object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub(crate) u64);

type TimerCallback = Arc<Mutex<dyn FnMut() + Send>>;

struct TimerEntry {
    trigger: u64,
    interval_millis: u32,
    callback: TimerCallback,
}

impl fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntry")
            .field("trigger", &self.trigger)
            .field("interval_millis", &self.interval_millis)
            .finish()
    }
}

/// Ordered registry of pending timers, keyed by `(trigger millis, insertion
/// id)` so ties between simultaneous triggers resolve in scheduling order.
#[derive(Default)]
pub(crate) struct TimerRegistry {
    order: BTreeSet<(u64, u64)>,
    entries: HashMap<u64, TimerEntry>,
    next_id: u64,
}

impl TimerRegistry {
    pub(crate) fn schedule(
        &mut self,
        now: u64,
        delay_millis: u64,
        interval_millis: u32,
        callback: TimerCallback,
    ) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let trigger = now.saturating_add(delay_millis);
        self.order.insert((trigger, id));
        self.entries.insert(
            id,
            TimerEntry {
                trigger,
                interval_millis,
                callback,
            },
        );
        TimerHandle(id)
    }

    /// Cancels a timer, or replaces it in place if `callback` is supplied,
    /// keeping the same handle. A cancel of an unknown handle is a no-op.
    pub(crate) fn cancel(&mut self, handle: TimerHandle) {
        if let Some(entry) = self.entries.remove(&handle.0) {
            self.order.remove(&(entry.trigger, handle.0));
        }
    }

    pub(crate) fn next_trigger(&self) -> Option<u64> {
        self.order.iter().next().map(|(trigger, _)| *trigger)
    }

    /// Pops every timer whose trigger is `<= now`, advancing repeating
    /// timers by whole intervals and logging a single merged warning when a
    /// repeating timer fell behind by more than one interval. Returns the
    /// callbacks to invoke, in trigger order, so the caller can run them
    /// outside of whatever lock guards this registry.
    pub(crate) fn drain_expired(&mut self, now: u64, logger: &Logger) -> Vec<TimerCallback> {
        let mut fired = Vec::new();
        loop {
            let Some(&(trigger, id)) = self.order.iter().next() else {
                break;
            };
            if trigger > now {
                break;
            }
            self.order.remove(&(trigger, id));
            let Some(mut entry) = self.entries.remove(&id) else {
                continue;
            };
            fired.push(entry.callback.clone());
            if entry.interval_millis > 0 {
                let mut next_trigger = entry.trigger + entry.interval_millis as u64;
                let mut merged = false;
                while next_trigger <= now {
                    next_trigger += entry.interval_millis as u64;
                    merged = true;
                }
                if merged {
                    logger.log(
                        Severity::Warning,
                        format_args!(
                            "timer {id} fell behind by more than one interval, merging missed firings"
                        ),
                    );
                }
                entry.trigger = next_trigger;
                self.order.insert((next_trigger, id));
                self.entries.insert(id, entry);
            }
        }
        fired
    }
}
