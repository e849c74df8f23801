//! worker

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use parking_lot::{Condvar, Mutex};

use crate::{error::ChainError, reactor::ReactorHandle};

/// Identity key for a unit of work submitted to [`crate::reactor::Reactor::run_thread`].
/// Callers choose their own ids; the reactor uses them only to reject a
/// resubmission while the previous run with the same id is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

/// A type-erased task outcome: the reactor boxes the concrete return value so
/// the worker pool itself never needs to know the task's result type, the
/// same boundary [`crate::deferred`] crosses for chain handlers.
pub(crate) type AnyBox = Box<dyn std::any::Any + Send>;
pub(crate) type TaskResult = Result<AnyBox, ChainError>;
pub(crate) type BoxedTask = Box<dyn FnOnce(CancelToken) -> TaskResult + Send>;

/// Cooperative cancellation flag handed to a running task. Tasks are
/// expected to poll [`CancelToken::is_cancelled`] at safe points and return
/// `Err(ChainError::Interrupted)`-equivalent work early; nothing here
/// preempts a task that never checks it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn request_cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

pub(crate) enum WorkerCommand {
    Idle,
    Run {
        task_id: TaskId,
        sink: Arc<crate::deferred::DeferredCore>,
        cancel: CancelToken,
        task: BoxedTask,
    },
    Kill,
}

/// One long-lived OS thread in the pool. Holds its own small mutex/condvar
/// pair so the reactor can hand it a task without contending on the shared
/// reactor monitor, matching the per-worker handshake in the design's state
/// machine table.
pub(crate) struct WorkerSlot {
    pub(crate) index: usize,
    command: Mutex<WorkerCommand>,
    condvar: Condvar,
    cancel: Mutex<Option<CancelToken>>,
}

impl fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSlot").field("index", &self.index).finish()
    }
}

impl WorkerSlot {
    pub(crate) fn spawn(index: usize, reactor: ReactorHandle) -> (Arc<Self>, JoinHandle<()>) {
        let slot = Arc::new(Self {
            index,
            command: Mutex::new(WorkerCommand::Idle),
            condvar: Condvar::new(),
            cancel: Mutex::new(None),
        });
        let worker_slot = slot.clone();
        let handle = std::thread::Builder::new()
            .name(format!("reactor-worker-{index}"))
            .spawn(move || run_worker_loop(worker_slot, reactor))
            .expect("failed to spawn reactor worker thread");
        (slot, handle)
    }

    /// Hands a task to this slot and wakes its thread. Only valid while the
    /// slot is idle; the reactor never dispatches to a busy slot.
    pub(crate) fn dispatch(
        &self,
        task_id: TaskId,
        sink: Arc<crate::deferred::DeferredCore>,
        task: BoxedTask,
    ) -> CancelToken {
        let cancel = CancelToken::new();
        *self.cancel.lock() = Some(cancel.clone());
        let mut guard = self.command.lock();
        *guard = WorkerCommand::Run {
            task_id,
            sink,
            cancel: cancel.clone(),
            task,
        };
        self.condvar.notify_one();
        cancel
    }

    pub(crate) fn request_cancel(&self) {
        if let Some(token) = self.cancel.lock().as_ref() {
            token.request_cancel();
        }
    }

    pub(crate) fn kill(&self) {
        let mut guard = self.command.lock();
        *guard = WorkerCommand::Kill;
        self.condvar.notify_one();
    }
}

fn run_worker_loop(slot: Arc<WorkerSlot>, reactor: ReactorHandle) {
    loop {
        let command = {
            let mut guard = slot.command.lock();
            loop {
                match &*guard {
                    WorkerCommand::Idle => slot.condvar.wait(&mut guard),
                    _ => break,
                }
            }
            std::mem::replace(&mut *guard, WorkerCommand::Idle)
        };
        match command {
            WorkerCommand::Run {
                task_id,
                sink,
                cancel,
                task,
            } => {
                let result = task(cancel);
                *slot.cancel.lock() = None;
                reactor.worker_completed(task_id, sink, result, slot.clone());
            }
            WorkerCommand::Kill => return,
            WorkerCommand::Idle => unreachable!("woke with no command set"),
        }
    }
}
