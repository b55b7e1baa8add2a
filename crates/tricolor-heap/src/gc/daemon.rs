//! Background threads and the request/completion monitor that drives them.
//!
//! Both the GC thread and the finalizer thread sleep on a [`Trigger`]. A
//! request returns a ticket; the worker serves every request issued up to the
//! moment it wakes and then publishes that count as completed, so a caller
//! can block until its own ticket is served.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::error::{HeapError, Result};
use crate::manager::HeapManager;
use crate::safepoint::{self, HeapHelper};

#[derive(Debug, Default)]
struct TriggerState {
    requested: u64,
    completed: u64,
    serviced: bool,
    shutdown: bool,
}

/// Request/completion counters guarded by one monitor.
#[derive(Debug, Default)]
pub(crate) struct Trigger {
    state: Mutex<TriggerState>,
    changed: Condvar,
}

impl Trigger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records a request and wakes the worker. Returns the request's ticket.
    pub(crate) fn request(&self) -> u64 {
        let mut state = self.state.lock();
        state.requested += 1;
        self.changed.notify_all();
        state.requested
    }

    /// Blocks until `ticket` has been served. Returns `false` if the worker
    /// went away first.
    pub(crate) fn wait_for(&self, helper: &dyn HeapHelper, ticket: u64) -> bool {
        safepoint::blocking(helper, || {
            let mut state = self.state.lock();
            while state.completed < ticket && state.serviced && !state.shutdown {
                self.changed.wait(&mut state);
            }
            state.completed >= ticket
        })
    }

    /// Worker side: sleeps until a request is outstanding, then returns the
    /// ticket to complete once it has been served. `None` on shutdown.
    pub(crate) fn next_request(&self) -> Option<u64> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if state.requested > state.completed {
                return Some(state.requested);
            }
            self.changed.wait(&mut state);
        }
    }

    pub(crate) fn complete(&self, ticket: u64) {
        let mut state = self.state.lock();
        state.completed = state.completed.max(ticket);
        self.changed.notify_all();
    }

    /// Is a worker serving this trigger?
    pub(crate) fn is_serviced(&self) -> bool {
        let state = self.state.lock();
        state.serviced && !state.shutdown
    }

    /// Claims the trigger for a new worker. Returns `false` if one already
    /// serves it or it was shut down.
    fn claim(&self) -> bool {
        let mut state = self.state.lock();
        if state.serviced || state.shutdown {
            return false;
        }
        state.serviced = true;
        true
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.serviced = false;
        self.changed.notify_all();
    }

    /// Stops the worker and releases every waiter.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.changed.notify_all();
    }

    #[cfg(test)]
    fn completed(&self) -> u64 {
        self.state.lock().completed
    }
}

/// Releases the trigger when the worker exits, even by unwinding.
struct Serving<'a>(&'a Trigger);

impl Drop for Serving<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// The two background threads of a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DaemonKind {
    Gc,
    Finalizer,
}

impl DaemonKind {
    const fn thread_name(self) -> &'static str {
        match self {
            Self::Gc => "tricolor-gc",
            Self::Finalizer => "tricolor-finalizer",
        }
    }

    fn serve(self, heap: &HeapManager) {
        match self {
            Self::Gc => {
                heap.collector().collect(heap);
            }
            Self::Finalizer => {
                crate::gc::finalizer::run_pass(heap);
            }
        }
    }
}

/// Starts a daemon serving `trigger`, unless one already does.
///
/// The thread holds the heap only weakly while it sleeps, and exits when the
/// trigger is shut down or the heap is gone.
pub(crate) fn spawn(
    heap: &Arc<HeapManager>,
    trigger: &Arc<Trigger>,
    kind: DaemonKind,
) -> Result<Option<JoinHandle<()>>> {
    if !trigger.claim() {
        return Ok(None);
    }
    let weak = Arc::downgrade(heap);
    let worker_trigger = Arc::clone(trigger);
    thread::Builder::new()
        .name(kind.thread_name().into())
        .spawn(move || run(&weak, &worker_trigger, kind))
        .map(Some)
        .map_err(|source| {
            trigger.release();
            HeapError::Spawn {
                name: kind.thread_name(),
                source,
            }
        })
}

fn run(weak: &Weak<HeapManager>, trigger: &Trigger, kind: DaemonKind) {
    let _serving = Serving(trigger);
    #[cfg(feature = "tracing")]
    tracing::debug!(thread = kind.thread_name(), "daemon started");
    while let Some(ticket) = trigger.next_request() {
        let Some(heap) = weak.upgrade() else {
            break;
        };
        kind.serve(&heap);
        trigger.complete(ticket);
    }
    #[cfg(feature = "tracing")]
    tracing::debug!(thread = kind.thread_name(), "daemon stopped");
}
