//! Stop-the-world coordination.
//!
//! The collector only needs one guarantee from its environment: between
//! [`HeapHelper::stop_threads_at_safe_point`] and [`HeapHelper::restart_threads`]
//! no other thread observes or changes heap state. [`Safepoints`] provides it
//! cooperatively: mutator threads attach, poll at every heap operation, and
//! declare the spans where they block as safe regions.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

/// Capabilities the collector needs from the runtime that embeds it.
pub trait HeapHelper: Send + Sync {
    /// Blocks until every mutator thread other than the caller is parked.
    fn stop_threads_at_safe_point(&self);

    /// Releases the threads parked by `stop_threads_at_safe_point`.
    fn restart_threads(&self);

    /// Registers the calling thread as a mutator.
    fn attach(&self) {}

    /// Undoes one `attach`.
    fn detach(&self) {}

    /// Parks the calling thread if a stop has been requested.
    fn poll(&self) {}

    /// The calling thread is about to block outside the heap.
    fn enter_safe_region(&self) {}

    /// The calling thread stopped blocking; waits out any stop in progress.
    fn leave_safe_region(&self) {}

    /// Halts after unrecoverable heap corruption.
    fn die(&self, reason: &str) -> ! {
        #[cfg(feature = "tracing")]
        tracing::error!(reason, "heap corruption");
        panic!("fatal heap error: {reason}");
    }
}

/// Keeps the calling thread attached as a mutator until dropped.
#[must_use = "the thread detaches when the guard is dropped"]
pub struct MutatorGuard {
    helper: Arc<dyn HeapHelper>,
    _not_send: PhantomData<*const ()>,
}

impl MutatorGuard {
    pub(crate) fn attach(helper: Arc<dyn HeapHelper>) -> Self {
        helper.attach();
        Self {
            helper,
            _not_send: PhantomData,
        }
    }
}

impl Drop for MutatorGuard {
    fn drop(&mut self) {
        self.helper.detach();
    }
}

impl std::fmt::Debug for MutatorGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorGuard").finish_non_exhaustive()
    }
}

struct SafeRegion<'a>(&'a dyn HeapHelper);

impl Drop for SafeRegion<'_> {
    fn drop(&mut self) {
        self.0.leave_safe_region();
    }
}

/// Runs `f`, which may block, inside a safe region.
pub(crate) fn blocking<R>(helper: &dyn HeapHelper, f: impl FnOnce() -> R) -> R {
    helper.enter_safe_region();
    let _region = SafeRegion(helper);
    f()
}

#[derive(Debug, Default)]
struct ThreadRecord {
    attached: usize,
    safe_depth: usize,
    parked: bool,
}

impl ThreadRecord {
    const fn is_executing(&self) -> bool {
        self.safe_depth == 0 && !self.parked
    }
}

#[derive(Debug, Default)]
struct Registry {
    threads: HashMap<ThreadId, ThreadRecord>,
    collector: Option<ThreadId>,
}

impl Registry {
    fn must_wait(&self, requested: bool, me: ThreadId) -> bool {
        requested && self.collector != Some(me)
    }
}

/// The default [`HeapHelper`]: cooperative safepoints for attached threads.
///
/// Threads that never attach are invisible to it and must not touch the
/// heap while another thread collects.
#[derive(Debug, Default)]
pub struct Safepoints {
    requested: CachePadded<AtomicBool>,
    registry: Mutex<Registry>,
    changed: Condvar,
}

impl Safepoints {
    /// Creates a coordinator with no attached threads.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attached threads.
    #[must_use]
    pub fn attached_threads(&self) -> usize {
        self.registry.lock().threads.len()
    }

    /// Is a stop currently requested?
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl HeapHelper for Safepoints {
    fn stop_threads_at_safe_point(&self) {
        let me = thread::current().id();
        let mut registry = self.registry.lock();
        while registry.collector.is_some_and(|owner| owner != me) {
            self.changed.wait(&mut registry);
        }
        registry.collector = Some(me);
        self.requested.store(true, Ordering::SeqCst);
        while registry
            .threads
            .iter()
            .any(|(id, record)| *id != me && record.is_executing())
        {
            self.changed.wait(&mut registry);
        }
    }

    fn restart_threads(&self) {
        let mut registry = self.registry.lock();
        registry.collector = None;
        self.requested.store(false, Ordering::SeqCst);
        self.changed.notify_all();
    }

    fn attach(&self) {
        let me = thread::current().id();
        let mut registry = self.registry.lock();
        while registry.must_wait(self.requested.load(Ordering::SeqCst), me) {
            self.changed.wait(&mut registry);
        }
        registry.threads.entry(me).or_default().attached += 1;
    }

    fn detach(&self) {
        let me = thread::current().id();
        let mut registry = self.registry.lock();
        if let Some(record) = registry.threads.get_mut(&me) {
            record.attached -= 1;
            if record.attached == 0 {
                registry.threads.remove(&me);
            }
        }
        self.changed.notify_all();
    }

    fn poll(&self) {
        if !self.requested.load(Ordering::Acquire) {
            return;
        }
        let me = thread::current().id();
        let mut registry = self.registry.lock();
        if !registry.must_wait(self.requested.load(Ordering::SeqCst), me) {
            return;
        }
        match registry.threads.get_mut(&me) {
            Some(record) if record.is_executing() => record.parked = true,
            _ => return,
        }
        self.changed.notify_all();
        while registry.must_wait(self.requested.load(Ordering::SeqCst), me) {
            self.changed.wait(&mut registry);
        }
        if let Some(record) = registry.threads.get_mut(&me) {
            record.parked = false;
        }
    }

    fn enter_safe_region(&self) {
        let me = thread::current().id();
        let mut registry = self.registry.lock();
        if let Some(record) = registry.threads.get_mut(&me) {
            record.safe_depth += 1;
            self.changed.notify_all();
        }
    }

    fn leave_safe_region(&self) {
        let me = thread::current().id();
        let mut registry = self.registry.lock();
        let leaving_last = registry
            .threads
            .get(&me)
            .is_some_and(|record| record.safe_depth == 1);
        if leaving_last {
            while registry.must_wait(self.requested.load(Ordering::SeqCst), me) {
                self.changed.wait(&mut registry);
            }
        }
        if let Some(record) = registry.threads.get_mut(&me) {
            record.safe_depth = record.safe_depth.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_stop_parks_polling_thread() {
        let safepoints = Arc::new(Safepoints::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let worker = {
            let safepoints = Arc::clone(&safepoints);
            let counter = Arc::clone(&counter);
            let done = Arc::clone(&done);
            let helper: Arc<dyn HeapHelper> = safepoints;
            thread::spawn(move || {
                let _guard = MutatorGuard::attach(Arc::clone(&helper));
                while !done.load(Ordering::SeqCst) {
                    helper.poll();
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        while safepoints.attached_threads() == 0 {
            thread::yield_now();
        }
        safepoints.stop_threads_at_safe_point();
        let frozen = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), frozen);
        safepoints.restart_threads();

        while counter.load(Ordering::SeqCst) == frozen {
            thread::yield_now();
        }
        done.store(true, Ordering::SeqCst);
        worker.join().unwrap();
        assert_eq!(safepoints.attached_threads(), 0);
    }

    #[test]
    fn test_safe_region_does_not_block_stop() {
        let safepoints = Arc::new(Safepoints::new());
        let release = Arc::new((Mutex::new(false), Condvar::new()));
        let entered = Arc::new(AtomicBool::new(false));

        let worker = {
            let safepoints = Arc::clone(&safepoints);
            let release = Arc::clone(&release);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let helper: Arc<dyn HeapHelper> = safepoints;
                let _guard = MutatorGuard::attach(Arc::clone(&helper));
                blocking(helper.as_ref(), || {
                    entered.store(true, Ordering::SeqCst);
                    let (lock, cond) = &*release;
                    let mut go = lock.lock();
                    while !*go {
                        cond.wait(&mut go);
                    }
                });
            })
        };

        while !entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        safepoints.stop_threads_at_safe_point();
        {
            let (lock, cond) = &*release;
            *lock.lock() = true;
            cond.notify_all();
        }
        // The worker cannot leave its safe region while the heap is stopped.
        thread::sleep(Duration::from_millis(20));
        assert!(!worker.is_finished());
        safepoints.restart_threads();
        worker.join().unwrap();
    }

    #[test]
    fn test_collector_may_poll_itself() {
        let safepoints = Safepoints::new();
        safepoints.attach();
        safepoints.stop_threads_at_safe_point();
        safepoints.poll();
        safepoints.enter_safe_region();
        safepoints.leave_safe_region();
        safepoints.restart_threads();
        safepoints.detach();
        assert!(!safepoints.is_stop_requested());
    }
}
