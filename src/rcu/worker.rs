// Worker handle
//
// A Worker is the calling context's claim on one slot. The handle is Send (a worker may migrate between threads)
// but not Sync: only one thread can hold `&Worker` at a time, which is what makes the lock-free append sound.
// Dropping the handle takes the slot offline; anything it left queued is still harvested.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError};

use mem::CallbackNode;
use mem::sync::{Condvar, Mutex};

use super::Engine;
use super::slot::WorkerSlot;

pub struct Worker {
    engine: Arc<Engine>,
    id: usize,
    _not_sync: PhantomData<Cell<()>>,
}

impl Worker {
    pub(crate) fn new(engine: Arc<Engine>, id: usize) -> Self {
        Self {
            engine,
            id,
            _not_sync: PhantomData,
        }
    }

    #[inline(always)]
    fn slot(&self) -> &WorkerSlot {
        &self.engine.slots[self.id]
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Queues `f` to run once every worker has passed a quiescent point. Never blocks, never fails.
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_node(CallbackNode::new(f));
    }

    /// Queues a pre-built node. No allocation happens on this path.
    pub fn submit_node(&self, node: Box<CallbackNode>) {
        self.engine.stats.record_submit();
        // SAFETY: this handle is the slot's only owner and, being !Sync, can't be inside append on two threads.
        unsafe { self.slot().append(&self.engine.epoch, node) };
    }

    /// Announces a quiescent point: this worker holds no reference that the current batch's callbacks could free.
    #[inline]
    pub fn quiesce(&self) {
        self.slot().mark_quiescent();
    }

    /// Opens a read-side critical section. While any guard is alive, batches that start are held open until the
    /// outermost guard drops.
    pub fn read_lock(&self) -> ReadGuard<'_> {
        self.slot().enter_read();
        ReadGuard { worker: self }
    }

    /// An idle worker is quiescent by definition and is never asked to consent.
    pub fn set_idle(&self, idle: bool) {
        self.slot().set_idle(idle);
        if idle {
            self.slot().mark_quiescent();
        }
    }

    /// Blocks until a callback submitted now has run, i.e. until the end of the batch after the current one.
    ///
    /// Calling this inside a read-side critical section waits on ourselves and only returns once the batch is
    /// forced.
    pub fn synchronize(&self) {
        if !self.engine.is_active() {
            return;
        }
        debug_assert_eq!(
            self.slot().nesting(),
            0,
            "synchronize() inside a read-side critical section"
        );

        let completion = Arc::new(Completion::new());
        let signal = completion.clone();
        self.submit(move || signal.complete());

        // Blocking is a quiescent point
        self.quiesce();
        completion.wait();

        self.engine.stats.record_barrier();
    }

    /// Blocks until every callback submitted before this call has run.
    ///
    /// One synchronize() only guarantees the previous batch has drained; callbacks sitting in the still-open
    /// current batch are only covered by a second round.
    pub fn barrier(&self) {
        self.synchronize();
        self.synchronize();
    }

    /// Diagnostic no-op, see [`Engine::force_progress`].
    pub fn force_progress(&self) {
        self.engine.force_progress();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.slot().release();
        log::debug!("worker {} released", self.id);
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker").field("id", &self.id).finish()
    }
}

/// A read-side critical section. Dropping the outermost guard is a quiescent point.
#[must_use]
pub struct ReadGuard<'w> {
    worker: &'w Worker,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let slot = self.worker.slot();
        if slot.exit_read() {
            slot.mark_quiescent();
        }
    }
}

// One-shot completion signal for synchronize()
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn complete(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use crate::config::Config;

    // Stand-in progress driver: ticks until told to stop.
    fn with_ticker<R>(engine: &Arc<Engine>, f: impl FnOnce() -> R) -> R {
        let stop = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    engine.tick();
                    thread::sleep(Duration::from_millis(1));
                }
            });
            let out = f();
            stop.store(true, Ordering::Relaxed);
            out
        })
    }

    #[test]
    fn synchronize_returns_immediately_when_inactive() {
        let engine = Engine::new(Config::default()).unwrap();
        let worker = engine.register().unwrap();
        worker.synchronize();
        worker.barrier();
        assert_eq!(engine.stats().barriers, 0);
    }

    #[test]
    fn barrier_waits_for_earlier_callbacks() {
        let engine = Engine::new(Config::default()).unwrap();
        engine.activate();
        let worker = engine.register().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        const K: usize = 64;
        for _ in 0..K {
            let count = count.clone();
            worker.submit(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        with_ticker(&engine, || worker.barrier());

        assert_eq!(count.load(Ordering::Relaxed), K);
        assert_eq!(engine.stats().barriers, 2);
    }

    #[test]
    fn barrier_covers_other_workers_with_append_in_flight() {
        let engine = Engine::new(Config::default()).unwrap();
        engine.activate();
        let a = engine.register().unwrap();
        let b = engine.register().unwrap();
        let b_id = b.id();

        let ran = AtomicBool::new(false);
        let returned = AtomicBool::new(false);
        let (ran, returned) = (&ran, &returned);

        let ran_flag = Arc::new(AtomicBool::new(false));
        let flag = ran_flag.clone();
        b.submit(move || flag.store(true, Ordering::SeqCst));

        // b gets preempted inside its next append, before reading the selector
        engine.slots[b_id].pin_append(None);

        with_ticker(&engine, || {
            thread::scope(|s| {
                s.spawn(move || {
                    a.barrier();
                    ran.store(ran_flag.load(Ordering::SeqCst), Ordering::SeqCst);
                    returned.store(true, Ordering::SeqCst);
                });

                thread::sleep(Duration::from_millis(50));
                let early = returned.load(Ordering::SeqCst);
                engine.slots[b_id].unpin_append();

                println!("barrier returned while b was mid-append: {early}");
                assert!(!early);
            });
        });

        assert!(returned.load(Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst), "callback queued before barrier() has not run");
        assert_eq!(engine.stats().outstanding, 0);
        drop(b);
    }

    #[test]
    fn submit_node_reuses_prebuilt_nodes() {
        let engine = Engine::new(Config::default()).unwrap();
        engine.activate();
        let worker = engine.register().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let nodes: Vec<_> = (0..8)
            .map(|_| {
                let hits = hits.clone();
                CallbackNode::new(move || {
                    hits.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for node in nodes {
            worker.submit_node(node);
        }

        engine.tick();
        engine.tick();
        assert_eq!(hits.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn nested_guards() {
        let engine = Engine::new(Config::default()).unwrap();
        let worker = engine.register().unwrap();

        let outer = worker.read_lock();
        {
            let _inner = worker.read_lock();
            assert_eq!(worker.slot().nesting(), 2);
        }
        assert_eq!(worker.slot().nesting(), 1);
        drop(outer);
        assert_eq!(worker.slot().nesting(), 0);
    }

    #[test]
    fn worker_moves_between_threads() {
        let engine = Engine::new(Config::default()).unwrap();
        engine.activate();
        let worker = engine.register().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let worker = thread::spawn(move || {
            worker.submit(move || {
                h.fetch_add(1, Ordering::Relaxed);
            });
            worker
        })
        .join()
        .unwrap();

        engine.tick();
        engine.tick();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        drop(worker);
    }
}
