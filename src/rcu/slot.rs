// WorkerSlot
//
// One slot per worker. The slot holds the two callback queues, indexed by epoch parity, plus the flags the
// orchestrator looks at when deciding whether the current batch may end.
//
//              ┌───────────────────────────── WorkerSlot ─────────────────────────────┐
//   worker ──► │ appending │ lists[parity] ◄── push                                    │
//              │ wait      │ lists[parity ^ 1] ──► harvested into pending by tick()    │
//              │ nesting   │ idle │ claimed │ depth[2] (diagnostics only)              │
//              └───────────────────────────────────────────────────────────────────────┘
//
// Who touches what:
// - lists[current] is only ever pushed to by the owning worker
// - lists[previous] is only ever emptied by the orchestrator
// - which list is which is decided by the global epoch selector, flipped only by the orchestrator
//
// An append that runs with interrupts off can assume it finishes well within one tick period. A thread can be
// preempted anywhere, so a worker which read the selector just before a flip could still be pushing onto what is
// now the previous list when the next harvest comes round. The `appending` state closes that window:
//
//   worker                                       orchestrator
//   swap(appending, APPENDING)          (AcqRel)  swap(epoch) flip, previous tick          (AcqRel)
//   parity = epoch                      (Acquire) appending_to(previous)? read by RMW      (AcqRel)
//   appending = APPENDING_TO + parity   (Release)   yes -> batch stays open, no harvest, no flip
//   push onto lists[parity]                         no  -> harvest lists[previous]
//   appending = NOT_APPENDING           (Release)
//
// Both sides touch `appending` with a read-modify-write, so the two are ordered one way or the other. If the
// orchestrator's comes first, the worker's swap synchronises with it, which puts our earlier flip before the
// worker's selector load: it picks the current list, never the one being harvested. If the worker's comes first the
// orchestrator sees the append in flight, or NOT_APPENDING published by a Release store after the push. An append
// known to target the current list holds nothing up. Holding the batch open, rather than harvesting around the slot
// and flipping anyway, keeps every previous list either empty or next in line, which is what barrier() relies on.
//
// The consent flag is the other handshake, between rearm() and a worker leaving its read-side section:
//
//   worker                                       orchestrator
//   nesting -= 1                        (AcqRel)  swap(wait, true)                         (AcqRel)
//   swap(wait, false)                   (AcqRel)  nesting == 0 (or idle, offline)? -> wait = false
//
// Whichever swap on `wait` comes second wins. If it is the worker's, wait ends up false. If it is ours, it read the
// worker's write and synchronised with it, so the re-check sees the section already left. Either way a worker can't
// be left objecting after it has quiesced. Every write to `wait` outside of tests is a swap, which keeps the worker's
// release chained through any clears of ours that land in between.

use mem::sync::{AtomicBool, AtomicU8, AtomicUsize, Ordering, UnsafeCell};
use mem::{CallbackList, CallbackNode};

const NOT_APPENDING: u8 = 0;
// Between raising the flag and reading the selector: the target list is not known yet
const APPENDING: u8 = 1;
// Plus the parity read from the selector
const APPENDING_TO: u8 = 2;

#[derive(Debug)]
pub(crate) struct WorkerSlot {
    // Goes false when this worker consents to the end of the current batch
    wait: AtomicBool,
    appending: AtomicU8,
    claimed: AtomicBool,
    idle: AtomicBool,
    // Read-side critical section depth
    nesting: AtomicUsize,
    lists: [UnsafeCell<CallbackList>; 2],
    depth: [AtomicUsize; 2],
}

// SAFETY: the lists are only reached through `append` (owning worker, current parity) and `harvest` (orchestrator,
// previous parity) whose protocol is described above. Everything else is atomic.
unsafe impl Sync for WorkerSlot {}

impl WorkerSlot {
    pub(crate) fn new() -> Self {
        Self {
            wait: AtomicBool::new(false),
            appending: AtomicU8::new(NOT_APPENDING),
            claimed: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            nesting: AtomicUsize::new(0),
            lists: [
                UnsafeCell::new(CallbackList::new()),
                UnsafeCell::new(CallbackList::new()),
            ],
            depth: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    // ------------------------------------------------------
    // Ownership

    pub(crate) fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    // A released slot keeps whatever is still queued; the orchestrator harvests it like any other.
    pub(crate) fn release(&self) {
        self.nesting.store(0, Ordering::Release);
        self.idle.store(false, Ordering::Release);
        self.wait.swap(false, Ordering::AcqRel);
        self.claimed.store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------
    // Worker side

    /// Pushes `node` onto the list selected by the current epoch parity.
    ///
    /// # Safety
    ///
    /// The caller must be the single owner of this slot (the `Worker` handle which claimed it), and must not call
    /// this re-entrantly.
    #[inline]
    pub(crate) unsafe fn append(&self, epoch: &AtomicU8, node: Box<CallbackNode>) {
        self.appending.swap(APPENDING, Ordering::AcqRel);

        let parity = epoch.load(Ordering::Acquire) & 1;
        self.appending.store(APPENDING_TO + parity, Ordering::Release);

        let parity = parity as usize;
        // SAFETY: see the protocol at the top of the file. While we are appending to lists[parity] the orchestrator
        // won't harvest it, and it never touches the current list.
        self.lists[parity].with_mut(|list| unsafe { (*list).push_back(node) });
        self.depth[parity].fetch_add(1, Ordering::Relaxed);

        self.appending.store(NOT_APPENDING, Ordering::Release);
    }

    /// This worker no longer objects to the current batch ending. Idempotent.
    #[inline]
    pub(crate) fn mark_quiescent(&self) {
        self.wait.swap(false, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn enter_read(&self) {
        self.nesting.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when this left the outermost critical section.
    #[inline]
    pub(crate) fn exit_read(&self) -> bool {
        let prev = self.nesting.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "read-side exit without a matching enter");
        prev == 1
    }

    #[inline]
    pub(crate) fn nesting(&self) -> usize {
        self.nesting.load(Ordering::Relaxed)
    }

    pub(crate) fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Release);
    }

    // ------------------------------------------------------
    // Orchestrator side

    #[inline]
    pub(crate) fn is_waiting(&self) -> bool {
        self.wait.load(Ordering::Acquire)
    }

    /// True when an append may be writing to lists[previous]: it has either read that parity, or not read the
    /// selector yet.
    #[inline]
    pub(crate) fn appending_to(&self, previous: usize) -> bool {
        // A plain load could see a stale NOT_APPENDING; the RMW reads the latest state
        match self.appending.fetch_add(0, Ordering::AcqRel) {
            NOT_APPENDING => false,
            APPENDING => true,
            tag => (tag - APPENDING_TO) as usize == previous,
        }
    }

    /// Moves lists[previous] onto the end of `pending` and returns how many callbacks that was.
    ///
    /// # Safety
    ///
    /// Only the orchestrator may call this (never concurrently with itself), `previous` must be the parity the
    /// epoch selector is *not* currently pointing at, and `appending_to(previous)` must have returned false since the
    /// last flip.
    pub(crate) unsafe fn harvest(&self, previous: usize, pending: &mut CallbackList) -> usize {
        // SAFETY: no append into lists[previous] is in flight and any append starting from here picks the current
        // parity.
        let taken = self.lists[previous].with_mut(|list| {
            let list = unsafe { &mut *list };
            let n = list.len();
            pending.append(list);
            n
        });
        self.depth[previous].store(0, Ordering::Relaxed);
        taken
    }

    // Only a worker which is online, not idle and inside a read-side critical section could still be holding a
    // reference.
    #[inline]
    fn busy(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
            && !self.idle.load(Ordering::Acquire)
            && self.nesting.load(Ordering::Acquire) > 0
    }

    /// Decides whether this worker must consent before the next batch may end.
    pub(crate) fn rearm(&self) {
        if !self.busy() {
            self.wait.swap(false, Ordering::AcqRel);
            return;
        }

        self.wait.swap(true, Ordering::AcqRel);
        // The worker may have left its section between the check and the swap, finding `wait` still false
        if !self.busy() {
            self.wait.swap(false, Ordering::AcqRel);
        }
    }

    // ------------------------------------------------------
    // Diagnostics

    pub(crate) fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    pub(crate) fn depth(&self) -> [usize; 2] {
        [
            self.depth[0].load(Ordering::Relaxed),
            self.depth[1].load(Ordering::Relaxed),
        ]
    }

    #[cfg(test)]
    pub(crate) fn force_wait(&self, wait: bool) {
        self.wait.store(wait, Ordering::Release);
    }

    // Stands in for a worker preempted inside append(). `None` is "selector not read yet".
    #[cfg(test)]
    pub(crate) fn pin_append(&self, parity: Option<usize>) {
        let tag = match parity {
            None => APPENDING,
            Some(parity) => APPENDING_TO + parity as u8,
        };
        self.appending.store(tag, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn unpin_append(&self) {
        self.appending.store(NOT_APPENDING, Ordering::Release);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn recording(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> Box<CallbackNode> {
        let log = log.clone();
        CallbackNode::new(move || log.lock().unwrap().push(tag))
    }

    #[test]
    fn append_follows_parity() {
        let epoch = AtomicU8::new(0);
        let slot = WorkerSlot::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(slot.try_claim());

        unsafe {
            slot.append(&epoch, recording(&log, 1));
            slot.append(&epoch, recording(&log, 2));
        }
        assert_eq!(slot.depth(), [2, 0]);

        epoch.store(1, Ordering::SeqCst);
        unsafe { slot.append(&epoch, recording(&log, 3)) };
        assert_eq!(slot.depth(), [2, 1]);

        // Parity 0 is now the previous list
        let mut pending = CallbackList::new();
        assert!(!slot.appending_to(0));
        assert_eq!(unsafe { slot.harvest(0, &mut pending) }, 2);
        assert_eq!(slot.depth(), [0, 1]);

        for node in pending {
            node.invoke();
        }
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn in_flight_append_blocks_only_its_target() {
        let slot = WorkerSlot::new();
        assert!(!slot.appending_to(0));
        assert!(!slot.appending_to(1));

        // Selector not read yet: could be either list
        slot.pin_append(None);
        assert!(slot.appending_to(0));
        assert!(slot.appending_to(1));

        slot.pin_append(Some(1));
        assert!(slot.appending_to(1));
        assert!(!slot.appending_to(0));

        // A finished append leaves the state clear again
        slot.unpin_append();
        let epoch = AtomicU8::new(1);
        unsafe { slot.append(&epoch, CallbackNode::new(|| {})) };
        assert!(!slot.appending_to(0));
        assert!(!slot.appending_to(1));
    }

    #[test]
    fn rearm_only_for_busy_readers() {
        let slot = WorkerSlot::new();

        // Offline slots never object
        slot.enter_read();
        slot.rearm();
        assert!(!slot.is_waiting());
        assert!(slot.exit_read());

        assert!(slot.try_claim());
        assert!(!slot.try_claim());

        slot.rearm();
        assert!(!slot.is_waiting());

        slot.enter_read();
        slot.enter_read();
        slot.rearm();
        assert!(slot.is_waiting());

        // Inner exit is not the end of the critical section
        assert!(!slot.exit_read());
        assert!(slot.exit_read());
        slot.mark_quiescent();
        assert!(!slot.is_waiting());

        // Idle workers are skipped even when nested
        slot.enter_read();
        slot.set_idle(true);
        slot.rearm();
        assert!(!slot.is_waiting());

        slot.release();
        assert!(!slot.is_claimed());
        assert_eq!(slot.nesting(), 0);
        assert!(!slot.is_idle());
    }
}
