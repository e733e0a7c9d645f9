// The engine
//
// One orchestrator, many workers:
//
// - Workers own a slot each and push callbacks onto the slot's current list. That is all they do on the hot path:
//   no locks, no allocation (with submit_node), no waiting.
// - Every so often the progress driver calls tick(). If every worker has consented to the batch ending (or is idle,
//   or was never inside a read-side critical section), tick() moves each slot's previous list onto the pending
//   list, re-arms the consent flags, flips the epoch selector and runs what it harvested.
//
// A callback therefore sits through one full batch in its worker's current list and is only harvested at the end of
// the following one, by which time every worker has passed a quiescent point since the callback was queued.
//
//   epoch E        │ epoch E+1       │ epoch E+2
//   submit(cb) ──► │ cb in previous  │ harvested + invoked
//                  │ (waits for all  │
//                  │  workers)       │

use std::sync::Arc;
use std::time::Duration;

use mem::sync::{AtomicBool, AtomicU8, AtomicU64, Mutex, Ordering};
use mem::{CachePadded, CallbackList};

use crate::clock::Clock;
use crate::config::{Config, DriverMode, Tunables};
use crate::error::{RcuError, Result};
use crate::stats::{BatchStats, Report, StatsSnapshot, WorkerRow};

mod batch;
mod invoke;
mod slot;
mod worker;

pub use batch::TickOutcome;
pub use worker::{ReadGuard, Worker};

use slot::WorkerSlot;

const NO_DRIVER: u8 = 0;
const TIMER_DRIVER: u8 = 1;
const DAEMON_DRIVER: u8 = 2;

// State that belongs to whoever is currently inside tick(). Never touched by workers.
#[derive(Debug)]
struct Orchestrator {
    pending: CallbackList,
}

pub struct Engine {
    // Selects, in each slot's lists[], which is the current list and which is the previous one
    epoch: CachePadded<AtomicU8>,
    slots: Box<[CachePadded<WorkerSlot>]>,
    orchestrator: Mutex<Orchestrator>,

    // Set when something asynchronous may have interrupted an append; the next tick stands down
    trap_seen: AtomicBool,
    active: AtomicBool,
    // Time of the last completed batch, in nanoseconds on `clock`. Written by the orchestrator only.
    last_batch_ns: AtomicU64,
    forced_warned: AtomicBool,
    driver: AtomicU8,

    start_mode: DriverMode,
    force_after: Duration,
    clock: Clock,
    tunables: Tunables,
    stats: BatchStats,
}

impl Engine {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        Self::with_clock(config, Clock::monotonic())
    }

    pub fn with_clock(config: Config, clock: Clock) -> Result<Arc<Self>> {
        config.validate()?;

        let slots = (0..config.max_workers)
            .map(|_| CachePadded::new(WorkerSlot::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        // The force-end clock starts now rather than at "zero", otherwise the very first open batch could be
        // treated as overdue (or, the other way round, the check could never fire).
        let now = clock.now();

        Ok(Arc::new(Self {
            epoch: CachePadded::new(AtomicU8::new(0)),
            slots,
            orchestrator: Mutex::new(Orchestrator {
                pending: CallbackList::new(),
            }),
            trap_seen: AtomicBool::new(false),
            active: AtomicBool::new(false),
            last_batch_ns: AtomicU64::new(now.as_nanos() as u64),
            forced_warned: AtomicBool::new(false),
            driver: AtomicU8::new(NO_DRIVER),
            start_mode: config.driver,
            force_after: config.force_after,
            clock,
            tunables: Tunables::new(&config),
            stats: BatchStats::new(),
        }))
    }

    /// Claims a free slot for the calling context.
    pub fn register(self: &Arc<Self>) -> Result<Worker> {
        for (id, slot) in self.slots.iter().enumerate() {
            if slot.try_claim() {
                log::debug!("worker {id} registered");
                return Ok(Worker::new(self.clone(), id));
            }
        }
        Err(RcuError::NoFreeSlot {
            capacity: self.slots.len(),
        })
    }

    /// Switches from start-up mode to normal operation.
    ///
    /// Until then tick() does nothing and synchronize() returns straight away: before anything drives progress
    /// there is only one context that matters, and waiting for a batch to end would wait forever. Starting a
    /// [`Ticker`](crate::driver::Ticker) activates the engine.
    pub fn activate(&self) {
        if !self.active.swap(true, Ordering::AcqRel) {
            self.last_batch_ns
                .store(self.clock.now().as_nanos() as u64, Ordering::Relaxed);
            log::info!(
                "engine started with {} worker slots, rate is {} Hz",
                self.slots.len(),
                self.tunables.hz()
            );
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Records that an asynchronous trap ran, which may have interrupted an append. The next tick will not end the
    /// batch.
    pub fn note_async_trap(&self) {
        self.trap_seen.store(true, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn set_driver(&self, mode: Option<DriverMode>) {
        let tag = match mode {
            None => NO_DRIVER,
            Some(DriverMode::Timer) => TIMER_DRIVER,
            Some(DriverMode::Daemon) => DAEMON_DRIVER,
        };
        self.driver.store(tag, Ordering::Relaxed);
    }

    /// The driver mode the engine was configured to start with.
    pub fn start_mode(&self) -> DriverMode {
        self.start_mode
    }

    /// The driver currently running ticks, if any.
    pub fn driver(&self) -> Option<DriverMode> {
        match self.driver.load(Ordering::Relaxed) {
            TIMER_DRIVER => Some(DriverMode::Timer),
            DAEMON_DRIVER => Some(DriverMode::Daemon),
            _ => None,
        }
    }

    /// Renders the diagnostics report. Workers are listed when online or when they still have queued callbacks.
    pub fn report(&self) -> Report {
        let last = Duration::from_nanos(self.last_batch_ns.load(Ordering::Relaxed));

        let workers = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                let depth = slot.depth();
                if !slot.is_claimed() && depth == [0, 0] {
                    return None;
                }
                Some(WorkerRow {
                    id,
                    idle: slot.is_idle(),
                    waiting: slot.is_waiting(),
                    depth,
                })
            })
            .collect();

        Report {
            hz: self.tunables.hz(),
            driver: self.driver(),
            stats: self.stats.snapshot(),
            since_last_batch: self.clock.now().saturating_sub(last),
            current_queue: (self.epoch.load(Ordering::Relaxed) & 1) as usize,
            workers,
        }
    }

    /// Diagnostic hook kept for API parity with other reclaimers. Progress only ever comes from the driver.
    pub fn force_progress(&self) {}
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("capacity", &self.slots.len())
            .field("active", &self.is_active())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}
