// BatchController
//
//   BATCH_OPEN ──(every worker consents, or the batch is overdue)──► BATCH_ENDING ──(selector flipped)──► BATCH_OPEN
//
// tick() is the only way through that loop. It is driven from outside (see driver.rs) and must never run twice at
// once; rather than trusting every driver with that, the orchestrator state sits behind a mutex which tick() only
// ever try_locks. A second caller gets `Busy` back and goes away.

use std::sync::TryLockError;
use std::time::Duration;

use mem::sync::Ordering;

use super::Engine;
use super::invoke;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was already running.
    Busy,
    /// The engine has not been activated yet.
    Inactive,
    /// An asynchronous trap was noted since the last tick; the batch was left open.
    TrapDeferred,
    /// At least one worker still objects and the batch is not overdue.
    Open,
    /// A worker was caught part-way through appending to a list this batch end would harvest. The batch stays open
    /// until the append completes.
    AppendInFlight,
    /// The batch ended. `harvested` callbacks moved to the pending list, `invoked` of them ran.
    Ended {
        forced: bool,
        harvested: usize,
        invoked: usize,
    },
}

impl TickOutcome {
    pub fn ended(&self) -> bool {
        matches!(self, TickOutcome::Ended { .. })
    }
}

impl Engine {
    /// Ends the current batch if every worker has consented, then runs whatever that retired.
    pub fn tick(&self) -> TickOutcome {
        let mut orchestrator = match self.orchestrator.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return TickOutcome::Busy,
            // A callback panicked under a previous tick. The pending list is still a valid list, carry on.
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        self.stats.record_pass();

        if !self.is_active() {
            return TickOutcome::Inactive;
        }

        // If a trap went off then the previous batch may not be quiescent yet. Let's wait till it is.
        if self.trap_seen.swap(false, Ordering::AcqRel) {
            log::trace!("async trap seen, leaving batch open");
            return TickOutcome::TrapDeferred;
        }

        let now = self.clock.now();
        let consent = self.slots.iter().all(|slot| !slot.is_waiting());

        // Force the end of the batch if it has been open for too long. This trades a safety margin for forward
        // progress: some worker is still inside a read-side critical section, or forgot to announce.
        let open_for = now.saturating_sub(Duration::from_nanos(self.last_batch_ns.load(Ordering::Relaxed)));
        let forced = !consent && open_for > self.force_after;

        if !consent && !forced {
            return TickOutcome::Open;
        }

        let previous = ((self.epoch.load(Ordering::Relaxed) ^ 1) & 1) as usize;

        // A worker preempted mid-append may still be writing to a list we are about to harvest. Not even a forced
        // end can take that list, so wait for the append to finish rather than leave the list behind.
        if self.slots.iter().any(|slot| slot.appending_to(previous)) {
            self.stats.record_deferred_harvest();
            log::trace!("append in flight, leaving batch open");
            return TickOutcome::AppendInFlight;
        }

        if forced {
            self.stats.record_forced();
            self.warn_forced(open_for);
        }

        self.last_batch_ns
            .store(now.as_nanos() as u64, Ordering::Relaxed);

        // End the current batch and start a new one.
        //
        // Two steps: move every worker's previous list onto the pending list, then swap current and previous for
        // everyone at once by flipping the selector. Workers may keep appending to the old current list for a
        // while after the flip; that list is not harvested until the next end of batch.
        let mut harvested = 0;
        for slot in self.slots.iter() {
            // SAFETY: we hold the orchestrator lock, `previous` is not the parity the selector points at and no
            // append into it was in flight. Appends starting after the check above pick the current parity.
            harvested += unsafe { slot.harvest(previous, &mut orchestrator.pending) };
            slot.rearm();
        }

        // Only place the selector is written. Appends that observe the new parity are ordered after every harvest
        // above.
        self.epoch.swap(previous as u8, Ordering::AcqRel);
        self.stats.record_batch();

        let invoked = invoke::drain(&mut orchestrator.pending, &self.stats);

        log::trace!("batch ended: harvested {harvested}, invoked {invoked}, forced {forced}");
        TickOutcome::Ended {
            forced,
            harvested,
            invoked,
        }
    }

    fn warn_forced(&self, open_for: Duration) {
        // First one is loud, the rest go to debug so a stuck worker doesn't flood the log every few seconds
        if !self.forced_warned.swap(true, Ordering::Relaxed) {
            log::warn!(
                "forcing end of batch after {} ms: a worker never reached a quiescent point",
                open_for.as_millis()
            );
        } else {
            log::debug!("forcing end of batch after {} ms", open_for.as_millis());
        }
    }
}
